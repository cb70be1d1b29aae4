use crate::envelope::SigningPacket;
use crate::types::AmountMinor;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AddendumState {
    Draft,
    PendingSignature,
    Signed,
    Active,
    Cancelled,
}

impl AddendumState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Draft => "draft",
            Self::PendingSignature => "pending_signature",
            Self::Signed => "signed",
            Self::Active => "active",
            Self::Cancelled => "cancelled",
        }
    }
}

/// Exact arithmetic applied to the parent contract on activation.
///
/// Stored so cancellation subtracts the same figures regardless of when it runs.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct AppliedAdjustment {
    pub monthly_delta_minor: AmountMinor,
    pub value_delta_minor: AmountMinor,
    pub remaining_months: u32,
}

/// Contract modification (upsell, downgrade) with its own signing packet.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Addendum {
    pub addendum_id: String,
    pub description: String,
    pub monthly_delta_minor: AmountMinor,
    pub state: AddendumState,
    pub signing: SigningPacket,
    pub applied: Option<AppliedAdjustment>,
    pub created_at: DateTime<Utc>,
    pub activated_at: Option<DateTime<Utc>>,
    pub cancelled_at: Option<DateTime<Utc>>,
}

impl Addendum {
    pub fn new(description: impl Into<String>, monthly_delta_minor: AmountMinor) -> Self {
        Self {
            addendum_id: Uuid::new_v4().to_string(),
            description: description.into(),
            monthly_delta_minor,
            state: AddendumState::Draft,
            signing: SigningPacket::new(),
            applied: None,
            created_at: Utc::now(),
            activated_at: None,
            cancelled_at: None,
        }
    }

    /// Prorated value change for the months left on the parent contract.
    pub fn adjustment_for(&self, remaining_months: u32) -> AppliedAdjustment {
        AppliedAdjustment {
            monthly_delta_minor: self.monthly_delta_minor,
            value_delta_minor: self.monthly_delta_minor * AmountMinor::from(remaining_months),
            remaining_months,
        }
    }
}
