use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Kinds of work handed to an operator after a best-effort step could not finish.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum FollowUpKind {
    InstallationTaskFailed,
    DocumentDownloadFailed,
    ReconcileFailed,
    EnvelopeSendFailed,
    EnvelopeDeclined,
    EnvelopeVoided,
}

impl FollowUpKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::InstallationTaskFailed => "installation_task_failed",
            Self::DocumentDownloadFailed => "document_download_failed",
            Self::ReconcileFailed => "reconcile_failed",
            Self::EnvelopeSendFailed => "envelope_send_failed",
            Self::EnvelopeDeclined => "envelope_declined",
            Self::EnvelopeVoided => "envelope_voided",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FollowUp {
    pub follow_up_id: String,
    pub contract_id: String,
    pub kind: FollowUpKind,
    pub detail: String,
    pub created_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
    pub resolved_by: Option<String>,
}

impl FollowUp {
    pub fn new(contract_id: impl Into<String>, kind: FollowUpKind, detail: impl Into<String>) -> Self {
        Self {
            follow_up_id: Uuid::new_v4().to_string(),
            contract_id: contract_id.into(),
            kind,
            detail: detail.into(),
            created_at: Utc::now(),
            resolved_at: None,
            resolved_by: None,
        }
    }

    pub fn is_open(&self) -> bool {
        self.resolved_at.is_none()
    }

    pub fn resolve(&mut self, operator: impl Into<String>) {
        if self.resolved_at.is_none() {
            self.resolved_at = Some(Utc::now());
            self.resolved_by = Some(operator.into());
        }
    }
}

/// Result of a best-effort side effect attached to a primary operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum SideEffectOutcome {
    Applied { detail: String },
    /// Primary operation succeeded; the side effect is parked on the follow-up queue.
    Deferred { follow_up_id: String, reason: String },
    Skipped { reason: String },
}

impl SideEffectOutcome {
    pub fn applied(detail: impl Into<String>) -> Self {
        Self::Applied {
            detail: detail.into(),
        }
    }

    pub fn skipped(reason: impl Into<String>) -> Self {
        Self::Skipped {
            reason: reason.into(),
        }
    }

    pub fn is_deferred(&self) -> bool {
        matches!(self, Self::Deferred { .. })
    }
}
