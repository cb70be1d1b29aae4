use crate::lifecycle::{ContractEvent, ContractState};
use crate::phone::PhoneNumber;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Amounts are carried in minor units (cents) everywhere; never floats.
pub type AmountMinor = i64;

/// Render a minor-unit amount as `12.34` for notes and messages.
pub fn format_minor(amount: AmountMinor) -> String {
    let sign = if amount < 0 { "-" } else { "" };
    let abs = amount.unsigned_abs();
    format!("{sign}{}.{:02}", abs / 100, abs % 100)
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionState {
    Draft,
    Progress,
    Paused,
    Renewed,
    Churned,
    Suspended,
    Upsell,
    RenewalQuote,
}

impl SubscriptionState {
    pub const ALL: [SubscriptionState; 8] = [
        Self::Draft,
        Self::Progress,
        Self::Paused,
        Self::Renewed,
        Self::Churned,
        Self::Suspended,
        Self::Upsell,
        Self::RenewalQuote,
    ];
}

/// Contract progress as seen from the subscription.
///
/// Only written through [`Subscription::apply_contract_event`].
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionContractState {
    PendingContract,
    PendingCustomerSignature,
    PendingCabalSignature,
    Active,
    Expired,
    Terminated,
    NotRequired,
}

impl SubscriptionContractState {
    pub const ALL: [SubscriptionContractState; 7] = [
        Self::PendingContract,
        Self::PendingCustomerSignature,
        Self::PendingCabalSignature,
        Self::Active,
        Self::Expired,
        Self::Terminated,
        Self::NotRequired,
    ];
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum InstallationState {
    NotStarted,
    ToBeScheduled,
    Scheduled,
    Done,
    NotRequired,
}

impl InstallationState {
    pub const ALL: [InstallationState; 5] = [
        Self::NotStarted,
        Self::ToBeScheduled,
        Self::Scheduled,
        Self::Done,
        Self::NotRequired,
    ];

    pub fn is_satisfied(self) -> bool {
        matches!(self, Self::Done | Self::NotRequired)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ConfigurationState {
    Pending,
    Done,
    NotRequired,
}

impl ConfigurationState {
    pub const ALL: [ConfigurationState; 3] = [Self::Pending, Self::Done, Self::NotRequired];

    pub fn is_satisfied(self) -> bool {
        matches!(self, Self::Done | Self::NotRequired)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum InternetServiceState {
    Pending,
    Active,
    Suspended,
    NotRequired,
}

impl InternetServiceState {
    pub const ALL: [InternetServiceState; 4] = [
        Self::Pending,
        Self::Active,
        Self::Suspended,
        Self::NotRequired,
    ];

    pub fn is_satisfied(self) -> bool {
        matches!(self, Self::Active | Self::NotRequired)
    }
}

/// Sale-order status of the quotation behind a subscription.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum QuoteStatus {
    Draft,
    Sent,
    Confirmed,
    Cancelled,
}

impl QuoteStatus {
    pub fn is_confirmable(self) -> bool {
        matches!(self, Self::Draft | Self::Sent)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryChannel {
    #[default]
    Email,
    Whatsapp,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RecipientRole {
    Customer,
    Company,
}

/// Commercial terms copied onto each contract period.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ContractTerms {
    pub monthly_payment_minor: AmountMinor,
    pub duration_months: u32,
    pub early_termination_fee_minor: AmountMinor,
    pub currency: String,
}

impl ContractTerms {
    pub fn contract_value_minor(&self) -> AmountMinor {
        self.monthly_payment_minor * AmountMinor::from(self.duration_months)
    }
}

/// Root aggregate for a customer's recurring service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Subscription {
    pub subscription_id: String,
    pub customer_id: String,
    pub customer_name: String,
    pub customer_email: String,
    pub customer_phone: Option<String>,
    pub subscription_state: SubscriptionState,
    contract_state: SubscriptionContractState,
    pub installation_state: InstallationState,
    pub configuration_state: ConfigurationState,
    pub internet_service_state: InternetServiceState,
    pub quote_uuid: String,
    pub quote_status: QuoteStatus,
    quote_confirmed: bool,
    /// Renewal that carries over the installed service untouched.
    pub renewal_no_change: bool,
    pub preferred_channel: DeliveryChannel,
    pub billing_active: bool,
    pub terms: ContractTerms,
    pub installation_task_ref: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Subscription {
    pub fn new(
        customer_id: impl Into<String>,
        customer_name: impl Into<String>,
        customer_email: impl Into<String>,
        terms: ContractTerms,
    ) -> Self {
        let now = Utc::now();
        Self {
            subscription_id: Uuid::new_v4().to_string(),
            customer_id: customer_id.into(),
            customer_name: customer_name.into(),
            customer_email: customer_email.into(),
            customer_phone: None,
            subscription_state: SubscriptionState::Draft,
            contract_state: SubscriptionContractState::PendingContract,
            installation_state: InstallationState::NotStarted,
            configuration_state: ConfigurationState::Pending,
            internet_service_state: InternetServiceState::Pending,
            quote_uuid: Uuid::new_v4().to_string(),
            quote_status: QuoteStatus::Draft,
            quote_confirmed: false,
            renewal_no_change: false,
            preferred_channel: DeliveryChannel::Email,
            billing_active: false,
            terms,
            installation_task_ref: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_phone(mut self, phone: impl Into<String>) -> Self {
        self.customer_phone = Some(phone.into());
        self
    }

    pub fn contract_state(&self) -> SubscriptionContractState {
        self.contract_state
    }

    pub fn quote_confirmed(&self) -> bool {
        self.quote_confirmed
    }

    /// Mark the quotation confirmed. Returns `false` when it already was.
    pub fn confirm_quote(&mut self) -> bool {
        if self.quote_confirmed {
            return false;
        }
        self.quote_confirmed = true;
        self.quote_status = QuoteStatus::Confirmed;
        self.subscription_state = SubscriptionState::Progress;
        self.billing_active = true;
        self.touch();
        true
    }

    /// Apply a contract-side event to the subscription projection.
    ///
    /// This is the only writer of `contract_state`: the contract emits, the
    /// subscription follows, never the other way round.
    pub fn apply_contract_event(&mut self, event: &ContractEvent) {
        let next = match event {
            ContractEvent::Created { .. } => Some(SubscriptionContractState::PendingContract),
            ContractEvent::EnvelopeSent { .. } => {
                Some(SubscriptionContractState::PendingCustomerSignature)
            }
            ContractEvent::CustomerSigned { .. } => {
                Some(SubscriptionContractState::PendingCabalSignature)
            }
            ContractEvent::Transitioned { to, .. } => match to {
                ContractState::Active => Some(SubscriptionContractState::Active),
                ContractState::Expired => Some(SubscriptionContractState::Expired),
                ContractState::Terminated => Some(SubscriptionContractState::Terminated),
                ContractState::Draft | ContractState::RenewalDue => None,
            },
        };

        if let Some(next) = next {
            if self.contract_state != next {
                self.contract_state = next;
                self.touch();
            }
        }
    }

    pub fn cancel_billing(&mut self) {
        self.billing_active = false;
        self.touch();
    }

    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}

/// Source document attached to a contract or addendum before sending.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SourceDocument {
    pub document_id: String,
    pub name: String,
    pub content: Vec<u8>,
}

impl SourceDocument {
    pub fn new(name: impl Into<String>, content: Vec<u8>) -> Self {
        Self {
            document_id: Uuid::new_v4().to_string(),
            name: name.into(),
            content,
        }
    }
}

/// Signed document pulled from the provider after completion.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StoredDocument {
    pub recipient_id: u32,
    pub file_name: String,
    pub content_hash: String,
    pub size_bytes: u64,
    pub archive_ref: String,
    pub downloaded_at: DateTime<Utc>,
}

/// Party attached to a signing envelope.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Recipient {
    /// Routing ordinal, assigned once at envelope creation.
    pub recipient_id: Option<u32>,
    pub envelope_id: Option<String>,
    pub name: String,
    pub email: String,
    pub phone: Option<String>,
    pub role: RecipientRole,
    pub delivery_channel: DeliveryChannel,
    pub whatsapp_number: Option<PhoneNumber>,
    pub sign_status: bool,
    pub signed_at: Option<DateTime<Utc>>,
    /// Enables embedded (in-app) signing when set.
    pub client_user_id: Option<String>,
}

impl Recipient {
    pub fn new(name: impl Into<String>, email: impl Into<String>, role: RecipientRole) -> Self {
        Self {
            recipient_id: None,
            envelope_id: None,
            name: name.into(),
            email: email.into(),
            phone: None,
            role,
            delivery_channel: DeliveryChannel::Email,
            whatsapp_number: None,
            sign_status: false,
            signed_at: None,
            client_user_id: None,
        }
    }

    pub fn with_phone(mut self, phone: impl Into<String>) -> Self {
        self.phone = Some(phone.into());
        self
    }

    pub fn with_client_user_id(mut self, client_user_id: impl Into<String>) -> Self {
        self.client_user_id = Some(client_user_id.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn terms() -> ContractTerms {
        ContractTerms {
            monthly_payment_minor: 4_500,
            duration_months: 24,
            early_termination_fee_minor: 10_000,
            currency: "USD".to_string(),
        }
    }

    #[test]
    fn formats_minor_amounts() {
        assert_eq!(format_minor(4_500), "45.00");
        assert_eq!(format_minor(7), "0.07");
        assert_eq!(format_minor(-1_250), "-12.50");
    }

    #[test]
    fn quote_confirmation_is_set_once() {
        let mut subscription = Subscription::new("cust-1", "Ana", "ana@example.com", terms());
        assert!(subscription.confirm_quote());
        assert!(!subscription.confirm_quote());
        assert!(subscription.quote_confirmed());
        assert_eq!(subscription.subscription_state, SubscriptionState::Progress);
    }

    #[test]
    fn contract_state_follows_contract_events_only() {
        let mut subscription = Subscription::new("cust-1", "Ana", "ana@example.com", terms());
        subscription.apply_contract_event(&ContractEvent::EnvelopeSent {
            contract_id: "c-1".to_string(),
            envelope_id: "env-1".to_string(),
        });
        assert_eq!(
            subscription.contract_state(),
            SubscriptionContractState::PendingCustomerSignature
        );

        subscription.apply_contract_event(&ContractEvent::Transitioned {
            contract_id: "c-1".to_string(),
            from: ContractState::Active,
            to: ContractState::RenewalDue,
        });
        assert_eq!(
            subscription.contract_state(),
            SubscriptionContractState::PendingCustomerSignature
        );

        subscription.apply_contract_event(&ContractEvent::Transitioned {
            contract_id: "c-1".to_string(),
            from: ContractState::Draft,
            to: ContractState::Active,
        });
        assert_eq!(subscription.contract_state(), SubscriptionContractState::Active);
    }

    #[test]
    fn contract_value_is_monthly_times_duration() {
        assert_eq!(terms().contract_value_minor(), 108_000);
    }
}
