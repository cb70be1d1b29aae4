use crate::types::{
    ConfigurationState, InstallationState, InternetServiceState, Subscription,
    SubscriptionContractState, SubscriptionState,
};
use serde::{Deserialize, Serialize};

/// Single human-facing label summarizing a subscription's progress.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ProgressStage {
    Draft,
    Confirmed,
    PendingContract,
    PendingClientSignature,
    PendingCabalSignature,
    ScheduleInstall,
    PendingInstall,
    PendingActivation,
    Active,
    ActiveWithIssues,
    Paused,
    PausedWithIssues,
    Suspended,
    SuspendedWithIssues,
    Renewed,
    Churned,
}

impl ProgressStage {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Draft => "draft",
            Self::Confirmed => "confirmed",
            Self::PendingContract => "pending_contract",
            Self::PendingClientSignature => "pending_client_signature",
            Self::PendingCabalSignature => "pending_cabal_signature",
            Self::ScheduleInstall => "schedule_install",
            Self::PendingInstall => "pending_install",
            Self::PendingActivation => "pending_activation",
            Self::Active => "active",
            Self::ActiveWithIssues => "active_with_issues",
            Self::Paused => "paused",
            Self::PausedWithIssues => "paused_with_issues",
            Self::Suspended => "suspended",
            Self::SuspendedWithIssues => "suspended_with_issues",
            Self::Renewed => "renewed",
            Self::Churned => "churned",
        }
    }
}

/// Everything the projection reads. Nothing else, in particular no history.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ProgressInputs {
    pub subscription_state: SubscriptionState,
    pub contract_state: SubscriptionContractState,
    pub installation_state: InstallationState,
    pub configuration_state: ConfigurationState,
    pub internet_service_state: InternetServiceState,
    pub quote_confirmed: bool,
    pub renewal_no_change: bool,
}

impl From<&Subscription> for ProgressInputs {
    fn from(subscription: &Subscription) -> Self {
        Self {
            subscription_state: subscription.subscription_state,
            contract_state: subscription.contract_state(),
            installation_state: subscription.installation_state,
            configuration_state: subscription.configuration_state,
            internet_service_state: subscription.internet_service_state,
            quote_confirmed: subscription.quote_confirmed(),
            renewal_no_change: subscription.renewal_no_change,
        }
    }
}

impl ProgressInputs {
    fn contract_satisfied(&self) -> bool {
        matches!(
            self.contract_state,
            SubscriptionContractState::Active | SubscriptionContractState::NotRequired
        )
    }

    fn install_satisfied(&self) -> bool {
        self.renewal_no_change || self.installation_state.is_satisfied()
    }

    fn configuration_satisfied(&self) -> bool {
        self.renewal_no_change || self.configuration_state.is_satisfied()
    }

    fn all_satisfied(&self) -> bool {
        self.contract_satisfied()
            && self.install_satisfied()
            && self.configuration_satisfied()
            && self.internet_service_state.is_satisfied()
    }

    /// Something that was in place has gone away again.
    fn regressed(&self) -> bool {
        matches!(
            self.contract_state,
            SubscriptionContractState::Expired | SubscriptionContractState::Terminated
        ) || self.internet_service_state == InternetServiceState::Suspended
    }
}

/// Derive the progress stage. First matching rule wins.
pub fn project(inputs: &ProgressInputs) -> ProgressStage {
    if !inputs.quote_confirmed {
        return ProgressStage::Draft;
    }

    match inputs.subscription_state {
        SubscriptionState::Upsell => ProgressStage::Confirmed,
        SubscriptionState::Paused if inputs.all_satisfied() => ProgressStage::Paused,
        SubscriptionState::Paused => ProgressStage::PausedWithIssues,
        SubscriptionState::Suspended if inputs.all_satisfied() => ProgressStage::Suspended,
        SubscriptionState::Suspended => ProgressStage::SuspendedWithIssues,
        SubscriptionState::Renewed => ProgressStage::Renewed,
        SubscriptionState::Churned => ProgressStage::Churned,
        SubscriptionState::Progress
        | SubscriptionState::Draft
        | SubscriptionState::RenewalQuote => walk(inputs),
    }
}

fn walk(inputs: &ProgressInputs) -> ProgressStage {
    if inputs.all_satisfied() {
        return ProgressStage::Active;
    }
    if inputs.regressed() {
        return ProgressStage::ActiveWithIssues;
    }

    match inputs.contract_state {
        SubscriptionContractState::PendingContract => return ProgressStage::PendingContract,
        SubscriptionContractState::PendingCustomerSignature => {
            return ProgressStage::PendingClientSignature
        }
        SubscriptionContractState::PendingCabalSignature => {
            return ProgressStage::PendingCabalSignature
        }
        _ => {}
    }

    if !inputs.install_satisfied() {
        return match inputs.installation_state {
            InstallationState::Scheduled => ProgressStage::PendingInstall,
            _ => ProgressStage::ScheduleInstall,
        };
    }

    if !inputs.configuration_satisfied() || !inputs.internet_service_state.is_satisfied() {
        return ProgressStage::PendingActivation;
    }

    ProgressStage::Active
}
