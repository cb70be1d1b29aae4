//! Contract engine: the one place that loads aggregates, serializes work per
//! contract, calls collaborators and persists results.

mod coordinator;
mod portal;
mod reconcile;
mod termination;

pub use coordinator::RecipientChanges;
pub use portal::{MagicLinkGrant, QuoteConfirmation, SigningRedirect, SigningReturn};
pub use reconcile::{PollSummary, ReconcileOutcome, ReconcileSource, WebhookDisposition, WebhookEvent};
pub use termination::{AbandonOutcome, TerminationAction, TerminationReceipt};

use crate::collaborators::{BillingGateway, DocumentArchive, DocumentRenderer, TaskScheduler};
use crate::contract::Contract;
use crate::error::ContractError;
use crate::followup::{FollowUp, FollowUpKind, SideEffectOutcome};
use crate::journal::{ContractNote, JournalEntry, JournalEntryKind};
use crate::journal_storage::{JournalStorageConfig, PersistentJournal};
use crate::lifecycle::ContractState;
use crate::links::QuoteLinkSigner;
use crate::locks::KeyedLocks;
use crate::progress::{project, ProgressInputs, ProgressStage};
use crate::provider::SignatureProvider;
use crate::store::ContractStore;
use crate::types::{
    ConfigurationState, InstallationState, InternetServiceState, Subscription, SubscriptionState,
};
use chrono::{Duration, NaiveDate};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

/// Counter-signer added after the customer on every envelope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompanySigner {
    pub name: String,
    pub email: String,
}

#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Provider base URI; embedded signing URLs must resolve under its origin.
    pub provider_base_uri: String,
    /// Public base URL of this service, used for portal and return links.
    pub public_base_url: String,
    pub quote_link_secrets: Vec<String>,
    pub quote_link_validity_days: u32,
    pub magic_link_ttl: Duration,
    pub renewal_notice_days: u32,
    pub company_signer: Option<CompanySigner>,
    pub journal_storage: JournalStorageConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            provider_base_uri: "https://sandbox.sign.local".to_string(),
            public_base_url: "http://localhost:8480".to_string(),
            quote_link_secrets: vec!["covenant-local-dev-secret".to_string()],
            quote_link_validity_days: 14,
            magic_link_ttl: Duration::hours(72),
            renewal_notice_days: 30,
            company_signer: Some(CompanySigner {
                name: "Contracts Desk".to_string(),
                email: "contracts@example.com".to_string(),
            }),
            journal_storage: JournalStorageConfig::Memory,
        }
    }
}

/// External capabilities the engine drives.
#[derive(Clone)]
pub struct Collaborators {
    pub provider: Arc<dyn SignatureProvider>,
    pub tasks: Arc<dyn TaskScheduler>,
    pub billing: Arc<dyn BillingGateway>,
    pub renderer: Arc<dyn DocumentRenderer>,
    pub archive: Arc<dyn DocumentArchive>,
}

/// Field-service progress reported by collaborators outside the signing flow.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServiceStateUpdate {
    pub installation_state: Option<InstallationState>,
    pub configuration_state: Option<ConfigurationState>,
    pub internet_service_state: Option<InternetServiceState>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SweepSummary {
    pub renewal_due: Vec<String>,
    pub expired: Vec<String>,
    pub failed: Vec<String>,
}

pub struct ContractEngine {
    config: EngineConfig,
    store: Arc<dyn ContractStore>,
    collaborators: Collaborators,
    journal: AsyncMutex<PersistentJournal>,
    locks: KeyedLocks,
    quote_links: QuoteLinkSigner,
}

impl ContractEngine {
    pub async fn bootstrap(
        config: EngineConfig,
        store: Arc<dyn ContractStore>,
        collaborators: Collaborators,
    ) -> Result<Self, ContractError> {
        let quote_links = QuoteLinkSigner::new(
            &config.quote_link_secrets,
            config.public_base_url.clone(),
            config.quote_link_validity_days,
        )?;
        let journal = PersistentJournal::bootstrap(config.journal_storage.clone()).await?;
        tracing::info!(
            journal = journal.backend_label(),
            provider = collaborators.provider.provider_id(),
            "contract engine ready"
        );

        Ok(Self {
            config,
            store,
            collaborators,
            journal: AsyncMutex::new(journal),
            locks: KeyedLocks::new(),
            quote_links,
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn quote_links(&self) -> &QuoteLinkSigner {
        &self.quote_links
    }

    pub async fn register_subscription(
        &self,
        subscription: Subscription,
    ) -> Result<Subscription, ContractError> {
        if subscription.customer_email.trim().is_empty() {
            return Err(ContractError::validation("customer email is required"));
        }
        self.store.save_subscription(&subscription).await?;
        tracing::info!(subscription_id = %subscription.subscription_id, "subscription registered");
        Ok(subscription)
    }

    pub async fn subscription(&self, subscription_id: &str) -> Result<Subscription, ContractError> {
        self.store
            .load_subscription(subscription_id)
            .await?
            .ok_or_else(|| ContractError::not_found(format!("subscription '{subscription_id}'")))
    }

    pub async fn contract(&self, contract_id: &str) -> Result<Contract, ContractError> {
        self.store
            .load_contract(contract_id)
            .await?
            .ok_or_else(|| ContractError::not_found(format!("contract '{contract_id}'")))
    }

    pub async fn progress(&self, subscription_id: &str) -> Result<ProgressStage, ContractError> {
        let subscription = self.subscription(subscription_id).await?;
        Ok(project(&ProgressInputs::from(&subscription)))
    }

    pub async fn journal_for(&self, contract_id: &str) -> Vec<JournalEntry> {
        self.journal
            .lock()
            .await
            .entries_for(contract_id)
            .into_iter()
            .cloned()
            .collect()
    }

    pub async fn verify_journal(&self) -> bool {
        self.journal.lock().await.verify_chain()
    }

    pub async fn follow_ups(&self, include_resolved: bool) -> Result<Vec<FollowUp>, ContractError> {
        self.store.list_follow_ups(include_resolved).await
    }

    pub async fn resolve_follow_up(
        &self,
        follow_up_id: &str,
        operator: &str,
    ) -> Result<FollowUp, ContractError> {
        let mut follow_up = self
            .store
            .load_follow_up(follow_up_id)
            .await?
            .ok_or_else(|| ContractError::not_found(format!("follow-up '{follow_up_id}'")))?;
        follow_up.resolve(operator);
        self.store.save_follow_up(&follow_up).await?;
        self.note(
            &follow_up.contract_id,
            format!("Follow-up {} resolved by {operator}", follow_up.kind.as_str()),
        )
        .await;
        Ok(follow_up)
    }

    /// Record field-service progress on the subscription.
    pub async fn update_service_states(
        &self,
        subscription_id: &str,
        update: ServiceStateUpdate,
    ) -> Result<Subscription, ContractError> {
        let _guard = self.locks.lock(&subscription_key(subscription_id)).await;
        let mut subscription = self.subscription(subscription_id).await?;
        if let Some(state) = update.installation_state {
            subscription.installation_state = state;
        }
        if let Some(state) = update.configuration_state {
            subscription.configuration_state = state;
        }
        if let Some(state) = update.internet_service_state {
            subscription.internet_service_state = state;
        }
        subscription.touch();
        self.store.save_subscription(&subscription).await?;
        Ok(subscription)
    }

    /// Staff-driven transition along the contract table.
    pub async fn transition_contract(
        &self,
        contract_id: &str,
        to: ContractState,
        actor: &str,
    ) -> Result<Contract, ContractError> {
        let _guard = self.lock_contract(contract_id).await?;
        let (mut subscription, mut contract) = self.load_bundle(contract_id).await?;
        contract.state().check_transition(to)?;

        if to == ContractState::Terminated {
            if self.store.load_termination(contract_id).await?.is_some() {
                return Err(ContractError::validation(
                    "an early termination request is open; finish it in the termination wizard",
                ));
            }
            self.collaborators
                .billing
                .cancel_recurring_billing(&subscription.subscription_id)
                .await?;
        }

        let event = contract.transition(to)?;
        subscription.apply_contract_event(&event);
        if to == ContractState::Terminated {
            close_subscription(&mut subscription);
        }
        self.store.save_bundle(&subscription, &contract).await?;

        tracing::info!(contract_id, to = %to, actor, "contract transitioned");
        let body = match to {
            ContractState::Terminated => format!(
                "Contract terminated by {actor} outside the termination wizard; recurring billing cancelled, \
                 no termination cost, payment or equipment return recorded"
            ),
            _ => format!("Contract moved to {to} by {actor}"),
        };
        self.note(contract_id, body).await;
        Ok(contract)
    }

    /// Move contracts into the renewal window to `renewal_due` and past their
    /// end date to `expired`.
    pub async fn sweep_lifecycle(&self, today: NaiveDate) -> Result<SweepSummary, ContractError> {
        let mut summary = SweepSummary::default();
        for candidate in self.store.list_contracts().await? {
            let target = match candidate.state() {
                ContractState::Active | ContractState::RenewalDue if today >= candidate.end_date => {
                    ContractState::Expired
                }
                ContractState::Active
                    if candidate.renewal_window_open(today, self.config.renewal_notice_days) =>
                {
                    ContractState::RenewalDue
                }
                _ => continue,
            };

            match self
                .transition_contract(&candidate.contract_id, target, "lifecycle-sweep")
                .await
            {
                Ok(_) if target == ContractState::Expired => {
                    summary.expired.push(candidate.contract_id)
                }
                Ok(_) => summary.renewal_due.push(candidate.contract_id),
                Err(e) => {
                    tracing::warn!(
                        contract_id = %candidate.contract_id,
                        error = %e,
                        "lifecycle sweep transition failed"
                    );
                    summary.failed.push(candidate.contract_id);
                }
            }
        }
        Ok(summary)
    }

    pub async fn renew_contract(
        &self,
        contract_id: &str,
        months: u32,
        actor: &str,
    ) -> Result<Contract, ContractError> {
        let _guard = self.lock_contract(contract_id).await?;
        let (mut subscription, mut contract) = self.load_bundle(contract_id).await?;
        if let Some(event) = contract.renew(months)? {
            subscription.apply_contract_event(&event);
        }
        self.store.save_bundle(&subscription, &contract).await?;
        self.note(
            contract_id,
            format!(
                "Contract renewed by {actor} for {months} months; new end date {}",
                contract.end_date
            ),
        )
        .await;
        Ok(contract)
    }

    /// Serialize work on the subscription that owns `contract_id`.
    ///
    /// Contract writes also rewrite the subscription, so the subscription is
    /// the unit of exclusion.
    async fn lock_contract(&self, contract_id: &str) -> Result<OwnedMutexGuard<()>, ContractError> {
        let contract = self.contract(contract_id).await?;
        Ok(self
            .locks
            .lock(&subscription_key(&contract.subscription_id))
            .await)
    }

    async fn load_bundle(&self, contract_id: &str) -> Result<(Subscription, Contract), ContractError> {
        let contract = self.contract(contract_id).await?;
        let subscription = self.subscription(&contract.subscription_id).await?;
        Ok((subscription, contract))
    }

    /// Append a system note. Journal failures are logged, never propagated:
    /// the primary write has already landed.
    async fn note(&self, contract_id: &str, body: impl Into<String>) {
        let mut journal = self.journal.lock().await;
        if let Err(e) = journal
            .append_note(contract_id, ContractNote::system(body))
            .await
        {
            tracing::error!(contract_id, error = %e, "failed to append contract note");
        }
    }

    async fn record<T: Serialize + Sync>(&self, contract_id: &str, kind: JournalEntryKind, record: &T) {
        let mut journal = self.journal.lock().await;
        if let Err(e) = journal.append_record(contract_id, kind, record).await {
            tracing::error!(contract_id, error = %e, "failed to append journal record");
        }
    }

    /// Park a failed side effect on the follow-up queue.
    ///
    /// An open follow-up of the same kind for the same contract is reused, so
    /// repeated poll failures do not flood the queue.
    async fn defer(&self, contract_id: &str, kind: FollowUpKind, detail: String) -> SideEffectOutcome {
        tracing::warn!(contract_id, kind = kind.as_str(), detail = %detail, "side effect deferred");

        let existing = match self.store.list_follow_ups(false).await {
            Ok(open) => open
                .into_iter()
                .find(|follow_up| follow_up.contract_id == contract_id && follow_up.kind == kind),
            Err(e) => {
                tracing::error!(contract_id, error = %e, "failed to list follow-ups");
                None
            }
        };
        if let Some(existing) = existing {
            return SideEffectOutcome::Deferred {
                follow_up_id: existing.follow_up_id,
                reason: detail,
            };
        }

        let follow_up = FollowUp::new(contract_id, kind, detail.clone());
        if let Err(e) = self.store.save_follow_up(&follow_up).await {
            tracing::error!(contract_id, error = %e, "failed to persist follow-up");
        }
        self.record(contract_id, JournalEntryKind::FollowUp, &follow_up)
            .await;
        SideEffectOutcome::Deferred {
            follow_up_id: follow_up.follow_up_id,
            reason: detail,
        }
    }
}

fn subscription_key(subscription_id: &str) -> String {
    format!("subscription:{subscription_id}")
}

fn close_subscription(subscription: &mut Subscription) {
    subscription.cancel_billing();
    subscription.subscription_state = SubscriptionState::Churned;
}

#[cfg(test)]
mod tests;
