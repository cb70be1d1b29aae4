use super::coordinator::adjustment_note;
use super::{subscription_key, ContractEngine};
use crate::addendum::AddendumState;
use crate::collaborators::InstallationTaskRequest;
use crate::contract::{Contract, SigningTarget};
use crate::envelope::{EnvelopeState, ReconcileDelta};
use crate::error::ContractError;
use crate::followup::{FollowUpKind, SideEffectOutcome};
use crate::lifecycle::{ContractEvent, ContractState};
use crate::types::{InstallationState, Subscription};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Which path asked for the reconciliation. Every path converges on the same
/// fetch-and-apply routine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReconcileSource {
    Webhook,
    Poll,
    Portal,
}

impl ReconcileSource {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Webhook => "webhook",
            Self::Poll => "poll",
            Self::Portal => "portal",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconcileOutcome {
    pub contract_id: String,
    pub envelope_id: String,
    pub source: ReconcileSource,
    pub previous_state: EnvelopeState,
    pub state: EnvelopeState,
    pub newly_signed: Vec<u32>,
    pub contract_state: ContractState,
    /// False when the report matched what was already recorded.
    pub changed: bool,
    pub side_effects: Vec<SideEffectOutcome>,
}

/// Provider webhook notification, reduced to what reconciliation needs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WebhookEvent {
    pub event: String,
    pub envelope_id: String,
}

const SIGNING_EVENTS: [&str; 5] = [
    "recipient-completed",
    "envelope-completed",
    "recipient-declined",
    "envelope-declined",
    "envelope-voided",
];

impl WebhookEvent {
    /// Accepts `{"event": "...", "data": {"envelopeId": "..."}}`.
    pub fn parse(payload: &Value) -> Result<Self, ContractError> {
        let event = payload
            .get("event")
            .and_then(Value::as_str)
            .ok_or_else(|| ContractError::validation("webhook payload has no event"))?;
        let envelope_id = payload
            .get("data")
            .and_then(|data| data.get("envelopeId"))
            .and_then(Value::as_str)
            .filter(|id| !id.trim().is_empty())
            .ok_or_else(|| ContractError::validation("webhook payload has no envelope id"))?;
        Ok(Self {
            event: event.to_string(),
            envelope_id: envelope_id.to_string(),
        })
    }

    pub fn is_signing_event(&self) -> bool {
        SIGNING_EVENTS.contains(&self.event.as_str())
    }
}

/// What happened to a webhook delivery. Always acknowledged to the provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "disposition", rename_all = "snake_case")]
pub enum WebhookDisposition {
    Reconciled { outcome: ReconcileOutcome },
    Ignored { reason: String },
    UnknownEnvelope { envelope_id: String },
    Failed { envelope_id: String, error: String },
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PollSummary {
    pub checked: usize,
    pub changed: usize,
    pub failed: usize,
}

impl ContractEngine {
    /// Fetch the provider's view of `envelope_id` and fold it into the owning
    /// contract or addendum. Safe to repeat: an unchanged report writes nothing.
    pub async fn reconcile_envelope(
        &self,
        envelope_id: &str,
        source: ReconcileSource,
    ) -> Result<ReconcileOutcome, ContractError> {
        let owner = self
            .store
            .find_contract_by_envelope(envelope_id)
            .await?
            .ok_or_else(|| ContractError::not_found(format!("envelope '{envelope_id}'")))?;
        let _guard = self.locks.lock(&subscription_key(&owner.subscription_id)).await;

        let (mut subscription, mut contract) = self.load_bundle(&owner.contract_id).await?;
        let target = contract
            .target_for_envelope(envelope_id)
            .ok_or_else(|| ContractError::not_found(format!("envelope '{envelope_id}'")))?;
        let report = self
            .collaborators
            .provider
            .envelope_status(envelope_id)
            .await?;

        let packet = contract
            .signing_packet_mut(&target)
            .ok_or_else(|| ContractError::not_found(format!("envelope '{envelope_id}'")))?;
        let delta = packet.apply_report(&report, Utc::now())?;

        let mut outcome = ReconcileOutcome {
            contract_id: contract.contract_id.clone(),
            envelope_id: envelope_id.to_string(),
            source,
            previous_state: delta.previous_state,
            state: delta.state,
            newly_signed: delta.newly_signed.clone(),
            contract_state: contract.state(),
            changed: !delta.is_noop(),
            side_effects: Vec::new(),
        };
        if delta.is_noop() {
            tracing::debug!(envelope_id, source = source.as_str(), "envelope unchanged");
            return Ok(outcome);
        }
        if !delta.unknown_recipients.is_empty() {
            tracing::warn!(
                envelope_id,
                unknown = ?delta.unknown_recipients,
                "status report names recipients this envelope does not have"
            );
        }

        outcome.side_effects = match &target {
            SigningTarget::Contract => {
                self.apply_contract_delta(&mut subscription, &mut contract, &delta)
                    .await?
            }
            SigningTarget::Addendum(addendum_id) => {
                self.apply_addendum_delta(&mut contract, addendum_id, &delta)
                    .await
            }
        };
        contract.updated_at = Utc::now();
        outcome.contract_state = contract.state();
        self.store.save_bundle(&subscription, &contract).await?;

        tracing::info!(
            contract_id = %contract.contract_id,
            envelope_id,
            source = source.as_str(),
            from = delta.previous_state.as_str(),
            to = delta.state.as_str(),
            newly_signed = delta.newly_signed.len(),
            "envelope reconciled"
        );
        self.note(
            &contract.contract_id,
            format!(
                "Envelope {envelope_id} reconciled via {}: {} -> {}{}",
                source.as_str(),
                delta.previous_state.as_str(),
                delta.state.as_str(),
                if delta.newly_signed.is_empty() {
                    String::new()
                } else {
                    format!("; newly signed {:?}", delta.newly_signed)
                }
            ),
        )
        .await;
        Ok(outcome)
    }

    async fn apply_contract_delta(
        &self,
        subscription: &mut Subscription,
        contract: &mut Contract,
        delta: &ReconcileDelta,
    ) -> Result<Vec<SideEffectOutcome>, ContractError> {
        let mut side_effects = Vec::new();

        let signed_now = delta.entered(EnvelopeState::CustomerSigned)
            || (delta.entered(EnvelopeState::Completed)
                && delta.previous_state != EnvelopeState::CustomerSigned);
        if signed_now {
            if let Some(envelope_id) = contract.signing.envelope_id() {
                subscription.apply_contract_event(&ContractEvent::CustomerSigned {
                    contract_id: contract.contract_id.clone(),
                    envelope_id: envelope_id.to_string(),
                });
            }
            side_effects.push(self.schedule_installation(subscription, contract).await);
        }

        if delta.entered(EnvelopeState::Completed) {
            if contract.state() == ContractState::Draft {
                let event = contract.transition(ContractState::Active)?;
                subscription.apply_contract_event(&event);
            }
            if !signed_now {
                side_effects.push(self.schedule_installation(subscription, contract).await);
            }
            side_effects.extend(
                self.download_signed_documents(contract, &SigningTarget::Contract)
                    .await,
            );
        }

        if delta.entered(EnvelopeState::Declined) {
            side_effects.push(
                self.defer(
                    &contract.contract_id,
                    FollowUpKind::EnvelopeDeclined,
                    "a recipient declined the contract envelope".to_string(),
                )
                .await,
            );
        }
        if delta.entered(EnvelopeState::Voided) {
            side_effects.push(
                self.defer(
                    &contract.contract_id,
                    FollowUpKind::EnvelopeVoided,
                    "the contract envelope was voided at the provider".to_string(),
                )
                .await,
            );
        }
        Ok(side_effects)
    }

    async fn apply_addendum_delta(
        &self,
        contract: &mut Contract,
        addendum_id: &str,
        delta: &ReconcileDelta,
    ) -> Vec<SideEffectOutcome> {
        let mut side_effects = Vec::new();

        if delta.entered(EnvelopeState::Completed) {
            if let Some(addendum) = contract.addendum_mut(addendum_id) {
                if addendum.state == AddendumState::PendingSignature {
                    addendum.state = AddendumState::Signed;
                }
            }
            let outcome = match contract.activate_addendum(addendum_id, Utc::now().date_naive()) {
                Ok(applied) => {
                    self.note(&contract.contract_id, adjustment_note(addendum_id, &applied))
                        .await;
                    SideEffectOutcome::applied(format!("addendum {addendum_id} activated"))
                }
                Err(e) => SideEffectOutcome::skipped(format!(
                    "addendum {addendum_id} signed but not activated: {e}"
                )),
            };
            side_effects.push(outcome);
            side_effects.extend(
                self.download_signed_documents(
                    contract,
                    &SigningTarget::Addendum(addendum_id.to_string()),
                )
                .await,
            );
        }

        for (state, kind) in [
            (EnvelopeState::Declined, FollowUpKind::EnvelopeDeclined),
            (EnvelopeState::Voided, FollowUpKind::EnvelopeVoided),
        ] {
            if delta.entered(state) {
                side_effects.push(
                    self.defer(
                        &contract.contract_id,
                        kind,
                        format!("addendum {addendum_id} envelope is {}", state.as_str()),
                    )
                    .await,
                );
            }
        }
        side_effects
    }

    /// Request the installation task once per contract, as soon as the
    /// customer has signed.
    async fn schedule_installation(
        &self,
        subscription: &mut Subscription,
        contract: &mut Contract,
    ) -> SideEffectOutcome {
        if contract.installation_task_attempted {
            return SideEffectOutcome::skipped("installation task already requested");
        }
        if subscription.renewal_no_change {
            return SideEffectOutcome::skipped("renewal without service change");
        }
        contract.installation_task_attempted = true;

        let request = InstallationTaskRequest {
            subscription_id: subscription.subscription_id.clone(),
            contract_id: contract.contract_id.clone(),
            customer_name: subscription.customer_name.clone(),
            reason: "customer signed the contract".to_string(),
        };
        let result = self
            .collaborators
            .tasks
            .create_installation_task(&request)
            .await;
        if subscription.installation_state == InstallationState::NotStarted {
            subscription.installation_state = InstallationState::ToBeScheduled;
            subscription.touch();
        }

        match result {
            Ok(task_ref) => {
                subscription.installation_task_ref = Some(task_ref.clone());
                SideEffectOutcome::applied(format!("installation task {task_ref} created"))
            }
            Err(e) => {
                self.defer(
                    &contract.contract_id,
                    FollowUpKind::InstallationTaskFailed,
                    format!("installation task could not be created: {e}"),
                )
                .await
            }
        }
    }

    /// Webhook entry point. Never fails: unparseable, irrelevant and unknown
    /// deliveries are reported in the disposition and acknowledged.
    pub async fn handle_webhook(&self, payload: &Value) -> WebhookDisposition {
        let event = match WebhookEvent::parse(payload) {
            Ok(event) => event,
            Err(e) => {
                tracing::debug!(error = %e, "ignoring malformed webhook");
                return WebhookDisposition::Ignored {
                    reason: e.to_string(),
                };
            }
        };
        if !event.is_signing_event() {
            return WebhookDisposition::Ignored {
                reason: format!("event '{}' does not affect signing", event.event),
            };
        }

        match self
            .reconcile_envelope(&event.envelope_id, ReconcileSource::Webhook)
            .await
        {
            Ok(outcome) => WebhookDisposition::Reconciled { outcome },
            Err(ContractError::NotFound(_)) => {
                tracing::info!(envelope_id = %event.envelope_id, "webhook for unknown envelope");
                WebhookDisposition::UnknownEnvelope {
                    envelope_id: event.envelope_id,
                }
            }
            Err(e) => {
                tracing::warn!(
                    envelope_id = %event.envelope_id,
                    error = %e,
                    "webhook reconciliation failed; polling will retry"
                );
                match self.store.find_contract_by_envelope(&event.envelope_id).await {
                    Ok(Some(owner)) => {
                        self.defer(
                            &owner.contract_id,
                            FollowUpKind::ReconcileFailed,
                            format!("webhook for envelope {} failed: {e}", event.envelope_id),
                        )
                        .await;
                    }
                    Ok(None) => {}
                    Err(lookup) => {
                        tracing::error!(
                            envelope_id = %event.envelope_id,
                            error = %lookup,
                            "could not record webhook failure"
                        );
                    }
                }
                WebhookDisposition::Failed {
                    envelope_id: event.envelope_id,
                    error: e.to_string(),
                }
            }
        }
    }

    /// Reconcile every envelope that is still waiting on the provider.
    pub async fn poll_open_envelopes(&self) -> Result<PollSummary, ContractError> {
        let mut summary = PollSummary::default();
        for contract in self.store.list_contracts().await? {
            if matches!(
                contract.state(),
                ContractState::Expired | ContractState::Terminated
            ) {
                continue;
            }
            for envelope_id in contract.open_envelope_ids() {
                summary.checked += 1;
                match self
                    .reconcile_envelope(&envelope_id, ReconcileSource::Poll)
                    .await
                {
                    Ok(outcome) if outcome.changed => summary.changed += 1,
                    Ok(_) => {}
                    Err(e) => {
                        summary.failed += 1;
                        self.defer(
                            &contract.contract_id,
                            FollowUpKind::ReconcileFailed,
                            format!("polling envelope {envelope_id} failed: {e}"),
                        )
                        .await;
                    }
                }
            }
        }
        if summary.checked > 0 {
            tracing::info!(
                checked = summary.checked,
                changed = summary.changed,
                failed = summary.failed,
                "envelope poll finished"
            );
        }
        Ok(summary)
    }
}
