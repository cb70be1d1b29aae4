use super::{close_subscription, ContractEngine};
use crate::error::ContractError;
use crate::journal::JournalEntryKind;
use crate::lifecycle::ContractState;
use crate::termination::{ClosureDetails, ClosureRecord, TerminationRequest, TerminationStep};
use crate::types::{format_minor, AmountMinor};
use serde::{Deserialize, Serialize};

/// One wizard interaction. The acting user is passed alongside.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum TerminationAction {
    RequestOverride {
        cost_minor: AmountMinor,
        justification: String,
    },
    ApplyOverride,
    Approve,
    ConfirmPayment {
        reference: String,
    },
    EquipmentReturned {
        returned: bool,
    },
    Closure {
        details: ClosureDetails,
    },
    Next,
    Back,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TerminationReceipt {
    pub contract_id: String,
    pub contract_state: ContractState,
    pub closure: ClosureRecord,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AbandonOutcome {
    /// Nothing had been entered; the request is gone.
    Deleted,
    /// Partial input is kept so the wizard can be resumed.
    Kept,
}

impl ContractEngine {
    /// Start the termination wizard, or resume the open request for this contract.
    pub async fn open_termination(
        &self,
        contract_id: &str,
        requested_by: &str,
    ) -> Result<TerminationRequest, ContractError> {
        let _guard = self.lock_contract(contract_id).await?;
        if let Some(existing) = self.store.load_termination(contract_id).await? {
            return Ok(existing);
        }

        let contract = self.contract(contract_id).await?;
        contract.state().check_transition(ContractState::Terminated)?;
        let total_paid = self
            .collaborators
            .billing
            .total_paid(contract_id)
            .await?;
        let cost = contract.early_termination_cost(total_paid);
        let request = TerminationRequest::open(
            contract_id,
            contract.subscription_id.clone(),
            requested_by,
            cost,
            contract.currency.clone(),
        );
        self.store.save_termination(&request).await?;

        tracing::info!(contract_id, cost_minor = cost, "termination opened");
        self.note(
            contract_id,
            format!(
                "Early termination opened by {requested_by}; computed cost {} {}",
                format_minor(cost),
                request.currency
            ),
        )
        .await;
        Ok(request)
    }

    pub async fn termination(&self, contract_id: &str) -> Result<TerminationRequest, ContractError> {
        self.store
            .load_termination(contract_id)
            .await?
            .ok_or_else(|| ContractError::not_found(format!("open termination for '{contract_id}'")))
    }

    /// Apply one wizard action. A failed action leaves the stored request as it was.
    pub async fn update_termination(
        &self,
        contract_id: &str,
        actor: &str,
        action: TerminationAction,
    ) -> Result<TerminationRequest, ContractError> {
        let _guard = self.lock_contract(contract_id).await?;
        let mut request = self.termination(contract_id).await?;

        let note = match action {
            TerminationAction::RequestOverride {
                cost_minor,
                justification,
            } => {
                request.request_override(actor, cost_minor, &justification)?;
                Some(format!(
                    "{actor} requested a termination cost override to {} {}: {}",
                    format_minor(cost_minor),
                    request.currency,
                    justification.trim()
                ))
            }
            TerminationAction::ApplyOverride => {
                request.apply_override(actor)?;
                Some(format!(
                    "{actor} approved the override; applied cost {} {}",
                    format_minor(request.applied_cost_minor),
                    request.currency
                ))
            }
            TerminationAction::Approve => {
                request.approve(actor)?;
                Some(format!("{actor} approved the termination cost"))
            }
            TerminationAction::ConfirmPayment { reference } => {
                let payment = self
                    .collaborators
                    .billing
                    .find_payment(&reference)
                    .await?
                    .ok_or_else(|| ContractError::not_found(format!("payment '{reference}'")))?;
                request.confirm_payment(&payment)?;
                Some(format!("Termination payment {reference} confirmed by {actor}"))
            }
            TerminationAction::EquipmentReturned { returned } => {
                request.set_equipment_returned(returned)?;
                None
            }
            TerminationAction::Closure { details } => {
                request.set_closure(details)?;
                None
            }
            TerminationAction::Next => {
                request.next_step()?;
                None
            }
            TerminationAction::Back => {
                request.previous_step()?;
                None
            }
        };

        self.store.save_termination(&request).await?;
        tracing::debug!(contract_id, actor, step = request.step.as_str(), "termination updated");
        if let Some(body) = note {
            self.note(contract_id, body).await;
        }
        Ok(request)
    }

    /// Final confirmation: every gate is re-checked, recurring billing is
    /// cancelled, then the contract is terminated.
    pub async fn confirm_termination(
        &self,
        contract_id: &str,
        actor: &str,
    ) -> Result<TerminationReceipt, ContractError> {
        let _guard = self.lock_contract(contract_id).await?;
        let mut request = self.termination(contract_id).await?;
        let closure = request.check_ready_to_confirm()?.clone();

        let (mut subscription, mut contract) = self.load_bundle(contract_id).await?;
        contract.state().check_transition(ContractState::Terminated)?;
        self.collaborators
            .billing
            .cancel_recurring_billing(&subscription.subscription_id)
            .await?;

        let event = contract.transition(ContractState::Terminated)?;
        subscription.apply_contract_event(&event);
        close_subscription(&mut subscription);
        request.mark_confirmed();
        let record = ClosureRecord::from_request(&request, &closure);

        self.store
            .save_termination_bundle(&subscription, &contract, &request)
            .await?;
        self.record(contract_id, JournalEntryKind::Closure, &record)
            .await;

        tracing::info!(
            contract_id,
            actor,
            applied_cost_minor = request.applied_cost_minor,
            "contract terminated"
        );
        self.note(
            contract_id,
            format!(
                "Contract terminated by {actor}; applied cost {} {}{}",
                format_minor(request.applied_cost_minor),
                request.currency,
                if request.is_waiver() { " (waived)" } else { "" }
            ),
        )
        .await;

        Ok(TerminationReceipt {
            contract_id: contract_id.to_string(),
            contract_state: contract.state(),
            closure: record,
        })
    }

    /// Leaving the wizard deletes the request only when nothing was entered.
    pub async fn abandon_termination(&self, contract_id: &str) -> Result<AbandonOutcome, ContractError> {
        let _guard = self.lock_contract(contract_id).await?;
        let request = self.termination(contract_id).await?;
        if !request.is_untouched() || request.step != TerminationStep::Cost {
            return Ok(AbandonOutcome::Kept);
        }
        self.store.delete_termination(contract_id).await?;
        self.note(contract_id, "Untouched termination request discarded")
            .await;
        Ok(AbandonOutcome::Deleted)
    }
}
