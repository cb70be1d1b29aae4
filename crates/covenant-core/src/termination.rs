//! Step-gated early termination wizard.
//!
//! The request is a plain value; every mutation returns `Result` and leaves the
//! request untouched on failure. Persistence and collaborator calls live in the
//! engine.

use crate::collaborators::PaymentRecord;
use crate::error::ContractError;
use crate::types::{format_minor, AmountMinor};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Costs strictly below this need a separate manager approval (100.00).
pub const MANAGER_APPROVAL_THRESHOLD_MINOR: AmountMinor = 10_000;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TerminationStep {
    Cost,
    Approval,
    Payment,
    Equipment,
    Closure,
    Done,
}

impl TerminationStep {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Cost => "cost",
            Self::Approval => "approval",
            Self::Payment => "payment",
            Self::Equipment => "equipment",
            Self::Closure => "closure",
            Self::Done => "done",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TerminationReason {
    Relocation,
    Price,
    ServiceQuality,
    Competitor,
    Other,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CompetitorInfo {
    pub name: String,
    pub offer: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ClosureDetails {
    pub reason: TerminationReason,
    pub competitor: Option<CompetitorInfo>,
    pub notes: String,
    /// Service rating, 1 to 5.
    pub rating: u8,
    #[serde(default)]
    pub problems: Vec<String>,
}

impl ClosureDetails {
    pub fn validate(&self) -> Result<(), ContractError> {
        if self.notes.trim().is_empty() {
            return Err(ContractError::validation("closure notes are required"));
        }
        if !(1..=5).contains(&self.rating) {
            return Err(ContractError::validation("service rating must be between 1 and 5"));
        }
        if self.reason == TerminationReason::Competitor {
            let named = self
                .competitor
                .as_ref()
                .map(|competitor| !competitor.name.trim().is_empty())
                .unwrap_or(false);
            if !named {
                return Err(ContractError::validation(
                    "competitor name is required when the customer left for a competitor",
                ));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct OverrideRequest {
    pub requested_by: String,
    pub requested_cost_minor: AmountMinor,
    pub justification: String,
    pub requested_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct OverrideApproval {
    pub approved_by: String,
    pub applied_cost_minor: AmountMinor,
    pub approved_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ManagerApproval {
    pub manager: String,
    pub approved_at: DateTime<Utc>,
}

/// Resumable termination wizard state, one open request per contract.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TerminationRequest {
    pub request_id: String,
    pub contract_id: String,
    pub subscription_id: String,
    pub requested_by: String,
    pub step: TerminationStep,
    pub computed_cost_minor: AmountMinor,
    pub applied_cost_minor: AmountMinor,
    pub currency: String,
    pub override_request: Option<OverrideRequest>,
    pub override_approval: Option<OverrideApproval>,
    pub manager_approval: Option<ManagerApproval>,
    pub payment_confirmed: bool,
    pub payment_reference: Option<String>,
    pub equipment_returned: bool,
    pub closure: Option<ClosureDetails>,
    touched: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl TerminationRequest {
    pub fn open(
        contract_id: impl Into<String>,
        subscription_id: impl Into<String>,
        requested_by: impl Into<String>,
        computed_cost_minor: AmountMinor,
        currency: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            request_id: Uuid::new_v4().to_string(),
            contract_id: contract_id.into(),
            subscription_id: subscription_id.into(),
            requested_by: requested_by.into(),
            step: TerminationStep::Cost,
            computed_cost_minor,
            applied_cost_minor: computed_cost_minor,
            currency: currency.into(),
            override_request: None,
            override_approval: None,
            manager_approval: None,
            payment_confirmed: false,
            payment_reference: None,
            equipment_returned: false,
            closure: None,
            touched: false,
            created_at: now,
            updated_at: now,
            completed_at: None,
        }
    }

    /// Nothing has been entered since the request was opened.
    pub fn is_untouched(&self) -> bool {
        !self.touched
    }

    pub fn is_complete(&self) -> bool {
        self.step == TerminationStep::Done
    }

    pub fn is_waiver(&self) -> bool {
        self.override_approval.is_some() && self.applied_cost_minor == 0
    }

    fn ensure_open(&self) -> Result<(), ContractError> {
        if self.is_complete() {
            return Err(ContractError::validation("termination request is already confirmed"));
        }
        Ok(())
    }

    fn mark_touched(&mut self) {
        self.touched = true;
        self.updated_at = Utc::now();
    }

    /// Ask for a waiver (cost 0) or reduction, with justification.
    pub fn request_override(
        &mut self,
        requested_by: &str,
        requested_cost_minor: AmountMinor,
        justification: &str,
    ) -> Result<(), ContractError> {
        self.ensure_open()?;
        if !matches!(self.step, TerminationStep::Cost | TerminationStep::Approval) {
            return Err(ContractError::validation(
                "overrides can only be requested on the cost or approval step",
            ));
        }
        if justification.trim().is_empty() {
            return Err(ContractError::validation("override justification is required"));
        }
        if requested_cost_minor < 0 || requested_cost_minor >= self.computed_cost_minor {
            return Err(ContractError::validation(format!(
                "override cost must be between 0.00 and {} (exclusive)",
                format_minor(self.computed_cost_minor)
            )));
        }

        self.override_request = Some(OverrideRequest {
            requested_by: requested_by.to_string(),
            requested_cost_minor,
            justification: justification.trim().to_string(),
            requested_at: Utc::now(),
        });
        self.override_approval = None;
        self.applied_cost_minor = self.computed_cost_minor;
        self.mark_touched();
        Ok(())
    }

    /// Apply a requested override. The manager must be neither the termination
    /// requester nor the override requester.
    pub fn apply_override(&mut self, manager: &str) -> Result<(), ContractError> {
        self.ensure_open()?;
        let request = self
            .override_request
            .as_ref()
            .ok_or_else(|| ContractError::validation("no override has been requested"))?;
        for requester in [&self.requested_by, &request.requested_by] {
            if manager == requester.as_str() {
                return Err(ContractError::SeparationOfDutiesViolation {
                    approver: manager.to_string(),
                    requester: requester.clone(),
                });
            }
        }

        let applied = request.requested_cost_minor;
        self.override_approval = Some(OverrideApproval {
            approved_by: manager.to_string(),
            applied_cost_minor: applied,
            approved_at: Utc::now(),
        });
        if applied != self.applied_cost_minor {
            self.payment_confirmed = false;
            self.payment_reference = None;
        }
        self.applied_cost_minor = applied;
        self.mark_touched();
        Ok(())
    }

    /// Manager sign-off for the unchanged-cost path.
    pub fn approve(&mut self, manager: &str) -> Result<(), ContractError> {
        self.ensure_open()?;
        if manager == self.requested_by {
            return Err(ContractError::SeparationOfDutiesViolation {
                approver: manager.to_string(),
                requester: self.requested_by.clone(),
            });
        }
        self.manager_approval = Some(ManagerApproval {
            manager: manager.to_string(),
            approved_at: Utc::now(),
        });
        self.mark_touched();
        Ok(())
    }

    /// Accept a payment that matches the applied cost to the cent.
    pub fn confirm_payment(&mut self, payment: &PaymentRecord) -> Result<(), ContractError> {
        self.ensure_open()?;
        if let Some(invoice) = &payment.applied_invoice {
            return Err(ContractError::validation(format!(
                "payment '{}' is already applied to invoice '{invoice}'",
                payment.reference
            )));
        }
        if !payment.currency.eq_ignore_ascii_case(&self.currency) {
            return Err(ContractError::validation(format!(
                "payment currency {} does not match {}",
                payment.currency, self.currency
            )));
        }
        if payment.amount_minor != self.applied_cost_minor {
            return Err(ContractError::AmountMismatch {
                expected_minor: self.applied_cost_minor,
                actual_minor: payment.amount_minor,
            });
        }

        self.payment_confirmed = true;
        self.payment_reference = Some(payment.reference.clone());
        self.mark_touched();
        Ok(())
    }

    pub fn set_equipment_returned(&mut self, returned: bool) -> Result<(), ContractError> {
        self.ensure_open()?;
        self.equipment_returned = returned;
        self.mark_touched();
        Ok(())
    }

    pub fn set_closure(&mut self, details: ClosureDetails) -> Result<(), ContractError> {
        self.ensure_open()?;
        details.validate()?;
        self.closure = Some(details);
        self.mark_touched();
        Ok(())
    }

    fn override_applied(&self) -> bool {
        self.override_approval.is_some()
    }

    /// Unchanged-cost path, except for the manager approval.
    fn check_unchanged_cost_path(&self) -> Result<(), ContractError> {
        if self.applied_cost_minor != self.computed_cost_minor {
            return Err(ContractError::validation(
                "applied cost differs from the computed cost without an approved override",
            ));
        }
        if !self.payment_confirmed {
            return Err(ContractError::validation(format!(
                "payment of {} {} must be confirmed before continuing",
                format_minor(self.applied_cost_minor),
                self.currency
            )));
        }
        Ok(())
    }

    fn check_manager_approval(&self) -> Result<(), ContractError> {
        if self.applied_cost_minor < MANAGER_APPROVAL_THRESHOLD_MINOR
            && self.manager_approval.is_none()
        {
            return Err(ContractError::validation(format!(
                "manager approval is required for termination costs below {}",
                format_minor(MANAGER_APPROVAL_THRESHOLD_MINOR)
            )));
        }
        Ok(())
    }

    fn check_cost_gate(&self) -> Result<(), ContractError> {
        if self.override_applied() {
            return Ok(());
        }
        if self.override_request.is_some() {
            return Err(ContractError::validation(
                "the requested override is awaiting manager approval",
            ));
        }
        self.check_unchanged_cost_path()?;
        self.check_manager_approval()
    }

    /// Advance one step if the current step's gate is satisfied.
    pub fn next_step(&mut self) -> Result<TerminationStep, ContractError> {
        self.ensure_open()?;
        let next = match self.step {
            TerminationStep::Cost => {
                if self.override_request.is_none() {
                    self.check_cost_gate()?;
                }
                TerminationStep::Approval
            }
            TerminationStep::Approval => {
                self.check_cost_gate()?;
                if self.is_waiver() {
                    TerminationStep::Equipment
                } else {
                    TerminationStep::Payment
                }
            }
            TerminationStep::Payment => {
                if !self.payment_confirmed || self.payment_reference.is_none() {
                    return Err(ContractError::validation(format!(
                        "select a payment of exactly {} {}",
                        format_minor(self.applied_cost_minor),
                        self.currency
                    )));
                }
                TerminationStep::Equipment
            }
            TerminationStep::Equipment => {
                if !self.equipment_returned {
                    return Err(ContractError::validation(
                        "equipment return must be confirmed",
                    ));
                }
                TerminationStep::Closure
            }
            TerminationStep::Closure => {
                return Err(ContractError::validation(
                    "closure is the last step; confirm the termination instead",
                ))
            }
            TerminationStep::Done => {
                return Err(ContractError::validation("termination request is already confirmed"))
            }
        };
        self.step = next;
        self.mark_touched();
        Ok(next)
    }

    /// Mirror of [`Self::next_step`].
    pub fn previous_step(&mut self) -> Result<TerminationStep, ContractError> {
        self.ensure_open()?;
        let previous = match self.step {
            TerminationStep::Cost => {
                return Err(ContractError::validation("already on the first step"))
            }
            TerminationStep::Approval => TerminationStep::Cost,
            TerminationStep::Payment => TerminationStep::Approval,
            TerminationStep::Equipment if self.is_waiver() => TerminationStep::Approval,
            TerminationStep::Equipment => TerminationStep::Payment,
            TerminationStep::Closure => TerminationStep::Equipment,
            TerminationStep::Done => {
                return Err(ContractError::validation("termination request is already confirmed"))
            }
        };
        self.step = previous;
        self.mark_touched();
        Ok(previous)
    }

    /// Every gate re-checked, as the final confirmation requires.
    pub fn check_ready_to_confirm(&self) -> Result<&ClosureDetails, ContractError> {
        self.ensure_open()?;
        if self.step != TerminationStep::Closure {
            return Err(ContractError::validation(format!(
                "termination can only be confirmed from the closure step (currently {})",
                self.step.as_str()
            )));
        }
        self.check_cost_gate()?;
        if self.applied_cost_minor > 0 && !self.payment_confirmed {
            return Err(ContractError::validation("payment is not confirmed"));
        }
        if !self.equipment_returned {
            return Err(ContractError::validation("equipment return must be confirmed"));
        }
        let closure = self
            .closure
            .as_ref()
            .ok_or_else(|| ContractError::validation("closure reason, notes and rating are required"))?;
        closure.validate()?;
        Ok(closure)
    }

    pub fn mark_confirmed(&mut self) {
        let now = Utc::now();
        self.step = TerminationStep::Done;
        self.completed_at = Some(now);
        self.updated_at = now;
    }

    /// Who authorised the cost that was applied.
    pub fn approved_by(&self) -> Option<&str> {
        self.override_approval
            .as_ref()
            .map(|approval| approval.approved_by.as_str())
            .or_else(|| {
                self.manager_approval
                    .as_ref()
                    .map(|approval| approval.manager.as_str())
            })
    }
}

/// Audit record written when a termination is confirmed.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ClosureRecord {
    pub request_id: String,
    pub contract_id: String,
    pub subscription_id: String,
    pub requested_by: String,
    pub approved_by: Option<String>,
    pub computed_cost_minor: AmountMinor,
    pub applied_cost_minor: AmountMinor,
    pub currency: String,
    pub override_justification: Option<String>,
    pub payment_reference: Option<String>,
    pub equipment_returned: bool,
    pub reason: TerminationReason,
    pub competitor: Option<CompetitorInfo>,
    pub notes: String,
    pub rating: u8,
    pub problems: Vec<String>,
    pub closed_at: DateTime<Utc>,
}

impl ClosureRecord {
    pub fn from_request(request: &TerminationRequest, closure: &ClosureDetails) -> Self {
        Self {
            request_id: request.request_id.clone(),
            contract_id: request.contract_id.clone(),
            subscription_id: request.subscription_id.clone(),
            requested_by: request.requested_by.clone(),
            approved_by: request.approved_by().map(str::to_string),
            computed_cost_minor: request.computed_cost_minor,
            applied_cost_minor: request.applied_cost_minor,
            currency: request.currency.clone(),
            override_justification: request
                .override_request
                .as_ref()
                .map(|request| request.justification.clone()),
            payment_reference: request.payment_reference.clone(),
            equipment_returned: request.equipment_returned,
            reason: closure.reason,
            competitor: closure.competitor.clone(),
            notes: closure.notes.clone(),
            rating: closure.rating,
            problems: closure.problems.clone(),
            closed_at: Utc::now(),
        }
    }
}
