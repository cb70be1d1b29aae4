use crate::addendum::{Addendum, AddendumState, AppliedAdjustment};
use crate::embedded::EmbeddedSigningStatus;
use crate::envelope::SigningPacket;
use crate::error::ContractError;
use crate::lifecycle::{ContractEvent, ContractState};
use crate::types::{AmountMinor, Subscription};
use chrono::{DateTime, Datelike, Months, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Which signing packet of a contract an envelope belongs to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SigningTarget {
    Contract,
    Addendum(String),
}

/// One signed agreement period of a subscription.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Contract {
    pub contract_id: String,
    pub subscription_id: String,
    pub name: String,
    state: ContractState,
    pub monthly_payment_minor: AmountMinor,
    pub contract_value_minor: AmountMinor,
    pub early_termination_fee_minor: AmountMinor,
    pub currency: String,
    pub duration_months: u32,
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
    pub signing: SigningPacket,
    pub addendums: Vec<Addendum>,
    pub embedded_status: Option<EmbeddedSigningStatus>,
    /// Installation task auto-creation is attempted at most once per contract.
    pub installation_task_attempted: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub activated_at: Option<DateTime<Utc>>,
    pub terminated_at: Option<DateTime<Utc>>,
}

impl Contract {
    /// Open a draft contract from the subscription's current terms.
    pub fn draft_for(
        subscription: &Subscription,
        start_date: NaiveDate,
    ) -> Result<(Self, ContractEvent), ContractError> {
        let terms = &subscription.terms;
        if terms.duration_months == 0 {
            return Err(ContractError::validation("contract duration must be at least one month"));
        }
        if terms.monthly_payment_minor < 0 || terms.early_termination_fee_minor < 0 {
            return Err(ContractError::validation("contract amounts cannot be negative"));
        }
        let end_date = add_months(start_date, terms.duration_months)?;
        let now = Utc::now();
        let contract = Self {
            contract_id: Uuid::new_v4().to_string(),
            subscription_id: subscription.subscription_id.clone(),
            name: format!("Service contract {}", subscription.customer_name),
            state: ContractState::Draft,
            monthly_payment_minor: terms.monthly_payment_minor,
            contract_value_minor: terms.contract_value_minor(),
            early_termination_fee_minor: terms.early_termination_fee_minor,
            currency: terms.currency.clone(),
            duration_months: terms.duration_months,
            start_date,
            end_date,
            signing: SigningPacket::new(),
            addendums: Vec::new(),
            embedded_status: None,
            installation_task_attempted: false,
            created_at: now,
            updated_at: now,
            activated_at: None,
            terminated_at: None,
        };
        let event = ContractEvent::Created {
            contract_id: contract.contract_id.clone(),
        };
        Ok((contract, event))
    }

    pub fn state(&self) -> ContractState {
        self.state
    }

    /// Move along the transition table. On failure the contract is untouched.
    pub fn transition(&mut self, to: ContractState) -> Result<ContractEvent, ContractError> {
        let from = self.state;
        from.check_transition(to)?;

        let now = Utc::now();
        self.state = to;
        match to {
            ContractState::Active if self.activated_at.is_none() => self.activated_at = Some(now),
            ContractState::Terminated => self.terminated_at = Some(now),
            _ => {}
        }
        self.updated_at = now;

        Ok(ContractEvent::Transitioned {
            contract_id: self.contract_id.clone(),
            from,
            to,
        })
    }

    /// `contract_value - total_paid + early_termination_fee`, never below zero.
    pub fn early_termination_cost(&self, total_paid_minor: AmountMinor) -> AmountMinor {
        (self.contract_value_minor - total_paid_minor + self.early_termination_fee_minor).max(0)
    }

    /// Whole months left between `today` and the end date.
    pub fn remaining_months(&self, today: NaiveDate) -> u32 {
        if today >= self.end_date {
            return 0;
        }
        let mut months = (self.end_date.year() - today.year()) * 12
            + self.end_date.month() as i32
            - today.month() as i32;
        if self.end_date.day() < today.day() {
            months -= 1;
        }
        u32::try_from(months.max(0)).unwrap_or(0)
    }

    pub fn renewal_window_open(&self, today: NaiveDate, notice_days: u32) -> bool {
        let notice_start = self.end_date - chrono::Duration::days(i64::from(notice_days));
        today >= notice_start && today < self.end_date
    }

    /// Extend the contract period. A contract awaiting renewal becomes active again.
    pub fn renew(&mut self, months: u32) -> Result<Option<ContractEvent>, ContractError> {
        if months == 0 {
            return Err(ContractError::validation("renewal must add at least one month"));
        }
        let reactivate = match self.state {
            ContractState::Active => false,
            ContractState::RenewalDue => true,
            ContractState::Draft => {
                return Err(ContractError::validation(
                    "a draft contract cannot be renewed before it is signed",
                ))
            }
            other => {
                other.check_transition(ContractState::Active)?;
                true
            }
        };
        let end_date = add_months(self.end_date, months)?;

        let event = if reactivate {
            Some(self.transition(ContractState::Active)?)
        } else {
            None
        };
        self.end_date = end_date;
        self.duration_months += months;
        self.contract_value_minor += self.monthly_payment_minor * AmountMinor::from(months);
        self.updated_at = Utc::now();
        Ok(event)
    }

    pub fn addendum(&self, addendum_id: &str) -> Option<&Addendum> {
        self.addendums
            .iter()
            .find(|addendum| addendum.addendum_id == addendum_id)
    }

    pub fn addendum_mut(&mut self, addendum_id: &str) -> Option<&mut Addendum> {
        self.addendums
            .iter_mut()
            .find(|addendum| addendum.addendum_id == addendum_id)
    }

    pub fn signing_packet_mut(&mut self, target: &SigningTarget) -> Option<&mut SigningPacket> {
        match target {
            SigningTarget::Contract => Some(&mut self.signing),
            SigningTarget::Addendum(id) => self.addendum_mut(id).map(|addendum| &mut addendum.signing),
        }
    }

    /// Locate the packet that was sent under `envelope_id`.
    pub fn target_for_envelope(&self, envelope_id: &str) -> Option<SigningTarget> {
        if self.signing.envelope_id() == Some(envelope_id) {
            return Some(SigningTarget::Contract);
        }
        self.addendums
            .iter()
            .find(|addendum| addendum.signing.envelope_id() == Some(envelope_id))
            .map(|addendum| SigningTarget::Addendum(addendum.addendum_id.clone()))
    }

    /// All envelope ids still waiting on the provider.
    pub fn open_envelope_ids(&self) -> Vec<String> {
        std::iter::once(&self.signing)
            .chain(self.addendums.iter().map(|addendum| &addendum.signing))
            .filter_map(|packet| {
                let envelope = packet.envelope.as_ref()?;
                let open = !envelope.state.is_terminal_failure()
                    && envelope.state != crate::envelope::EnvelopeState::Completed;
                open.then(|| envelope.envelope_id.clone())
            })
            .collect()
    }

    /// Apply a signed addendum's deltas, prorated over the months left.
    pub fn activate_addendum(
        &mut self,
        addendum_id: &str,
        today: NaiveDate,
    ) -> Result<AppliedAdjustment, ContractError> {
        if !matches!(self.state, ContractState::Active | ContractState::RenewalDue) {
            return Err(ContractError::validation(format!(
                "addendum cannot be activated on a {} contract",
                self.state
            )));
        }
        let remaining = self.remaining_months(today);
        let addendum = self
            .addendum_mut(addendum_id)
            .ok_or_else(|| ContractError::not_found(format!("addendum '{addendum_id}'")))?;
        if addendum.state != AddendumState::Signed {
            return Err(ContractError::validation(format!(
                "addendum is {}; only signed addenda can be activated",
                addendum.state.as_str()
            )));
        }

        let adjustment = addendum.adjustment_for(remaining);
        addendum.state = AddendumState::Active;
        addendum.applied = Some(adjustment);
        addendum.activated_at = Some(Utc::now());

        self.monthly_payment_minor += adjustment.monthly_delta_minor;
        self.contract_value_minor += adjustment.value_delta_minor;
        self.updated_at = Utc::now();
        Ok(adjustment)
    }

    /// Cancel an addendum, reversing exactly what its activation applied.
    pub fn cancel_addendum(&mut self, addendum_id: &str) -> Result<(), ContractError> {
        let addendum = self
            .addendum_mut(addendum_id)
            .ok_or_else(|| ContractError::not_found(format!("addendum '{addendum_id}'")))?;
        if addendum.state == AddendumState::Cancelled {
            return Err(ContractError::validation("addendum is already cancelled"));
        }

        let reversal = addendum.applied.take();
        addendum.state = AddendumState::Cancelled;
        addendum.cancelled_at = Some(Utc::now());

        if let Some(applied) = reversal {
            self.monthly_payment_minor -= applied.monthly_delta_minor;
            self.contract_value_minor -= applied.value_delta_minor;
        }
        self.updated_at = Utc::now();
        Ok(())
    }
}

fn add_months(date: NaiveDate, months: u32) -> Result<NaiveDate, ContractError> {
    date.checked_add_months(Months::new(months))
        .ok_or_else(|| ContractError::validation("contract end date out of range"))
}
