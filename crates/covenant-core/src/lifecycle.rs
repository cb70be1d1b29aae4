use crate::error::ContractError;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Authoritative contract lifecycle.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ContractState {
    Draft,
    Active,
    RenewalDue,
    Expired,
    Terminated,
}

impl ContractState {
    pub const ALL: [ContractState; 5] = [
        Self::Draft,
        Self::Active,
        Self::RenewalDue,
        Self::Expired,
        Self::Terminated,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Draft => "draft",
            Self::Active => "active",
            Self::RenewalDue => "renewal_due",
            Self::Expired => "expired",
            Self::Terminated => "terminated",
        }
    }

    /// Directed transition table. There are no implicit edges.
    pub fn allowed_next(self) -> &'static [ContractState] {
        match self {
            Self::Draft => &[Self::Active],
            Self::Active => &[Self::RenewalDue, Self::Expired, Self::Terminated],
            Self::RenewalDue => &[Self::Active, Self::Expired, Self::Terminated],
            Self::Expired => &[Self::Terminated],
            Self::Terminated => &[],
        }
    }

    pub fn can_transition_to(self, next: ContractState) -> bool {
        self.allowed_next().contains(&next)
    }

    pub fn check_transition(self, next: ContractState) -> Result<(), ContractError> {
        if self.can_transition_to(next) {
            Ok(())
        } else {
            Err(ContractError::InvalidTransition {
                from: self,
                to: next,
                allowed: self.allowed_next().to_vec(),
            })
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|state| state.as_str() == value.trim().to_ascii_lowercase())
    }
}

impl fmt::Display for ContractState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Events a contract emits towards its owning subscription.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ContractEvent {
    Created {
        contract_id: String,
    },
    EnvelopeSent {
        contract_id: String,
        envelope_id: String,
    },
    CustomerSigned {
        contract_id: String,
        envelope_id: String,
    },
    Transitioned {
        contract_id: String,
        from: ContractState,
        to: ContractState,
    },
}

impl ContractEvent {
    pub fn contract_id(&self) -> &str {
        match self {
            Self::Created { contract_id }
            | Self::EnvelopeSent { contract_id, .. }
            | Self::CustomerSigned { contract_id, .. }
            | Self::Transitioned { contract_id, .. } => contract_id,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_table_edges_are_allowed() {
        let allowed = [
            (ContractState::Draft, ContractState::Active),
            (ContractState::Active, ContractState::RenewalDue),
            (ContractState::Active, ContractState::Expired),
            (ContractState::Active, ContractState::Terminated),
            (ContractState::RenewalDue, ContractState::Active),
            (ContractState::RenewalDue, ContractState::Expired),
            (ContractState::RenewalDue, ContractState::Terminated),
            (ContractState::Expired, ContractState::Terminated),
        ];

        for from in ContractState::ALL {
            for to in ContractState::ALL {
                let expected = allowed.contains(&(from, to));
                assert_eq!(
                    from.check_transition(to).is_ok(),
                    expected,
                    "{from} -> {to}"
                );
            }
        }
    }

    #[test]
    fn terminated_is_a_sink() {
        let err = ContractState::Terminated
            .check_transition(ContractState::Active)
            .unwrap_err();
        assert!(err.to_string().contains("allowed next states: []"));
    }

    #[test]
    fn parses_wire_names() {
        assert_eq!(ContractState::parse("renewal_due"), Some(ContractState::RenewalDue));
        assert_eq!(ContractState::parse(" Active "), Some(ContractState::Active));
        assert_eq!(ContractState::parse("pending"), None);
    }
}
