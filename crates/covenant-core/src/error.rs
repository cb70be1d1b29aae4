use crate::lifecycle::ContractState;
use crate::links::LinkRejection;
use crate::magic_link::MagicLinkRejection;
use thiserror::Error;

/// Covenant core errors.
#[derive(Debug, Error)]
pub enum ContractError {
    #[error("invalid transition from '{from}' to '{to}'; allowed next states: [{}]", render_states(.allowed))]
    InvalidTransition {
        from: ContractState,
        to: ContractState,
        allowed: Vec<ContractState>,
    },

    #[error("contract '{0}' has no source document attached")]
    MissingDocument(String),

    #[error("contract '{0}' has no recipients")]
    MissingRecipient(String),

    #[error("no signing envelope for '{0}'")]
    MissingEnvelope(String),

    #[error("envelope '{0}' was already sent; use resend or replace")]
    EnvelopeAlreadySent(String),

    #[error("cannot replace envelope: {0}")]
    CannotReplace(String),

    #[error("signature provider authentication failed: {0}")]
    AuthenticationFailed(String),

    #[error("amount mismatch: expected {expected_minor} minor units, got {actual_minor}")]
    AmountMismatch {
        expected_minor: i64,
        actual_minor: i64,
    },

    #[error("separation of duties violated: '{approver}' cannot approve a request made by '{requester}'")]
    SeparationOfDutiesViolation { approver: String, requester: String },

    #[error("invalid phone number '{0}': expected country code and subscriber number")]
    InvalidPhoneNumber(String),

    #[error("quote confirmation link rejected: {0}")]
    QuoteLinkRejected(LinkRejection),

    #[error("magic link rejected: {0}")]
    MagicLinkRejected(MagicLinkRejection),

    #[error("validation failed: {0}")]
    Validation(String),

    #[error("{0} not found")]
    NotFound(String),

    #[error("signature provider call '{operation}' failed: {message}")]
    Provider { operation: String, message: String },

    #[error("storage error: {0}")]
    Storage(String),

    #[error("serialization error: {0}")]
    Serialization(String),
}

impl ContractError {
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    pub fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound(what.into())
    }

    pub fn provider(operation: &str, message: impl Into<String>) -> Self {
        Self::Provider {
            operation: operation.to_string(),
            message: message.into(),
        }
    }

    /// Stable machine-readable code used by portal error pages and API bodies.
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidTransition { .. } => "invalid_transition",
            Self::MissingDocument(_) => "missing_document",
            Self::MissingRecipient(_) => "missing_recipient",
            Self::MissingEnvelope(_) => "missing_envelope",
            Self::EnvelopeAlreadySent(_) => "envelope_already_sent",
            Self::CannotReplace(_) => "cannot_replace",
            Self::AuthenticationFailed(_) => "authentication_failed",
            Self::AmountMismatch { .. } => "amount_mismatch",
            Self::SeparationOfDutiesViolation { .. } => "separation_of_duties",
            Self::InvalidPhoneNumber(_) => "invalid_phone_number",
            Self::QuoteLinkRejected(rejection) => rejection.code(),
            Self::MagicLinkRejected(rejection) => rejection.code(),
            Self::Validation(_) => "validation",
            Self::NotFound(_) => "not_found",
            Self::Provider { .. } => "provider_failure",
            Self::Storage(_) => "storage",
            Self::Serialization(_) => "serialization",
        }
    }
}

fn render_states(states: &[ContractState]) -> String {
    states
        .iter()
        .map(|state| state.as_str())
        .collect::<Vec<_>>()
        .join(", ")
}
