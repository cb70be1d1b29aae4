use covenant_core::ContractError;
use thiserror::Error;

/// Transport-level failures of the HTTP gateway.
///
/// Never leaves this crate: every variant folds into a [`ContractError`]
/// before reaching the engine.
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("{operation} timed out")]
    Timeout { operation: &'static str },

    #[error("{operation} transport error: {message}")]
    Transport {
        operation: &'static str,
        message: String,
    },

    #[error("{operation} rejected the access token")]
    Unauthorized { operation: &'static str },

    #[error("{operation} returned HTTP {status}: {body}")]
    Status {
        operation: &'static str,
        status: u16,
        body: String,
    },

    #[error("{operation} returned an unreadable body: {message}")]
    Decode {
        operation: &'static str,
        message: String,
    },

    #[error("invalid gateway configuration: {0}")]
    Config(String),
}

impl GatewayError {
    pub fn transport(operation: &'static str, err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Self::Timeout { operation }
        } else {
            Self::Transport {
                operation,
                message: err.to_string(),
            }
        }
    }

    pub fn decode(operation: &'static str, message: impl ToString) -> Self {
        Self::Decode {
            operation,
            message: message.to_string(),
        }
    }

    fn operation(&self) -> &'static str {
        match self {
            Self::Timeout { operation }
            | Self::Transport { operation, .. }
            | Self::Unauthorized { operation }
            | Self::Status { operation, .. }
            | Self::Decode { operation, .. } => operation,
            Self::Config(_) => "configure",
        }
    }
}

impl From<GatewayError> for ContractError {
    fn from(err: GatewayError) -> Self {
        match err {
            GatewayError::Unauthorized { .. } => ContractError::AuthenticationFailed(err.to_string()),
            GatewayError::Config(message) => ContractError::validation(message),
            other => ContractError::provider(other.operation(), other.to_string()),
        }
    }
}

/// Trim a response body so error messages stay readable in logs and follow-ups.
pub(crate) fn excerpt(body: &str) -> String {
    const LIMIT: usize = 512;
    let body = body.trim();
    match body.char_indices().nth(LIMIT) {
        Some((cut, _)) => format!("{}...", &body[..cut]),
        None => body.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unauthorized_maps_to_authentication_failed() {
        let err: ContractError = GatewayError::Unauthorized {
            operation: "envelope_status",
        }
        .into();
        assert_eq!(err.code(), "authentication_failed");
    }

    #[test]
    fn status_errors_keep_the_operation() {
        let err: ContractError = GatewayError::Status {
            operation: "create_envelope",
            status: 400,
            body: "INVALID_EMAIL_ADDRESS_FOR_RECIPIENT".to_string(),
        }
        .into();
        match err {
            ContractError::Provider { operation, message } => {
                assert_eq!(operation, "create_envelope");
                assert!(message.contains("HTTP 400"));
                assert!(message.contains("INVALID_EMAIL_ADDRESS_FOR_RECIPIENT"));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn long_bodies_are_cut() {
        let body = "x".repeat(2_000);
        let cut = excerpt(&body);
        assert_eq!(cut.len(), 515);
        assert!(cut.ends_with("..."));
        assert_eq!(excerpt("  short  "), "short");
    }
}
