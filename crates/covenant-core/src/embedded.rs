use crate::error::ContractError;
use serde::{Deserialize, Serialize};
use url::Url;

/// Outcome of an embedded signing session, as reported on the return URL.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum EmbeddedSigningStatus {
    Launched,
    Completed,
    Cancelled,
    Declined,
    Other,
}

impl EmbeddedSigningStatus {
    /// Map the provider's return `event` query parameter.
    pub fn from_return_event(event: &str) -> Self {
        match event.trim().to_ascii_lowercase().as_str() {
            "signing_complete" | "completed" => Self::Completed,
            "cancel" | "canceled" | "cancelled" => Self::Cancelled,
            "decline" | "declined" => Self::Declined,
            _ => Self::Other,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Launched => "launched",
            Self::Completed => "completed",
            Self::Cancelled => "cancelled",
            Self::Declined => "declined",
            Self::Other => "other",
        }
    }
}

/// Resolve a provider-issued signing URL against the configured base URI.
///
/// Relative URLs are joined onto the base. Absolute URLs must share the base
/// origin; anything else is refused rather than redirected to.
pub fn normalize_signing_url(raw: &str, base_uri: &str) -> Result<String, ContractError> {
    let base = Url::parse(base_uri).map_err(|e| {
        ContractError::validation(format!("invalid provider base uri '{base_uri}': {e}"))
    })?;
    let raw = raw.trim();
    if raw.is_empty() {
        return Err(ContractError::validation("provider returned an empty signing url"));
    }

    let resolved = match Url::parse(raw) {
        Ok(absolute) => absolute,
        Err(url::ParseError::RelativeUrlWithoutBase) => base
            .join(raw)
            .map_err(|e| ContractError::validation(format!("malformed signing url: {e}")))?,
        Err(e) => {
            return Err(ContractError::validation(format!(
                "malformed signing url: {e}"
            )))
        }
    };

    if !matches!(resolved.scheme(), "https" | "http") {
        return Err(ContractError::validation(format!(
            "signing url scheme '{}' is not allowed",
            resolved.scheme()
        )));
    }
    if resolved.origin() != base.origin() {
        return Err(ContractError::validation(format!(
            "signing url host '{}' does not match the provider",
            resolved.host_str().unwrap_or_default()
        )));
    }

    Ok(resolved.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    const BASE: &str = "https://sign.example.net/restapi";

    #[test]
    fn maps_return_events() {
        assert_eq!(
            EmbeddedSigningStatus::from_return_event("signing_complete"),
            EmbeddedSigningStatus::Completed
        );
        assert_eq!(
            EmbeddedSigningStatus::from_return_event("canceled"),
            EmbeddedSigningStatus::Cancelled
        );
        assert_eq!(
            EmbeddedSigningStatus::from_return_event("decline"),
            EmbeddedSigningStatus::Declined
        );
        assert_eq!(
            EmbeddedSigningStatus::from_return_event("ttl_expired"),
            EmbeddedSigningStatus::Other
        );
    }

    #[test]
    fn joins_relative_urls_onto_base() {
        let url = normalize_signing_url("/Signing/StartInSession.aspx?t=abc", BASE).unwrap();
        assert_eq!(url, "https://sign.example.net/Signing/StartInSession.aspx?t=abc");
    }

    #[test]
    fn keeps_same_origin_absolute_urls() {
        let url = normalize_signing_url("https://sign.example.net/Signing/?t=1", BASE).unwrap();
        assert_eq!(url, "https://sign.example.net/Signing/?t=1");
    }

    #[test]
    fn rejects_foreign_or_odd_urls() {
        assert!(normalize_signing_url("https://evil.example.com/x", BASE).is_err());
        assert!(normalize_signing_url("javascript:alert(1)", BASE).is_err());
        assert!(normalize_signing_url("   ", BASE).is_err());
    }
}
