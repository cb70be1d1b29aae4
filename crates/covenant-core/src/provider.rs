use crate::error::ContractError;
use crate::phone::PhoneNumber;
use crate::types::{DeliveryChannel, SourceDocument};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;

/// Envelope status as reported by the signature provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum ProviderEnvelopeStatus {
    Created,
    Sent,
    Delivered,
    Completed,
    Declined,
    Voided,
    Other(String),
}

impl ProviderEnvelopeStatus {
    pub fn parse(value: &str) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "created" => Self::Created,
            "sent" => Self::Sent,
            "delivered" => Self::Delivered,
            "completed" | "signed" => Self::Completed,
            "declined" => Self::Declined,
            "voided" => Self::Voided,
            other => Self::Other(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::Created => "created",
            Self::Sent => "sent",
            Self::Delivered => "delivered",
            Self::Completed => "completed",
            Self::Declined => "declined",
            Self::Voided => "voided",
            Self::Other(value) => value,
        }
    }

    /// Statuses in which the unsigned document may still be swapped.
    pub fn is_replaceable(&self) -> bool {
        matches!(self, Self::Created | Self::Sent | Self::Delivered)
    }
}

impl From<String> for ProviderEnvelopeStatus {
    fn from(value: String) -> Self {
        Self::parse(&value)
    }
}

impl From<ProviderEnvelopeStatus> for String {
    fn from(value: ProviderEnvelopeStatus) -> Self {
        value.as_str().to_string()
    }
}

impl fmt::Display for ProviderEnvelopeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Recipient status as reported by the signature provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum ProviderRecipientStatus {
    Created,
    Sent,
    Delivered,
    Signed,
    Completed,
    Declined,
    Other(String),
}

impl ProviderRecipientStatus {
    pub fn parse(value: &str) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "created" => Self::Created,
            "sent" => Self::Sent,
            "delivered" => Self::Delivered,
            "signed" => Self::Signed,
            "completed" => Self::Completed,
            "declined" => Self::Declined,
            other => Self::Other(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::Created => "created",
            Self::Sent => "sent",
            Self::Delivered => "delivered",
            Self::Signed => "signed",
            Self::Completed => "completed",
            Self::Declined => "declined",
            Self::Other(value) => value,
        }
    }

    pub fn is_signed(&self) -> bool {
        matches!(self, Self::Signed | Self::Completed)
    }

    pub fn is_declined(&self) -> bool {
        matches!(self, Self::Declined)
    }
}

impl From<String> for ProviderRecipientStatus {
    fn from(value: String) -> Self {
        Self::parse(&value)
    }
}

impl From<ProviderRecipientStatus> for String {
    fn from(value: ProviderRecipientStatus) -> Self {
        value.as_str().to_string()
    }
}

/// Recipient-level status observation.
///
/// The provider either reports one status shared by every recipient or one
/// status per recipient ordinal. This is resolved once, at the gateway boundary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum RecipientStatuses {
    Shared(ProviderRecipientStatus),
    PerRecipient(BTreeMap<u32, ProviderRecipientStatus>),
}

/// Normalized result of an envelope status query.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvelopeStatusReport {
    pub envelope_id: String,
    pub envelope_status: ProviderEnvelopeStatus,
    pub recipients: RecipientStatuses,
}

impl EnvelopeStatusReport {
    pub fn shared(
        envelope_id: impl Into<String>,
        envelope_status: ProviderEnvelopeStatus,
        recipient_status: ProviderRecipientStatus,
    ) -> Self {
        Self {
            envelope_id: envelope_id.into(),
            envelope_status,
            recipients: RecipientStatuses::Shared(recipient_status),
        }
    }

    pub fn per_recipient(
        envelope_id: impl Into<String>,
        envelope_status: ProviderEnvelopeStatus,
        statuses: impl IntoIterator<Item = (u32, ProviderRecipientStatus)>,
    ) -> Self {
        Self {
            envelope_id: envelope_id.into(),
            envelope_status,
            recipients: RecipientStatuses::PerRecipient(statuses.into_iter().collect()),
        }
    }

    /// Parse a provider status payload.
    ///
    /// Accepted shapes:
    /// - `{"envelopeId", "status", "recipientStatus": "completed"}`
    /// - `{"envelopeId", "status", "recipientStatus": {"1": "completed", "2": "sent"}}`
    /// - `{"envelopeId", "status", "recipients": {"signers": [{"recipientId": "1", "status": "sent"}]}}`
    pub fn from_payload(payload: &Value) -> Result<Self, ContractError> {
        let envelope_id = payload
            .get("envelopeId")
            .and_then(Value::as_str)
            .ok_or_else(|| malformed("missing envelopeId"))?
            .to_string();
        let envelope_status = payload
            .get("status")
            .and_then(Value::as_str)
            .map(ProviderEnvelopeStatus::parse)
            .ok_or_else(|| malformed("missing status"))?;

        let recipients = match payload.get("recipientStatus") {
            Some(Value::String(shared)) => {
                RecipientStatuses::Shared(ProviderRecipientStatus::parse(shared))
            }
            Some(Value::Object(map)) => {
                let mut statuses = BTreeMap::new();
                for (key, value) in map {
                    let ordinal = parse_ordinal(key)?;
                    let status = value
                        .as_str()
                        .ok_or_else(|| malformed("recipient status must be a string"))?;
                    statuses.insert(ordinal, ProviderRecipientStatus::parse(status));
                }
                RecipientStatuses::PerRecipient(statuses)
            }
            Some(_) => return Err(malformed("recipientStatus must be a string or an object")),
            None => match payload.pointer("/recipients/signers").and_then(Value::as_array) {
                Some(signers) => {
                    let mut statuses = BTreeMap::new();
                    for signer in signers {
                        let ordinal = match signer.get("recipientId") {
                            Some(Value::String(raw)) => parse_ordinal(raw)?,
                            Some(Value::Number(raw)) => raw
                                .as_u64()
                                .and_then(|value| u32::try_from(value).ok())
                                .ok_or_else(|| malformed("recipientId out of range"))?,
                            _ => return Err(malformed("signer without recipientId")),
                        };
                        let status = signer
                            .get("status")
                            .and_then(Value::as_str)
                            .ok_or_else(|| malformed("signer without status"))?;
                        statuses.insert(ordinal, ProviderRecipientStatus::parse(status));
                    }
                    RecipientStatuses::PerRecipient(statuses)
                }
                None => RecipientStatuses::Shared(match envelope_status {
                    ProviderEnvelopeStatus::Completed => ProviderRecipientStatus::Completed,
                    _ => ProviderRecipientStatus::Sent,
                }),
            },
        };

        Ok(Self {
            envelope_id,
            envelope_status,
            recipients,
        })
    }
}

fn parse_ordinal(raw: &str) -> Result<u32, ContractError> {
    raw.trim()
        .parse::<u32>()
        .map_err(|_| malformed(&format!("recipient ordinal '{raw}' is not a number")))
}

fn malformed(detail: &str) -> ContractError {
    ContractError::provider("envelope_status", format!("malformed status payload: {detail}"))
}

/// One recipient as submitted at envelope creation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecipientDraft {
    pub recipient_id: u32,
    pub routing_order: u32,
    pub name: String,
    pub email: String,
    pub delivery_channel: DeliveryChannel,
    pub phone: Option<PhoneNumber>,
    pub client_user_id: Option<String>,
}

/// Envelope creation request: all documents and recipients in one call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvelopeDraft {
    pub email_subject: String,
    pub documents: Vec<SourceDocument>,
    pub recipients: Vec<RecipientDraft>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvelopeReceipt {
    pub envelope_id: String,
    pub status: ProviderEnvelopeStatus,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecipientUpdate {
    pub recipient_id: u32,
    pub name: String,
    pub email: String,
    pub delivery_channel: DeliveryChannel,
    pub phone: Option<PhoneNumber>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmbeddedSigningRequest {
    pub envelope_id: String,
    pub recipient_id: u32,
    pub name: String,
    pub email: String,
    pub client_user_id: String,
    pub return_url: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadedDocument {
    pub file_name: String,
    pub bytes: Vec<u8>,
}

/// External e-signature capability.
///
/// Every call is a single bounded request; implementations carry their own
/// timeouts and report failures instead of retrying in a loop.
#[async_trait]
pub trait SignatureProvider: Send + Sync {
    fn provider_id(&self) -> &'static str;

    async fn create_envelope(&self, draft: &EnvelopeDraft)
        -> Result<EnvelopeReceipt, ContractError>;

    async fn replace_document(
        &self,
        envelope_id: &str,
        document: &SourceDocument,
    ) -> Result<(), ContractError>;

    async fn resend_envelope(&self, envelope_id: &str) -> Result<(), ContractError>;

    async fn update_recipient(
        &self,
        envelope_id: &str,
        update: &RecipientUpdate,
    ) -> Result<(), ContractError>;

    async fn envelope_status(&self, envelope_id: &str)
        -> Result<EnvelopeStatusReport, ContractError>;

    async fn download_document(
        &self,
        envelope_id: &str,
        recipient_id: u32,
    ) -> Result<DownloadedDocument, ContractError>;

    async fn embedded_signing_url(
        &self,
        request: &EmbeddedSigningRequest,
    ) -> Result<String, ContractError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_shared_recipient_status() {
        let report = EnvelopeStatusReport::from_payload(&json!({
            "envelopeId": "env-1",
            "status": "sent",
            "recipientStatus": "delivered"
        }))
        .unwrap();

        assert_eq!(report.envelope_status, ProviderEnvelopeStatus::Sent);
        assert_eq!(
            report.recipients,
            RecipientStatuses::Shared(ProviderRecipientStatus::Delivered)
        );
    }

    #[test]
    fn parses_per_recipient_map() {
        let report = EnvelopeStatusReport::from_payload(&json!({
            "envelopeId": "env-1",
            "status": "sent",
            "recipientStatus": {"1": "completed", "2": "sent"}
        }))
        .unwrap();

        match report.recipients {
            RecipientStatuses::PerRecipient(map) => {
                assert!(map[&1].is_signed());
                assert!(!map[&2].is_signed());
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn parses_signer_list() {
        let report = EnvelopeStatusReport::from_payload(&json!({
            "envelopeId": "env-1",
            "status": "completed",
            "recipients": {"signers": [
                {"recipientId": "1", "status": "completed"},
                {"recipientId": 2, "status": "completed"}
            ]}
        }))
        .unwrap();

        assert_eq!(
            report.recipients,
            RecipientStatuses::PerRecipient(BTreeMap::from([
                (1, ProviderRecipientStatus::Completed),
                (2, ProviderRecipientStatus::Completed),
            ]))
        );
    }

    #[test]
    fn missing_recipient_info_derives_from_envelope_status() {
        let report = EnvelopeStatusReport::from_payload(&json!({
            "envelopeId": "env-1",
            "status": "completed"
        }))
        .unwrap();
        assert_eq!(
            report.recipients,
            RecipientStatuses::Shared(ProviderRecipientStatus::Completed)
        );
    }

    #[test]
    fn rejects_malformed_payloads() {
        assert!(EnvelopeStatusReport::from_payload(&json!({"status": "sent"})).is_err());
        assert!(EnvelopeStatusReport::from_payload(&json!({
            "envelopeId": "env-1",
            "status": "sent",
            "recipientStatus": {"first": "sent"}
        }))
        .is_err());
        assert!(EnvelopeStatusReport::from_payload(&json!({
            "envelopeId": "env-1",
            "status": "sent",
            "recipientStatus": 3
        }))
        .is_err());
    }

    #[test]
    fn only_early_statuses_are_replaceable() {
        assert!(ProviderEnvelopeStatus::Created.is_replaceable());
        assert!(ProviderEnvelopeStatus::Delivered.is_replaceable());
        assert!(!ProviderEnvelopeStatus::Completed.is_replaceable());
        assert!(!ProviderEnvelopeStatus::parse("correct").is_replaceable());
    }
}
