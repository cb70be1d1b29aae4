use crate::error::ContractError;
use crate::phone::PhoneNumber;
use crate::provider::{
    EnvelopeDraft, EnvelopeReceipt, EnvelopeStatusReport, ProviderEnvelopeStatus,
    RecipientDraft, RecipientStatuses,
};
use crate::types::{DeliveryChannel, Recipient, SourceDocument, StoredDocument};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Internal envelope lifecycle.
///
/// `Voided` and `Declined` are only ever entered from provider observations.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum EnvelopeState {
    New,
    Sent,
    CustomerSigned,
    Completed,
    Voided,
    Declined,
}

impl EnvelopeState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::New => "new",
            Self::Sent => "sent",
            Self::CustomerSigned => "customer_signed",
            Self::Completed => "completed",
            Self::Voided => "voided",
            Self::Declined => "declined",
        }
    }

    pub fn is_terminal_failure(self) -> bool {
        matches!(self, Self::Voided | Self::Declined)
    }
}

impl fmt::Display for EnvelopeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SigningEnvelope {
    pub envelope_id: String,
    pub state: EnvelopeState,
    pub external_status: ProviderEnvelopeStatus,
    pub created_at: DateTime<Utc>,
    pub last_reconciled_at: Option<DateTime<Utc>>,
}

/// Observable effect of applying one status report.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconcileDelta {
    pub previous_state: EnvelopeState,
    pub state: EnvelopeState,
    pub newly_signed: Vec<u32>,
    /// Ordinals reported by the provider that match no local recipient.
    pub unknown_recipients: Vec<u32>,
}

impl ReconcileDelta {
    pub fn is_noop(&self) -> bool {
        self.newly_signed.is_empty() && self.previous_state == self.state
    }

    pub fn entered(&self, state: EnvelopeState) -> bool {
        self.previous_state != state && self.state == state
    }
}

/// Documents, recipients and the one envelope they are sent under.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct SigningPacket {
    pub documents: Vec<SourceDocument>,
    pub recipients: Vec<Recipient>,
    pub envelope: Option<SigningEnvelope>,
    pub signed_documents: Vec<StoredDocument>,
}

impl SigningPacket {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> EnvelopeState {
        self.envelope
            .as_ref()
            .map(|envelope| envelope.state)
            .unwrap_or(EnvelopeState::New)
    }

    pub fn envelope_id(&self) -> Option<&str> {
        self.envelope
            .as_ref()
            .map(|envelope| envelope.envelope_id.as_str())
    }

    pub fn any_signed(&self) -> bool {
        self.recipients.iter().any(|recipient| recipient.sign_status)
    }

    pub fn all_signed(&self) -> bool {
        !self.recipients.is_empty() && self.recipients.iter().all(|recipient| recipient.sign_status)
    }

    pub fn recipient_by_ordinal(&self, recipient_id: u32) -> Option<&Recipient> {
        self.recipients
            .iter()
            .find(|recipient| recipient.recipient_id == Some(recipient_id))
    }

    pub fn recipient_by_ordinal_mut(&mut self, recipient_id: u32) -> Option<&mut Recipient> {
        self.recipients
            .iter_mut()
            .find(|recipient| recipient.recipient_id == Some(recipient_id))
    }

    pub fn has_download_for(&self, recipient_id: u32) -> bool {
        self.signed_documents
            .iter()
            .any(|document| document.recipient_id == recipient_id)
    }

    pub fn record_download(&mut self, document: StoredDocument) {
        if !self.has_download_for(document.recipient_id) {
            self.signed_documents.push(document);
        }
    }

    /// Build the envelope creation request without touching the packet.
    ///
    /// Routing order follows the recipient list. Only the first signer gets the
    /// requested channel; everyone after it is emailed.
    pub fn prepare_send(
        &self,
        owner_id: &str,
        email_subject: &str,
        channel: DeliveryChannel,
    ) -> Result<EnvelopeDraft, ContractError> {
        if let Some(envelope) = &self.envelope {
            return Err(ContractError::EnvelopeAlreadySent(
                envelope.envelope_id.clone(),
            ));
        }
        if self.documents.is_empty() {
            return Err(ContractError::MissingDocument(owner_id.to_string()));
        }
        if self.recipients.is_empty() {
            return Err(ContractError::MissingRecipient(owner_id.to_string()));
        }

        let mut recipients = Vec::with_capacity(self.recipients.len());
        for (position, recipient) in self.recipients.iter().enumerate() {
            let ordinal = u32::try_from(position + 1)
                .map_err(|_| ContractError::validation("too many recipients"))?;
            let delivery_channel = if position == 0 {
                channel
            } else {
                DeliveryChannel::Email
            };
            let phone = match delivery_channel {
                DeliveryChannel::Whatsapp => Some(PhoneNumber::parse(
                    recipient.phone.as_deref().unwrap_or_default(),
                )?),
                DeliveryChannel::Email => None,
            };
            recipients.push(RecipientDraft {
                recipient_id: ordinal,
                routing_order: ordinal,
                name: recipient.name.clone(),
                email: recipient.email.clone(),
                delivery_channel,
                phone,
                client_user_id: recipient.client_user_id.clone(),
            });
        }

        Ok(EnvelopeDraft {
            email_subject: email_subject.to_string(),
            documents: self.documents.clone(),
            recipients,
        })
    }

    /// Store the provider-issued envelope id and the ordinals assigned in the draft.
    pub fn record_sent(&mut self, draft: &EnvelopeDraft, receipt: &EnvelopeReceipt) {
        for (recipient, sent) in self.recipients.iter_mut().zip(&draft.recipients) {
            recipient.recipient_id = Some(sent.recipient_id);
            recipient.envelope_id = Some(receipt.envelope_id.clone());
            recipient.delivery_channel = sent.delivery_channel;
            recipient.whatsapp_number = sent.phone.clone();
        }
        self.envelope = Some(SigningEnvelope {
            envelope_id: receipt.envelope_id.clone(),
            state: EnvelopeState::Sent,
            external_status: receipt.status.clone(),
            created_at: receipt.created_at,
            last_reconciled_at: None,
        });
    }

    /// Guard for resend, document replacement and recipient updates.
    pub fn check_replaceable(&self, owner_id: &str) -> Result<&SigningEnvelope, ContractError> {
        let envelope = self
            .envelope
            .as_ref()
            .ok_or_else(|| ContractError::MissingEnvelope(owner_id.to_string()))?;
        if self.any_signed() {
            return Err(ContractError::CannotReplace(format!(
                "envelope '{}' already has a signature",
                envelope.envelope_id
            )));
        }
        if envelope.state.is_terminal_failure() || envelope.state == EnvelopeState::Completed {
            return Err(ContractError::CannotReplace(format!(
                "envelope '{}' is {}",
                envelope.envelope_id, envelope.state
            )));
        }
        if !envelope.external_status.is_replaceable() {
            return Err(ContractError::CannotReplace(format!(
                "envelope '{}' has external status '{}'",
                envelope.envelope_id, envelope.external_status
            )));
        }
        Ok(envelope)
    }

    /// Fold a provider status report into recipient flags and envelope state.
    ///
    /// Signatures are only ever added. A report saying a recipient has not
    /// signed never clears an earlier signature, and a completed envelope
    /// stays completed.
    pub fn apply_report(
        &mut self,
        report: &EnvelopeStatusReport,
        now: DateTime<Utc>,
    ) -> Result<ReconcileDelta, ContractError> {
        let previous_state = match &self.envelope {
            Some(envelope) if envelope.envelope_id == report.envelope_id => envelope.state,
            Some(envelope) => {
                return Err(ContractError::validation(format!(
                    "status report for '{}' applied to envelope '{}'",
                    report.envelope_id, envelope.envelope_id
                )))
            }
            None => return Err(ContractError::MissingEnvelope(report.envelope_id.clone())),
        };

        let mut newly_signed = Vec::new();
        let mut unknown_recipients = Vec::new();
        let mut declined = report.envelope_status == ProviderEnvelopeStatus::Declined;

        match &report.recipients {
            RecipientStatuses::Shared(status) => {
                declined |= status.is_declined();
                if status.is_signed() {
                    for recipient in &mut self.recipients {
                        if mark_signed(recipient, now) {
                            newly_signed.extend(recipient.recipient_id);
                        }
                    }
                }
            }
            RecipientStatuses::PerRecipient(statuses) => {
                for (ordinal, status) in statuses {
                    declined |= status.is_declined();
                    match self.recipient_by_ordinal_mut(*ordinal) {
                        Some(recipient) => {
                            if status.is_signed() && mark_signed(recipient, now) {
                                newly_signed.push(*ordinal);
                            }
                        }
                        None => unknown_recipients.push(*ordinal),
                    }
                }
            }
        }

        let all_signed = self.all_signed();
        let any_signed = self.any_signed();
        let Some(envelope) = self.envelope.as_mut() else {
            return Err(ContractError::MissingEnvelope(report.envelope_id.clone()));
        };

        let state = if all_signed {
            EnvelopeState::Completed
        } else if previous_state.is_terminal_failure() {
            previous_state
        } else if declined {
            EnvelopeState::Declined
        } else if report.envelope_status == ProviderEnvelopeStatus::Voided {
            EnvelopeState::Voided
        } else if any_signed {
            EnvelopeState::CustomerSigned
        } else {
            previous_state
        };

        let external_settled = matches!(
            envelope.external_status,
            ProviderEnvelopeStatus::Completed
                | ProviderEnvelopeStatus::Declined
                | ProviderEnvelopeStatus::Voided
        );
        if !external_settled {
            envelope.external_status = report.envelope_status.clone();
        }
        envelope.state = state;

        let delta = ReconcileDelta {
            previous_state,
            state,
            newly_signed,
            unknown_recipients,
        };
        if !delta.is_noop() {
            envelope.last_reconciled_at = Some(now);
        }
        Ok(delta)
    }
}

fn mark_signed(recipient: &mut Recipient, now: DateTime<Utc>) -> bool {
    if recipient.sign_status {
        return false;
    }
    recipient.sign_status = true;
    recipient.signed_at = Some(now);
    true
}
