use super::reconcile::{ReconcileOutcome, ReconcileSource};
use super::{subscription_key, ContractEngine};
use crate::contract::Contract;
use crate::embedded::{normalize_signing_url, EmbeddedSigningStatus};
use crate::envelope::EnvelopeState;
use crate::error::ContractError;
use crate::followup::{FollowUpKind, SideEffectOutcome};
use crate::links::{LinkRejection, QuoteLinkParams};
use crate::magic_link::{self, hash_token, MagicLinkRejection};
use crate::provider::EmbeddedSigningRequest;
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use url::Url;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuoteConfirmation {
    pub subscription_id: String,
    pub contract_id: Option<String>,
    /// The link had already been used to confirm this quote.
    pub already_confirmed: bool,
    pub send: SideEffectOutcome,
}

/// Where to send the signer's browser.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SigningRedirect {
    pub contract_id: String,
    pub recipient_id: u32,
    pub url: String,
}

/// A magic link ready to deliver. The token is not stored anywhere.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MagicLinkGrant {
    pub contract_id: String,
    pub recipient_id: u32,
    pub url: String,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SigningReturn {
    pub contract_id: String,
    pub status: EmbeddedSigningStatus,
    pub reconciled: Option<ReconcileOutcome>,
}

impl ContractEngine {
    /// Customer clicked the signed confirmation link on a quote: confirm it,
    /// draft the contract and send it for signature.
    ///
    /// A failed send does not undo the confirmation; it becomes a follow-up.
    pub async fn confirm_quote(
        &self,
        params: &QuoteLinkParams,
        today: NaiveDate,
    ) -> Result<QuoteConfirmation, ContractError> {
        let quote_uuid = self
            .quote_links
            .verify(params, today)
            .map_err(ContractError::QuoteLinkRejected)?;
        let found = self
            .store
            .find_subscription_by_quote(&quote_uuid)
            .await?
            .ok_or_else(|| ContractError::not_found(format!("quote '{quote_uuid}'")))?;
        let _guard = self.locks.lock(&subscription_key(&found.subscription_id)).await;
        let mut subscription = self.subscription(&found.subscription_id).await?;

        if subscription.quote_confirmed() {
            let existing = self
                .store
                .list_contracts()
                .await?
                .into_iter()
                .find(|contract| contract.subscription_id == subscription.subscription_id);
            return Ok(QuoteConfirmation {
                subscription_id: subscription.subscription_id,
                contract_id: existing.map(|contract| contract.contract_id),
                already_confirmed: true,
                send: SideEffectOutcome::skipped("quote was already confirmed"),
            });
        }
        if !subscription.quote_status.is_confirmable() {
            return Err(ContractError::QuoteLinkRejected(LinkRejection::NotConfirmable));
        }

        // Persisted together with the drafted contract, or not at all.
        subscription.confirm_quote();
        let mut contract = match self.create_contract_locked(&mut subscription, today).await {
            Ok(contract) => contract,
            Err(e) => {
                tracing::warn!(
                    subscription_id = %subscription.subscription_id,
                    error = %e,
                    "quote left unconfirmed: contract could not be drafted"
                );
                return Err(e);
            }
        };
        tracing::info!(
            subscription_id = %subscription.subscription_id,
            quote_uuid = %quote_uuid,
            "quote confirmed"
        );
        let channel = subscription.preferred_channel;
        let send = match self
            .send_contract_locked(&mut subscription, &mut contract, channel)
            .await
        {
            Ok(()) => SideEffectOutcome::applied(format!(
                "envelope {} sent",
                contract.signing.envelope_id().unwrap_or_default()
            )),
            Err(e) => {
                self.defer(
                    &contract.contract_id,
                    FollowUpKind::EnvelopeSendFailed,
                    format!("contract could not be sent after quote confirmation: {e}"),
                )
                .await
            }
        };

        Ok(QuoteConfirmation {
            subscription_id: subscription.subscription_id,
            contract_id: Some(contract.contract_id),
            already_confirmed: false,
            send,
        })
    }

    /// Mint a single-use link that opens embedded signing for one recipient.
    pub async fn issue_magic_link(
        &self,
        contract_id: &str,
        recipient_id: u32,
    ) -> Result<MagicLinkGrant, ContractError> {
        let contract = self.contract(contract_id).await?;
        if contract.signing.envelope_id().is_none() {
            return Err(ContractError::MissingEnvelope(contract_id.to_string()));
        }
        let recipient = contract
            .signing
            .recipient_by_ordinal(recipient_id)
            .ok_or_else(|| ContractError::not_found(format!("recipient {recipient_id}")))?;
        if recipient.client_user_id.is_none() {
            return Err(ContractError::validation(format!(
                "recipient {recipient_id} is not set up for embedded signing"
            )));
        }

        let issued = magic_link::issue(contract_id, recipient_id, self.config.magic_link_ttl, Utc::now());
        self.store.save_magic_link(&issued.record).await?;
        let url = public_url(
            &self.config.public_base_url,
            "/v1/sign/magic",
            &[("token", issued.token.as_str())],
        )?;

        self.note(
            contract_id,
            format!(
                "Signing link issued for recipient {recipient_id}, valid until {}",
                issued.record.expires_at.to_rfc3339()
            ),
        )
        .await;
        Ok(MagicLinkGrant {
            contract_id: contract_id.to_string(),
            recipient_id,
            url,
            expires_at: issued.record.expires_at,
        })
    }

    /// Consume a magic link and open embedded signing for its recipient.
    pub async fn resolve_magic_link(&self, token: Option<&str>) -> Result<SigningRedirect, ContractError> {
        let token = token
            .map(str::trim)
            .filter(|token| !token.is_empty())
            .ok_or(ContractError::MagicLinkRejected(MagicLinkRejection::Missing))?;
        let token_hash = hash_token(token);
        let found = self
            .store
            .find_magic_link(&token_hash)
            .await?
            .ok_or(ContractError::MagicLinkRejected(MagicLinkRejection::NotFound))?;

        let _guard = self.lock_contract(&found.contract_id).await?;
        let mut record = self
            .store
            .find_magic_link(&token_hash)
            .await?
            .ok_or(ContractError::MagicLinkRejected(MagicLinkRejection::NotFound))?;
        record
            .consume(Utc::now())
            .map_err(ContractError::MagicLinkRejected)?;
        self.store.save_magic_link(&record).await?;

        let mut contract = self.contract(&record.contract_id).await?;
        let redirect = self
            .launch_embedded_locked(&mut contract, Some(record.recipient_id))
            .await?;
        self.save_contract(&contract).await?;
        self.note(
            &contract.contract_id,
            format!("Signing link used by recipient {}", record.recipient_id),
        )
        .await;
        Ok(redirect)
    }

    /// Open an embedded signing session. Without `recipient_id` the first
    /// unsigned recipient that can sign embedded is chosen.
    pub async fn launch_embedded_signing(
        &self,
        contract_id: &str,
        recipient_id: Option<u32>,
    ) -> Result<SigningRedirect, ContractError> {
        let _guard = self.lock_contract(contract_id).await?;
        let mut contract = self.contract(contract_id).await?;
        let redirect = self.launch_embedded_locked(&mut contract, recipient_id).await?;
        self.save_contract(&contract).await?;
        Ok(redirect)
    }

    async fn launch_embedded_locked(
        &self,
        contract: &mut Contract,
        recipient_id: Option<u32>,
    ) -> Result<SigningRedirect, ContractError> {
        let envelope = contract
            .signing
            .envelope
            .as_ref()
            .ok_or_else(|| ContractError::MissingEnvelope(contract.contract_id.clone()))?;
        if envelope.state == EnvelopeState::Completed || envelope.state.is_terminal_failure() {
            return Err(ContractError::validation(format!(
                "envelope is {}; there is nothing left to sign",
                envelope.state.as_str()
            )));
        }
        let envelope_id = envelope.envelope_id.clone();

        let recipient = match recipient_id {
            Some(id) => contract
                .signing
                .recipient_by_ordinal(id)
                .ok_or_else(|| ContractError::not_found(format!("recipient {id}")))?,
            None => contract
                .signing
                .recipients
                .iter()
                .find(|recipient| !recipient.sign_status && recipient.client_user_id.is_some())
                .ok_or_else(|| {
                    ContractError::validation("no unsigned recipient can sign embedded")
                })?,
        };
        if recipient.sign_status {
            return Err(ContractError::validation("recipient has already signed"));
        }
        let ordinal = recipient
            .recipient_id
            .ok_or_else(|| ContractError::validation("recipient has no ordinal on the envelope"))?;
        let client_user_id = recipient.client_user_id.clone().ok_or_else(|| {
            ContractError::validation(format!(
                "recipient {ordinal} is not set up for embedded signing"
            ))
        })?;

        let return_url = public_url(
            &self.config.public_base_url,
            "/v1/contracts/signing/return",
            &[("contract_id", contract.contract_id.as_str())],
        )?;
        let request = EmbeddedSigningRequest {
            envelope_id,
            recipient_id: ordinal,
            name: recipient.name.clone(),
            email: recipient.email.clone(),
            client_user_id,
            return_url,
        };
        let raw = self
            .collaborators
            .provider
            .embedded_signing_url(&request)
            .await?;
        let url = normalize_signing_url(&raw, &self.config.provider_base_uri)?;

        contract.embedded_status = Some(EmbeddedSigningStatus::Launched);
        contract.updated_at = Utc::now();
        tracing::info!(
            contract_id = %contract.contract_id,
            recipient_id = ordinal,
            "embedded signing launched"
        );
        Ok(SigningRedirect {
            contract_id: contract.contract_id.clone(),
            recipient_id: ordinal,
            url,
        })
    }

    /// The provider sent the signer back. A completed session triggers an
    /// immediate reconcile; webhooks and polling cover the rest.
    pub async fn record_signing_return(
        &self,
        contract_id: &str,
        event: &str,
    ) -> Result<SigningReturn, ContractError> {
        let status = EmbeddedSigningStatus::from_return_event(event);
        let envelope_id = {
            let _guard = self.lock_contract(contract_id).await?;
            let mut contract = self.contract(contract_id).await?;
            contract.embedded_status = Some(status);
            contract.updated_at = Utc::now();
            self.save_contract(&contract).await?;
            contract.signing.envelope_id().map(str::to_string)
        };
        self.note(
            contract_id,
            format!("Embedded signing returned with '{}'", status.as_str()),
        )
        .await;

        let reconciled = match (status, envelope_id) {
            (EmbeddedSigningStatus::Completed, Some(envelope_id)) => match self
                .reconcile_envelope(&envelope_id, ReconcileSource::Portal)
                .await
            {
                Ok(outcome) => Some(outcome),
                Err(e) => {
                    tracing::warn!(contract_id, error = %e, "reconcile after signing return failed");
                    None
                }
            },
            _ => None,
        };

        Ok(SigningReturn {
            contract_id: contract_id.to_string(),
            status,
            reconciled,
        })
    }
}

fn public_url(base: &str, path: &str, query: &[(&str, &str)]) -> Result<String, ContractError> {
    let mut url = Url::parse(base.trim_end_matches('/'))
        .and_then(|base| base.join(path))
        .map_err(|e| ContractError::validation(format!("invalid public base url '{base}': {e}")))?;
    url.query_pairs_mut().extend_pairs(query);
    Ok(url.to_string())
}
