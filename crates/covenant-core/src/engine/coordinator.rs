use super::{subscription_key, ContractEngine};
use crate::addendum::{Addendum, AddendumState, AppliedAdjustment};
use crate::contract::{Contract, SigningTarget};
use crate::envelope::EnvelopeState;
use crate::error::ContractError;
use crate::followup::{FollowUpKind, SideEffectOutcome};
use crate::lifecycle::{ContractEvent, ContractState};
use crate::phone::PhoneNumber;
use crate::provider::RecipientUpdate;
use crate::types::{
    DeliveryChannel, Recipient, RecipientRole, SourceDocument, StoredDocument, Subscription,
};
use chrono::{NaiveDate, Utc};
use serde::{Deserialize, Serialize};

/// Partial recipient edit; `None` keeps the current value.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RecipientChanges {
    pub name: Option<String>,
    pub email: Option<String>,
    pub phone: Option<String>,
}

impl ContractEngine {
    /// Draft a contract for a confirmed quote, with rendered document and the
    /// default recipients (customer first, company counter-signer second).
    pub async fn create_contract(
        &self,
        subscription_id: &str,
        start_date: NaiveDate,
    ) -> Result<Contract, ContractError> {
        let _guard = self.locks.lock(&subscription_key(subscription_id)).await;
        let mut subscription = self.subscription(subscription_id).await?;
        self.create_contract_locked(&mut subscription, start_date)
            .await
    }

    pub(super) async fn create_contract_locked(
        &self,
        subscription: &mut Subscription,
        start_date: NaiveDate,
    ) -> Result<Contract, ContractError> {
        if !subscription.quote_confirmed() {
            return Err(ContractError::validation(
                "a contract can only be created once the quote is confirmed",
            ));
        }
        let live = self
            .store
            .list_contracts()
            .await?
            .into_iter()
            .find(|existing| {
                existing.subscription_id == subscription.subscription_id
                    && !matches!(
                        existing.state(),
                        ContractState::Terminated | ContractState::Expired
                    )
            });
        if let Some(existing) = live {
            return Err(ContractError::validation(format!(
                "subscription already has contract {} in state {}",
                existing.contract_id,
                existing.state()
            )));
        }

        let (mut contract, event) = Contract::draft_for(subscription, start_date)?;
        let document = self
            .collaborators
            .renderer
            .render_contract(subscription, &contract)
            .await?;
        contract.signing.documents.push(document);
        contract.signing.recipients = self.default_recipients(subscription);

        subscription.apply_contract_event(&event);
        self.store.save_bundle(subscription, &contract).await?;

        tracing::info!(
            contract_id = %contract.contract_id,
            subscription_id = %subscription.subscription_id,
            "contract drafted"
        );
        self.note(
            &contract.contract_id,
            format!("Contract drafted from quote {}", subscription.quote_uuid),
        )
        .await;
        Ok(contract)
    }

    fn default_recipients(&self, subscription: &Subscription) -> Vec<Recipient> {
        let mut customer = Recipient::new(
            subscription.customer_name.clone(),
            subscription.customer_email.clone(),
            RecipientRole::Customer,
        )
        .with_client_user_id(subscription.customer_id.clone());
        customer.phone = subscription.customer_phone.clone();

        let mut recipients = vec![customer];
        if let Some(signer) = &self.config.company_signer {
            recipients.push(Recipient::new(
                signer.name.clone(),
                signer.email.clone(),
                RecipientRole::Company,
            ));
        }
        recipients
    }

    pub async fn attach_document(
        &self,
        contract_id: &str,
        document: SourceDocument,
    ) -> Result<Contract, ContractError> {
        let _guard = self.lock_contract(contract_id).await?;
        let mut contract = self.contract(contract_id).await?;
        if let Some(envelope_id) = contract.signing.envelope_id() {
            return Err(ContractError::EnvelopeAlreadySent(envelope_id.to_string()));
        }
        contract.signing.documents.push(document);
        contract.updated_at = Utc::now();
        self.save_contract(&contract).await?;
        Ok(contract)
    }

    /// Replace the recipient list of an unsent contract. Order is routing order.
    pub async fn set_recipients(
        &self,
        contract_id: &str,
        recipients: Vec<Recipient>,
    ) -> Result<Contract, ContractError> {
        let _guard = self.lock_contract(contract_id).await?;
        let mut contract = self.contract(contract_id).await?;
        if let Some(envelope_id) = contract.signing.envelope_id() {
            return Err(ContractError::EnvelopeAlreadySent(envelope_id.to_string()));
        }
        contract.signing.recipients = recipients;
        contract.updated_at = Utc::now();
        self.save_contract(&contract).await?;
        Ok(contract)
    }

    /// Create the one envelope for this contract with every recipient in a
    /// single provider call.
    pub async fn send_contract(
        &self,
        contract_id: &str,
        channel: DeliveryChannel,
    ) -> Result<Contract, ContractError> {
        let _guard = self.lock_contract(contract_id).await?;
        let (mut subscription, mut contract) = self.load_bundle(contract_id).await?;
        self.send_contract_locked(&mut subscription, &mut contract, channel)
            .await?;
        Ok(contract)
    }

    pub(super) async fn send_contract_locked(
        &self,
        subscription: &mut Subscription,
        contract: &mut Contract,
        channel: DeliveryChannel,
    ) -> Result<(), ContractError> {
        let subject = format!("Please sign: {}", contract.name);
        let draft = contract
            .signing
            .prepare_send(&contract.contract_id, &subject, channel)?;
        let receipt = self.collaborators.provider.create_envelope(&draft).await?;
        contract.signing.record_sent(&draft, &receipt);
        contract.updated_at = Utc::now();

        subscription.preferred_channel = channel;
        subscription.apply_contract_event(&ContractEvent::EnvelopeSent {
            contract_id: contract.contract_id.clone(),
            envelope_id: receipt.envelope_id.clone(),
        });
        self.store.save_bundle(subscription, contract).await?;

        tracing::info!(
            contract_id = %contract.contract_id,
            envelope_id = %receipt.envelope_id,
            recipients = draft.recipients.len(),
            "envelope sent"
        );
        self.note(
            &contract.contract_id,
            format!(
                "Envelope {} sent to {} recipient(s); first signer via {}",
                receipt.envelope_id,
                draft.recipients.len(),
                channel_label(channel)
            ),
        )
        .await;
        Ok(())
    }

    pub async fn resend_envelope(&self, contract_id: &str) -> Result<Contract, ContractError> {
        let _guard = self.lock_contract(contract_id).await?;
        let contract = self.contract(contract_id).await?;
        let envelope_id = contract
            .signing
            .check_replaceable(contract_id)?
            .envelope_id
            .clone();
        self.collaborators
            .provider
            .resend_envelope(&envelope_id)
            .await?;

        tracing::info!(contract_id, envelope_id = %envelope_id, "envelope resent");
        self.note(contract_id, format!("Envelope {envelope_id} resent")).await;
        Ok(contract)
    }

    /// Swap the first document on the existing envelope. The envelope id and
    /// recipient ordinals stay as they are.
    pub async fn replace_document(
        &self,
        contract_id: &str,
        document: Option<SourceDocument>,
    ) -> Result<Contract, ContractError> {
        let _guard = self.lock_contract(contract_id).await?;
        let (subscription, mut contract) = self.load_bundle(contract_id).await?;
        let envelope_id = contract
            .signing
            .check_replaceable(contract_id)?
            .envelope_id
            .clone();

        let document = match document {
            Some(document) => document,
            None => {
                self.collaborators
                    .renderer
                    .render_contract(&subscription, &contract)
                    .await?
            }
        };
        self.collaborators
            .provider
            .replace_document(&envelope_id, &document)
            .await?;

        let name = document.name.clone();
        match contract.signing.documents.first_mut() {
            Some(first) => *first = document,
            None => contract.signing.documents.push(document),
        }
        contract.updated_at = Utc::now();
        self.save_contract(&contract).await?;

        tracing::info!(contract_id, envelope_id = %envelope_id, "envelope document replaced");
        self.note(
            contract_id,
            format!("Document on envelope {envelope_id} replaced with '{name}'"),
        )
        .await;
        Ok(contract)
    }

    /// Change a recipient's contact details while the envelope is still replaceable.
    pub async fn update_recipient(
        &self,
        contract_id: &str,
        recipient_id: u32,
        changes: RecipientChanges,
    ) -> Result<Contract, ContractError> {
        let _guard = self.lock_contract(contract_id).await?;
        let mut contract = self.contract(contract_id).await?;
        let envelope_id = contract
            .signing
            .check_replaceable(contract_id)?
            .envelope_id
            .clone();
        let current = contract
            .signing
            .recipient_by_ordinal(recipient_id)
            .ok_or_else(|| ContractError::not_found(format!("recipient {recipient_id}")))?;

        let mut updated = current.clone();
        if let Some(name) = changes.name {
            updated.name = name;
        }
        if let Some(email) = changes.email {
            updated.email = email;
        }
        if let Some(phone) = changes.phone {
            updated.phone = Some(phone);
        }
        if updated.email.trim().is_empty() {
            return Err(ContractError::validation("recipient email cannot be empty"));
        }
        updated.whatsapp_number = match updated.delivery_channel {
            DeliveryChannel::Whatsapp => Some(PhoneNumber::parse(
                updated.phone.as_deref().unwrap_or_default(),
            )?),
            DeliveryChannel::Email => None,
        };

        self.collaborators
            .provider
            .update_recipient(
                &envelope_id,
                &RecipientUpdate {
                    recipient_id,
                    name: updated.name.clone(),
                    email: updated.email.clone(),
                    delivery_channel: updated.delivery_channel,
                    phone: updated.whatsapp_number.clone(),
                },
            )
            .await?;

        if let Some(slot) = contract.signing.recipient_by_ordinal_mut(recipient_id) {
            *slot = updated;
        }
        contract.updated_at = Utc::now();
        self.save_contract(&contract).await?;
        self.note(
            contract_id,
            format!("Recipient {recipient_id} on envelope {envelope_id} updated"),
        )
        .await;
        Ok(contract)
    }

    pub async fn create_addendum(
        &self,
        contract_id: &str,
        description: &str,
        monthly_delta_minor: i64,
    ) -> Result<Addendum, ContractError> {
        let _guard = self.lock_contract(contract_id).await?;
        let mut contract = self.contract(contract_id).await?;
        if !matches!(
            contract.state(),
            ContractState::Active | ContractState::RenewalDue
        ) {
            return Err(ContractError::validation(format!(
                "addenda can only be added to active contracts (contract is {})",
                contract.state()
            )));
        }
        if description.trim().is_empty() {
            return Err(ContractError::validation("addendum description is required"));
        }

        let mut addendum = Addendum::new(description.trim(), monthly_delta_minor);
        addendum.signing.recipients = contract
            .signing
            .recipients
            .iter()
            .map(|recipient| {
                let mut fresh = Recipient::new(
                    recipient.name.clone(),
                    recipient.email.clone(),
                    recipient.role,
                );
                fresh.phone = recipient.phone.clone();
                fresh.client_user_id = recipient.client_user_id.clone();
                fresh
            })
            .collect();
        let addendum_id = addendum.addendum_id.clone();
        contract.addendums.push(addendum);

        let document = self
            .collaborators
            .renderer
            .render_addendum(&contract, &addendum_id)
            .await?;
        let addendum = contract
            .addendum_mut(&addendum_id)
            .ok_or_else(|| ContractError::not_found(format!("addendum '{addendum_id}'")))?;
        addendum.signing.documents.push(document);
        let created = addendum.clone();

        contract.updated_at = Utc::now();
        self.save_contract(&contract).await?;
        self.note(
            contract_id,
            format!("Addendum {addendum_id} drafted: {}", created.description),
        )
        .await;
        Ok(created)
    }

    pub async fn send_addendum(
        &self,
        contract_id: &str,
        addendum_id: &str,
        channel: DeliveryChannel,
    ) -> Result<Addendum, ContractError> {
        let _guard = self.lock_contract(contract_id).await?;
        let mut contract = self.contract(contract_id).await?;
        let subject = format!("Please sign: addendum to {}", contract.name);
        let addendum = contract
            .addendum_mut(addendum_id)
            .ok_or_else(|| ContractError::not_found(format!("addendum '{addendum_id}'")))?;
        if addendum.state != AddendumState::Draft {
            return Err(ContractError::validation(format!(
                "addendum is {}; only drafts can be sent",
                addendum.state.as_str()
            )));
        }

        let draft = addendum
            .signing
            .prepare_send(addendum_id, &subject, channel)?;
        let receipt = self.collaborators.provider.create_envelope(&draft).await?;
        addendum.signing.record_sent(&draft, &receipt);
        addendum.state = AddendumState::PendingSignature;
        let sent = addendum.clone();

        contract.updated_at = Utc::now();
        self.save_contract(&contract).await?;
        tracing::info!(
            contract_id,
            addendum_id,
            envelope_id = %receipt.envelope_id,
            "addendum envelope sent"
        );
        self.note(
            contract_id,
            format!("Addendum {addendum_id} sent under envelope {}", receipt.envelope_id),
        )
        .await;
        Ok(sent)
    }

    /// Activate a signed addendum that was not activated on completion.
    pub async fn activate_addendum(
        &self,
        contract_id: &str,
        addendum_id: &str,
        today: NaiveDate,
    ) -> Result<AppliedAdjustment, ContractError> {
        let _guard = self.lock_contract(contract_id).await?;
        let mut contract = self.contract(contract_id).await?;
        let applied = contract.activate_addendum(addendum_id, today)?;
        self.save_contract(&contract).await?;
        self.note(contract_id, adjustment_note(addendum_id, &applied))
            .await;
        Ok(applied)
    }

    pub async fn cancel_addendum(
        &self,
        contract_id: &str,
        addendum_id: &str,
    ) -> Result<Contract, ContractError> {
        let _guard = self.lock_contract(contract_id).await?;
        let mut contract = self.contract(contract_id).await?;
        contract.cancel_addendum(addendum_id)?;
        self.save_contract(&contract).await?;
        self.note(contract_id, format!("Addendum {addendum_id} cancelled"))
            .await;
        Ok(contract)
    }

    /// Pull signed documents for a completed contract envelope.
    pub async fn download_completed_documents(
        &self,
        contract_id: &str,
    ) -> Result<Vec<SideEffectOutcome>, ContractError> {
        let _guard = self.lock_contract(contract_id).await?;
        let mut contract = self.contract(contract_id).await?;
        let outcomes = self
            .download_signed_documents(&mut contract, &SigningTarget::Contract)
            .await;
        self.save_contract(&contract).await?;
        Ok(outcomes)
    }

    /// Download one signed copy per signed recipient, skipping any already stored.
    pub(super) async fn download_signed_documents(
        &self,
        contract: &mut Contract,
        target: &SigningTarget,
    ) -> Vec<SideEffectOutcome> {
        let contract_id = contract.contract_id.clone();
        let Some(packet) = contract.signing_packet_mut(target) else {
            return vec![SideEffectOutcome::skipped("signing packet not found")];
        };
        let Some(envelope_id) = packet.envelope_id().map(str::to_string) else {
            return vec![SideEffectOutcome::skipped("no envelope")];
        };
        if packet.state() != EnvelopeState::Completed {
            return vec![SideEffectOutcome::skipped("envelope not completed")];
        }

        let pending: Vec<u32> = packet
            .recipients
            .iter()
            .filter(|recipient| recipient.sign_status)
            .filter_map(|recipient| recipient.recipient_id)
            .filter(|recipient_id| !packet.has_download_for(*recipient_id))
            .collect();
        if pending.is_empty() {
            return vec![SideEffectOutcome::skipped("signed documents already stored")];
        }

        let mut outcomes = Vec::with_capacity(pending.len());
        for recipient_id in pending {
            let downloaded = match self
                .collaborators
                .provider
                .download_document(&envelope_id, recipient_id)
                .await
            {
                Ok(downloaded) => downloaded,
                Err(e) => {
                    outcomes.push(
                        self.defer(
                            &contract_id,
                            FollowUpKind::DocumentDownloadFailed,
                            format!("download for recipient {recipient_id} on {envelope_id} failed: {e}"),
                        )
                        .await,
                    );
                    continue;
                }
            };

            match self
                .collaborators
                .archive
                .store(&contract_id, &downloaded.file_name, &downloaded.bytes)
                .await
            {
                Ok(archive_ref) => {
                    packet.record_download(StoredDocument {
                        recipient_id,
                        file_name: downloaded.file_name.clone(),
                        content_hash: blake3::hash(&downloaded.bytes).to_hex().to_string(),
                        size_bytes: downloaded.bytes.len() as u64,
                        archive_ref: archive_ref.clone(),
                        downloaded_at: Utc::now(),
                    });
                    outcomes.push(SideEffectOutcome::applied(format!(
                        "stored {} as {archive_ref}",
                        downloaded.file_name
                    )));
                }
                Err(e) => outcomes.push(
                    self.defer(
                        &contract_id,
                        FollowUpKind::DocumentDownloadFailed,
                        format!("archiving {} failed: {e}", downloaded.file_name),
                    )
                    .await,
                ),
            }
        }
        outcomes
    }

    pub(super) async fn save_contract(&self, contract: &Contract) -> Result<(), ContractError> {
        let subscription = self.subscription(&contract.subscription_id).await?;
        self.store.save_bundle(&subscription, contract).await
    }
}

pub(super) fn adjustment_note(addendum_id: &str, applied: &AppliedAdjustment) -> String {
    format!(
        "Addendum {addendum_id} activated: monthly {:+} minor units, value {:+} minor units over {} remaining month(s)",
        applied.monthly_delta_minor, applied.value_delta_minor, applied.remaining_months
    )
}

fn channel_label(channel: DeliveryChannel) -> &'static str {
    match channel {
        DeliveryChannel::Email => "email",
        DeliveryChannel::Whatsapp => "whatsapp",
    }
}
