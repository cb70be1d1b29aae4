//! In-process collaborators for local runs and tests.
//!
//! The sandbox provider keeps envelopes in memory and lets callers move
//! recipients along by hand, the way a signer would at a real provider.

use crate::collaborators::{
    BillingGateway, DocumentArchive, DocumentRenderer, InstallationTaskRequest, PaymentRecord,
    TaskScheduler,
};
use crate::contract::Contract;
use crate::engine::Collaborators;
use crate::error::ContractError;
use crate::provider::{
    DownloadedDocument, EmbeddedSigningRequest, EnvelopeDraft, EnvelopeReceipt,
    EnvelopeStatusReport, ProviderEnvelopeStatus, ProviderRecipientStatus, RecipientUpdate,
    SignatureProvider,
};
use crate::token::{StaticTokenSource, TokenCache};
use crate::types::{format_minor, AmountMinor, SourceDocument, Subscription};
use async_trait::async_trait;
use chrono::{Duration, Utc};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;

#[derive(Debug, Clone)]
struct SandboxEnvelope {
    draft: EnvelopeDraft,
    status: ProviderEnvelopeStatus,
    recipients: BTreeMap<u32, ProviderRecipientStatus>,
    /// Report one status for every recipient instead of per-recipient values.
    shared_status: Option<ProviderRecipientStatus>,
    resends: u32,
}

impl SandboxEnvelope {
    fn settle(&mut self) {
        if matches!(self.status, ProviderEnvelopeStatus::Voided) {
            return;
        }
        let statuses: Vec<&ProviderRecipientStatus> = match &self.shared_status {
            Some(shared) => vec![shared],
            None => self.recipients.values().collect(),
        };
        self.status = if statuses.iter().any(|status| status.is_declined()) {
            ProviderEnvelopeStatus::Declined
        } else if !statuses.is_empty() && statuses.iter().all(|status| status.is_signed()) {
            ProviderEnvelopeStatus::Completed
        } else if statuses.iter().any(|status| status.is_signed()) {
            ProviderEnvelopeStatus::Delivered
        } else {
            ProviderEnvelopeStatus::Sent
        };
    }

    fn report(&self, envelope_id: &str) -> EnvelopeStatusReport {
        match &self.shared_status {
            Some(shared) => {
                EnvelopeStatusReport::shared(envelope_id, self.status.clone(), shared.clone())
            }
            None => EnvelopeStatusReport::per_recipient(
                envelope_id,
                self.status.clone(),
                self.recipients
                    .iter()
                    .map(|(ordinal, status)| (*ordinal, status.clone())),
            ),
        }
    }
}

#[derive(Debug, Default)]
struct SandboxProviderState {
    next_envelope: u64,
    envelopes: HashMap<String, SandboxEnvelope>,
}

/// Memory-backed signature provider.
pub struct SandboxSignatureProvider {
    base_uri: String,
    tokens: TokenCache,
    state: Mutex<SandboxProviderState>,
    failing: AtomicBool,
    status_queries: AtomicU64,
}

impl SandboxSignatureProvider {
    pub fn new(base_uri: impl Into<String>) -> Self {
        let source = Arc::new(StaticTokenSource::new("sandbox", Duration::hours(1)));
        Self {
            base_uri: base_uri.into(),
            tokens: TokenCache::new(source, Duration::seconds(60)),
            state: Mutex::new(SandboxProviderState::default()),
            failing: AtomicBool::new(false),
            status_queries: AtomicU64::new(0),
        }
    }

    /// Simulate an outage: every call fails until switched back.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub async fn set_recipient_status(
        &self,
        envelope_id: &str,
        recipient_id: u32,
        status: ProviderRecipientStatus,
    ) -> Result<(), ContractError> {
        let mut state = self.state.lock().await;
        let envelope = lookup(&mut state, envelope_id)?;
        let slot = envelope
            .recipients
            .get_mut(&recipient_id)
            .ok_or_else(|| ContractError::not_found(format!("recipient {recipient_id}")))?;
        *slot = status;
        envelope.settle();
        Ok(())
    }

    /// Report a single status for every recipient of the envelope.
    pub async fn set_shared_status(
        &self,
        envelope_id: &str,
        status: ProviderRecipientStatus,
    ) -> Result<(), ContractError> {
        let mut state = self.state.lock().await;
        let envelope = lookup(&mut state, envelope_id)?;
        envelope.shared_status = Some(status);
        envelope.settle();
        Ok(())
    }

    pub async fn sign_all(&self, envelope_id: &str) -> Result<(), ContractError> {
        let mut state = self.state.lock().await;
        let envelope = lookup(&mut state, envelope_id)?;
        for status in envelope.recipients.values_mut() {
            *status = ProviderRecipientStatus::Completed;
        }
        envelope.settle();
        Ok(())
    }

    pub async fn void(&self, envelope_id: &str) -> Result<(), ContractError> {
        let mut state = self.state.lock().await;
        lookup(&mut state, envelope_id)?.status = ProviderEnvelopeStatus::Voided;
        Ok(())
    }

    /// What was sent for `envelope_id`, as last updated.
    pub async fn envelope(&self, envelope_id: &str) -> Option<EnvelopeDraft> {
        self.state
            .lock()
            .await
            .envelopes
            .get(envelope_id)
            .map(|envelope| envelope.draft.clone())
    }

    pub async fn envelope_count(&self) -> usize {
        self.state.lock().await.envelopes.len()
    }

    pub async fn resend_count(&self, envelope_id: &str) -> u32 {
        self.state
            .lock()
            .await
            .envelopes
            .get(envelope_id)
            .map(|envelope| envelope.resends)
            .unwrap_or(0)
    }

    pub fn status_queries(&self) -> u64 {
        self.status_queries.load(Ordering::SeqCst)
    }

    pub fn token_refreshes(&self) -> u64 {
        self.tokens.refresh_count()
    }

    async fn authorize(&self, operation: &str) -> Result<(), ContractError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(ContractError::provider(operation, "sandbox provider unavailable"));
        }
        self.tokens.access_token().await.map(|_| ())
    }
}

fn lookup<'a>(
    state: &'a mut SandboxProviderState,
    envelope_id: &str,
) -> Result<&'a mut SandboxEnvelope, ContractError> {
    state
        .envelopes
        .get_mut(envelope_id)
        .ok_or_else(|| ContractError::not_found(format!("envelope '{envelope_id}'")))
}

#[async_trait]
impl SignatureProvider for SandboxSignatureProvider {
    fn provider_id(&self) -> &'static str {
        "sandbox"
    }

    async fn create_envelope(&self, draft: &EnvelopeDraft) -> Result<EnvelopeReceipt, ContractError> {
        self.authorize("create_envelope").await?;
        let mut state = self.state.lock().await;
        state.next_envelope += 1;
        let envelope_id = format!("sbx-env-{:04}", state.next_envelope);
        let recipients = draft
            .recipients
            .iter()
            .map(|recipient| (recipient.recipient_id, ProviderRecipientStatus::Sent))
            .collect();
        state.envelopes.insert(
            envelope_id.clone(),
            SandboxEnvelope {
                draft: draft.clone(),
                status: ProviderEnvelopeStatus::Sent,
                recipients,
                shared_status: None,
                resends: 0,
            },
        );
        Ok(EnvelopeReceipt {
            envelope_id,
            status: ProviderEnvelopeStatus::Sent,
            created_at: Utc::now(),
        })
    }

    async fn replace_document(
        &self,
        envelope_id: &str,
        document: &SourceDocument,
    ) -> Result<(), ContractError> {
        self.authorize("replace_document").await?;
        let mut state = self.state.lock().await;
        let envelope = lookup(&mut state, envelope_id)?;
        match envelope.draft.documents.first_mut() {
            Some(first) => *first = document.clone(),
            None => envelope.draft.documents.push(document.clone()),
        }
        Ok(())
    }

    async fn resend_envelope(&self, envelope_id: &str) -> Result<(), ContractError> {
        self.authorize("resend_envelope").await?;
        let mut state = self.state.lock().await;
        lookup(&mut state, envelope_id)?.resends += 1;
        Ok(())
    }

    async fn update_recipient(
        &self,
        envelope_id: &str,
        update: &RecipientUpdate,
    ) -> Result<(), ContractError> {
        self.authorize("update_recipient").await?;
        let mut state = self.state.lock().await;
        let envelope = lookup(&mut state, envelope_id)?;
        let recipient = envelope
            .draft
            .recipients
            .iter_mut()
            .find(|recipient| recipient.recipient_id == update.recipient_id)
            .ok_or_else(|| ContractError::not_found(format!("recipient {}", update.recipient_id)))?;
        recipient.name = update.name.clone();
        recipient.email = update.email.clone();
        recipient.delivery_channel = update.delivery_channel;
        recipient.phone = update.phone.clone();
        Ok(())
    }

    async fn envelope_status(&self, envelope_id: &str) -> Result<EnvelopeStatusReport, ContractError> {
        self.authorize("envelope_status").await?;
        self.status_queries.fetch_add(1, Ordering::SeqCst);
        let mut state = self.state.lock().await;
        Ok(lookup(&mut state, envelope_id)?.report(envelope_id))
    }

    async fn download_document(
        &self,
        envelope_id: &str,
        recipient_id: u32,
    ) -> Result<DownloadedDocument, ContractError> {
        self.authorize("download_document").await?;
        let mut state = self.state.lock().await;
        let envelope = lookup(&mut state, envelope_id)?;
        if envelope.status != ProviderEnvelopeStatus::Completed {
            return Err(ContractError::provider(
                "download_document",
                format!("envelope '{envelope_id}' is {}", envelope.status),
            ));
        }
        Ok(DownloadedDocument {
            file_name: format!("{envelope_id}-{recipient_id}.pdf"),
            bytes: format!("signed {envelope_id} for recipient {recipient_id}").into_bytes(),
        })
    }

    async fn embedded_signing_url(
        &self,
        request: &EmbeddedSigningRequest,
    ) -> Result<String, ContractError> {
        self.authorize("embedded_signing_url").await?;
        let mut state = self.state.lock().await;
        let envelope = lookup(&mut state, &request.envelope_id)?;
        let captive = envelope.draft.recipients.iter().any(|recipient| {
            recipient.recipient_id == request.recipient_id
                && recipient.client_user_id.as_deref() == Some(request.client_user_id.as_str())
        });
        if !captive {
            return Err(ContractError::provider(
                "embedded_signing_url",
                format!("recipient {} is not an embedded signer", request.recipient_id),
            ));
        }
        Ok(format!(
            "{}/signing/{}/{}",
            self.base_uri.trim_end_matches('/'),
            request.envelope_id,
            request.recipient_id
        ))
    }
}

/// Records installation task requests instead of creating them.
#[derive(Default)]
pub struct RecordingTaskScheduler {
    requests: Mutex<Vec<InstallationTaskRequest>>,
    failing: AtomicBool,
}

impl RecordingTaskScheduler {
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub async fn requests(&self) -> Vec<InstallationTaskRequest> {
        self.requests.lock().await.clone()
    }
}

#[async_trait]
impl TaskScheduler for RecordingTaskScheduler {
    async fn create_installation_task(
        &self,
        request: &InstallationTaskRequest,
    ) -> Result<String, ContractError> {
        let mut requests = self.requests.lock().await;
        requests.push(request.clone());
        if self.failing.load(Ordering::SeqCst) {
            return Err(ContractError::provider("create_installation_task", "scheduler unavailable"));
        }
        Ok(format!("task-{}", requests.len()))
    }
}

#[derive(Default)]
struct BillingState {
    payments: HashMap<String, PaymentRecord>,
    paid: HashMap<String, AmountMinor>,
    cancelled: Vec<String>,
}

/// Billing ledger kept in memory.
#[derive(Default)]
pub struct SandboxBilling {
    state: Mutex<BillingState>,
    failing: AtomicBool,
}

impl SandboxBilling {
    pub async fn record_payment(&self, payment: PaymentRecord) {
        self.state
            .lock()
            .await
            .payments
            .insert(payment.reference.clone(), payment);
    }

    pub async fn set_total_paid(&self, contract_id: &str, amount_minor: AmountMinor) {
        self.state
            .lock()
            .await
            .paid
            .insert(contract_id.to_string(), amount_minor);
    }

    pub async fn cancellations(&self) -> Vec<String> {
        self.state.lock().await.cancelled.clone()
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }
}

#[async_trait]
impl BillingGateway for SandboxBilling {
    async fn cancel_recurring_billing(&self, subscription_id: &str) -> Result<(), ContractError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(ContractError::provider("cancel_recurring_billing", "billing unavailable"));
        }
        self.state
            .lock()
            .await
            .cancelled
            .push(subscription_id.to_string());
        Ok(())
    }

    async fn total_paid(&self, contract_id: &str) -> Result<AmountMinor, ContractError> {
        Ok(self
            .state
            .lock()
            .await
            .paid
            .get(contract_id)
            .copied()
            .unwrap_or(0))
    }

    async fn find_payment(&self, reference: &str) -> Result<Option<PaymentRecord>, ContractError> {
        Ok(self.state.lock().await.payments.get(reference).cloned())
    }
}

/// Renders a plain-text summary in place of a real contract template.
#[derive(Debug, Default)]
pub struct PlainTextRenderer;

#[async_trait]
impl DocumentRenderer for PlainTextRenderer {
    async fn render_contract(
        &self,
        subscription: &Subscription,
        contract: &Contract,
    ) -> Result<SourceDocument, ContractError> {
        let body = format!(
            "{}\nCustomer: {}\nMonthly payment: {} {}\nTerm: {} months from {}\nEarly termination fee: {} {}\n",
            contract.name,
            subscription.customer_name,
            format_minor(contract.monthly_payment_minor),
            contract.currency,
            contract.duration_months,
            contract.start_date,
            format_minor(contract.early_termination_fee_minor),
            contract.currency,
        );
        Ok(SourceDocument::new(
            format!("{}.txt", contract.contract_id),
            body.into_bytes(),
        ))
    }

    async fn render_addendum(
        &self,
        contract: &Contract,
        addendum_id: &str,
    ) -> Result<SourceDocument, ContractError> {
        let addendum = contract
            .addendum(addendum_id)
            .ok_or_else(|| ContractError::not_found(format!("addendum '{addendum_id}'")))?;
        let body = format!(
            "Addendum to {}\n{}\nMonthly change: {} {}\n",
            contract.name,
            addendum.description,
            format_minor(addendum.monthly_delta_minor),
            contract.currency,
        );
        Ok(SourceDocument::new(
            format!("{}-{addendum_id}.txt", contract.contract_id),
            body.into_bytes(),
        ))
    }
}

/// Keeps archived documents in memory.
#[derive(Default)]
pub struct MemoryArchive {
    documents: Mutex<BTreeMap<String, Vec<u8>>>,
}

impl MemoryArchive {
    pub async fn stored(&self) -> Vec<String> {
        self.documents.lock().await.keys().cloned().collect()
    }
}

#[async_trait]
impl DocumentArchive for MemoryArchive {
    async fn store(
        &self,
        contract_id: &str,
        file_name: &str,
        bytes: &[u8],
    ) -> Result<String, ContractError> {
        let archive_ref = format!("archive://{contract_id}/{file_name}");
        self.documents
            .lock()
            .await
            .insert(archive_ref.clone(), bytes.to_vec());
        Ok(archive_ref)
    }
}

/// Concrete handles to every sandbox collaborator, for inspection.
#[derive(Clone)]
pub struct SandboxCollaborators {
    pub provider: Arc<SandboxSignatureProvider>,
    pub tasks: Arc<RecordingTaskScheduler>,
    pub billing: Arc<SandboxBilling>,
    pub renderer: Arc<PlainTextRenderer>,
    pub archive: Arc<MemoryArchive>,
}

impl SandboxCollaborators {
    pub fn new(provider_base_uri: impl Into<String>) -> Self {
        Self {
            provider: Arc::new(SandboxSignatureProvider::new(provider_base_uri)),
            tasks: Arc::new(RecordingTaskScheduler::default()),
            billing: Arc::new(SandboxBilling::default()),
            renderer: Arc::new(PlainTextRenderer),
            archive: Arc::new(MemoryArchive::default()),
        }
    }

    pub fn collaborators(&self) -> Collaborators {
        Collaborators {
            provider: self.provider.clone(),
            tasks: self.tasks.clone(),
            billing: self.billing.clone(),
            renderer: self.renderer.clone(),
            archive: self.archive.clone(),
        }
    }
}
