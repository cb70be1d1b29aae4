use super::*;
use crate::envelope::EnvelopeState;
use crate::followup::FollowUpKind;
use crate::links::{LinkRejection, QuoteLinkParams};
use crate::magic_link::MagicLinkRejection;
use crate::provider::ProviderRecipientStatus;
use crate::magic_link::MagicLinkRecord;
use crate::sandbox::{PlainTextRenderer, SandboxCollaborators};
use crate::store::InMemoryContractStore;
use crate::termination::{ClosureDetails, TerminationReason, TerminationRequest, TerminationStep};
use crate::collaborators::PaymentRecord;
use crate::types::{
    ContractTerms, DeliveryChannel, SubscriptionContractState, SourceDocument,
};
use serde_json::json;
use std::sync::atomic::{AtomicBool, Ordering};

const PROVIDER_BASE: &str = "https://sandbox.sign.local";

fn today() -> NaiveDate {
    NaiveDate::from_ymd_opt(2026, 1, 15).unwrap()
}

fn terms() -> ContractTerms {
    ContractTerms {
        monthly_payment_minor: 2_500,
        duration_months: 12,
        early_termination_fee_minor: 5_000,
        currency: "USD".to_string(),
    }
}

async fn harness_with(config: EngineConfig) -> (ContractEngine, SandboxCollaborators) {
    let sandbox = SandboxCollaborators::new(PROVIDER_BASE);
    let engine = ContractEngine::bootstrap(
        config,
        Arc::new(InMemoryContractStore::new()),
        sandbox.collaborators(),
    )
    .await
    .unwrap();
    (engine, sandbox)
}

async fn harness() -> (ContractEngine, SandboxCollaborators) {
    harness_with(EngineConfig::default()).await
}

async fn confirmed_subscription(engine: &ContractEngine) -> Subscription {
    let mut subscription = Subscription::new("cust-1", "Ana Lopez", "ana@example.com", terms())
        .with_phone("+503 7000 1111");
    subscription.confirm_quote();
    engine.register_subscription(subscription).await.unwrap()
}

async fn sent_contract(engine: &ContractEngine) -> (Contract, String) {
    let subscription = confirmed_subscription(engine).await;
    let contract = engine
        .create_contract(&subscription.subscription_id, today())
        .await
        .unwrap();
    let contract = engine
        .send_contract(&contract.contract_id, DeliveryChannel::Email)
        .await
        .unwrap();
    let envelope_id = contract.signing.envelope_id().unwrap().to_string();
    (contract, envelope_id)
}

async fn active_contract(engine: &ContractEngine, sandbox: &SandboxCollaborators) -> Contract {
    let (contract, envelope_id) = sent_contract(engine).await;
    sandbox.provider.sign_all(&envelope_id).await.unwrap();
    engine
        .reconcile_envelope(&envelope_id, ReconcileSource::Poll)
        .await
        .unwrap();
    engine.contract(&contract.contract_id).await.unwrap()
}

fn webhook(envelope_id: &str) -> serde_json::Value {
    json!({"event": "envelope-completed", "data": {"envelopeId": envelope_id}})
}

#[tokio::test]
async fn draft_requires_confirmed_quote() {
    let (engine, _) = harness().await;
    let subscription = engine
        .register_subscription(Subscription::new("cust-2", "Luis", "luis@example.com", terms()))
        .await
        .unwrap();

    let err = engine
        .create_contract(&subscription.subscription_id, today())
        .await
        .unwrap_err();
    assert_eq!(err.code(), "validation");
}

#[tokio::test]
async fn whatsapp_send_uses_parsed_phone_for_single_recipient() {
    let config = EngineConfig {
        company_signer: None,
        ..EngineConfig::default()
    };
    let (engine, sandbox) = harness_with(config).await;
    let subscription = confirmed_subscription(&engine).await;
    let contract = engine
        .create_contract(&subscription.subscription_id, today())
        .await
        .unwrap();
    assert_eq!(
        engine
            .subscription(&subscription.subscription_id)
            .await
            .unwrap()
            .contract_state(),
        SubscriptionContractState::PendingContract
    );

    let contract = engine
        .send_contract(&contract.contract_id, DeliveryChannel::Whatsapp)
        .await
        .unwrap();

    assert_eq!(sandbox.provider.envelope_count().await, 1);
    let draft = sandbox
        .provider
        .envelope(contract.signing.envelope_id().unwrap())
        .await
        .unwrap();
    assert_eq!(draft.recipients.len(), 1);
    let phone = draft.recipients[0].phone.as_ref().unwrap();
    assert_eq!(phone.country_code, "503");
    assert_eq!(phone.number, "70001111");
    assert_eq!(
        engine
            .subscription(&subscription.subscription_id)
            .await
            .unwrap()
            .contract_state(),
        SubscriptionContractState::PendingCustomerSignature
    );
}

#[tokio::test]
async fn second_send_is_rejected() {
    let (engine, sandbox) = harness().await;
    let (contract, _) = sent_contract(&engine).await;

    let err = engine
        .send_contract(&contract.contract_id, DeliveryChannel::Email)
        .await
        .unwrap_err();
    assert!(matches!(err, ContractError::EnvelopeAlreadySent(_)));
    assert_eq!(sandbox.provider.envelope_count().await, 1);
}

#[tokio::test]
async fn every_recipient_goes_into_one_envelope() {
    let (engine, sandbox) = harness().await;
    let (contract, envelope_id) = sent_contract(&engine).await;

    let draft = sandbox.provider.envelope(&envelope_id).await.unwrap();
    let ordinals: Vec<u32> = draft.recipients.iter().map(|r| r.recipient_id).collect();
    assert_eq!(ordinals, vec![1, 2]);
    assert!(contract
        .signing
        .recipients
        .iter()
        .all(|recipient| recipient.envelope_id.as_deref() == Some(envelope_id.as_str())));
}

#[tokio::test]
async fn poll_then_webhook_activates_once() {
    let (engine, sandbox) = harness().await;
    let (contract, envelope_id) = sent_contract(&engine).await;

    sandbox
        .provider
        .set_recipient_status(&envelope_id, 1, ProviderRecipientStatus::Completed)
        .await
        .unwrap();
    let summary = engine.poll_open_envelopes().await.unwrap();
    assert_eq!(
        summary,
        PollSummary {
            checked: 1,
            changed: 1,
            failed: 0
        }
    );
    let subscription = engine.subscription(&contract.subscription_id).await.unwrap();
    assert_eq!(
        subscription.contract_state(),
        SubscriptionContractState::PendingCabalSignature
    );
    // The customer's signature alone is enough to book the installation.
    let requests = sandbox.tasks.requests().await;
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].contract_id, contract.contract_id);
    assert_eq!(subscription.installation_state, InstallationState::ToBeScheduled);
    assert_eq!(
        engine.contract(&contract.contract_id).await.unwrap().state(),
        ContractState::Draft
    );

    sandbox
        .provider
        .set_recipient_status(&envelope_id, 2, ProviderRecipientStatus::Completed)
        .await
        .unwrap();
    match engine.handle_webhook(&webhook(&envelope_id)).await {
        WebhookDisposition::Reconciled { outcome } => {
            assert_eq!(outcome.previous_state, EnvelopeState::CustomerSigned);
            assert_eq!(outcome.state, EnvelopeState::Completed);
            assert_eq!(outcome.contract_state, ContractState::Active);
            assert_eq!(outcome.newly_signed, vec![2]);
        }
        other => panic!("unexpected disposition: {other:?}"),
    }

    match engine.handle_webhook(&webhook(&envelope_id)).await {
        WebhookDisposition::Reconciled { outcome } => {
            assert!(!outcome.changed);
            assert!(outcome.side_effects.is_empty());
        }
        other => panic!("unexpected disposition: {other:?}"),
    }

    assert_eq!(sandbox.tasks.requests().await.len(), 1);
    assert_eq!(sandbox.archive.stored().await.len(), 2);
    let subscription = engine.subscription(&contract.subscription_id).await.unwrap();
    assert_eq!(subscription.contract_state(), SubscriptionContractState::Active);
    assert_eq!(subscription.installation_state, InstallationState::ToBeScheduled);
    assert_eq!(subscription.installation_task_ref.as_deref(), Some("task-1"));

    let contract = engine.contract(&contract.contract_id).await.unwrap();
    assert_eq!(contract.signing.signed_documents.len(), 2);
    assert_eq!(engine.poll_open_envelopes().await.unwrap().checked, 0);
}

#[tokio::test]
async fn shared_status_report_signs_everyone() {
    let (engine, sandbox) = harness().await;
    let (contract, envelope_id) = sent_contract(&engine).await;

    sandbox
        .provider
        .set_shared_status(&envelope_id, ProviderRecipientStatus::Completed)
        .await
        .unwrap();
    let outcome = engine
        .reconcile_envelope(&envelope_id, ReconcileSource::Poll)
        .await
        .unwrap();

    assert_eq!(outcome.state, EnvelopeState::Completed);
    assert_eq!(outcome.newly_signed, vec![1, 2]);
    assert_eq!(
        engine.contract(&contract.contract_id).await.unwrap().state(),
        ContractState::Active
    );
}

#[tokio::test]
async fn webhook_for_unknown_or_irrelevant_event_is_acknowledged() {
    let (engine, _) = harness().await;

    assert!(matches!(
        engine.handle_webhook(&webhook("env-missing")).await,
        WebhookDisposition::UnknownEnvelope { .. }
    ));
    assert!(matches!(
        engine
            .handle_webhook(&json!({"event": "envelope-sent", "data": {"envelopeId": "x"}}))
            .await,
        WebhookDisposition::Ignored { .. }
    ));
    assert!(matches!(
        engine.handle_webhook(&json!({"unexpected": true})).await,
        WebhookDisposition::Ignored { .. }
    ));
}

#[tokio::test]
async fn failed_installation_task_is_deferred() {
    let (engine, sandbox) = harness().await;
    sandbox.tasks.set_failing(true);
    let (contract, envelope_id) = sent_contract(&engine).await;
    sandbox.provider.sign_all(&envelope_id).await.unwrap();

    let outcome = engine
        .reconcile_envelope(&envelope_id, ReconcileSource::Webhook)
        .await
        .unwrap();

    assert_eq!(outcome.contract_state, ContractState::Active);
    assert!(outcome.side_effects.iter().any(SideEffectOutcome::is_deferred));
    let open = engine.follow_ups(false).await.unwrap();
    assert_eq!(open.len(), 1);
    assert_eq!(open[0].kind, FollowUpKind::InstallationTaskFailed);

    let subscription = engine.subscription(&contract.subscription_id).await.unwrap();
    assert_eq!(subscription.installation_state, InstallationState::ToBeScheduled);
    assert!(subscription.installation_task_ref.is_none());

    let resolved = engine
        .resolve_follow_up(&open[0].follow_up_id, "ops-1")
        .await
        .unwrap();
    assert!(!resolved.is_open());
    assert!(engine.follow_ups(false).await.unwrap().is_empty());
}

#[tokio::test]
async fn renewal_without_change_skips_installation() {
    let (engine, sandbox) = harness().await;
    let mut subscription = Subscription::new("cust-9", "Eva", "eva@example.com", terms());
    subscription.renewal_no_change = true;
    subscription.confirm_quote();
    let subscription = engine.register_subscription(subscription).await.unwrap();
    let contract = engine
        .create_contract(&subscription.subscription_id, today())
        .await
        .unwrap();
    let contract = engine
        .send_contract(&contract.contract_id, DeliveryChannel::Email)
        .await
        .unwrap();
    let envelope_id = contract.signing.envelope_id().unwrap().to_string();
    sandbox.provider.sign_all(&envelope_id).await.unwrap();

    engine
        .reconcile_envelope(&envelope_id, ReconcileSource::Poll)
        .await
        .unwrap();

    assert!(sandbox.tasks.requests().await.is_empty());
}

#[tokio::test]
async fn repeated_poll_failures_share_one_follow_up() {
    let (engine, sandbox) = harness().await;
    sent_contract(&engine).await;
    sandbox.provider.set_failing(true);

    for _ in 0..2 {
        let summary = engine.poll_open_envelopes().await.unwrap();
        assert_eq!(summary.failed, 1);
    }

    let open = engine.follow_ups(false).await.unwrap();
    assert_eq!(open.len(), 1);
    assert_eq!(open[0].kind, FollowUpKind::ReconcileFailed);
}

#[tokio::test]
async fn decline_is_sticky_and_blocks_replacement() {
    let (engine, sandbox) = harness().await;
    let (contract, envelope_id) = sent_contract(&engine).await;
    sandbox
        .provider
        .set_recipient_status(&envelope_id, 1, ProviderRecipientStatus::Declined)
        .await
        .unwrap();

    let outcome = engine
        .reconcile_envelope(&envelope_id, ReconcileSource::Poll)
        .await
        .unwrap();
    assert_eq!(outcome.state, EnvelopeState::Declined);
    assert_eq!(
        engine.follow_ups(false).await.unwrap()[0].kind,
        FollowUpKind::EnvelopeDeclined
    );

    let err = engine.resend_envelope(&contract.contract_id).await.unwrap_err();
    assert!(matches!(err, ContractError::CannotReplace(_)));
    assert_eq!(engine.poll_open_envelopes().await.unwrap().checked, 0);
}

#[tokio::test]
async fn replacement_keeps_envelope_until_first_signature() {
    let (engine, sandbox) = harness().await;
    let (contract, envelope_id) = sent_contract(&engine).await;

    let replaced = engine
        .replace_document(
            &contract.contract_id,
            Some(SourceDocument::new("v2.txt", b"revised terms".to_vec())),
        )
        .await
        .unwrap();
    assert_eq!(replaced.signing.envelope_id(), Some(envelope_id.as_str()));
    assert_eq!(replaced.signing.documents[0].name, "v2.txt");
    let draft = sandbox.provider.envelope(&envelope_id).await.unwrap();
    assert_eq!(draft.documents[0].content, b"revised terms".to_vec());

    let updated = engine
        .update_recipient(
            &contract.contract_id,
            1,
            RecipientChanges {
                email: Some("ana.lopez@example.com".to_string()),
                ..RecipientChanges::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(
        updated.signing.recipient_by_ordinal(1).unwrap().email,
        "ana.lopez@example.com"
    );
    engine.resend_envelope(&contract.contract_id).await.unwrap();
    assert_eq!(sandbox.provider.resend_count(&envelope_id).await, 1);

    sandbox
        .provider
        .set_recipient_status(&envelope_id, 1, ProviderRecipientStatus::Completed)
        .await
        .unwrap();
    engine
        .reconcile_envelope(&envelope_id, ReconcileSource::Poll)
        .await
        .unwrap();
    let err = engine
        .replace_document(&contract.contract_id, None)
        .await
        .unwrap_err();
    assert!(matches!(err, ContractError::CannotReplace(_)));
}

#[tokio::test]
async fn quote_link_confirms_drafts_and_sends_once() {
    let (engine, sandbox) = harness().await;
    let subscription = engine
        .register_subscription(
            Subscription::new("cust-3", "Marta", "marta@example.com", terms()),
        )
        .await
        .unwrap();
    let url = engine
        .quote_links()
        .build_url(&subscription.quote_uuid, today())
        .unwrap();
    let parsed = url::Url::parse(&url).unwrap();
    let mut params = QuoteLinkParams::default();
    for (key, value) in parsed.query_pairs() {
        match key.as_ref() {
            "uuid" => params.uuid = Some(value.into_owned()),
            "exp" => params.exp = Some(value.into_owned()),
            "sig" => params.sig = Some(value.into_owned()),
            _ => {}
        }
    }

    let first = engine.confirm_quote(&params, today()).await.unwrap();
    assert!(!first.already_confirmed);
    assert!(matches!(first.send, SideEffectOutcome::Applied { .. }));
    assert_eq!(sandbox.provider.envelope_count().await, 1);

    let second = engine.confirm_quote(&params, today()).await.unwrap();
    assert!(second.already_confirmed);
    assert_eq!(second.contract_id, first.contract_id);
    assert_eq!(sandbox.provider.envelope_count().await, 1);

    let tampered = QuoteLinkParams {
        sig: Some("00".repeat(32)),
        ..params
    };
    let err = engine.confirm_quote(&tampered, today()).await.unwrap_err();
    assert!(matches!(
        err,
        ContractError::QuoteLinkRejected(LinkRejection::InvalidSignature)
    ));
}

#[tokio::test]
async fn quote_confirmation_survives_send_failure() {
    let (engine, sandbox) = harness().await;
    let subscription = engine
        .register_subscription(Subscription::new("cust-4", "Rosa", "rosa@example.com", terms()))
        .await
        .unwrap();
    let exp = today() + Duration::days(3);
    let params = QuoteLinkParams {
        uuid: Some(subscription.quote_uuid.clone()),
        exp: Some(exp.format("%Y-%m-%d").to_string()),
        sig: Some(engine.quote_links().sign(&subscription.quote_uuid, exp).unwrap()),
    };
    sandbox.provider.set_failing(true);

    let confirmation = engine.confirm_quote(&params, today()).await.unwrap();

    assert!(confirmation.send.is_deferred());
    let subscription = engine.subscription(&subscription.subscription_id).await.unwrap();
    assert!(subscription.quote_confirmed());
    assert_eq!(
        engine.follow_ups(false).await.unwrap()[0].kind,
        FollowUpKind::EnvelopeSendFailed
    );
}

#[tokio::test]
async fn magic_link_is_single_use() {
    let (engine, _) = harness().await;
    let (contract, envelope_id) = sent_contract(&engine).await;

    let grant = engine
        .issue_magic_link(&contract.contract_id, 1)
        .await
        .unwrap();
    let token = grant.url.split("token=").nth(1).unwrap().to_string();

    let redirect = engine.resolve_magic_link(Some(&token)).await.unwrap();
    assert_eq!(redirect.recipient_id, 1);
    assert_eq!(
        redirect.url,
        format!("{PROVIDER_BASE}/signing/{envelope_id}/1")
    );

    let err = engine.resolve_magic_link(Some(&token)).await.unwrap_err();
    assert!(matches!(
        err,
        ContractError::MagicLinkRejected(MagicLinkRejection::Used)
    ));
    assert!(matches!(
        engine.resolve_magic_link(None).await,
        Err(ContractError::MagicLinkRejected(MagicLinkRejection::Missing))
    ));
    assert!(matches!(
        engine.resolve_magic_link(Some("not-a-token")).await,
        Err(ContractError::MagicLinkRejected(MagicLinkRejection::NotFound))
    ));

    let company = engine.issue_magic_link(&contract.contract_id, 2).await;
    assert!(matches!(company, Err(ContractError::Validation(_))));
}

#[tokio::test]
async fn signing_return_reconciles_immediately() {
    let (engine, sandbox) = harness().await;
    let (contract, envelope_id) = sent_contract(&engine).await;
    engine
        .launch_embedded_signing(&contract.contract_id, None)
        .await
        .unwrap();
    sandbox.provider.sign_all(&envelope_id).await.unwrap();

    let signing_return = engine
        .record_signing_return(&contract.contract_id, "signing_complete")
        .await
        .unwrap();

    let reconciled = signing_return.reconciled.unwrap();
    assert_eq!(reconciled.source, ReconcileSource::Portal);
    assert_eq!(reconciled.state, EnvelopeState::Completed);
    let contract = engine.contract(&contract.contract_id).await.unwrap();
    assert_eq!(contract.embedded_status, Some(crate::embedded::EmbeddedSigningStatus::Completed));
    assert_eq!(contract.state(), ContractState::Active);
}

#[tokio::test]
async fn cancelled_signing_return_does_not_reconcile() {
    let (engine, sandbox) = harness().await;
    let (contract, _) = sent_contract(&engine).await;
    let before = sandbox.provider.status_queries();

    let signing_return = engine
        .record_signing_return(&contract.contract_id, "cancel")
        .await
        .unwrap();

    assert!(signing_return.reconciled.is_none());
    assert_eq!(sandbox.provider.status_queries(), before);
}

#[tokio::test]
async fn direct_termination_cancels_billing_first() {
    let (engine, sandbox) = harness().await;
    let contract = active_contract(&engine, &sandbox).await;

    sandbox.billing.set_failing(true);
    let err = engine
        .transition_contract(&contract.contract_id, ContractState::Terminated, "ops-1")
        .await
        .unwrap_err();
    assert_eq!(err.code(), "provider_failure");
    assert_eq!(
        engine.contract(&contract.contract_id).await.unwrap().state(),
        ContractState::Active
    );

    sandbox.billing.set_failing(false);
    engine
        .transition_contract(&contract.contract_id, ContractState::Terminated, "ops-1")
        .await
        .unwrap();
    let subscription = engine.subscription(&contract.subscription_id).await.unwrap();
    assert_eq!(subscription.subscription_state, SubscriptionState::Churned);
    assert!(!subscription.billing_active);
    assert_eq!(
        sandbox.billing.cancellations().await,
        vec![contract.subscription_id.clone()]
    );
}

#[tokio::test]
async fn sweep_moves_contracts_through_renewal_and_expiry() {
    let (engine, sandbox) = harness().await;
    let contract = active_contract(&engine, &sandbox).await;
    let end = contract.end_date;

    let summary = engine
        .sweep_lifecycle(end - Duration::days(10))
        .await
        .unwrap();
    assert_eq!(summary.renewal_due, vec![contract.contract_id.clone()]);

    let summary = engine.sweep_lifecycle(end).await.unwrap();
    assert_eq!(summary.expired, vec![contract.contract_id.clone()]);
    let subscription = engine.subscription(&contract.subscription_id).await.unwrap();
    assert_eq!(subscription.contract_state(), SubscriptionContractState::Expired);
}

#[tokio::test]
async fn renewal_reactivates_a_due_contract() {
    let (engine, sandbox) = harness().await;
    let contract = active_contract(&engine, &sandbox).await;
    engine
        .transition_contract(&contract.contract_id, ContractState::RenewalDue, "ops-1")
        .await
        .unwrap();

    let renewed = engine
        .renew_contract(&contract.contract_id, 12, "ops-1")
        .await
        .unwrap();

    assert_eq!(renewed.state(), ContractState::Active);
    assert_eq!(renewed.duration_months, 24);
    assert_eq!(renewed.contract_value_minor, 60_000);
}

#[tokio::test]
async fn termination_wizard_enforces_separation_of_duties() {
    let (engine, sandbox) = harness().await;
    let contract = active_contract(&engine, &sandbox).await;
    let cid = contract.contract_id.clone();
    sandbox.billing.set_total_paid(&cid, 30_000).await;
    sandbox
        .billing
        .record_payment(PaymentRecord {
            reference: "PAY-1".to_string(),
            amount_minor: 5_000,
            currency: "USD".to_string(),
            applied_invoice: None,
        })
        .await;

    let request = engine.open_termination(&cid, "agent-1").await.unwrap();
    assert_eq!(request.computed_cost_minor, 5_000);
    assert_eq!(
        engine.abandon_termination(&cid).await.unwrap(),
        AbandonOutcome::Deleted
    );
    assert!(matches!(
        engine.termination(&cid).await,
        Err(ContractError::NotFound(_))
    ));

    engine.open_termination(&cid, "agent-1").await.unwrap();
    let err = engine
        .update_termination(&cid, "agent-1", TerminationAction::Approve)
        .await
        .unwrap_err();
    assert!(matches!(err, ContractError::SeparationOfDutiesViolation { .. }));

    engine
        .update_termination(&cid, "manager-1", TerminationAction::Approve)
        .await
        .unwrap();
    assert_eq!(
        engine.abandon_termination(&cid).await.unwrap(),
        AbandonOutcome::Kept
    );
    engine
        .update_termination(
            &cid,
            "agent-1",
            TerminationAction::ConfirmPayment {
                reference: "PAY-1".to_string(),
            },
        )
        .await
        .unwrap();
    for _ in 0..2 {
        engine
            .update_termination(&cid, "agent-1", TerminationAction::Next)
            .await
            .unwrap();
    }
    assert_eq!(
        engine.termination(&cid).await.unwrap().step,
        TerminationStep::Payment
    );
    engine
        .update_termination(&cid, "agent-1", TerminationAction::Next)
        .await
        .unwrap();
    engine
        .update_termination(
            &cid,
            "agent-1",
            TerminationAction::EquipmentReturned { returned: true },
        )
        .await
        .unwrap();
    engine
        .update_termination(&cid, "agent-1", TerminationAction::Next)
        .await
        .unwrap();
    engine
        .update_termination(
            &cid,
            "agent-1",
            TerminationAction::Closure {
                details: ClosureDetails {
                    reason: TerminationReason::Relocation,
                    competitor: None,
                    notes: "moving abroad".to_string(),
                    rating: 4,
                    problems: Vec::new(),
                },
            },
        )
        .await
        .unwrap();

    let receipt = engine.confirm_termination(&cid, "agent-1").await.unwrap();
    assert_eq!(receipt.contract_state, ContractState::Terminated);
    assert_eq!(receipt.closure.approved_by.as_deref(), Some("manager-1"));
    assert_eq!(receipt.closure.payment_reference.as_deref(), Some("PAY-1"));
    assert!(matches!(
        engine.termination(&cid).await,
        Err(ContractError::NotFound(_))
    ));
    assert!(engine
        .journal_for(&cid)
        .await
        .iter()
        .any(|entry| entry.kind == JournalEntryKind::Closure));
    assert!(engine.verify_journal().await);
}

#[tokio::test]
async fn termination_needs_a_terminable_contract() {
    let (engine, _) = harness().await;
    let (contract, _) = sent_contract(&engine).await;

    let err = engine
        .open_termination(&contract.contract_id, "agent-1")
        .await
        .unwrap_err();
    assert!(matches!(err, ContractError::InvalidTransition { .. }));
}

#[tokio::test]
async fn addendum_requires_active_contract() {
    let (engine, _) = harness().await;
    let (contract, _) = sent_contract(&engine).await;

    let err = engine
        .create_addendum(&contract.contract_id, "extra access point", 500)
        .await
        .unwrap_err();
    assert_eq!(err.code(), "validation");
}

#[tokio::test]
async fn service_state_updates_drive_progress() {
    let (engine, sandbox) = harness().await;
    let contract = active_contract(&engine, &sandbox).await;
    assert_eq!(
        engine.progress(&contract.subscription_id).await.unwrap(),
        crate::progress::ProgressStage::ScheduleInstall
    );

    engine
        .update_service_states(
            &contract.subscription_id,
            ServiceStateUpdate {
                installation_state: Some(InstallationState::Done),
                configuration_state: Some(ConfigurationState::Done),
                internet_service_state: Some(InternetServiceState::Active),
            },
        )
        .await
        .unwrap();

    assert_eq!(
        engine.progress(&contract.subscription_id).await.unwrap(),
        crate::progress::ProgressStage::Active
    );
}

/// Renders like the sandbox unless told to fail contract drafts.
struct FlakyRenderer {
    failing: AtomicBool,
}

#[async_trait::async_trait]
impl DocumentRenderer for FlakyRenderer {
    async fn render_contract(
        &self,
        subscription: &Subscription,
        contract: &Contract,
    ) -> Result<SourceDocument, ContractError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(ContractError::provider("render_contract", "renderer offline"));
        }
        PlainTextRenderer.render_contract(subscription, contract).await
    }

    async fn render_addendum(
        &self,
        contract: &Contract,
        addendum_id: &str,
    ) -> Result<SourceDocument, ContractError> {
        PlainTextRenderer.render_addendum(contract, addendum_id).await
    }
}

/// In-memory store whose termination commit can be made to fail.
#[derive(Default)]
struct CommitFailingStore {
    inner: InMemoryContractStore,
    fail_commit: AtomicBool,
}

#[async_trait::async_trait]
impl ContractStore for CommitFailingStore {
    async fn load_subscription(
        &self,
        subscription_id: &str,
    ) -> Result<Option<Subscription>, ContractError> {
        self.inner.load_subscription(subscription_id).await
    }

    async fn find_subscription_by_quote(
        &self,
        quote_uuid: &str,
    ) -> Result<Option<Subscription>, ContractError> {
        self.inner.find_subscription_by_quote(quote_uuid).await
    }

    async fn save_subscription(&self, subscription: &Subscription) -> Result<(), ContractError> {
        self.inner.save_subscription(subscription).await
    }

    async fn load_contract(&self, contract_id: &str) -> Result<Option<Contract>, ContractError> {
        self.inner.load_contract(contract_id).await
    }

    async fn find_contract_by_envelope(
        &self,
        envelope_id: &str,
    ) -> Result<Option<Contract>, ContractError> {
        self.inner.find_contract_by_envelope(envelope_id).await
    }

    async fn list_contracts(&self) -> Result<Vec<Contract>, ContractError> {
        self.inner.list_contracts().await
    }

    async fn save_bundle(
        &self,
        subscription: &Subscription,
        contract: &Contract,
    ) -> Result<(), ContractError> {
        self.inner.save_bundle(subscription, contract).await
    }

    async fn load_termination(
        &self,
        contract_id: &str,
    ) -> Result<Option<TerminationRequest>, ContractError> {
        self.inner.load_termination(contract_id).await
    }

    async fn save_termination(&self, request: &TerminationRequest) -> Result<(), ContractError> {
        self.inner.save_termination(request).await
    }

    async fn delete_termination(&self, contract_id: &str) -> Result<bool, ContractError> {
        self.inner.delete_termination(contract_id).await
    }

    async fn save_termination_bundle(
        &self,
        subscription: &Subscription,
        contract: &Contract,
        request: &TerminationRequest,
    ) -> Result<(), ContractError> {
        if self.fail_commit.load(Ordering::SeqCst) {
            return Err(ContractError::Storage("disk full".to_string()));
        }
        self.inner
            .save_termination_bundle(subscription, contract, request)
            .await
    }

    async fn save_magic_link(&self, record: &MagicLinkRecord) -> Result<(), ContractError> {
        self.inner.save_magic_link(record).await
    }

    async fn find_magic_link(
        &self,
        token_hash: &str,
    ) -> Result<Option<MagicLinkRecord>, ContractError> {
        self.inner.find_magic_link(token_hash).await
    }

    async fn save_follow_up(&self, follow_up: &FollowUp) -> Result<(), ContractError> {
        self.inner.save_follow_up(follow_up).await
    }

    async fn load_follow_up(&self, follow_up_id: &str) -> Result<Option<FollowUp>, ContractError> {
        self.inner.load_follow_up(follow_up_id).await
    }

    async fn list_follow_ups(&self, include_resolved: bool) -> Result<Vec<FollowUp>, ContractError> {
        self.inner.list_follow_ups(include_resolved).await
    }
}

/// Walk an open termination up to the closure step with a paid cost.
async fn termination_at_closure(engine: &ContractEngine, sandbox: &SandboxCollaborators, cid: &str) {
    sandbox.billing.set_total_paid(cid, 30_000).await;
    sandbox
        .billing
        .record_payment(PaymentRecord {
            reference: "PAY-7".to_string(),
            amount_minor: 5_000,
            currency: "USD".to_string(),
            applied_invoice: None,
        })
        .await;
    engine.open_termination(cid, "agent-1").await.unwrap();
    engine
        .update_termination(cid, "manager-1", TerminationAction::Approve)
        .await
        .unwrap();
    engine
        .update_termination(
            cid,
            "agent-1",
            TerminationAction::ConfirmPayment {
                reference: "PAY-7".to_string(),
            },
        )
        .await
        .unwrap();
    for _ in 0..3 {
        engine
            .update_termination(cid, "agent-1", TerminationAction::Next)
            .await
            .unwrap();
    }
    engine
        .update_termination(
            cid,
            "agent-1",
            TerminationAction::EquipmentReturned { returned: true },
        )
        .await
        .unwrap();
    engine
        .update_termination(cid, "agent-1", TerminationAction::Next)
        .await
        .unwrap();
    engine
        .update_termination(
            cid,
            "agent-1",
            TerminationAction::Closure {
                details: ClosureDetails {
                    reason: TerminationReason::Relocation,
                    competitor: None,
                    notes: "moving".to_string(),
                    rating: 3,
                    problems: Vec::new(),
                },
            },
        )
        .await
        .unwrap();
}

#[tokio::test]
async fn quote_stays_unconfirmed_when_drafting_fails() {
    let sandbox = SandboxCollaborators::new(PROVIDER_BASE);
    let renderer = Arc::new(FlakyRenderer {
        failing: AtomicBool::new(true),
    });
    let mut collaborators = sandbox.collaborators();
    collaborators.renderer = renderer.clone() as Arc<dyn DocumentRenderer>;
    let engine = ContractEngine::bootstrap(
        EngineConfig::default(),
        Arc::new(InMemoryContractStore::new()),
        collaborators,
    )
    .await
    .unwrap();
    let subscription = engine
        .register_subscription(Subscription::new("cust-5", "Marta", "marta@example.com", terms()))
        .await
        .unwrap();
    let exp = today() + Duration::days(3);
    let params = QuoteLinkParams {
        uuid: Some(subscription.quote_uuid.clone()),
        exp: Some(exp.format("%Y-%m-%d").to_string()),
        sig: Some(engine.quote_links().sign(&subscription.quote_uuid, exp).unwrap()),
    };

    let err = engine.confirm_quote(&params, today()).await.unwrap_err();
    assert_eq!(err.code(), "provider_failure");
    let stored = engine.subscription(&subscription.subscription_id).await.unwrap();
    assert!(!stored.quote_confirmed());
    assert_eq!(sandbox.provider.envelope_count().await, 0);

    // Clicking the same link again drafts and sends.
    renderer.failing.store(false, Ordering::SeqCst);
    let confirmation = engine.confirm_quote(&params, today()).await.unwrap();
    assert!(!confirmation.already_confirmed);
    assert!(confirmation.contract_id.is_some());
    assert!(!confirmation.send.is_deferred());
    assert_eq!(sandbox.provider.envelope_count().await, 1);
    assert!(engine
        .subscription(&subscription.subscription_id)
        .await
        .unwrap()
        .quote_confirmed());
}

#[tokio::test]
async fn failed_webhook_reconcile_is_queued_once() {
    let (engine, sandbox) = harness().await;
    let (contract, envelope_id) = sent_contract(&engine).await;
    sandbox.provider.set_failing(true);

    match engine.handle_webhook(&webhook(&envelope_id)).await {
        WebhookDisposition::Failed {
            envelope_id: failed, ..
        } => assert_eq!(failed, envelope_id),
        other => panic!("unexpected disposition: {other:?}"),
    }
    let open = engine.follow_ups(false).await.unwrap();
    assert_eq!(open.len(), 1);
    assert_eq!(open[0].kind, FollowUpKind::ReconcileFailed);
    assert_eq!(open[0].contract_id, contract.contract_id);

    assert_eq!(engine.poll_open_envelopes().await.unwrap().failed, 1);
    assert_eq!(engine.follow_ups(false).await.unwrap().len(), 1);
}

#[tokio::test]
async fn direct_termination_refuses_open_wizard_request() {
    let (engine, sandbox) = harness().await;
    let contract = active_contract(&engine, &sandbox).await;
    let cid = contract.contract_id.clone();
    engine.open_termination(&cid, "agent-1").await.unwrap();

    let err = engine
        .transition_contract(&cid, ContractState::Terminated, "ops-1")
        .await
        .unwrap_err();
    assert_eq!(err.code(), "validation");
    assert_eq!(
        engine.contract(&cid).await.unwrap().state(),
        ContractState::Active
    );
    assert!(sandbox.billing.cancellations().await.is_empty());
    assert_eq!(
        engine.termination(&cid).await.unwrap().step,
        TerminationStep::Cost
    );
}

#[tokio::test]
async fn failed_termination_commit_changes_nothing() {
    let sandbox = SandboxCollaborators::new(PROVIDER_BASE);
    let store = Arc::new(CommitFailingStore::default());
    let engine = ContractEngine::bootstrap(
        EngineConfig::default(),
        store.clone(),
        sandbox.collaborators(),
    )
    .await
    .unwrap();
    let contract = active_contract(&engine, &sandbox).await;
    let cid = contract.contract_id.clone();
    termination_at_closure(&engine, &sandbox, &cid).await;

    store.fail_commit.store(true, Ordering::SeqCst);
    let err = engine.confirm_termination(&cid, "agent-1").await.unwrap_err();
    assert_eq!(err.code(), "storage");
    assert_eq!(
        engine.contract(&cid).await.unwrap().state(),
        ContractState::Active
    );
    assert_eq!(
        engine.termination(&cid).await.unwrap().step,
        TerminationStep::Closure
    );
    let subscription = engine.subscription(&contract.subscription_id).await.unwrap();
    assert_ne!(subscription.subscription_state, SubscriptionState::Churned);
    assert!(!engine
        .journal_for(&cid)
        .await
        .iter()
        .any(|entry| entry.kind == JournalEntryKind::Closure));

    store.fail_commit.store(false, Ordering::SeqCst);
    let receipt = engine.confirm_termination(&cid, "agent-1").await.unwrap();
    assert_eq!(receipt.contract_state, ContractState::Terminated);
    assert!(matches!(
        engine.termination(&cid).await,
        Err(ContractError::NotFound(_))
    ));
    let subscription = engine.subscription(&contract.subscription_id).await.unwrap();
    assert_eq!(subscription.subscription_state, SubscriptionState::Churned);
}

#[tokio::test]
async fn concurrent_webhook_and_poll_apply_completion_once() {
    let (engine, sandbox) = harness().await;
    let (contract, envelope_id) = sent_contract(&engine).await;
    sandbox.provider.sign_all(&envelope_id).await.unwrap();

    let event = webhook(&envelope_id);
    let (disposition, summary) =
        tokio::join!(engine.handle_webhook(&event), engine.poll_open_envelopes());
    let webhook_changed = match disposition {
        WebhookDisposition::Reconciled { outcome } => usize::from(outcome.changed),
        other => panic!("unexpected disposition: {other:?}"),
    };
    let summary = summary.unwrap();
    assert_eq!(summary.failed, 0);
    assert_eq!(webhook_changed + summary.changed, 1);

    assert_eq!(sandbox.tasks.requests().await.len(), 1);
    assert_eq!(sandbox.archive.stored().await.len(), 2);
    let contract = engine.contract(&contract.contract_id).await.unwrap();
    assert_eq!(contract.state(), ContractState::Active);
    assert_eq!(contract.signing.signed_documents.len(), 2);

    let completions = engine
        .journal_for(&contract.contract_id)
        .await
        .into_iter()
        .filter(|entry| entry.kind == JournalEntryKind::Note)
        .filter(|entry| {
            entry.payload["body"]
                .as_str()
                .is_some_and(|body| body.contains("-> completed"))
        })
        .count();
    assert_eq!(completions, 1);
    assert!(engine.verify_journal().await);
}

#[tokio::test]
async fn second_live_contract_is_rejected() {
    let (engine, sandbox) = harness().await;
    let (contract, _) = sent_contract(&engine).await;

    let err = engine
        .create_contract(&contract.subscription_id, today())
        .await
        .unwrap_err();
    assert_eq!(err.code(), "validation");
    assert_eq!(
        engine
            .subscription(&contract.subscription_id)
            .await
            .unwrap()
            .contract_state(),
        SubscriptionContractState::PendingCustomerSignature
    );
    assert_eq!(sandbox.provider.envelope_count().await, 1);
}
