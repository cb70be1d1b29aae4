//! End-to-end contract lifecycle scenarios against the sandbox collaborators.

use chrono::{NaiveDate, Utc};
use covenant_core::sandbox::SandboxCollaborators;
use covenant_core::*;
use std::sync::Arc;

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

const PROVIDER_BASE: &str = "https://sandbox.sign.local";

fn terms() -> ContractTerms {
    ContractTerms {
        monthly_payment_minor: 2_500,
        duration_months: 12,
        early_termination_fee_minor: 5_000,
        currency: "USD".to_string(),
    }
}

async fn engine_with(store: Arc<dyn ContractStore>, sandbox: &SandboxCollaborators) -> ContractEngine {
    ContractEngine::bootstrap(EngineConfig::default(), store, sandbox.collaborators())
        .await
        .unwrap()
}

async fn active_contract(
    engine: &ContractEngine,
    sandbox: &SandboxCollaborators,
    start: NaiveDate,
) -> Contract {
    let mut subscription =
        Subscription::new("cust-1", "Ana Lopez", "ana@example.com", terms()).with_phone("+50370001111");
    subscription.confirm_quote();
    let subscription = engine.register_subscription(subscription).await.unwrap();
    let contract = engine
        .create_contract(&subscription.subscription_id, start)
        .await
        .unwrap();
    let contract = engine
        .send_contract(&contract.contract_id, DeliveryChannel::Email)
        .await
        .unwrap();
    let envelope_id = contract.signing.envelope_id().unwrap().to_string();
    sandbox.provider.sign_all(&envelope_id).await.unwrap();
    engine
        .reconcile_envelope(&envelope_id, ReconcileSource::Webhook)
        .await
        .unwrap();
    engine.contract(&contract.contract_id).await.unwrap()
}

// ---------------------------------------------------------------------------
// Reconciliation
// ---------------------------------------------------------------------------

#[tokio::test]
async fn signatures_survive_a_regressing_provider_report() {
    let sandbox = SandboxCollaborators::new(PROVIDER_BASE);
    let engine = engine_with(Arc::new(InMemoryContractStore::new()), &sandbox).await;
    let mut subscription = Subscription::new("cust-7", "Pia", "pia@example.com", terms());
    subscription.confirm_quote();
    let subscription = engine.register_subscription(subscription).await.unwrap();
    let contract = engine
        .create_contract(&subscription.subscription_id, Utc::now().date_naive())
        .await
        .unwrap();
    let contract = engine
        .send_contract(&contract.contract_id, DeliveryChannel::Email)
        .await
        .unwrap();
    let envelope_id = contract.signing.envelope_id().unwrap().to_string();

    sandbox
        .provider
        .set_recipient_status(&envelope_id, 1, ProviderRecipientStatus::Completed)
        .await
        .unwrap();
    let first = engine
        .reconcile_envelope(&envelope_id, ReconcileSource::Poll)
        .await
        .unwrap();
    assert_eq!(first.state, EnvelopeState::CustomerSigned);

    sandbox
        .provider
        .set_recipient_status(&envelope_id, 1, ProviderRecipientStatus::Sent)
        .await
        .unwrap();
    let second = engine
        .reconcile_envelope(&envelope_id, ReconcileSource::Poll)
        .await
        .unwrap();
    assert!(!second.changed);
    assert_eq!(second.state, EnvelopeState::CustomerSigned);

    let contract = engine.contract(&contract.contract_id).await.unwrap();
    assert!(contract.signing.recipient_by_ordinal(1).unwrap().sign_status);
    assert!(!contract.signing.recipient_by_ordinal(2).unwrap().sign_status);
}

#[tokio::test]
async fn file_store_resumes_after_restart() {
    let path = std::env::temp_dir().join(format!("covenant-lifecycle-{}.json", uuid::Uuid::new_v4()));
    let sandbox = SandboxCollaborators::new(PROVIDER_BASE);

    let (contract_id, envelope_id) = {
        let store = Arc::new(FileContractStore::load(path.clone()).unwrap());
        let engine = engine_with(store, &sandbox).await;
        let mut subscription = Subscription::new("cust-8", "Iris", "iris@example.com", terms());
        subscription.confirm_quote();
        let subscription = engine.register_subscription(subscription).await.unwrap();
        let contract = engine
            .create_contract(&subscription.subscription_id, Utc::now().date_naive())
            .await
            .unwrap();
        let contract = engine
            .send_contract(&contract.contract_id, DeliveryChannel::Email)
            .await
            .unwrap();
        (
            contract.contract_id.clone(),
            contract.signing.envelope_id().unwrap().to_string(),
        )
    };

    sandbox.provider.sign_all(&envelope_id).await.unwrap();
    let store = Arc::new(FileContractStore::load(path.clone()).unwrap());
    let engine = engine_with(store, &sandbox).await;
    let summary = engine.poll_open_envelopes().await.unwrap();

    assert_eq!(summary.checked, 1);
    assert_eq!(
        engine.contract(&contract_id).await.unwrap().state(),
        ContractState::Active
    );
    let _ = std::fs::remove_file(&path);
}

// ---------------------------------------------------------------------------
// Addenda
// ---------------------------------------------------------------------------

#[tokio::test]
async fn addendum_activation_and_cancellation_round_trip() {
    let sandbox = SandboxCollaborators::new(PROVIDER_BASE);
    let engine = engine_with(Arc::new(InMemoryContractStore::new()), &sandbox).await;
    let contract = active_contract(&engine, &sandbox, Utc::now().date_naive()).await;
    let monthly_before = contract.monthly_payment_minor;
    let value_before = contract.contract_value_minor;

    let addendum = engine
        .create_addendum(&contract.contract_id, "second access point", 1_000)
        .await
        .unwrap();
    assert_eq!(addendum.state, AddendumState::Draft);
    let addendum = engine
        .send_addendum(&contract.contract_id, &addendum.addendum_id, DeliveryChannel::Email)
        .await
        .unwrap();
    assert_eq!(addendum.state, AddendumState::PendingSignature);
    let envelope_id = addendum.signing.envelope_id().unwrap().to_string();
    assert_ne!(contract.signing.envelope_id(), Some(envelope_id.as_str()));

    sandbox.provider.sign_all(&envelope_id).await.unwrap();
    let outcome = engine
        .reconcile_envelope(&envelope_id, ReconcileSource::Webhook)
        .await
        .unwrap();
    assert_eq!(outcome.state, EnvelopeState::Completed);

    let activated = engine.contract(&contract.contract_id).await.unwrap();
    let applied = activated
        .addendum(&addendum.addendum_id)
        .unwrap()
        .applied
        .unwrap();
    assert_eq!(activated.monthly_payment_minor, monthly_before + 1_000);
    assert_eq!(
        activated.contract_value_minor,
        value_before + applied.value_delta_minor
    );
    assert_eq!(
        applied.value_delta_minor,
        1_000 * AmountMinor::from(applied.remaining_months)
    );

    let cancelled = engine
        .cancel_addendum(&contract.contract_id, &addendum.addendum_id)
        .await
        .unwrap();
    assert_eq!(cancelled.monthly_payment_minor, monthly_before);
    assert_eq!(cancelled.contract_value_minor, value_before);
    assert_eq!(
        cancelled.addendum(&addendum.addendum_id).unwrap().state,
        AddendumState::Cancelled
    );
    // Only the contract envelope requested an installation.
    assert_eq!(sandbox.tasks.requests().await.len(), 1);
}

// ---------------------------------------------------------------------------
// Termination
// ---------------------------------------------------------------------------

#[tokio::test]
async fn under_threshold_termination_needs_payment_then_manager() {
    let sandbox = SandboxCollaborators::new(PROVIDER_BASE);
    let engine = engine_with(Arc::new(InMemoryContractStore::new()), &sandbox).await;
    let contract = active_contract(&engine, &sandbox, Utc::now().date_naive()).await;
    let cid = contract.contract_id.clone();
    // 300.00 value + 50.00 fee - 305.00 paid = 45.00
    sandbox.billing.set_total_paid(&cid, 30_500).await;
    sandbox
        .billing
        .record_payment(PaymentRecord {
            reference: "PAY-44".to_string(),
            amount_minor: 4_499,
            currency: "USD".to_string(),
            applied_invoice: None,
        })
        .await;
    sandbox
        .billing
        .record_payment(PaymentRecord {
            reference: "PAY-45".to_string(),
            amount_minor: 4_500,
            currency: "USD".to_string(),
            applied_invoice: None,
        })
        .await;

    let request = engine.open_termination(&cid, "agent-1").await.unwrap();
    assert_eq!(request.computed_cost_minor, 4_500);

    let err = engine
        .update_termination(&cid, "agent-1", TerminationAction::Next)
        .await
        .unwrap_err();
    assert!(err.to_string().contains("payment"), "{err}");

    let err = engine
        .update_termination(
            &cid,
            "agent-1",
            TerminationAction::ConfirmPayment {
                reference: "PAY-44".to_string(),
            },
        )
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        ContractError::AmountMismatch {
            expected_minor: 4_500,
            actual_minor: 4_499
        }
    ));

    engine
        .update_termination(
            &cid,
            "agent-1",
            TerminationAction::ConfirmPayment {
                reference: "PAY-45".to_string(),
            },
        )
        .await
        .unwrap();
    let err = engine
        .update_termination(&cid, "agent-1", TerminationAction::Next)
        .await
        .unwrap_err();
    assert!(err.to_string().contains("manager approval"), "{err}");

    engine
        .update_termination(&cid, "manager-1", TerminationAction::Approve)
        .await
        .unwrap();
    let request = engine
        .update_termination(&cid, "agent-1", TerminationAction::Next)
        .await
        .unwrap();
    assert_eq!(request.step, TerminationStep::Approval);
}

#[tokio::test]
async fn waiver_skips_payment_and_terminates() {
    let sandbox = SandboxCollaborators::new(PROVIDER_BASE);
    let engine = engine_with(Arc::new(InMemoryContractStore::new()), &sandbox).await;
    let contract = active_contract(&engine, &sandbox, Utc::now().date_naive()).await;
    let cid = contract.contract_id.clone();

    engine.open_termination(&cid, "agent-1").await.unwrap();
    engine
        .update_termination(
            &cid,
            "agent-2",
            TerminationAction::RequestOverride {
                cost_minor: 0,
                justification: "service outage for three weeks".to_string(),
            },
        )
        .await
        .unwrap();

    let err = engine
        .update_termination(&cid, "agent-2", TerminationAction::ApplyOverride)
        .await
        .unwrap_err();
    assert!(matches!(err, ContractError::SeparationOfDutiesViolation { .. }));

    engine
        .update_termination(&cid, "agent-1", TerminationAction::Next)
        .await
        .unwrap();
    engine
        .update_termination(&cid, "manager-1", TerminationAction::ApplyOverride)
        .await
        .unwrap();
    let request = engine
        .update_termination(&cid, "agent-1", TerminationAction::Next)
        .await
        .unwrap();
    assert_eq!(request.step, TerminationStep::Equipment);

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
                    reason: TerminationReason::Competitor,
                    competitor: Some(CompetitorInfo {
                        name: "FastNet".to_string(),
                        offer: Some("half price for a year".to_string()),
                    }),
                    notes: "customer switching provider".to_string(),
                    rating: 2,
                    problems: vec!["outage".to_string()],
                },
            },
        )
        .await
        .unwrap();

    let receipt = engine.confirm_termination(&cid, "agent-1").await.unwrap();
    assert_eq!(receipt.closure.applied_cost_minor, 0);
    assert_eq!(receipt.closure.approved_by.as_deref(), Some("manager-1"));
    let subscription = engine.subscription(&contract.subscription_id).await.unwrap();
    assert_eq!(subscription.contract_state(), SubscriptionContractState::Terminated);
    assert_eq!(subscription.subscription_state, SubscriptionState::Churned);
    assert_eq!(
        sandbox.billing.cancellations().await,
        vec![contract.subscription_id.clone()]
    );
}
