use super::*;
use axum::body::{to_bytes, Body};
use axum::http::{header, Request};
use covenant_core::sandbox::SandboxCollaborators;
use serde_json::{json, Value};
use tower::ServiceExt;

async fn state_with(config: ServiceConfig) -> ServiceState {
    ServiceState::bootstrap(config).await.unwrap()
}

async fn sandbox_state() -> ServiceState {
    state_with(ServiceConfig::default()).await
}

fn sandbox(state: &ServiceState) -> &SandboxCollaborators {
    state.sandbox.as_ref().unwrap()
}

async fn send(app: &Router, method: &str, uri: &str, body: Option<Value>) -> Response {
    let builder = Request::builder().method(method).uri(uri);
    let request = match body {
        Some(body) => builder
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    };
    app.clone().oneshot(request).await.unwrap()
}

async fn json_body(response: Response) -> Value {
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

fn location(response: &Response) -> String {
    response
        .headers()
        .get(header::LOCATION)
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default()
        .to_string()
}

fn subscription_payload() -> Value {
    json!({
        "customer_id": "cust-1",
        "customer_name": "Ana Cruz",
        "customer_email": "ana@example.com",
        "customer_phone": "+50370001111",
        "terms": {
            "monthly_payment_minor": 2_500,
            "duration_months": 12,
            "early_termination_fee_minor": 5_000,
            "currency": "USD"
        }
    })
}

/// Active contract built through the engine, returning its id.
async fn active_contract(state: &ServiceState) -> String {
    let mut subscription = Subscription::new(
        "cust-9",
        "Luis Pena",
        "luis@example.com",
        ContractTerms {
            monthly_payment_minor: 2_500,
            duration_months: 12,
            early_termination_fee_minor: 5_000,
            currency: "USD".to_string(),
        },
    );
    subscription.confirm_quote();
    let subscription = state.engine.register_subscription(subscription).await.unwrap();
    let contract = state
        .engine
        .create_contract(&subscription.subscription_id, today())
        .await
        .unwrap();
    let contract = state
        .engine
        .send_contract(&contract.contract_id, DeliveryChannel::Email)
        .await
        .unwrap();
    let envelope_id = contract.signing.envelope_id().unwrap().to_string();
    sandbox(state).provider.sign_all(&envelope_id).await.unwrap();
    state
        .engine
        .reconcile_envelope(&envelope_id, ReconcileSource::Poll)
        .await
        .unwrap();
    contract.contract_id
}

#[tokio::test]
async fn health_reports_sandbox_provider() {
    let app = build_router(sandbox_state().await);
    let response = send(&app, "GET", "/v1/health", None).await;
    assert_eq!(response.status(), StatusCode::OK);

    let body = json_body(response).await;
    assert_eq!(body["provider"], "sandbox");
    assert_eq!(body["journal_verified"], true);
}

#[tokio::test]
async fn quote_link_confirms_and_webhook_activates() {
    let state = sandbox_state().await;
    let app = build_router(state.clone());

    let response = send(&app, "POST", "/v1/subscriptions", Some(subscription_payload())).await;
    assert_eq!(response.status(), StatusCode::CREATED);
    let subscription_id = json_body(response).await["subscription_id"]
        .as_str()
        .unwrap()
        .to_string();

    let response = send(
        &app,
        "GET",
        &format!("/v1/subscriptions/{subscription_id}/quote-link"),
        None,
    )
    .await;
    assert_eq!(response.status(), StatusCode::OK);
    let url = json_body(response).await["url"].as_str().unwrap().to_string();
    let path = &url[url.find("/v1/").unwrap()..];

    let response = send(&app, "GET", path, None).await;
    assert_eq!(response.status(), StatusCode::SEE_OTHER);
    assert_eq!(location(&response), "/portal/done?status=quote_confirmed");

    let response = send(&app, "GET", path, None).await;
    assert_eq!(
        location(&response),
        "/portal/done?status=quote_already_confirmed"
    );
    assert_eq!(sandbox(&state).provider.envelope_count().await, 1);

    let response = send(
        &app,
        "POST",
        "/v1/webhooks/signature",
        Some(json!({"event": "envelope-sent", "data": {"envelopeId": "sbx-env-0001"}})),
    )
    .await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(json_body(response).await["disposition"], "ignored");

    sandbox(&state).provider.sign_all("sbx-env-0001").await.unwrap();
    let response = send(
        &app,
        "POST",
        "/v1/webhooks/signature",
        Some(json!({"event": "envelope-completed", "data": {"envelopeId": "sbx-env-0001"}})),
    )
    .await;
    assert_eq!(response.status(), StatusCode::OK);
    let body = json_body(response).await;
    assert_eq!(body["disposition"], "reconciled");
    assert_eq!(body["outcome"]["contract_state"], "active");
    let contract_id = body["outcome"]["contract_id"].as_str().unwrap().to_string();

    let contract = state.engine.contract(&contract_id).await.unwrap();
    assert_eq!(contract.state(), ContractState::Active);
    assert_eq!(sandbox(&state).tasks.requests().await.len(), 1);

    let response = send(
        &app,
        "GET",
        &format!("/v1/subscriptions/{subscription_id}/progress"),
        None,
    )
    .await;
    assert_eq!(response.status(), StatusCode::OK);
    assert!(json_body(response).await["stage"].is_string());

    let response = send(&app, "GET", &format!("/v1/contracts/{contract_id}/journal"), None).await;
    let entries = json_body(response).await;
    assert!(entries.as_array().map(|items| !items.is_empty()).unwrap_or(false));
}

#[tokio::test]
async fn tampered_quote_link_lands_on_error_page() {
    let state = sandbox_state().await;
    let app = build_router(state.clone());

    let response = send(&app, "POST", "/v1/subscriptions", Some(subscription_payload())).await;
    let subscription_id = json_body(response).await["subscription_id"]
        .as_str()
        .unwrap()
        .to_string();
    let subscription = state.engine.subscription(&subscription_id).await.unwrap();
    let url = state
        .engine
        .quote_links()
        .build_url(&subscription.quote_uuid, today())
        .unwrap();
    let tampered = url[url.find("/v1/").unwrap()..].replace("sig=", "sig=00");

    let response = send(&app, "GET", &tampered, None).await;
    assert_eq!(response.status(), StatusCode::SEE_OTHER);
    assert_eq!(location(&response), "/portal/error?reason=invalid_signature");
    assert_eq!(sandbox(&state).provider.envelope_count().await, 0);
}

#[tokio::test]
async fn magic_link_errors_render_friendly_messages() {
    let app = build_router(sandbox_state().await);

    let response = send(&app, "GET", "/v1/sign/magic", None).await;
    assert_eq!(response.status(), StatusCode::SEE_OTHER);
    assert_eq!(location(&response), "/portal/error?reason=magic_link_missing");

    let response = send(&app, "GET", "/v1/sign/magic?token=nope", None).await;
    assert_eq!(location(&response), "/portal/error?reason=magic_link_not_found");

    let response = send(&app, "GET", "/portal/error?reason=magic_link_used", None).await;
    assert_eq!(response.status(), StatusCode::OK);
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let page = String::from_utf8(bytes.to_vec()).unwrap();
    assert!(page.contains("already been used"));
}

#[tokio::test]
async fn magic_link_redirects_once_to_provider() {
    let state = sandbox_state().await;
    let app = build_router(state.clone());

    let mut subscription = Subscription::new(
        "cust-3",
        "Marta Diaz",
        "marta@example.com",
        ContractTerms {
            monthly_payment_minor: 3_000,
            duration_months: 24,
            early_termination_fee_minor: 5_000,
            currency: "USD".to_string(),
        },
    );
    subscription.confirm_quote();
    let subscription = state.engine.register_subscription(subscription).await.unwrap();
    let contract = state
        .engine
        .create_contract(&subscription.subscription_id, today())
        .await
        .unwrap();
    state
        .engine
        .send_contract(&contract.contract_id, DeliveryChannel::Email)
        .await
        .unwrap();

    let response = send(
        &app,
        "POST",
        &format!("/v1/contracts/{}/magic-links", contract.contract_id),
        Some(json!({"recipient_id": 1})),
    )
    .await;
    assert_eq!(response.status(), StatusCode::CREATED);
    let url = json_body(response).await["url"].as_str().unwrap().to_string();
    let path = &url[url.find("/v1/").unwrap()..];

    let response = send(&app, "GET", path, None).await;
    assert_eq!(response.status(), StatusCode::SEE_OTHER);
    assert!(location(&response).starts_with("https://sandbox.sign.local/signing/sbx-env-0001/1"));

    let response = send(&app, "GET", path, None).await;
    assert_eq!(location(&response), "/portal/error?reason=magic_link_used");
}

#[tokio::test]
async fn webhook_signature_is_enforced_when_configured() {
    let mut config = ServiceConfig::default();
    config.webhook.hmac_secret = "whsec".to_string();
    let app = build_router(state_with(config).await);

    let body = json!({"event": "envelope-completed", "data": {"envelopeId": "env-unknown"}}).to_string();
    let unsigned = Request::builder()
        .method("POST")
        .uri("/v1/webhooks/signature")
        .header("content-type", "application/json")
        .header(WEBHOOK_SIGNATURE_HEADER, "deadbeef")
        .body(Body::from(body.clone()))
        .unwrap();
    let response = app.clone().oneshot(unsigned).await.unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    let mut mac = HmacSha256::new_from_slice(b"whsec").unwrap();
    mac.update(body.as_bytes());
    let signature = format!("sha256={}", hex::encode(mac.finalize().into_bytes()));
    let signed = Request::builder()
        .method("POST")
        .uri("/v1/webhooks/signature")
        .header("content-type", "application/json")
        .header(WEBHOOK_SIGNATURE_HEADER, signature)
        .body(Body::from(body))
        .unwrap();
    let response = app.oneshot(signed).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = json_body(response).await;
    assert_eq!(body["disposition"], "unknown_envelope");
    assert_eq!(body["envelope_id"], "env-unknown");
}

#[test]
fn webhook_signature_rejects_garbage() {
    assert!(!verify_webhook_signature("whsec", b"{}", None));
    assert!(!verify_webhook_signature("whsec", b"{}", Some("not-hex")));
    assert!(!verify_webhook_signature("whsec", b"{}", Some("00")));
}

#[tokio::test]
async fn contract_draft_requires_confirmed_quote() {
    let app = build_router(sandbox_state().await);
    let response = send(&app, "POST", "/v1/subscriptions", Some(subscription_payload())).await;
    let subscription_id = json_body(response).await["subscription_id"]
        .as_str()
        .unwrap()
        .to_string();

    let response = send(
        &app,
        "POST",
        &format!("/v1/subscriptions/{subscription_id}/contracts"),
        Some(json!({})),
    )
    .await;
    assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(json_body(response).await["code"], "validation");
}

#[tokio::test]
async fn invalid_transition_is_a_conflict() {
    let state = sandbox_state().await;
    let app = build_router(state.clone());
    let contract_id = active_contract(&state).await;

    let response = send(
        &app,
        "POST",
        &format!("/v1/contracts/{contract_id}/transition"),
        Some(json!({"to": "draft", "actor": "ops-1"})),
    )
    .await;
    assert_eq!(response.status(), StatusCode::CONFLICT);
    let body = json_body(response).await;
    assert_eq!(body["code"], "invalid_transition");
    assert!(body["error"]
        .as_str()
        .unwrap()
        .contains("renewal_due, expired, terminated"));

    let response = send(&app, "GET", "/v1/contracts/missing", None).await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn termination_wizard_over_http() {
    let state = sandbox_state().await;
    let app = build_router(state.clone());
    let contract_id = active_contract(&state).await;
    let base = format!("/v1/contracts/{contract_id}/termination");

    let response = send(&app, "POST", &base, Some(json!({"requested_by": "agent-1"}))).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(json_body(response).await["step"], "cost");

    let actions = format!("{base}/actions");
    let response = send(&app, "POST", &actions, Some(json!({"actor": "agent-1", "action": "next"}))).await;
    assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);

    let response = send(
        &app,
        "POST",
        &actions,
        Some(json!({
            "actor": "agent-1",
            "action": "request_override",
            "cost_minor": 0,
            "justification": "repeated outages in the first month"
        })),
    )
    .await;
    assert_eq!(response.status(), StatusCode::OK);

    let response = send(
        &app,
        "POST",
        &actions,
        Some(json!({"actor": "agent-1", "action": "apply_override"})),
    )
    .await;
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
    assert_eq!(json_body(response).await["code"], "separation_of_duties");

    let response = send(&app, "DELETE", &base, None).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(json_body(response).await["outcome"], "kept");

    let response = send(
        &app,
        "POST",
        &format!("{base}/confirm"),
        Some(json!({"actor": "manager-1"})),
    )
    .await;
    assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
    assert!(sandbox(&state).billing.cancellations().await.is_empty());
}

#[tokio::test]
async fn follow_ups_can_be_listed_and_resolved() {
    let state = sandbox_state().await;
    let app = build_router(state.clone());
    sandbox(&state).tasks.set_failing(true);
    let contract_id = active_contract(&state).await;

    let response = send(&app, "GET", "/v1/follow-ups", None).await;
    let items = json_body(response).await["items"].as_array().cloned().unwrap();
    assert_eq!(items.len(), 1);
    assert_eq!(items[0]["contract_id"], contract_id.as_str());
    assert_eq!(items[0]["kind"], "installation_task_failed");
    let follow_up_id = items[0]["follow_up_id"].as_str().unwrap().to_string();

    let response = send(
        &app,
        "POST",
        &format!("/v1/follow-ups/{follow_up_id}/resolve"),
        Some(json!({"operator": "ops-1"})),
    )
    .await;
    assert_eq!(response.status(), StatusCode::OK);

    let response = send(&app, "GET", "/v1/follow-ups", None).await;
    assert!(json_body(response).await["items"].as_array().unwrap().is_empty());
}

#[test]
fn provider_failures_map_to_bad_gateway() {
    assert_eq!(
        status_for(&ContractError::provider("create_envelope", "timeout")),
        StatusCode::BAD_GATEWAY
    );
    assert_eq!(
        status_for(&ContractError::CannotReplace("signed".to_string())),
        StatusCode::CONFLICT
    );
    assert_eq!(
        status_for(&ContractError::AmountMismatch {
            expected_minor: 4_500,
            actual_minor: 4_499
        }),
        StatusCode::UNPROCESSABLE_ENTITY
    );
}
