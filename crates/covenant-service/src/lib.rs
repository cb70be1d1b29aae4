#![deny(unsafe_code)]

pub mod config;
pub mod scheduler;

use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{Html, IntoResponse, Redirect, Response};
use axum::routing::{get, post, put};
use axum::{Json, Router};
use chrono::{NaiveDate, Utc};
use config::{ProviderMode, ServiceConfig};
use covenant_adapters::{GatewayError, HttpSignatureProvider};
use covenant_core::sandbox::SandboxCollaborators;
use covenant_core::{
    AbandonOutcome, Addendum, AppliedAdjustment, Contract, ContractEngine, ContractError, ContractState,
    ContractStore, ContractTerms, DeliveryChannel, FileContractStore, FollowUp,
    InMemoryContractStore, JournalEntry, MagicLinkGrant, PollSummary, ProgressStage,
    QuoteLinkParams, QuoteStatus, RecipientChanges, ReconcileOutcome, ReconcileSource,
    ServiceStateUpdate, SideEffectOutcome, SourceDocument, Subscription, SweepSummary,
    TerminationAction, TerminationReceipt, TerminationRequest, WebhookDisposition,
};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::sync::Arc;
use thiserror::Error;
use tower_http::trace::TraceLayer;

type HmacSha256 = Hmac<Sha256>;

/// Hex HMAC-SHA256 of the raw webhook body, optionally prefixed with `sha256=`.
pub const WEBHOOK_SIGNATURE_HEADER: &str = "x-covenant-signature";

#[derive(Clone)]
pub struct ServiceState {
    pub engine: Arc<ContractEngine>,
    pub config: Arc<ServiceConfig>,
    /// Handles to the in-process provider when running in sandbox mode.
    pub sandbox: Option<SandboxCollaborators>,
}

impl ServiceState {
    pub async fn bootstrap(config: ServiceConfig) -> Result<Self, ServiceError> {
        let local = SandboxCollaborators::new(config.provider.base_uri());
        let (collaborators, sandbox) = match config.provider.mode {
            ProviderMode::Sandbox => (local.collaborators(), Some(local)),
            ProviderMode::Http => {
                let mut collaborators = local.collaborators();
                collaborators.provider = Arc::new(HttpSignatureProvider::new(&config.provider.http)?);
                tracing::warn!(
                    "billing, task and archive collaborators run in-process; only signatures go to the provider"
                );
                (collaborators, None)
            }
        };

        let store: Arc<dyn ContractStore> = if config.storage.snapshot_path.trim().is_empty() {
            Arc::new(InMemoryContractStore::new())
        } else {
            Arc::new(FileContractStore::load(config.storage.snapshot_path.trim())?)
        };

        let engine = ContractEngine::bootstrap(config.engine_config(), store, collaborators).await?;

        Ok(Self {
            engine: Arc::new(engine),
            config: Arc::new(config),
            sandbox,
        })
    }
}

pub fn build_router(state: ServiceState) -> Router {
    Router::new()
        .route("/v1/health", get(health))
        // Provider and customer facing
        .route("/v1/webhooks/signature", post(signature_webhook))
        .route("/v1/quotes/confirm", get(confirm_quote))
        .route("/v1/sign/magic", get(resolve_magic_link))
        .route("/v1/contracts/:contract_id/signing/launch", get(launch_signing))
        .route("/v1/contracts/signing/return", get(signing_return))
        .route("/portal/error", get(portal_error))
        .route("/portal/done", get(portal_done))
        // Staff
        .route("/v1/subscriptions", post(register_subscription))
        .route("/v1/subscriptions/:subscription_id", get(get_subscription))
        .route("/v1/subscriptions/:subscription_id/progress", get(get_progress))
        .route("/v1/subscriptions/:subscription_id/quote-link", get(get_quote_link))
        .route(
            "/v1/subscriptions/:subscription_id/service-states",
            post(update_service_states),
        )
        .route("/v1/subscriptions/:subscription_id/contracts", post(create_contract))
        .route("/v1/contracts/:contract_id", get(get_contract))
        .route("/v1/contracts/:contract_id/send", post(send_contract))
        .route("/v1/contracts/:contract_id/resend", post(resend_envelope))
        .route("/v1/contracts/:contract_id/replace", post(replace_document))
        .route(
            "/v1/contracts/:contract_id/recipients/:recipient_id",
            put(update_recipient),
        )
        .route("/v1/contracts/:contract_id/reconcile", post(reconcile_contract))
        .route(
            "/v1/contracts/:contract_id/documents/download",
            post(download_documents),
        )
        .route("/v1/contracts/:contract_id/transition", post(transition_contract))
        .route("/v1/contracts/:contract_id/renew", post(renew_contract))
        .route("/v1/contracts/:contract_id/magic-links", post(issue_magic_link))
        .route("/v1/contracts/:contract_id/journal", get(contract_journal))
        .route("/v1/contracts/:contract_id/addenda", post(create_addendum))
        .route(
            "/v1/contracts/:contract_id/addenda/:addendum_id/send",
            post(send_addendum),
        )
        .route(
            "/v1/contracts/:contract_id/addenda/:addendum_id/activate",
            post(activate_addendum),
        )
        .route(
            "/v1/contracts/:contract_id/addenda/:addendum_id/cancel",
            post(cancel_addendum),
        )
        .route(
            "/v1/contracts/:contract_id/termination",
            post(open_termination)
                .get(get_termination)
                .delete(abandon_termination),
        )
        .route(
            "/v1/contracts/:contract_id/termination/actions",
            post(update_termination),
        )
        .route(
            "/v1/contracts/:contract_id/termination/confirm",
            post(confirm_termination),
        )
        .route("/v1/follow-ups", get(list_follow_ups))
        .route("/v1/follow-ups/:follow_up_id/resolve", post(resolve_follow_up))
        .route("/v1/lifecycle/sweep", post(sweep_lifecycle))
        .route("/v1/envelopes/poll", post(poll_envelopes))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("core engine error: {0}")]
    Core(#[from] ContractError),
    #[error("signature gateway error: {0}")]
    Gateway(#[from] GatewayError),
}

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{message}")]
    Http { status: StatusCode, message: String },
    #[error(transparent)]
    Contract(#[from] ContractError),
}

impl ApiError {
    fn bad_request(message: impl Into<String>) -> Self {
        Self::Http {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
        }
    }

    fn unauthorized(message: impl Into<String>) -> Self {
        Self::Http {
            status: StatusCode::UNAUTHORIZED,
            message: message.into(),
        }
    }
}

/// HTTP status for each member of the error taxonomy.
pub fn status_for(err: &ContractError) -> StatusCode {
    match err {
        ContractError::InvalidTransition { .. }
        | ContractError::CannotReplace(_)
        | ContractError::EnvelopeAlreadySent(_) => StatusCode::CONFLICT,
        ContractError::MissingDocument(_)
        | ContractError::MissingRecipient(_)
        | ContractError::MissingEnvelope(_)
        | ContractError::AmountMismatch { .. }
        | ContractError::InvalidPhoneNumber(_)
        | ContractError::QuoteLinkRejected(_)
        | ContractError::MagicLinkRejected(_)
        | ContractError::Validation(_) => StatusCode::UNPROCESSABLE_ENTITY,
        ContractError::SeparationOfDutiesViolation { .. } => StatusCode::FORBIDDEN,
        ContractError::AuthenticationFailed(_) => StatusCode::UNAUTHORIZED,
        ContractError::Provider { .. } => StatusCode::BAD_GATEWAY,
        ContractError::NotFound(_) => StatusCode::NOT_FOUND,
        ContractError::Storage(_) | ContractError::Serialization(_) => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            ApiError::Http { status, message } => {
                (status, Json(serde_json::json!({ "error": message }))).into_response()
            }
            ApiError::Contract(err) => {
                let status = status_for(&err);
                if status.is_server_error() {
                    tracing::error!(error = %err, "request failed");
                }
                (
                    status,
                    Json(serde_json::json!({ "error": err.to_string(), "code": err.code() })),
                )
                    .into_response()
            }
        }
    }
}

/// Constant-time check of the webhook body signature.
pub fn verify_webhook_signature(secret: &str, body: &[u8], signature: Option<&str>) -> bool {
    let Some(signature) = signature.map(str::trim) else {
        return false;
    };
    let signature = signature.strip_prefix("sha256=").unwrap_or(signature);
    let Ok(expected) = hex::decode(signature) else {
        return false;
    };
    let Ok(mut mac) = HmacSha256::new_from_slice(secret.as_bytes()) else {
        return false;
    };
    mac.update(body);
    mac.verify_slice(&expected).is_ok()
}

fn today() -> NaiveDate {
    Utc::now().date_naive()
}

/// Customers never see raw errors; they land on a reason-coded page.
fn portal_failure(flow: &'static str, err: ContractError) -> Redirect {
    tracing::warn!(flow, code = err.code(), error = %err, "portal request failed");
    Redirect::to(&format!("/portal/error?reason={}", err.code()))
}

fn portal_message(reason: &str) -> &'static str {
    match reason {
        "magic_link_missing" => {
            "The signing link is incomplete. Please open the full link from your message."
        }
        "magic_link_not_found" => "This signing link is not valid. Please request a new one.",
        "magic_link_used" => "This signing link has already been used.",
        "magic_link_expired" => "This signing link has expired. Please request a new one.",
        "missing_signature" | "invalid_signature" | "malformed_link" => {
            "This confirmation link is not valid."
        }
        "link_expired" => "This confirmation link has expired. Please ask for a new quote.",
        "quote_not_confirmable" => "This quote can no longer be confirmed.",
        "not_found" => "We could not find what this link points to.",
        _ => "Something went wrong. Our team has been notified.",
    }
}

#[derive(Debug, Clone, Serialize)]
struct HealthResponse {
    status: &'static str,
    service: &'static str,
    provider: &'static str,
    journal_verified: bool,
}

async fn health(State(state): State<ServiceState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        service: "covenant-service",
        provider: match state.config.provider.mode {
            ProviderMode::Sandbox => "sandbox",
            ProviderMode::Http => "http",
        },
        journal_verified: state.engine.verify_journal().await,
    })
}

async fn signature_webhook(
    State(state): State<ServiceState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<WebhookDisposition>, ApiError> {
    if let Some(secret) = state.config.webhook.secret() {
        let signature = headers
            .get(WEBHOOK_SIGNATURE_HEADER)
            .and_then(|value| value.to_str().ok());
        if !verify_webhook_signature(secret, &body, signature) {
            tracing::warn!("webhook rejected: signature mismatch");
            return Err(ApiError::unauthorized("invalid webhook signature"));
        }
    }
    let payload: serde_json::Value = serde_json::from_slice(&body)
        .map_err(|e| ApiError::bad_request(format!("webhook body is not json: {e}")))?;
    Ok(Json(state.engine.handle_webhook(&payload).await))
}

async fn confirm_quote(
    State(state): State<ServiceState>,
    Query(params): Query<QuoteLinkParams>,
) -> Redirect {
    match state.engine.confirm_quote(&params, today()).await {
        Ok(confirmation) => {
            let status = if confirmation.already_confirmed {
                "quote_already_confirmed"
            } else {
                "quote_confirmed"
            };
            Redirect::to(&format!("/portal/done?status={status}"))
        }
        Err(e) => portal_failure("quote_confirm", e),
    }
}

#[derive(Debug, Clone, Deserialize)]
struct MagicLinkQuery {
    token: Option<String>,
}

async fn resolve_magic_link(
    State(state): State<ServiceState>,
    Query(query): Query<MagicLinkQuery>,
) -> Redirect {
    match state.engine.resolve_magic_link(query.token.as_deref()).await {
        Ok(redirect) => Redirect::to(&redirect.url),
        Err(e) => portal_failure("magic_link", e),
    }
}

#[derive(Debug, Clone, Deserialize)]
struct LaunchQuery {
    recipient_id: Option<u32>,
}

async fn launch_signing(
    Path(contract_id): Path<String>,
    State(state): State<ServiceState>,
    Query(query): Query<LaunchQuery>,
) -> Redirect {
    match state
        .engine
        .launch_embedded_signing(&contract_id, query.recipient_id)
        .await
    {
        Ok(redirect) => Redirect::to(&redirect.url),
        Err(e) => portal_failure("signing_launch", e),
    }
}

#[derive(Debug, Clone, Deserialize)]
struct SigningReturnQuery {
    contract_id: Option<String>,
    event: Option<String>,
}

async fn signing_return(
    State(state): State<ServiceState>,
    Query(query): Query<SigningReturnQuery>,
) -> Redirect {
    let Some(contract_id) = query.contract_id.filter(|id| !id.trim().is_empty()) else {
        return portal_failure(
            "signing_return",
            ContractError::validation("contract_id is required"),
        );
    };
    let event = query.event.unwrap_or_default();
    match state.engine.record_signing_return(&contract_id, &event).await {
        Ok(returned) => Redirect::to(&format!("/portal/done?status={}", returned.status.as_str())),
        Err(e) => portal_failure("signing_return", e),
    }
}

#[derive(Debug, Clone, Deserialize)]
struct PortalQuery {
    reason: Option<String>,
    status: Option<String>,
}

async fn portal_error(Query(query): Query<PortalQuery>) -> Html<String> {
    let reason = query.reason.unwrap_or_default();
    Html(format!(
        "<!doctype html><html><body><h1>We could not complete your request</h1><p>{}</p></body></html>",
        portal_message(&reason)
    ))
}

async fn portal_done(Query(query): Query<PortalQuery>) -> Html<String> {
    let message = match query.status.as_deref() {
        Some("quote_confirmed") => "Thank you. Your quote is confirmed and your contract is on its way.",
        Some("quote_already_confirmed") => "This quote was already confirmed.",
        Some("completed") => "Thank you for signing. We will be in touch to schedule your installation.",
        Some("cancelled") => "Signing was cancelled. You can reopen the link from your message at any time.",
        Some("declined") => "You declined to sign. Our team will contact you.",
        _ => "Thank you.",
    };
    Html(format!(
        "<!doctype html><html><body><h1>All set</h1><p>{message}</p></body></html>"
    ))
}

#[derive(Debug, Clone, Deserialize)]
struct RegisterSubscriptionRequest {
    customer_id: String,
    customer_name: String,
    customer_email: String,
    customer_phone: Option<String>,
    terms: ContractTerms,
    #[serde(default)]
    preferred_channel: DeliveryChannel,
    #[serde(default)]
    renewal_no_change: bool,
    quote_status: Option<QuoteStatus>,
}

async fn register_subscription(
    State(state): State<ServiceState>,
    Json(request): Json<RegisterSubscriptionRequest>,
) -> Result<(StatusCode, Json<Subscription>), ApiError> {
    let mut subscription = Subscription::new(
        request.customer_id,
        request.customer_name,
        request.customer_email,
        request.terms,
    );
    subscription.customer_phone = request.customer_phone;
    subscription.preferred_channel = request.preferred_channel;
    subscription.renewal_no_change = request.renewal_no_change;
    if let Some(status) = request.quote_status {
        subscription.quote_status = status;
    }
    let subscription = state.engine.register_subscription(subscription).await?;
    Ok((StatusCode::CREATED, Json(subscription)))
}

async fn get_subscription(
    Path(subscription_id): Path<String>,
    State(state): State<ServiceState>,
) -> Result<Json<Subscription>, ApiError> {
    Ok(Json(state.engine.subscription(&subscription_id).await?))
}

#[derive(Debug, Clone, Serialize)]
struct ProgressResponse {
    subscription_id: String,
    stage: ProgressStage,
}

async fn get_progress(
    Path(subscription_id): Path<String>,
    State(state): State<ServiceState>,
) -> Result<Json<ProgressResponse>, ApiError> {
    let stage = state.engine.progress(&subscription_id).await?;
    Ok(Json(ProgressResponse {
        subscription_id,
        stage,
    }))
}

#[derive(Debug, Clone, Serialize)]
struct QuoteLinkResponse {
    subscription_id: String,
    url: String,
}

async fn get_quote_link(
    Path(subscription_id): Path<String>,
    State(state): State<ServiceState>,
) -> Result<Json<QuoteLinkResponse>, ApiError> {
    let subscription = state.engine.subscription(&subscription_id).await?;
    let url = state
        .engine
        .quote_links()
        .build_url(&subscription.quote_uuid, today())?;
    Ok(Json(QuoteLinkResponse {
        subscription_id,
        url,
    }))
}

async fn update_service_states(
    Path(subscription_id): Path<String>,
    State(state): State<ServiceState>,
    Json(update): Json<ServiceStateUpdate>,
) -> Result<Json<Subscription>, ApiError> {
    Ok(Json(
        state
            .engine
            .update_service_states(&subscription_id, update)
            .await?,
    ))
}

#[derive(Debug, Clone, Default, Deserialize)]
struct CreateContractRequest {
    start_date: Option<NaiveDate>,
}

async fn create_contract(
    Path(subscription_id): Path<String>,
    State(state): State<ServiceState>,
    Json(request): Json<CreateContractRequest>,
) -> Result<(StatusCode, Json<Contract>), ApiError> {
    let contract = state
        .engine
        .create_contract(&subscription_id, request.start_date.unwrap_or_else(today))
        .await?;
    Ok((StatusCode::CREATED, Json(contract)))
}

async fn get_contract(
    Path(contract_id): Path<String>,
    State(state): State<ServiceState>,
) -> Result<Json<Contract>, ApiError> {
    Ok(Json(state.engine.contract(&contract_id).await?))
}

#[derive(Debug, Clone, Default, Deserialize)]
struct ChannelRequest {
    #[serde(default)]
    channel: DeliveryChannel,
}

async fn send_contract(
    Path(contract_id): Path<String>,
    State(state): State<ServiceState>,
    Json(request): Json<ChannelRequest>,
) -> Result<Json<Contract>, ApiError> {
    Ok(Json(
        state
            .engine
            .send_contract(&contract_id, request.channel)
            .await?,
    ))
}

async fn resend_envelope(
    Path(contract_id): Path<String>,
    State(state): State<ServiceState>,
) -> Result<Json<Contract>, ApiError> {
    Ok(Json(state.engine.resend_envelope(&contract_id).await?))
}

/// Omit both fields to re-render the contract from its current terms.
#[derive(Debug, Clone, Default, Deserialize)]
struct ReplaceDocumentRequest {
    name: Option<String>,
    content: Option<String>,
}

async fn replace_document(
    Path(contract_id): Path<String>,
    State(state): State<ServiceState>,
    Json(request): Json<ReplaceDocumentRequest>,
) -> Result<Json<Contract>, ApiError> {
    let document = match (request.name, request.content) {
        (Some(name), Some(content)) => Some(SourceDocument::new(name, content.into_bytes())),
        (None, None) => None,
        _ => {
            return Err(ApiError::bad_request(
                "name and content must be given together",
            ))
        }
    };
    Ok(Json(
        state
            .engine
            .replace_document(&contract_id, document)
            .await?,
    ))
}

async fn update_recipient(
    Path((contract_id, recipient_id)): Path<(String, u32)>,
    State(state): State<ServiceState>,
    Json(changes): Json<RecipientChanges>,
) -> Result<Json<Contract>, ApiError> {
    Ok(Json(
        state
            .engine
            .update_recipient(&contract_id, recipient_id, changes)
            .await?,
    ))
}

async fn reconcile_contract(
    Path(contract_id): Path<String>,
    State(state): State<ServiceState>,
) -> Result<Json<ReconcileOutcome>, ApiError> {
    let contract = state.engine.contract(&contract_id).await?;
    let envelope_id = contract
        .signing
        .envelope_id()
        .ok_or_else(|| ContractError::MissingEnvelope(contract_id.clone()))?;
    Ok(Json(
        state
            .engine
            .reconcile_envelope(envelope_id, ReconcileSource::Poll)
            .await?,
    ))
}

async fn download_documents(
    Path(contract_id): Path<String>,
    State(state): State<ServiceState>,
) -> Result<Json<Vec<SideEffectOutcome>>, ApiError> {
    Ok(Json(
        state
            .engine
            .download_completed_documents(&contract_id)
            .await?,
    ))
}

#[derive(Debug, Clone, Deserialize)]
struct TransitionRequest {
    to: ContractState,
    actor: String,
}

async fn transition_contract(
    Path(contract_id): Path<String>,
    State(state): State<ServiceState>,
    Json(request): Json<TransitionRequest>,
) -> Result<Json<Contract>, ApiError> {
    Ok(Json(
        state
            .engine
            .transition_contract(&contract_id, request.to, &request.actor)
            .await?,
    ))
}

#[derive(Debug, Clone, Deserialize)]
struct RenewRequest {
    months: u32,
    actor: String,
}

async fn renew_contract(
    Path(contract_id): Path<String>,
    State(state): State<ServiceState>,
    Json(request): Json<RenewRequest>,
) -> Result<Json<Contract>, ApiError> {
    Ok(Json(
        state
            .engine
            .renew_contract(&contract_id, request.months, &request.actor)
            .await?,
    ))
}

#[derive(Debug, Clone, Deserialize)]
struct MagicLinkRequest {
    recipient_id: u32,
}

async fn issue_magic_link(
    Path(contract_id): Path<String>,
    State(state): State<ServiceState>,
    Json(request): Json<MagicLinkRequest>,
) -> Result<(StatusCode, Json<MagicLinkGrant>), ApiError> {
    let grant = state
        .engine
        .issue_magic_link(&contract_id, request.recipient_id)
        .await?;
    Ok((StatusCode::CREATED, Json(grant)))
}

async fn contract_journal(
    Path(contract_id): Path<String>,
    State(state): State<ServiceState>,
) -> Result<Json<Vec<JournalEntry>>, ApiError> {
    state.engine.contract(&contract_id).await?;
    Ok(Json(state.engine.journal_for(&contract_id).await))
}

#[derive(Debug, Clone, Deserialize)]
struct CreateAddendumRequest {
    description: String,
    monthly_delta_minor: i64,
}

async fn create_addendum(
    Path(contract_id): Path<String>,
    State(state): State<ServiceState>,
    Json(request): Json<CreateAddendumRequest>,
) -> Result<(StatusCode, Json<Addendum>), ApiError> {
    let addendum = state
        .engine
        .create_addendum(&contract_id, &request.description, request.monthly_delta_minor)
        .await?;
    Ok((StatusCode::CREATED, Json(addendum)))
}

async fn send_addendum(
    Path((contract_id, addendum_id)): Path<(String, String)>,
    State(state): State<ServiceState>,
    Json(request): Json<ChannelRequest>,
) -> Result<Json<Addendum>, ApiError> {
    Ok(Json(
        state
            .engine
            .send_addendum(&contract_id, &addendum_id, request.channel)
            .await?,
    ))
}

#[derive(Debug, Clone, Default, Deserialize)]
struct ActivateAddendumRequest {
    date: Option<NaiveDate>,
}

async fn activate_addendum(
    Path((contract_id, addendum_id)): Path<(String, String)>,
    State(state): State<ServiceState>,
    Json(request): Json<ActivateAddendumRequest>,
) -> Result<Json<AppliedAdjustment>, ApiError> {
    Ok(Json(
        state
            .engine
            .activate_addendum(&contract_id, &addendum_id, request.date.unwrap_or_else(today))
            .await?,
    ))
}

async fn cancel_addendum(
    Path((contract_id, addendum_id)): Path<(String, String)>,
    State(state): State<ServiceState>,
) -> Result<Json<Contract>, ApiError> {
    Ok(Json(
        state
            .engine
            .cancel_addendum(&contract_id, &addendum_id)
            .await?,
    ))
}

#[derive(Debug, Clone, Deserialize)]
struct OpenTerminationRequest {
    requested_by: String,
}

async fn open_termination(
    Path(contract_id): Path<String>,
    State(state): State<ServiceState>,
    Json(request): Json<OpenTerminationRequest>,
) -> Result<Json<TerminationRequest>, ApiError> {
    Ok(Json(
        state
            .engine
            .open_termination(&contract_id, &request.requested_by)
            .await?,
    ))
}

async fn get_termination(
    Path(contract_id): Path<String>,
    State(state): State<ServiceState>,
) -> Result<Json<TerminationRequest>, ApiError> {
    Ok(Json(state.engine.termination(&contract_id).await?))
}

/// `{"actor": "...", "action": "confirm_payment", "reference": "..."}`
#[derive(Debug, Clone, Deserialize)]
struct TerminationActionRequest {
    actor: String,
    #[serde(flatten)]
    action: TerminationAction,
}

async fn update_termination(
    Path(contract_id): Path<String>,
    State(state): State<ServiceState>,
    Json(request): Json<TerminationActionRequest>,
) -> Result<Json<TerminationRequest>, ApiError> {
    Ok(Json(
        state
            .engine
            .update_termination(&contract_id, &request.actor, request.action)
            .await?,
    ))
}

#[derive(Debug, Clone, Deserialize)]
struct ConfirmTerminationRequest {
    actor: String,
}

async fn confirm_termination(
    Path(contract_id): Path<String>,
    State(state): State<ServiceState>,
    Json(request): Json<ConfirmTerminationRequest>,
) -> Result<Json<TerminationReceipt>, ApiError> {
    Ok(Json(
        state
            .engine
            .confirm_termination(&contract_id, &request.actor)
            .await?,
    ))
}

#[derive(Debug, Clone, Serialize)]
struct AbandonResponse {
    contract_id: String,
    outcome: AbandonOutcome,
}

async fn abandon_termination(
    Path(contract_id): Path<String>,
    State(state): State<ServiceState>,
) -> Result<Json<AbandonResponse>, ApiError> {
    let outcome = state.engine.abandon_termination(&contract_id).await?;
    Ok(Json(AbandonResponse {
        contract_id,
        outcome,
    }))
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FollowUpQuery {
    include_resolved: Option<bool>,
}

#[derive(Debug, Clone, Serialize)]
struct FollowUpListResponse {
    items: Vec<FollowUp>,
}

async fn list_follow_ups(
    State(state): State<ServiceState>,
    Query(query): Query<FollowUpQuery>,
) -> Result<Json<FollowUpListResponse>, ApiError> {
    Ok(Json(FollowUpListResponse {
        items: state
            .engine
            .follow_ups(query.include_resolved.unwrap_or(false))
            .await?,
    }))
}

#[derive(Debug, Clone, Deserialize)]
struct ResolveFollowUpRequest {
    operator: String,
}

async fn resolve_follow_up(
    Path(follow_up_id): Path<String>,
    State(state): State<ServiceState>,
    Json(request): Json<ResolveFollowUpRequest>,
) -> Result<Json<FollowUp>, ApiError> {
    if request.operator.trim().is_empty() {
        return Err(ApiError::bad_request("operator is required"));
    }
    Ok(Json(
        state
            .engine
            .resolve_follow_up(&follow_up_id, &request.operator)
            .await?,
    ))
}

#[derive(Debug, Clone, Default, Deserialize)]
struct SweepRequest {
    today: Option<NaiveDate>,
}

async fn sweep_lifecycle(
    State(state): State<ServiceState>,
    Json(request): Json<SweepRequest>,
) -> Result<Json<SweepSummary>, ApiError> {
    Ok(Json(
        state
            .engine
            .sweep_lifecycle(request.today.unwrap_or_else(today))
            .await?,
    ))
}

async fn poll_envelopes(State(state): State<ServiceState>) -> Result<Json<PollSummary>, ApiError> {
    Ok(Json(state.engine.poll_open_envelopes().await?))
}

#[cfg(test)]
mod tests;
