use crate::auth::ProviderTokenSource;
use crate::config::HttpProviderConfig;
use crate::error::{excerpt, GatewayError};
use crate::payload;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use covenant_core::{
    ContractError, DownloadedDocument, EmbeddedSigningRequest, EnvelopeDraft, EnvelopeReceipt,
    EnvelopeStatusReport, ProviderEnvelopeStatus, RecipientUpdate, SignatureProvider,
    SourceDocument, TokenCache, TokenSource,
};
use reqwest::{Client, Method, Response, StatusCode};
use serde_json::Value;
use std::sync::Arc;

/// Signature provider gateway over the provider's REST API.
///
/// Each call is one bounded request. A `401` drops the cached token and the
/// request is repeated once with a fresh one; anything else is reported.
pub struct HttpSignatureProvider {
    client: Client,
    accounts_url: String,
    tokens: Arc<TokenCache>,
}

impl HttpSignatureProvider {
    pub fn new(config: &HttpProviderConfig) -> Result<Self, GatewayError> {
        config.validate()?;
        let client = Client::builder()
            .timeout(config.request_timeout())
            .build()
            .map_err(|e| GatewayError::Config(format!("http client: {e}")))?;
        let source: Arc<dyn TokenSource> = Arc::new(ProviderTokenSource::new(client.clone(), config)?);
        let tokens = Arc::new(TokenCache::new(source, config.token_skew()));
        Ok(Self::with_tokens(client, config.accounts_url()?, tokens))
    }

    /// Build around an existing token cache, e.g. one shared across gateways.
    pub fn with_tokens(client: Client, accounts_url: impl Into<String>, tokens: Arc<TokenCache>) -> Self {
        Self {
            client,
            accounts_url: accounts_url.into().trim_end_matches('/').to_string(),
            tokens,
        }
    }

    pub fn token_refreshes(&self) -> u64 {
        self.tokens.refresh_count()
    }

    fn envelope_url(&self, envelope_id: &str, suffix: &str) -> String {
        format!("{}/envelopes/{}{suffix}", self.accounts_url, envelope_id.trim())
    }

    async fn call(
        &self,
        operation: &'static str,
        method: Method,
        url: &str,
        body: Option<&Value>,
    ) -> Result<Response, ContractError> {
        for attempt in 0..2 {
            let token = self.tokens.access_token().await?;
            let mut request = self.client.request(method.clone(), url).bearer_auth(&token);
            if let Some(body) = body {
                request = request.json(body);
            }
            let response = request
                .send()
                .await
                .map_err(|e| GatewayError::transport(operation, e))?;

            if response.status() == StatusCode::UNAUTHORIZED && attempt == 0 {
                tracing::debug!(operation, "provider rejected cached token; refreshing");
                self.tokens.invalidate().await;
                continue;
            }
            return check_status(operation, response).await;
        }
        Err(GatewayError::Unauthorized { operation }.into())
    }

    async fn call_json(
        &self,
        operation: &'static str,
        method: Method,
        url: &str,
        body: Option<&Value>,
    ) -> Result<Value, ContractError> {
        let response = self.call(operation, method, url, body).await?;
        let text = response
            .text()
            .await
            .map_err(|e| GatewayError::transport(operation, e))?;
        if text.trim().is_empty() {
            return Ok(Value::Null);
        }
        serde_json::from_str(&text).map_err(|e| GatewayError::decode(operation, e).into())
    }
}

async fn check_status(operation: &'static str, response: Response) -> Result<Response, ContractError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    if status == StatusCode::UNAUTHORIZED {
        return Err(GatewayError::Unauthorized { operation }.into());
    }
    let body = response.text().await.unwrap_or_default();
    tracing::warn!(operation, status = status.as_u16(), "signature provider call failed");
    Err(GatewayError::Status {
        operation,
        status: status.as_u16(),
        body: excerpt(&body),
    }
    .into())
}

fn parse_receipt(value: &Value) -> Result<EnvelopeReceipt, GatewayError> {
    let envelope_id = value
        .get("envelopeId")
        .and_then(Value::as_str)
        .filter(|id| !id.is_empty())
        .ok_or_else(|| GatewayError::decode("create_envelope", "missing envelopeId"))?;
    let status = value
        .get("status")
        .and_then(Value::as_str)
        .map(ProviderEnvelopeStatus::parse)
        .unwrap_or(ProviderEnvelopeStatus::Sent);
    let created_at = value
        .get("statusDateTime")
        .and_then(Value::as_str)
        .and_then(|raw| DateTime::parse_from_rfc3339(raw).ok())
        .map(|at| at.with_timezone(&Utc))
        .unwrap_or_else(Utc::now);
    Ok(EnvelopeReceipt {
        envelope_id: envelope_id.to_string(),
        status,
        created_at,
    })
}

#[async_trait]
impl SignatureProvider for HttpSignatureProvider {
    fn provider_id(&self) -> &'static str {
        "http"
    }

    async fn create_envelope(&self, draft: &EnvelopeDraft) -> Result<EnvelopeReceipt, ContractError> {
        let url = format!("{}/envelopes", self.accounts_url);
        let body = payload::envelope_body(draft);
        let value = self
            .call_json("create_envelope", Method::POST, &url, Some(&body))
            .await?;
        let receipt = parse_receipt(&value)?;
        tracing::info!(
            envelope_id = %receipt.envelope_id,
            recipients = draft.recipients.len(),
            "envelope created"
        );
        Ok(receipt)
    }

    async fn replace_document(
        &self,
        envelope_id: &str,
        document: &SourceDocument,
    ) -> Result<(), ContractError> {
        let url = self.envelope_url(envelope_id, "/documents");
        let body = payload::replace_document_body(document);
        self.call("replace_document", Method::PUT, &url, Some(&body))
            .await?;
        Ok(())
    }

    async fn resend_envelope(&self, envelope_id: &str) -> Result<(), ContractError> {
        let url = self.envelope_url(envelope_id, "?resend_envelope=true");
        self.call("resend_envelope", Method::PUT, &url, Some(&Value::Object(Default::default())))
            .await?;
        Ok(())
    }

    async fn update_recipient(
        &self,
        envelope_id: &str,
        update: &RecipientUpdate,
    ) -> Result<(), ContractError> {
        let url = self.envelope_url(envelope_id, "/recipients?resend_envelope=true");
        let body = payload::recipient_update_body(update);
        self.call("update_recipient", Method::PUT, &url, Some(&body))
            .await?;
        Ok(())
    }

    async fn envelope_status(&self, envelope_id: &str) -> Result<EnvelopeStatusReport, ContractError> {
        let url = self.envelope_url(envelope_id, "?include=recipients");
        let value = self
            .call_json("envelope_status", Method::GET, &url, None)
            .await?;
        EnvelopeStatusReport::from_payload(&value)
    }

    async fn download_document(
        &self,
        envelope_id: &str,
        recipient_id: u32,
    ) -> Result<DownloadedDocument, ContractError> {
        let url = self.envelope_url(envelope_id, "/documents/combined?certificate=true");
        let response = self
            .call("download_document", Method::GET, &url, None)
            .await?;
        let bytes = response
            .bytes()
            .await
            .map_err(|e| GatewayError::transport("download_document", e))?;
        if bytes.is_empty() {
            return Err(GatewayError::decode("download_document", "empty document").into());
        }
        Ok(DownloadedDocument {
            file_name: format!("{envelope_id}-recipient-{recipient_id}.pdf"),
            bytes: bytes.to_vec(),
        })
    }

    async fn embedded_signing_url(&self, request: &EmbeddedSigningRequest) -> Result<String, ContractError> {
        let url = self.envelope_url(&request.envelope_id, "/views/recipient");
        let body = payload::signing_view_body(request);
        let value = self
            .call_json("embedded_signing_url", Method::POST, &url, Some(&body))
            .await?;
        value
            .get("url")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| GatewayError::decode("embedded_signing_url", "missing url").into())
    }
}
