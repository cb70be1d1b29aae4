use crate::config::HttpProviderConfig;
use crate::error::{excerpt, GatewayError};
use async_trait::async_trait;
use chrono::{Duration, Utc};
use covenant_core::{AccessToken, ContractError, TokenSource};
use serde::Deserialize;

const OPERATION: &str = "fetch_token";

/// Service-identity grant against the provider's OAuth endpoint.
///
/// Wrapped in a [`covenant_core::TokenCache`] by the gateway; this type never
/// caches on its own.
pub struct ProviderTokenSource {
    client: reqwest::Client,
    token_url: String,
    integration_key: String,
    integration_secret: String,
    service_user_id: String,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default = "default_expires_in")]
    expires_in: i64,
}

fn default_expires_in() -> i64 {
    3_600
}

impl ProviderTokenSource {
    pub fn new(client: reqwest::Client, config: &HttpProviderConfig) -> Result<Self, GatewayError> {
        Ok(Self {
            client,
            token_url: config.token_url()?,
            integration_key: config.integration_key.clone(),
            integration_secret: config.integration_secret.clone(),
            service_user_id: config.service_user_id.clone(),
        })
    }
}

#[async_trait]
impl TokenSource for ProviderTokenSource {
    async fn fetch_token(&self) -> Result<AccessToken, ContractError> {
        let response = self
            .client
            .post(&self.token_url)
            .basic_auth(&self.integration_key, Some(&self.integration_secret))
            .form(&[
                ("grant_type", "client_credentials"),
                ("scope", "signature impersonation"),
                ("subject", self.service_user_id.as_str()),
            ])
            .send()
            .await
            .map_err(|e| auth_failed(GatewayError::transport(OPERATION, e)))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(auth_failed(GatewayError::Status {
                operation: OPERATION,
                status: status.as_u16(),
                body: excerpt(&body),
            }));
        }

        let token: TokenResponse = response
            .json()
            .await
            .map_err(|e| auth_failed(GatewayError::decode(OPERATION, e)))?;
        Ok(AccessToken {
            value: token.access_token,
            expires_at: Utc::now() + Duration::seconds(token.expires_in.max(0)),
        })
    }
}

fn auth_failed(err: GatewayError) -> ContractError {
    ContractError::AuthenticationFailed(err.to_string())
}
