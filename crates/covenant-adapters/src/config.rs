use crate::error::GatewayError;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use url::Url;

/// Connection settings for the hosted e-signature provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpProviderConfig {
    /// REST API origin, e.g. `https://demo.docusign.net`.
    pub base_uri: String,
    /// OAuth origin, e.g. `https://account-d.docusign.com`.
    pub auth_uri: String,
    pub account_id: String,
    pub integration_key: String,
    pub integration_secret: String,
    /// User the integration impersonates when it sends envelopes.
    pub service_user_id: String,
    pub request_timeout_secs: u64,
    /// Tokens this close to expiry are refreshed before use.
    pub token_skew_secs: i64,
}

impl Default for HttpProviderConfig {
    fn default() -> Self {
        Self {
            base_uri: "https://demo.docusign.net".to_string(),
            auth_uri: "https://account-d.docusign.com".to_string(),
            account_id: String::new(),
            integration_key: String::new(),
            integration_secret: String::new(),
            service_user_id: String::new(),
            request_timeout_secs: 20,
            token_skew_secs: 300,
        }
    }
}

impl HttpProviderConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs.max(1))
    }

    pub fn token_skew(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.token_skew_secs.max(0))
    }

    /// `{base}/restapi/v2.1/accounts/{account}`
    pub fn accounts_url(&self) -> Result<String, GatewayError> {
        let base = parse_origin("base_uri", &self.base_uri)?;
        if self.account_id.trim().is_empty() {
            return Err(GatewayError::Config("provider.account_id is required".to_string()));
        }
        Ok(format!(
            "{}/restapi/v2.1/accounts/{}",
            base.as_str().trim_end_matches('/'),
            self.account_id.trim()
        ))
    }

    pub fn token_url(&self) -> Result<String, GatewayError> {
        let auth = parse_origin("auth_uri", &self.auth_uri)?;
        Ok(format!("{}/oauth/token", auth.as_str().trim_end_matches('/')))
    }

    pub fn validate(&self) -> Result<(), GatewayError> {
        self.accounts_url()?;
        self.token_url()?;
        for (field, value) in [
            ("integration_key", &self.integration_key),
            ("integration_secret", &self.integration_secret),
            ("service_user_id", &self.service_user_id),
        ] {
            if value.trim().is_empty() {
                return Err(GatewayError::Config(format!("provider.{field} is required")));
            }
        }
        Ok(())
    }
}

fn parse_origin(field: &str, raw: &str) -> Result<Url, GatewayError> {
    let url = Url::parse(raw.trim())
        .map_err(|e| GatewayError::Config(format!("provider.{field} '{raw}' is not a url: {e}")))?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(GatewayError::Config(format!(
            "provider.{field} must be http or https"
        )));
    }
    Ok(url)
}
