use crate::error::ContractError;
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;

/// Bearer token issued by the provider's auth endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessToken {
    pub value: String,
    pub expires_at: DateTime<Utc>,
}

impl AccessToken {
    pub fn is_fresh(&self, now: DateTime<Utc>, skew: Duration) -> bool {
        self.expires_at - skew > now
    }
}

/// Where tokens come from (JWT grant, client credentials, a fixed sandbox value).
#[async_trait]
pub trait TokenSource: Send + Sync {
    async fn fetch_token(&self) -> Result<AccessToken, ContractError>;
}

/// Injected, process-wide token cache.
///
/// The slot lock is held across the refresh call, so concurrent readers that
/// find the token stale queue behind a single in-flight fetch and then reuse
/// its result.
pub struct TokenCache {
    source: Arc<dyn TokenSource>,
    skew: Duration,
    slot: Mutex<Option<AccessToken>>,
    refreshes: AtomicU64,
}

impl TokenCache {
    pub fn new(source: Arc<dyn TokenSource>, skew: Duration) -> Self {
        Self {
            source,
            skew,
            slot: Mutex::new(None),
            refreshes: AtomicU64::new(0),
        }
    }

    /// Return a token valid for at least `skew`, refreshing when needed.
    pub async fn access_token(&self) -> Result<String, ContractError> {
        let mut slot = self.slot.lock().await;
        if let Some(token) = slot.as_ref() {
            if token.is_fresh(Utc::now(), self.skew) {
                return Ok(token.value.clone());
            }
        }

        let token = self.source.fetch_token().await.map_err(|err| match err {
            ContractError::AuthenticationFailed(_) => err,
            other => ContractError::AuthenticationFailed(other.to_string()),
        })?;
        if token.value.is_empty() {
            return Err(ContractError::AuthenticationFailed(
                "token endpoint returned an empty token".to_string(),
            ));
        }

        self.refreshes.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(expires_at = %token.expires_at, "signature provider token refreshed");
        let value = token.value.clone();
        *slot = Some(token);
        Ok(value)
    }

    /// Drop the cached token, e.g. after the provider rejected it.
    pub async fn invalidate(&self) {
        self.slot.lock().await.take();
    }

    pub fn refresh_count(&self) -> u64 {
        self.refreshes.load(Ordering::Relaxed)
    }
}

/// Token source for sandbox mode; issues a fresh opaque token per fetch.
pub struct StaticTokenSource {
    prefix: String,
    lifetime: Duration,
    issued: AtomicU64,
}

impl StaticTokenSource {
    pub fn new(prefix: impl Into<String>, lifetime: Duration) -> Self {
        Self {
            prefix: prefix.into(),
            lifetime,
            issued: AtomicU64::new(0),
        }
    }
}

#[async_trait]
impl TokenSource for StaticTokenSource {
    async fn fetch_token(&self) -> Result<AccessToken, ContractError> {
        let serial = self.issued.fetch_add(1, Ordering::Relaxed) + 1;
        Ok(AccessToken {
            value: format!("{}-{serial}", self.prefix),
            expires_at: Utc::now() + self.lifetime,
        })
    }
}
