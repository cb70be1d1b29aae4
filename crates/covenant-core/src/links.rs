use crate::error::ContractError;
use chrono::{Duration, NaiveDate};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::fmt;
use url::Url;

type HmacSha256 = Hmac<Sha256>;

const EXP_FORMAT: &str = "%Y-%m-%d";

/// Why a public quote-confirmation link was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LinkRejection {
    MissingSignature,
    InvalidSignature,
    Malformed,
    Expired,
    NotConfirmable,
}

impl LinkRejection {
    pub fn code(self) -> &'static str {
        match self {
            Self::MissingSignature => "missing_signature",
            Self::InvalidSignature => "invalid_signature",
            Self::Malformed => "malformed_link",
            Self::Expired => "link_expired",
            Self::NotConfirmable => "quote_not_confirmable",
        }
    }
}

impl fmt::Display for LinkRejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

/// Query parameters of `GET /v1/quotes/confirm`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct QuoteLinkParams {
    pub uuid: Option<String>,
    pub exp: Option<String>,
    pub sig: Option<String>,
}

/// Signs and verifies quote-confirmation links.
///
/// New links are signed with the first secret; verification accepts any of
/// them so secrets can be rotated without breaking links already sent out.
#[derive(Clone)]
pub struct QuoteLinkSigner {
    secrets: Vec<Vec<u8>>,
    public_base_url: String,
    validity_days: u32,
}

impl fmt::Debug for QuoteLinkSigner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QuoteLinkSigner")
            .field("secrets", &self.secrets.len())
            .field("public_base_url", &self.public_base_url)
            .field("validity_days", &self.validity_days)
            .finish()
    }
}

impl QuoteLinkSigner {
    pub fn new(
        secrets: &[String],
        public_base_url: impl Into<String>,
        validity_days: u32,
    ) -> Result<Self, ContractError> {
        let secrets: Vec<Vec<u8>> = secrets
            .iter()
            .filter(|secret| !secret.is_empty())
            .map(|secret| secret.as_bytes().to_vec())
            .collect();
        if secrets.is_empty() {
            return Err(ContractError::validation(
                "at least one quote link secret must be configured",
            ));
        }
        Ok(Self {
            secrets,
            public_base_url: public_base_url.into(),
            validity_days,
        })
    }

    fn mac(secret: &[u8], uuid: &str, exp: &str) -> Result<HmacSha256, ContractError> {
        let mut mac = HmacSha256::new_from_slice(secret)
            .map_err(|e| ContractError::validation(format!("invalid link secret: {e}")))?;
        mac.update(uuid.as_bytes());
        mac.update(b":");
        mac.update(exp.as_bytes());
        Ok(mac)
    }

    /// Hex HMAC-SHA256 over `uuid:exp` with the active secret.
    pub fn sign(&self, uuid: &str, exp: NaiveDate) -> Result<String, ContractError> {
        let secret = self
            .secrets
            .first()
            .ok_or_else(|| ContractError::validation("no quote link secret configured"))?;
        let exp = exp.format(EXP_FORMAT).to_string();
        let mac = Self::mac(secret, uuid, &exp)?;
        Ok(hex::encode(mac.finalize().into_bytes()))
    }

    /// Full confirmation URL for a quote, valid for the configured number of days.
    pub fn build_url(&self, uuid: &str, today: NaiveDate) -> Result<String, ContractError> {
        let exp = today + Duration::days(i64::from(self.validity_days));
        let sig = self.sign(uuid, exp)?;
        let mut url = Url::parse(&self.public_base_url)
            .and_then(|base| base.join("/v1/quotes/confirm"))
            .map_err(|e| ContractError::validation(format!("invalid public base url: {e}")))?;
        url.query_pairs_mut()
            .append_pair("uuid", uuid)
            .append_pair("exp", &exp.format(EXP_FORMAT).to_string())
            .append_pair("sig", &sig);
        Ok(url.to_string())
    }

    /// Check signature and expiry. Returns the quote uuid on success.
    pub fn verify(&self, params: &QuoteLinkParams, today: NaiveDate) -> Result<String, LinkRejection> {
        let sig = params
            .sig
            .as_deref()
            .filter(|sig| !sig.is_empty())
            .ok_or(LinkRejection::MissingSignature)?;
        let uuid = params
            .uuid
            .as_deref()
            .filter(|uuid| !uuid.is_empty())
            .ok_or(LinkRejection::Malformed)?;
        let exp_raw = params.exp.as_deref().ok_or(LinkRejection::Malformed)?;
        let sig_bytes = hex::decode(sig).map_err(|_| LinkRejection::InvalidSignature)?;

        let authentic = self.secrets.iter().any(|secret| {
            Self::mac(secret, uuid, exp_raw)
                .map(|mac| mac.verify_slice(&sig_bytes).is_ok())
                .unwrap_or(false)
        });
        if !authentic {
            return Err(LinkRejection::InvalidSignature);
        }

        let exp = NaiveDate::parse_from_str(exp_raw, EXP_FORMAT)
            .map_err(|_| LinkRejection::Malformed)?;
        if today > exp {
            return Err(LinkRejection::Expired);
        }
        Ok(uuid.to_string())
    }
}
