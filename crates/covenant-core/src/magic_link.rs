use chrono::{DateTime, Duration, Utc};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::fmt;

const TOKEN_BYTES: usize = 32;

/// Resolution failures, each with its own user-facing message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MagicLinkRejection {
    Missing,
    NotFound,
    Used,
    Expired,
}

impl MagicLinkRejection {
    pub fn code(self) -> &'static str {
        match self {
            Self::Missing => "magic_link_missing",
            Self::NotFound => "magic_link_not_found",
            Self::Used => "magic_link_used",
            Self::Expired => "magic_link_expired",
        }
    }

    pub fn user_message(self) -> &'static str {
        match self {
            Self::Missing => "The signing link is incomplete. Please open the full link from your message.",
            Self::NotFound => "This signing link is not valid. Please request a new one.",
            Self::Used => "This signing link has already been used.",
            Self::Expired => "This signing link has expired. Please request a new one.",
        }
    }
}

impl fmt::Display for MagicLinkRejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

/// Stored form of a magic link. The raw token is never kept.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MagicLinkRecord {
    pub token_hash: String,
    pub contract_id: String,
    pub recipient_id: u32,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub used_at: Option<DateTime<Utc>>,
}

impl MagicLinkRecord {
    pub fn check_usable(&self, now: DateTime<Utc>) -> Result<(), MagicLinkRejection> {
        if self.used_at.is_some() {
            return Err(MagicLinkRejection::Used);
        }
        if now >= self.expires_at {
            return Err(MagicLinkRejection::Expired);
        }
        Ok(())
    }

    /// Mark used. Fails without changes if the link is not usable.
    pub fn consume(&mut self, now: DateTime<Utc>) -> Result<(), MagicLinkRejection> {
        self.check_usable(now)?;
        self.used_at = Some(now);
        Ok(())
    }
}

/// Freshly minted link: the raw token goes to the recipient once.
#[derive(Debug, Clone)]
pub struct IssuedMagicLink {
    pub token: String,
    pub record: MagicLinkRecord,
}

pub fn hash_token(token: &str) -> String {
    blake3::hash(token.as_bytes()).to_hex().to_string()
}

pub fn issue(contract_id: &str, recipient_id: u32, ttl: Duration, now: DateTime<Utc>) -> IssuedMagicLink {
    let mut bytes = [0u8; TOKEN_BYTES];
    rand::thread_rng().fill_bytes(&mut bytes);
    let token = hex::encode(bytes);
    let record = MagicLinkRecord {
        token_hash: hash_token(&token),
        contract_id: contract_id.to_string(),
        recipient_id,
        created_at: now,
        expires_at: now + ttl,
        used_at: None,
    };
    IssuedMagicLink { token, record }
}
