use crate::error::ContractError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum JournalEntryKind {
    Note,
    Closure,
    FollowUp,
}

impl JournalEntryKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Note => "note",
            Self::Closure => "closure",
            Self::FollowUp => "follow_up",
        }
    }

    pub fn parse(value: &str) -> Result<Self, ContractError> {
        match value {
            "note" => Ok(Self::Note),
            "closure" => Ok(Self::Closure),
            "follow_up" => Ok(Self::FollowUp),
            other => Err(ContractError::Storage(format!(
                "unknown journal entry kind '{other}'"
            ))),
        }
    }
}

/// Hash-chained journal entry, the contract's auditable chatter.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JournalEntry {
    pub entry_id: String,
    pub index: u64,
    pub contract_id: String,
    pub kind: JournalEntryKind,
    pub timestamp: DateTime<Utc>,
    pub payload: Value,
    pub previous_hash: Option<String>,
    pub entry_hash: String,
}

/// Free-text note attached to a contract.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ContractNote {
    pub author: String,
    pub body: String,
}

impl ContractNote {
    pub fn system(body: impl Into<String>) -> Self {
        Self {
            author: "system".to_string(),
            body: body.into(),
        }
    }
}

/// Append-only contract journal with a blake3 hash chain.
///
/// Entries are never edited; corrections are new entries.
#[derive(Debug, Default, Clone)]
pub struct AuditJournal {
    entries: Vec<JournalEntry>,
}

impl AuditJournal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild from persisted entries, rejecting gaps and broken hashes.
    pub fn from_entries(entries: Vec<JournalEntry>) -> Result<Self, ContractError> {
        let journal = Self { entries };
        for (position, entry) in journal.entries.iter().enumerate() {
            if entry.index != position as u64 {
                return Err(ContractError::Storage(format!(
                    "journal index gap at position {position} (found {})",
                    entry.index
                )));
            }
        }
        if !journal.verify_chain() {
            return Err(ContractError::Storage(
                "persisted journal hash-chain verification failed".to_string(),
            ));
        }
        Ok(journal)
    }

    pub fn entries(&self) -> &[JournalEntry] {
        &self.entries
    }

    pub fn entries_for(&self, contract_id: &str) -> Vec<&JournalEntry> {
        self.entries
            .iter()
            .filter(|entry| entry.contract_id == contract_id)
            .collect()
    }

    pub fn verify_chain(&self) -> bool {
        let mut previous_hash: Option<String> = None;
        for entry in &self.entries {
            let expected = compute_entry_hash(
                entry.index,
                &entry.contract_id,
                entry.kind,
                entry.timestamp,
                &entry.payload,
                previous_hash.as_deref(),
            );
            if entry.entry_hash != expected || entry.previous_hash != previous_hash {
                return false;
            }
            previous_hash = Some(entry.entry_hash.clone());
        }
        true
    }

    pub fn append(
        &mut self,
        contract_id: &str,
        kind: JournalEntryKind,
        payload: Value,
    ) -> Result<JournalEntry, ContractError> {
        let entry = self.build_entry(contract_id, kind, payload);
        self.commit_entry(entry.clone())?;
        Ok(entry)
    }

    /// Next entry in the chain, without committing it.
    pub fn build_entry(&self, contract_id: &str, kind: JournalEntryKind, payload: Value) -> JournalEntry {
        let index = self.entries.len() as u64;
        let timestamp = Utc::now();
        let previous_hash = self.entries.last().map(|entry| entry.entry_hash.clone());
        let entry_hash = compute_entry_hash(
            index,
            contract_id,
            kind,
            timestamp,
            &payload,
            previous_hash.as_deref(),
        );
        JournalEntry {
            entry_id: Uuid::new_v4().to_string(),
            index,
            contract_id: contract_id.to_string(),
            kind,
            timestamp,
            payload,
            previous_hash,
            entry_hash,
        }
    }

    /// Commit an entry built by [`Self::build_entry`] once it is durable.
    pub fn commit_entry(&mut self, entry: JournalEntry) -> Result<(), ContractError> {
        let expected_index = self.entries.len() as u64;
        if entry.index != expected_index {
            return Err(ContractError::Storage(format!(
                "journal commit index mismatch: expected {expected_index}, got {}",
                entry.index
            )));
        }
        let expected_previous = self.entries.last().map(|last| last.entry_hash.clone());
        if entry.previous_hash != expected_previous {
            return Err(ContractError::Storage(
                "journal commit previous hash mismatch".to_string(),
            ));
        }
        let expected_hash = compute_entry_hash(
            entry.index,
            &entry.contract_id,
            entry.kind,
            entry.timestamp,
            &entry.payload,
            entry.previous_hash.as_deref(),
        );
        if entry.entry_hash != expected_hash {
            return Err(ContractError::Storage(
                "journal commit hash mismatch".to_string(),
            ));
        }
        self.entries.push(entry);
        Ok(())
    }
}

fn compute_entry_hash(
    index: u64,
    contract_id: &str,
    kind: JournalEntryKind,
    timestamp: DateTime<Utc>,
    payload: &Value,
    previous_hash: Option<&str>,
) -> String {
    let material = serde_json::json!({
        "index": index,
        "contract_id": contract_id,
        "kind": kind,
        "timestamp": timestamp,
        "payload": payload,
        "previous_hash": previous_hash,
    });
    let bytes = serde_json::to_vec(&material).unwrap_or_default();
    blake3::hash(&bytes).to_hex().to_string()
}
