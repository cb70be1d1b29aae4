use crate::error::ContractError;
use crate::journal::{AuditJournal, ContractNote, JournalEntry, JournalEntryKind};
use serde::Serialize;
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Row};

/// Journal persistence backend.
#[derive(Debug, Clone, Default)]
pub enum JournalStorageConfig {
    /// Process memory only.
    #[default]
    Memory,
    /// Mirror every entry to PostgreSQL and hydrate on startup.
    Postgres {
        database_url: String,
        max_connections: u32,
    },
}

impl JournalStorageConfig {
    pub fn memory() -> Self {
        Self::Memory
    }

    pub fn postgres(database_url: impl Into<String>, max_connections: u32) -> Self {
        Self::Postgres {
            database_url: database_url.into(),
            max_connections,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::Memory => "memory",
            Self::Postgres { .. } => "postgres",
        }
    }
}

#[derive(Debug, Clone)]
enum JournalBackend {
    Memory,
    Postgres(PostgresJournalStore),
}

/// In-memory authoritative chain, optionally mirrored to PostgreSQL.
///
/// An entry is written to the backend before it is committed in memory, so a
/// failed insert leaves both sides unchanged.
#[derive(Debug, Clone)]
pub struct PersistentJournal {
    journal: AuditJournal,
    backend: JournalBackend,
}

impl PersistentJournal {
    pub async fn bootstrap(config: JournalStorageConfig) -> Result<Self, ContractError> {
        match config {
            JournalStorageConfig::Memory => Ok(Self {
                journal: AuditJournal::new(),
                backend: JournalBackend::Memory,
            }),
            JournalStorageConfig::Postgres {
                database_url,
                max_connections,
            } => {
                let store = PostgresJournalStore::connect(&database_url, max_connections).await?;
                store.ensure_schema().await?;
                let journal = AuditJournal::from_entries(store.load_entries().await?)?;
                tracing::info!(entries = journal.entries().len(), "journal hydrated from postgres");
                Ok(Self {
                    journal,
                    backend: JournalBackend::Postgres(store),
                })
            }
        }
    }

    pub fn memory() -> Self {
        Self {
            journal: AuditJournal::new(),
            backend: JournalBackend::Memory,
        }
    }

    pub fn backend_label(&self) -> &'static str {
        match self.backend {
            JournalBackend::Memory => "memory",
            JournalBackend::Postgres(_) => "postgres",
        }
    }

    pub fn entries(&self) -> &[JournalEntry] {
        self.journal.entries()
    }

    pub fn entries_for(&self, contract_id: &str) -> Vec<&JournalEntry> {
        self.journal.entries_for(contract_id)
    }

    pub fn verify_chain(&self) -> bool {
        self.journal.verify_chain()
    }

    pub async fn append_note(
        &mut self,
        contract_id: &str,
        note: ContractNote,
    ) -> Result<JournalEntry, ContractError> {
        self.append_record(contract_id, JournalEntryKind::Note, &note)
            .await
    }

    pub async fn append_record<T: Serialize>(
        &mut self,
        contract_id: &str,
        kind: JournalEntryKind,
        record: &T,
    ) -> Result<JournalEntry, ContractError> {
        let payload = serde_json::to_value(record)
            .map_err(|e| ContractError::Serialization(e.to_string()))?;
        let entry = self.journal.build_entry(contract_id, kind, payload);
        if let JournalBackend::Postgres(store) = &self.backend {
            store.insert_entry(&entry).await?;
        }
        self.journal.commit_entry(entry.clone())?;
        Ok(entry)
    }
}

#[derive(Debug, Clone)]
struct PostgresJournalStore {
    pool: PgPool,
}

impl PostgresJournalStore {
    async fn connect(database_url: &str, max_connections: u32) -> Result<Self, ContractError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections.max(1))
            .connect(database_url)
            .await
            .map_err(|e| ContractError::Storage(format!("postgres connect failed: {e}")))?;
        Ok(Self { pool })
    }

    async fn ensure_schema(&self) -> Result<(), ContractError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS covenant_journal_entries (
                journal_index BIGINT PRIMARY KEY,
                entry_id TEXT NOT NULL UNIQUE,
                contract_id TEXT NOT NULL,
                kind TEXT NOT NULL,
                entry_timestamp TIMESTAMPTZ NOT NULL,
                payload JSONB NOT NULL,
                previous_hash TEXT NULL,
                entry_hash TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| ContractError::Storage(format!("postgres schema create failed: {e}")))?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_covenant_journal_contract ON covenant_journal_entries (contract_id)",
        )
        .execute(&self.pool)
        .await
        .map_err(|e| ContractError::Storage(format!("postgres index create failed: {e}")))?;

        Ok(())
    }

    async fn load_entries(&self) -> Result<Vec<JournalEntry>, ContractError> {
        let rows = sqlx::query(
            r#"
            SELECT journal_index, entry_id, contract_id, kind, entry_timestamp,
                   payload, previous_hash, entry_hash
            FROM covenant_journal_entries
            ORDER BY journal_index ASC
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|e| ContractError::Storage(format!("postgres load failed: {e}")))?;

        let mut entries = Vec::with_capacity(rows.len());
        for row in rows {
            let index: i64 = row.try_get("journal_index").map_err(decode_error)?;
            let kind: String = row.try_get("kind").map_err(decode_error)?;
            entries.push(JournalEntry {
                entry_id: row.try_get("entry_id").map_err(decode_error)?,
                index: index
                    .try_into()
                    .map_err(|_| ContractError::Storage("negative journal index".to_string()))?,
                contract_id: row.try_get("contract_id").map_err(decode_error)?,
                kind: JournalEntryKind::parse(&kind)?,
                timestamp: row.try_get("entry_timestamp").map_err(decode_error)?,
                payload: row.try_get("payload").map_err(decode_error)?,
                previous_hash: row.try_get("previous_hash").map_err(decode_error)?,
                entry_hash: row.try_get("entry_hash").map_err(decode_error)?,
            });
        }
        Ok(entries)
    }

    async fn insert_entry(&self, entry: &JournalEntry) -> Result<(), ContractError> {
        let index: i64 = entry
            .index
            .try_into()
            .map_err(|_| ContractError::Storage("journal index exceeds BIGINT".to_string()))?;
        sqlx::query(
            r#"
            INSERT INTO covenant_journal_entries (
                journal_index, entry_id, contract_id, kind, entry_timestamp,
                payload, previous_hash, entry_hash
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(index)
        .bind(&entry.entry_id)
        .bind(&entry.contract_id)
        .bind(entry.kind.as_str())
        .bind(entry.timestamp)
        .bind(&entry.payload)
        .bind(&entry.previous_hash)
        .bind(&entry.entry_hash)
        .execute(&self.pool)
        .await
        .map_err(|e| ContractError::Storage(format!("postgres insert failed: {e}")))?;
        Ok(())
    }
}

fn decode_error(error: sqlx::Error) -> ContractError {
    ContractError::Storage(format!("postgres decode failed: {error}"))
}
