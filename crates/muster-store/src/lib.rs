//! Authoritative local store for roster identity mappings, event responses,
//! and the event→thread index, plus the snapshot/backup manager.
//!
//! Every composite read-then-write the recovery engine relies on is a single
//! SQL statement (`INSERT OR IGNORE`), so idempotent recovery holds even if
//! this core is ever driven from parallel tasks.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod backup;
mod sqlite;

pub use backup::{BackupInfo, BackupManager};
pub use sqlite::SqliteRosterStore;

use muster_resilience::{ClassifyFn, ErrorClass};

/// Result type for store operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Errors returned by store implementations.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("roster id '{0}' is already linked to another chat account")]
    RosterIdTaken(String),
    #[error("invalid persisted value for '{field}': {value}")]
    InvalidPersistedValue { field: &'static str, value: String },
    #[error("snapshot export failed: {0}")]
    SnapshotExport(String),
    #[error(transparent)]
    Sqlite(#[from] rusqlite::Error),
    #[error(transparent)]
    Chrono(#[from] chrono::ParseError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl StoreError {
    /// True for lock-contention faults that deserve a short retry.
    pub fn is_busy(&self) -> bool {
        match self {
            StoreError::Sqlite(rusqlite::Error::SqliteFailure(error, _)) => matches!(
                error.code,
                rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked
            ),
            _ => false,
        }
    }
}

/// Classifier for executor-wrapped store calls.
pub fn store_classifier() -> ClassifyFn {
    Arc::new(|error| {
        let class = match error.downcast_ref::<StoreError>() {
            Some(store_error) if store_error.is_busy() => ErrorClass::StorageBusy,
            Some(_) => ErrorClass::Permanent,
            None => ErrorClass::TransientNetwork,
        };
        class.into()
    })
}

/// Yes/no attendance answer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Response {
    Yes,
    No,
}

/// Link between a chat account and an external roster profile.
///
/// Bijection invariant: one mapping per chat id and per roster id, enforced
/// by the schema.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserMapping {
    pub chat_id: String,
    pub display_name: String,
    pub roster_id: String,
    pub skill_level: Option<u32>,
    pub elo: Option<u32>,
    pub country: Option<String>,
    pub linked_at: DateTime<Utc>,
}

/// One user's answer for one event. Keyed by (event_id, chat_id).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseRecord {
    pub event_id: String,
    pub chat_id: String,
    pub response: Response,
    /// Display name at the time of the answer; rendered summaries show this
    /// snapshot, not the live profile name.
    pub display_name: String,
    pub recorded_at: DateTime<Utc>,
}

/// Async store contract consumed by the reconciler and recovery engine.
#[async_trait]
pub trait RosterStore: Send + Sync {
    /// Creates or replaces the mapping for `mapping.chat_id`. Fails with
    /// [`StoreError::RosterIdTaken`] when the roster id belongs to a
    /// different chat account.
    async fn upsert_mapping(&self, mapping: UserMapping) -> StoreResult<()>;

    /// Insert-if-absent variant used by recovery. Returns true when a new
    /// row was written; an existing mapping (either key) is left untouched.
    async fn insert_mapping_if_absent(&self, mapping: UserMapping) -> StoreResult<bool>;

    async fn get_mapping_by_chat_id(&self, chat_id: &str) -> StoreResult<Option<UserMapping>>;
    async fn get_mapping_by_roster_id(&self, roster_id: &str) -> StoreResult<Option<UserMapping>>;
    async fn list_mappings(&self) -> StoreResult<Vec<UserMapping>>;
    /// Admin-initiated wipe of every mapping. Returns rows removed.
    async fn clear_mappings(&self) -> StoreResult<usize>;

    /// Last-write-wins answer upsert, the normal command-handler path.
    async fn upsert_response(&self, record: ResponseRecord) -> StoreResult<()>;
    /// Insert-if-absent variant used by recovery and journal replay.
    async fn insert_response_if_absent(&self, record: ResponseRecord) -> StoreResult<bool>;
    async fn get_response(
        &self,
        event_id: &str,
        chat_id: &str,
    ) -> StoreResult<Option<ResponseRecord>>;
    async fn list_responses_for_event(&self, event_id: &str) -> StoreResult<Vec<ResponseRecord>>;
    async fn clear_responses_for_event(&self, event_id: &str) -> StoreResult<usize>;

    /// Associates `event_id` with its discussion thread. At most one thread
    /// per event; re-pointing an event replaces the old association.
    async fn set_event_thread(&self, event_id: &str, thread_id: &str) -> StoreResult<()>;
    async fn get_event_thread(&self, event_id: &str) -> StoreResult<Option<String>>;
    async fn list_event_threads(&self) -> StoreResult<Vec<(String, String)>>;
    async fn clear_event_threads(&self) -> StoreResult<usize>;

    /// Atomic point-in-time export of the backing file to `destination`.
    async fn export_snapshot(&self, destination: &Path) -> StoreResult<()>;

    /// Path of the backing database file, used by the backup manager's
    /// restore path.
    fn backing_file(&self) -> &Path;
}
