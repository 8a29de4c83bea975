//! Storage backends for agent-memory
//!
//! Each concern has one async trait and two implementations: an in-memory
//! one for tests and single-process use, and a SQLite one that survives
//! restarts and can be shared between processes.

mod memory;
mod sqlite;

pub use memory::{MemoryDocumentStore, MemoryEntryBackend, MemoryRecordBackend};
pub use sqlite::SqliteStorage;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::long_term::SummaryDocument;

/// A raw expiring entry
#[derive(Debug, Clone, PartialEq)]
pub struct Entry {
    pub key: String,
    pub value: Vec<u8>,
    pub expires_at: DateTime<Utc>,
}

impl Entry {
    /// An entry is live strictly before `expires_at`
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

/// Backing medium for [`crate::ExpiringStore`]
#[async_trait]
pub trait EntryBackend: Send + Sync {
    /// Read a live entry. An expired entry is deleted and reported absent.
    async fn get(&self, key: &str, now: DateTime<Utc>) -> Result<Option<Entry>>;

    /// Insert or replace an entry, applying the capacity policy
    async fn set(&self, entry: Entry, now: DateTime<Utc>) -> Result<()>;

    async fn delete(&self, key: &str) -> Result<()>;

    /// Drop every entry expired at `now`. Returns the number removed.
    async fn purge_expired(&self, now: DateTime<Utc>) -> Result<usize>;

    /// Number of stored entries, including expired ones not yet swept
    async fn len(&self) -> Result<usize>;
}

/// Lifecycle state of an idempotency record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordStatus {
    InProgress,
    Completed,
    Failed,
}

impl RecordStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecordStatus::InProgress => "in_progress",
            RecordStatus::Completed => "completed",
            RecordStatus::Failed => "failed",
        }
    }
}

impl std::fmt::Display for RecordStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for RecordStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "in_progress" => Ok(RecordStatus::InProgress),
            "completed" => Ok(RecordStatus::Completed),
            "failed" => Ok(RecordStatus::Failed),
            other => Err(Error::storage(format!("Unknown record status: {}", other))),
        }
    }
}

/// One record per idempotency key
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IdempotencyRecord {
    pub key: String,
    pub status: RecordStatus,

    /// Identifies the attempt that currently owns the record
    pub attempt: Uuid,

    /// Number of attempts that have claimed this key
    pub attempts: u32,

    /// Stored result, present once Completed
    pub result: Option<serde_json::Value>,

    /// Failure message of the last attempt, present when Failed
    pub error: Option<String>,

    pub created_at: DateTime<Utc>,

    /// When the current attempt claimed the record
    pub started_at: DateTime<Utc>,

    pub completed_at: Option<DateTime<Utc>>,
}

impl IdempotencyRecord {
    /// A fresh InProgress record for the first attempt on `key`
    pub fn claimed(key: &str, attempt: Uuid, now: DateTime<Utc>) -> Self {
        Self {
            key: key.to_string(),
            status: RecordStatus::InProgress,
            attempt,
            attempts: 1,
            result: None,
            error: None,
            created_at: now,
            started_at: now,
            completed_at: None,
        }
    }

    /// Whether a new attempt may take this record over
    pub fn is_reclaimable(&self, now: DateTime<Utc>, lease: Option<chrono::Duration>) -> bool {
        match self.status {
            RecordStatus::Failed => true,
            RecordStatus::Completed => false,
            RecordStatus::InProgress => {
                lease.is_some_and(|lease| {
                    self.started_at
                        .checked_add_signed(lease)
                        .is_some_and(|expiry| expiry <= now)
                })
            }
        }
    }

    /// Re-enter InProgress for a new attempt
    pub fn reclaim(&mut self, attempt: Uuid, now: DateTime<Utc>) {
        self.status = RecordStatus::InProgress;
        self.attempt = attempt;
        self.attempts += 1;
        self.result = None;
        self.error = None;
        self.started_at = now;
        self.completed_at = None;
    }
}

/// Outcome of an atomic claim
#[derive(Debug, Clone, PartialEq)]
pub enum Claim {
    /// The caller now owns the key and must run the action
    Claimed(IdempotencyRecord),

    /// Someone else owns or already resolved the key
    Existing(IdempotencyRecord),
}

/// Backing medium for [`crate::IdempotencyRegistry`]
///
/// `try_claim` must be a single atomic insert-if-absent or
/// compare-and-swap. The registry never does a separate read before it.
#[async_trait]
pub trait RecordBackend: Send + Sync {
    async fn try_claim(
        &self,
        key: &str,
        attempt: Uuid,
        now: DateTime<Utc>,
        lease: Option<chrono::Duration>,
    ) -> Result<Claim>;

    /// Mark the attempt completed. Returns false if `attempt` no longer
    /// owns the record.
    async fn complete(
        &self,
        key: &str,
        attempt: Uuid,
        result: serde_json::Value,
        now: DateTime<Utc>,
    ) -> Result<bool>;

    /// Mark the attempt failed. Returns false if `attempt` no longer owns
    /// the record.
    async fn fail(&self, key: &str, attempt: Uuid, message: &str, now: DateTime<Utc>)
        -> Result<bool>;

    async fn get(&self, key: &str) -> Result<Option<IdempotencyRecord>>;

    /// Remove Completed and Failed records resolved before `cutoff`
    async fn purge_resolved_before(&self, cutoff: DateTime<Utc>) -> Result<usize>;
}

/// Backing medium for [`crate::LongTermMemory`]
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Insert or replace by document id
    async fn upsert(&self, doc: SummaryDocument) -> Result<()>;

    async fn get(&self, id: &str) -> Result<Option<SummaryDocument>>;

    /// Record an access in place. Never inserts: returns false if the
    /// document does not exist.
    async fn touch(&self, id: &str, now: DateTime<Utc>) -> Result<bool>;

    /// Delete every listed id in one call. Unknown ids are ignored.
    async fn delete(&self, ids: &[String]) -> Result<usize>;

    /// A snapshot of all documents, not a live cursor
    async fn all_documents(&self) -> Result<Vec<SummaryDocument>>;

    async fn len(&self) -> Result<usize>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ts(secs: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(secs, 0).unwrap()
    }

    #[test]
    fn entry_expires_at_boundary() {
        let entry = Entry {
            key: "k".into(),
            value: b"v".to_vec(),
            expires_at: ts(100),
        };
        assert!(!entry.is_expired(ts(99)));
        assert!(entry.is_expired(ts(100)));
    }

    #[test]
    fn completed_records_are_never_reclaimable() {
        let mut record = IdempotencyRecord::claimed("k", Uuid::new_v4(), ts(0));
        record.status = RecordStatus::Completed;
        assert!(!record.is_reclaimable(ts(10_000), Some(chrono::Duration::seconds(1))));
    }

    #[test]
    fn in_progress_reclaimable_only_after_lease() {
        let record = IdempotencyRecord::claimed("k", Uuid::new_v4(), ts(0));
        let lease = Some(chrono::Duration::seconds(30));
        assert!(!record.is_reclaimable(ts(29), lease));
        assert!(record.is_reclaimable(ts(30), lease));
        assert!(!record.is_reclaimable(ts(10_000), None));
    }

    #[test]
    fn status_round_trips_through_str() {
        for status in [
            RecordStatus::InProgress,
            RecordStatus::Completed,
            RecordStatus::Failed,
        ] {
            assert_eq!(status.as_str().parse::<RecordStatus>().unwrap(), status);
        }
        assert!("bogus".parse::<RecordStatus>().is_err());
    }
}
