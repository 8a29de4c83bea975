//! SQLite storage for expiring entries, idempotency records and summaries

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use uuid::Uuid;

use super::{Claim, DocumentStore, Entry, EntryBackend, IdempotencyRecord, RecordBackend};
use crate::config::{CapacityPolicy, Config, Eviction};
use crate::error::{Error, Result};
use crate::long_term::{format_timestamp, SummaryDocument, ACCESS_COUNT, LAST_ACCESSED_AT};

/// SQLite storage backend
///
/// One connection serves all three storage traits. Every conditional write
/// is a single statement, so the same database file can back several
/// processes.
#[derive(Clone)]
pub struct SqliteStorage {
    conn: Arc<Mutex<Connection>>,
    capacity: CapacityPolicy,
}

impl SqliteStorage {
    /// Open the database at the configured path
    pub fn new(config: &Config) -> Result<Self> {
        Self::open(config.sqlite_path(), config.capacity)
    }

    /// Open a database file
    pub fn open(path: impl AsRef<Path>, capacity: CapacityPolicy) -> Result<Self> {
        let conn = Connection::open(path)?;
        Self::init(conn, capacity)
    }

    /// Open a private in-memory database
    pub fn open_in_memory(capacity: CapacityPolicy) -> Result<Self> {
        Self::init(Connection::open_in_memory()?, capacity)
    }

    fn init(conn: Connection, capacity: CapacityPolicy) -> Result<Self> {
        // Initialize schema
        conn.execute_batch(include_str!("schema.sql"))?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            capacity,
        })
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|e| Error::storage(e.to_string()))
    }

    fn read_record(conn: &Connection, key: &str) -> Result<Option<IdempotencyRecord>> {
        let row = conn
            .query_row(
                r#"
                SELECT key, status, attempt, attempts, result, error,
                       created_at, started_at, completed_at
                FROM idempotency_records WHERE key = ?1
                "#,
                params![key],
                |row| {
                    Ok(RecordRow {
                        key: row.get(0)?,
                        status: row.get(1)?,
                        attempt: row.get(2)?,
                        attempts: row.get(3)?,
                        result: row.get(4)?,
                        error: row.get(5)?,
                        created_at: row.get(6)?,
                        started_at: row.get(7)?,
                        completed_at: row.get(8)?,
                    })
                },
            )
            .optional()?;

        row.map(|row| row.into_record()).transpose()
    }
}

fn millis_to_datetime(ms: i64) -> Result<DateTime<Utc>> {
    DateTime::from_timestamp_millis(ms)
        .ok_or_else(|| Error::storage(format!("Timestamp out of range: {}", ms)))
}

#[async_trait]
impl EntryBackend for SqliteStorage {
    async fn get(&self, key: &str, now: DateTime<Utc>) -> Result<Option<Entry>> {
        let conn = self.conn()?;
        let now_ms = now.timestamp_millis();

        let row: Option<(Vec<u8>, i64)> = conn
            .query_row(
                "SELECT value, expires_at FROM kv_entries WHERE key = ?1",
                params![key],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;

        let Some((value, expires_at)) = row else {
            return Ok(None);
        };

        if now_ms >= expires_at {
            // Conditional so a concurrent refresh of the key survives
            conn.execute(
                "DELETE FROM kv_entries WHERE key = ?1 AND expires_at <= ?2",
                params![key, now_ms],
            )?;
            tracing::debug!(key, "lazily evicted expired entry");
            return Ok(None);
        }

        if self.capacity.max_entries().is_some() {
            conn.execute(
                r#"
                UPDATE kv_entries
                SET last_used = (SELECT COALESCE(MAX(last_used), 0) + 1 FROM kv_entries)
                WHERE key = ?1
                "#,
                params![key],
            )?;
        }

        Ok(Some(Entry {
            key: key.to_string(),
            value,
            expires_at: millis_to_datetime(expires_at)?,
        }))
    }

    async fn set(&self, entry: Entry, now: DateTime<Utc>) -> Result<()> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;

        if let CapacityPolicy::Bounded {
            max_entries,
            eviction,
        } = self.capacity
        {
            let exists: bool = tx.query_row(
                "SELECT EXISTS(SELECT 1 FROM kv_entries WHERE key = ?1)",
                params![entry.key],
                |row| row.get(0),
            )?;

            if !exists {
                let count_entries = |tx: &rusqlite::Transaction<'_>| -> rusqlite::Result<usize> {
                    tx.query_row("SELECT COUNT(*) FROM kv_entries", [], |row| {
                        row.get::<_, i64>(0)
                    })
                    .map(|count| count as usize)
                };

                if count_entries(&tx)? >= max_entries {
                    tx.execute(
                        "DELETE FROM kv_entries WHERE expires_at <= ?1",
                        params![now.timestamp_millis()],
                    )?;
                }

                if count_entries(&tx)? >= max_entries {
                    match eviction {
                        Eviction::Lru => {
                            tx.execute(
                                r#"
                                DELETE FROM kv_entries WHERE key = (
                                    SELECT key FROM kv_entries ORDER BY last_used ASC LIMIT 1
                                )
                                "#,
                                [],
                            )?;
                        }
                        Eviction::Reject => {
                            return Err(Error::StoreFull {
                                capacity: max_entries,
                            })
                        }
                    }
                }
            }
        }

        tx.execute(
            r#"
            INSERT INTO kv_entries (key, value, expires_at, last_used)
            VALUES (?1, ?2, ?3, (SELECT COALESCE(MAX(last_used), 0) + 1 FROM kv_entries))
            ON CONFLICT(key) DO UPDATE SET
                value = excluded.value,
                expires_at = excluded.expires_at,
                last_used = excluded.last_used
            "#,
            params![entry.key, entry.value, entry.expires_at.timestamp_millis()],
        )?;

        tx.commit()?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let conn = self.conn()?;
        conn.execute("DELETE FROM kv_entries WHERE key = ?1", params![key])?;
        Ok(())
    }

    async fn purge_expired(&self, now: DateTime<Utc>) -> Result<usize> {
        let conn = self.conn()?;
        let removed = conn.execute(
            "DELETE FROM kv_entries WHERE expires_at <= ?1",
            params![now.timestamp_millis()],
        )?;
        Ok(removed)
    }

    async fn len(&self) -> Result<usize> {
        let conn = self.conn()?;
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM kv_entries", [], |row| row.get(0))?;
        Ok(count as usize)
    }
}

#[async_trait]
impl RecordBackend for SqliteStorage {
    async fn try_claim(
        &self,
        key: &str,
        attempt: Uuid,
        now: DateTime<Utc>,
        lease: Option<chrono::Duration>,
    ) -> Result<Claim> {
        let conn = self.conn()?;

        let claimed = conn.execute(
            r#"
            INSERT INTO idempotency_records (
                key, status, attempt, attempts, result, error,
                created_at, started_at, completed_at
            ) VALUES (?1, 'in_progress', ?2, 1, NULL, NULL, ?3, ?3, NULL)
            ON CONFLICT(key) DO UPDATE SET
                status = 'in_progress',
                attempt = excluded.attempt,
                attempts = idempotency_records.attempts + 1,
                result = NULL,
                error = NULL,
                started_at = excluded.started_at,
                completed_at = NULL
            WHERE idempotency_records.status = 'failed'
               OR (idempotency_records.status = 'in_progress'
                   AND ?4 IS NOT NULL
                   AND idempotency_records.started_at + ?4 <= ?3)
            "#,
            params![
                key,
                attempt.to_string(),
                now.timestamp_millis(),
                lease.map(|lease| lease.num_milliseconds()),
            ],
        )? == 1;

        let record = Self::read_record(&conn, key)?
            .ok_or_else(|| Error::storage(format!("Record for '{}' vanished after claim", key)))?;

        if claimed {
            Ok(Claim::Claimed(record))
        } else {
            Ok(Claim::Existing(record))
        }
    }

    async fn complete(
        &self,
        key: &str,
        attempt: Uuid,
        result: serde_json::Value,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let conn = self.conn()?;
        let updated = conn.execute(
            r#"
            UPDATE idempotency_records
            SET status = 'completed', result = ?3, error = NULL, completed_at = ?4
            WHERE key = ?1 AND attempt = ?2 AND status = 'in_progress'
            "#,
            params![
                key,
                attempt.to_string(),
                serde_json::to_string(&result)?,
                now.timestamp_millis(),
            ],
        )?;
        Ok(updated == 1)
    }

    async fn fail(
        &self,
        key: &str,
        attempt: Uuid,
        message: &str,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let conn = self.conn()?;
        let updated = conn.execute(
            r#"
            UPDATE idempotency_records
            SET status = 'failed', error = ?3, completed_at = ?4
            WHERE key = ?1 AND attempt = ?2 AND status = 'in_progress'
            "#,
            params![key, attempt.to_string(), message, now.timestamp_millis()],
        )?;
        Ok(updated == 1)
    }

    async fn get(&self, key: &str) -> Result<Option<IdempotencyRecord>> {
        let conn = self.conn()?;
        Self::read_record(&conn, key)
    }

    async fn purge_resolved_before(&self, cutoff: DateTime<Utc>) -> Result<usize> {
        let conn = self.conn()?;
        let removed = conn.execute(
            r#"
            DELETE FROM idempotency_records
            WHERE status != 'in_progress' AND completed_at IS NOT NULL AND completed_at < ?1
            "#,
            params![cutoff.timestamp_millis()],
        )?;
        Ok(removed)
    }
}

#[async_trait]
impl DocumentStore for SqliteStorage {
    async fn upsert(&self, doc: SummaryDocument) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            r#"
            INSERT INTO documents (id, content, metadata) VALUES (?1, ?2, ?3)
            ON CONFLICT(id) DO UPDATE SET
                content = excluded.content,
                metadata = excluded.metadata
            "#,
            params![doc.id, doc.content, serde_json::to_string(&doc.metadata)?],
        )?;
        Ok(())
    }

    async fn get(&self, id: &str) -> Result<Option<SummaryDocument>> {
        let conn = self.conn()?;
        let row = conn
            .query_row(
                "SELECT id, content, metadata FROM documents WHERE id = ?1",
                params![id],
                |row| {
                    Ok(DocumentRow {
                        id: row.get(0)?,
                        content: row.get(1)?,
                        metadata: row.get(2)?,
                    })
                },
            )
            .optional()?;

        row.map(|row| row.into_document()).transpose()
    }

    async fn touch(&self, id: &str, now: DateTime<Utc>) -> Result<bool> {
        let conn = self.conn()?;
        let updated = conn.execute(
            r#"
            UPDATE documents
            SET metadata = json_set(
                metadata,
                '$.' || ?2, ?3,
                '$.' || ?4, COALESCE(json_extract(metadata, '$.' || ?4), 0) + 1
            )
            WHERE id = ?1
            "#,
            params![id, LAST_ACCESSED_AT, format_timestamp(now), ACCESS_COUNT],
        )?;
        Ok(updated == 1)
    }

    async fn delete(&self, ids: &[String]) -> Result<usize> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let mut deleted = 0;
        {
            let mut stmt = tx.prepare("DELETE FROM documents WHERE id = ?1")?;
            for id in ids {
                deleted += stmt.execute(params![id])?;
            }
        }
        tx.commit()?;
        Ok(deleted)
    }

    async fn all_documents(&self) -> Result<Vec<SummaryDocument>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare("SELECT id, content, metadata FROM documents ORDER BY id")?;

        let rows = stmt.query_map([], |row| {
            Ok(DocumentRow {
                id: row.get(0)?,
                content: row.get(1)?,
                metadata: row.get(2)?,
            })
        })?;

        let mut docs = Vec::new();
        for row in rows {
            docs.push(row?.into_document()?);
        }

        Ok(docs)
    }

    async fn len(&self) -> Result<usize> {
        let conn = self.conn()?;
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM documents", [], |row| row.get(0))?;
        Ok(count as usize)
    }
}

/// Intermediate struct for reading idempotency records
struct RecordRow {
    key: String,
    status: String,
    attempt: String,
    attempts: u32,
    result: Option<String>,
    error: Option<String>,
    created_at: i64,
    started_at: i64,
    completed_at: Option<i64>,
}

impl RecordRow {
    fn into_record(self) -> Result<IdempotencyRecord> {
        Ok(IdempotencyRecord {
            status: self.status.parse()?,
            attempt: Uuid::parse_str(&self.attempt).map_err(|e| Error::storage(e.to_string()))?,
            attempts: self.attempts,
            result: self.result.map(|raw| serde_json::from_str(&raw)).transpose()?,
            error: self.error,
            created_at: millis_to_datetime(self.created_at)?,
            started_at: millis_to_datetime(self.started_at)?,
            completed_at: self.completed_at.map(millis_to_datetime).transpose()?,
            key: self.key,
        })
    }
}

/// Intermediate struct for reading summary documents
struct DocumentRow {
    id: String,
    content: String,
    metadata: String,
}

impl DocumentRow {
    fn into_document(self) -> Result<SummaryDocument> {
        let metadata = match serde_json::from_str::<serde_json::Value>(&self.metadata)? {
            serde_json::Value::Object(map) => map,
            other => {
                return Err(Error::storage(format!(
                    "Document {} has non-object metadata: {}",
                    self.id, other
                )))
            }
        };

        Ok(SummaryDocument {
            id: self.id,
            content: self.content,
            metadata,
        })
    }
}
