//! In-memory storage backends

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard, RwLock};
use uuid::Uuid;

use super::{
    Claim, DocumentStore, Entry, EntryBackend, IdempotencyRecord, RecordBackend, RecordStatus,
};
use crate::config::{CapacityPolicy, Eviction};
use crate::error::{Error, Result};
use crate::long_term::SummaryDocument;

fn lock<T>(mutex: &Mutex<T>) -> Result<MutexGuard<'_, T>> {
    mutex.lock().map_err(|e| Error::storage(e.to_string()))
}

struct Slot {
    entry: Entry,
    last_used: u64,
}

#[derive(Default)]
struct EntryTable {
    slots: HashMap<String, Slot>,
    tick: u64,
}

impl EntryTable {
    fn next_tick(&mut self) -> u64 {
        self.tick += 1;
        self.tick
    }

    fn purge_expired(&mut self, now: DateTime<Utc>) -> usize {
        let before = self.slots.len();
        self.slots.retain(|_, slot| !slot.entry.is_expired(now));
        before - self.slots.len()
    }

    fn evict_least_recently_used(&mut self) -> Option<String> {
        let key = self
            .slots
            .iter()
            .min_by_key(|(_, slot)| slot.last_used)
            .map(|(key, _)| key.clone())?;
        self.slots.remove(&key);
        Some(key)
    }
}

/// Expiring entries held in a process-local map
///
/// All operations take one lock, so a sweep can never remove an entry that a
/// concurrent `set` has just refreshed. LRU eviction needs a single recency
/// order across keys, so the table is not sharded. The lock is never held
/// across an await and each critical section is a single map operation, so
/// operations on different keys serialize briefly but never wait on each
/// other's I/O.
pub struct MemoryEntryBackend {
    table: Mutex<EntryTable>,
    capacity: CapacityPolicy,
}

impl MemoryEntryBackend {
    pub fn new(capacity: CapacityPolicy) -> Self {
        Self {
            table: Mutex::new(EntryTable::default()),
            capacity,
        }
    }

    pub fn unbounded() -> Self {
        Self::new(CapacityPolicy::Unbounded)
    }
}

impl Default for MemoryEntryBackend {
    fn default() -> Self {
        Self::unbounded()
    }
}

#[async_trait]
impl EntryBackend for MemoryEntryBackend {
    async fn get(&self, key: &str, now: DateTime<Utc>) -> Result<Option<Entry>> {
        let mut table = lock(&self.table)?;
        let tick = table.next_tick();

        match table.slots.get_mut(key) {
            None => Ok(None),
            Some(slot) if !slot.entry.is_expired(now) => {
                slot.last_used = tick;
                Ok(Some(slot.entry.clone()))
            }
            Some(_) => {
                table.slots.remove(key);
                tracing::debug!(key, "lazily evicted expired entry");
                Ok(None)
            }
        }
    }

    async fn set(&self, entry: Entry, now: DateTime<Utc>) -> Result<()> {
        let mut table = lock(&self.table)?;

        if let CapacityPolicy::Bounded {
            max_entries,
            eviction,
        } = self.capacity
        {
            if !table.slots.contains_key(&entry.key) && table.slots.len() >= max_entries {
                table.purge_expired(now);
                if table.slots.len() >= max_entries {
                    match eviction {
                        Eviction::Lru => {
                            if let Some(evicted) = table.evict_least_recently_used() {
                                tracing::debug!(
                                    key = %evicted,
                                    "evicted least recently used entry"
                                );
                            }
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

        let last_used = table.next_tick();
        table.slots.insert(entry.key.clone(), Slot { entry, last_used });
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        lock(&self.table)?.slots.remove(key);
        Ok(())
    }

    async fn purge_expired(&self, now: DateTime<Utc>) -> Result<usize> {
        Ok(lock(&self.table)?.purge_expired(now))
    }

    async fn len(&self) -> Result<usize> {
        Ok(lock(&self.table)?.slots.len())
    }
}

/// Idempotency records held in a process-local map
#[derive(Default)]
pub struct MemoryRecordBackend {
    records: Mutex<HashMap<String, IdempotencyRecord>>,
}

impl MemoryRecordBackend {
    pub fn new() -> Self {
        Self::default()
    }

    fn transition(
        &self,
        key: &str,
        attempt: Uuid,
        apply: impl FnOnce(&mut IdempotencyRecord),
    ) -> Result<bool> {
        let mut records = lock(&self.records)?;
        match records.get_mut(key) {
            Some(record)
                if record.attempt == attempt && record.status == RecordStatus::InProgress =>
            {
                apply(record);
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

#[async_trait]
impl RecordBackend for MemoryRecordBackend {
    async fn try_claim(
        &self,
        key: &str,
        attempt: Uuid,
        now: DateTime<Utc>,
        lease: Option<chrono::Duration>,
    ) -> Result<Claim> {
        let mut records = lock(&self.records)?;
        match records.get_mut(key) {
            None => {
                let record = IdempotencyRecord::claimed(key, attempt, now);
                records.insert(key.to_string(), record.clone());
                Ok(Claim::Claimed(record))
            }
            Some(record) if record.is_reclaimable(now, lease) => {
                record.reclaim(attempt, now);
                Ok(Claim::Claimed(record.clone()))
            }
            Some(record) => Ok(Claim::Existing(record.clone())),
        }
    }

    async fn complete(
        &self,
        key: &str,
        attempt: Uuid,
        result: serde_json::Value,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        self.transition(key, attempt, |record| {
            record.status = RecordStatus::Completed;
            record.result = Some(result);
            record.error = None;
            record.completed_at = Some(now);
        })
    }

    async fn fail(
        &self,
        key: &str,
        attempt: Uuid,
        message: &str,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        self.transition(key, attempt, |record| {
            record.status = RecordStatus::Failed;
            record.error = Some(message.to_string());
            record.completed_at = Some(now);
        })
    }

    async fn get(&self, key: &str) -> Result<Option<IdempotencyRecord>> {
        Ok(lock(&self.records)?.get(key).cloned())
    }

    async fn purge_resolved_before(&self, cutoff: DateTime<Utc>) -> Result<usize> {
        let mut records = lock(&self.records)?;
        let before = records.len();
        records.retain(|_, record| match record.completed_at {
            Some(at) if record.status != RecordStatus::InProgress => at >= cutoff,
            _ => true,
        });
        Ok(before - records.len())
    }
}

/// Summary documents held in a process-local map, ordered by id
#[derive(Default)]
pub struct MemoryDocumentStore {
    docs: RwLock<BTreeMap<String, SummaryDocument>>,
}

impl MemoryDocumentStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl DocumentStore for MemoryDocumentStore {
    async fn upsert(&self, doc: SummaryDocument) -> Result<()> {
        let mut docs = self.docs.write().map_err(|e| Error::storage(e.to_string()))?;
        docs.insert(doc.id.clone(), doc);
        Ok(())
    }

    async fn get(&self, id: &str) -> Result<Option<SummaryDocument>> {
        let docs = self.docs.read().map_err(|e| Error::storage(e.to_string()))?;
        Ok(docs.get(id).cloned())
    }

    async fn touch(&self, id: &str, now: DateTime<Utc>) -> Result<bool> {
        let mut docs = self.docs.write().map_err(|e| Error::storage(e.to_string()))?;
        match docs.get_mut(id) {
            Some(doc) => {
                doc.mark_accessed(now);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn delete(&self, ids: &[String]) -> Result<usize> {
        let mut docs = self.docs.write().map_err(|e| Error::storage(e.to_string()))?;
        Ok(ids.iter().filter(|id| docs.remove(id.as_str()).is_some()).count())
    }

    async fn all_documents(&self) -> Result<Vec<SummaryDocument>> {
        let docs = self.docs.read().map_err(|e| Error::storage(e.to_string()))?;
        Ok(docs.values().cloned().collect())
    }

    async fn len(&self) -> Result<usize> {
        let docs = self.docs.read().map_err(|e| Error::storage(e.to_string()))?;
        Ok(docs.len())
    }
}
