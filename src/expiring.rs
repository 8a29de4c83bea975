//! Typed key-value store with per-key TTL

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;

use crate::error::{Error, Result};
use crate::storage::{Entry, EntryBackend};

/// Key-value store where every entry carries its own expiry
///
/// Expiry is checked at read time: a read at or after `expires_at` behaves as
/// absent and deletes the entry. Several typed stores may share one backend
/// as long as their keys do not collide.
pub struct ExpiringStore<V> {
    backend: Arc<dyn EntryBackend>,
    _value: PhantomData<fn() -> V>,
}

impl<V> Clone for ExpiringStore<V> {
    fn clone(&self) -> Self {
        Self {
            backend: self.backend.clone(),
            _value: PhantomData,
        }
    }
}

impl<V> ExpiringStore<V>
where
    V: Serialize + DeserializeOwned,
{
    pub fn new(backend: Arc<dyn EntryBackend>) -> Self {
        Self {
            backend,
            _value: PhantomData,
        }
    }

    /// Store `value` under `key` for `ttl`, replacing any previous value
    pub async fn set(&self, key: &str, value: &V, ttl: Duration) -> Result<()> {
        self.set_at(key, value, ttl, Utc::now()).await
    }

    pub async fn set_at(
        &self,
        key: &str,
        value: &V,
        ttl: Duration,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let ttl = chrono::Duration::from_std(ttl)
            .map_err(|e| Error::invalid_input(format!("TTL out of range: {}", e)))?;
        let expires_at = now
            .checked_add_signed(ttl)
            .ok_or_else(|| Error::invalid_input("TTL overflows the clock"))?;

        let entry = Entry {
            key: key.to_string(),
            value: serde_json::to_vec(value)?,
            expires_at,
        };
        self.backend.set(entry, now).await
    }

    /// Read a live value
    pub async fn get(&self, key: &str) -> Result<Option<V>> {
        self.get_at(key, Utc::now()).await
    }

    pub async fn get_at(&self, key: &str, now: DateTime<Utc>) -> Result<Option<V>> {
        match self.backend.get(key, now).await? {
            Some(entry) => Ok(Some(serde_json::from_slice(&entry.value)?)),
            None => Ok(None),
        }
    }

    pub async fn delete(&self, key: &str) -> Result<()> {
        self.backend.delete(key).await
    }

    /// Sweep expired entries from the shared backend
    pub async fn purge_expired(&self) -> Result<usize> {
        self.purge_expired_at(Utc::now()).await
    }

    pub async fn purge_expired_at(&self, now: DateTime<Utc>) -> Result<usize> {
        let removed = self.backend.purge_expired(now).await?;
        if removed > 0 {
            tracing::debug!(removed, "swept expired entries");
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CapacityPolicy;
    use crate::storage::{MemoryEntryBackend, SqliteStorage};
    use serde::Deserialize;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Step {
        name: String,
        index: u32,
    }

    fn stores() -> Vec<ExpiringStore<Step>> {
        vec![
            ExpiringStore::new(Arc::new(MemoryEntryBackend::unbounded())),
            ExpiringStore::new(Arc::new(
                SqliteStorage::open_in_memory(CapacityPolicy::Unbounded).unwrap(),
            )),
        ]
    }

    fn step() -> Step {
        Step {
            name: "collect-email".into(),
            index: 2,
        }
    }

    #[tokio::test]
    async fn value_is_visible_before_ttl_and_absent_after() {
        let now = Utc::now();
        for store in stores() {
            store
                .set_at("wf", &step(), Duration::from_secs(1), now)
                .await
                .unwrap();

            let before = store
                .get_at("wf", now + chrono::Duration::milliseconds(500))
                .await
                .unwrap();
            assert_eq!(before, Some(step()));

            let after = store
                .get_at("wf", now + chrono::Duration::seconds(2))
                .await
                .unwrap();
            assert_eq!(after, None);
        }
    }

    #[tokio::test]
    async fn set_replaces_value_and_expiry() {
        let now = Utc::now();
        for store in stores() {
            store
                .set_at("wf", &step(), Duration::from_secs(1), now)
                .await
                .unwrap();
            let replacement = Step {
                name: "confirm".into(),
                index: 3,
            };
            store
                .set_at("wf", &replacement, Duration::from_secs(60), now)
                .await
                .unwrap();

            let later = store
                .get_at("wf", now + chrono::Duration::seconds(30))
                .await
                .unwrap();
            assert_eq!(later, Some(replacement));
        }
    }

    #[tokio::test]
    async fn delete_and_missing_keys_read_as_absent() {
        for store in stores() {
            assert_eq!(store.get("missing").await.unwrap(), None);

            store.set("wf", &step(), Duration::from_secs(60)).await.unwrap();
            store.delete("wf").await.unwrap();
            assert_eq!(store.get("wf").await.unwrap(), None);
        }
    }

    #[tokio::test]
    async fn sweep_leaves_refreshed_keys() {
        let now = Utc::now();
        for store in stores() {
            store
                .set_at("stale", &step(), Duration::from_secs(1), now)
                .await
                .unwrap();
            store
                .set_at("fresh", &step(), Duration::from_secs(1), now)
                .await
                .unwrap();
            let later = now + chrono::Duration::seconds(5);
            store
                .set_at("fresh", &step(), Duration::from_secs(60), later)
                .await
                .unwrap();

            assert_eq!(store.purge_expired_at(later).await.unwrap(), 1);
            assert!(store.get_at("fresh", later).await.unwrap().is_some());
        }
    }
}
