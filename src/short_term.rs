//! Short-term memory: live conversation turns and session state
//!
//! Both kinds live in an [`ExpiringStore`] under their own key prefix and
//! disappear on their own when their TTL runs out.

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;

use crate::error::Result;
use crate::expiring::ExpiringStore;
use crate::message::ConversationTurn;
use crate::storage::EntryBackend;

/// Raw turns of the current conversation
///
/// `save_messages` overwrites the full list. Appending is the caller's job:
/// read, push, write back.
#[derive(Clone)]
pub struct ConversationMemory {
    store: ExpiringStore<Vec<ConversationTurn>>,
    ttl: Duration,
    max_turns: Option<usize>,
}

impl ConversationMemory {
    pub fn new(backend: Arc<dyn EntryBackend>, ttl: Duration) -> Self {
        Self {
            store: ExpiringStore::new(backend),
            ttl,
            max_turns: None,
        }
    }

    /// Keep only the most recent `max_turns` turns on save
    pub fn with_max_turns(mut self, max_turns: Option<usize>) -> Self {
        self.max_turns = max_turns;
        self
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    fn key(conversation_id: &str) -> String {
        format!("conv:{}", conversation_id)
    }

    /// Save with the configured TTL
    pub async fn save_messages(
        &self,
        conversation_id: &str,
        messages: &[ConversationTurn],
    ) -> Result<()> {
        self.save_messages_with_ttl(conversation_id, messages, self.ttl, Utc::now())
            .await
    }

    pub async fn save_messages_with_ttl(
        &self,
        conversation_id: &str,
        messages: &[ConversationTurn],
        ttl: Duration,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let start = match self.max_turns {
            Some(max) => messages.len().saturating_sub(max),
            None => 0,
        };
        let kept = messages[start..].to_vec();

        tracing::debug!(conversation_id, turns = kept.len(), "saving conversation");
        self.store
            .set_at(&Self::key(conversation_id), &kept, ttl, now)
            .await
    }

    /// Turns for a conversation, empty if absent or expired
    pub async fn get_messages(&self, conversation_id: &str) -> Result<Vec<ConversationTurn>> {
        self.get_messages_at(conversation_id, Utc::now()).await
    }

    pub async fn get_messages_at(
        &self,
        conversation_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Vec<ConversationTurn>> {
        Ok(self
            .store
            .get_at(&Self::key(conversation_id), now)
            .await?
            .unwrap_or_default())
    }

    /// Drop a conversation before its TTL runs out
    pub async fn clear(&self, conversation_id: &str) -> Result<()> {
        self.store.delete(&Self::key(conversation_id)).await
    }
}

/// Structured, short-lived state for a user session
///
/// `S` defaults to a free-form JSON object. `load_state` returns
/// `S::default()` when nothing is stored.
pub struct SessionState<S = serde_json::Map<String, serde_json::Value>> {
    store: ExpiringStore<S>,
    ttl: Duration,
}

impl<S> Clone for SessionState<S> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            ttl: self.ttl,
        }
    }
}

impl<S> SessionState<S>
where
    S: Serialize + DeserializeOwned + Default,
{
    pub fn new(backend: Arc<dyn EntryBackend>, ttl: Duration) -> Self {
        Self {
            store: ExpiringStore::new(backend),
            ttl,
        }
    }

    fn key(user_id: &str) -> String {
        format!("user:{}:session", user_id)
    }

    pub async fn save_state(&self, user_id: &str, state: &S) -> Result<()> {
        self.save_state_at(user_id, state, Utc::now()).await
    }

    pub async fn save_state_at(&self, user_id: &str, state: &S, now: DateTime<Utc>) -> Result<()> {
        self.store.set_at(&Self::key(user_id), state, self.ttl, now).await
    }

    pub async fn load_state(&self, user_id: &str) -> Result<S> {
        self.load_state_at(user_id, Utc::now()).await
    }

    pub async fn load_state_at(&self, user_id: &str, now: DateTime<Utc>) -> Result<S> {
        Ok(self
            .store
            .get_at(&Self::key(user_id), now)
            .await?
            .unwrap_or_default())
    }

    pub async fn clear(&self, user_id: &str) -> Result<()> {
        self.store.delete(&Self::key(user_id)).await
    }
}
