//! Long-term memory: relevance-gated conversation summaries
//!
//! Only summaries are kept long-term, never full transcripts. Each
//! conversation maps to exactly one document whose id is derived from the
//! conversation id, so promoting the same conversation again replaces the
//! earlier summary instead of adding a second one.

use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use sha2::{Digest, Sha256};
use std::sync::Arc;

use crate::config::Config;
use crate::error::Result;
use crate::message::{ConversationTurn, Role};
use crate::storage::DocumentStore;

/// Metadata key holding the RFC 3339 creation time
pub const CREATED_AT: &str = "created_at";
/// Metadata key holding the RFC 3339 time of the last recorded access
pub const LAST_ACCESSED_AT: &str = "last_accessed_at";
/// Metadata key counting recorded accesses
pub const ACCESS_COUNT: &str = "access_count";

const DOCUMENT_TYPE: &str = "conversation_summary";

/// A summary stored in long-term memory
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SummaryDocument {
    /// Content-addressed id, see [`summary_id`]
    pub id: String,

    pub content: String,

    /// Free-form metadata. `created_at` is kept as a string so that a
    /// malformed value can be detected and retained rather than rejected.
    pub metadata: Map<String, Value>,
}

impl SummaryDocument {
    pub fn new(
        id: impl Into<String>,
        content: impl Into<String>,
        metadata: Map<String, Value>,
    ) -> Self {
        Self {
            id: id.into(),
            content: content.into(),
            metadata,
        }
    }

    pub fn conversation_id(&self) -> Option<&str> {
        self.metadata.get("conversation_id").and_then(Value::as_str)
    }

    pub fn turn_count(&self) -> Option<u64> {
        self.metadata.get("turn_count").and_then(Value::as_u64)
    }

    pub fn access_count(&self) -> u64 {
        self.metadata
            .get(ACCESS_COUNT)
            .and_then(Value::as_u64)
            .unwrap_or(0)
    }

    /// Stamp `last_accessed_at` and bump `access_count`
    pub fn mark_accessed(&mut self, now: DateTime<Utc>) {
        let count = self.access_count() + 1;
        self.metadata
            .insert(LAST_ACCESSED_AT.into(), json!(format_timestamp(now)));
        self.metadata.insert(ACCESS_COUNT.into(), json!(count));
    }

    /// Parse a timestamp stored under `field`
    ///
    /// Accepts RFC 3339 and ISO 8601 without an offset, which is read as
    /// UTC. `None` if the field is missing, `Some(Err(raw))` if it is present
    /// but unparsable.
    pub fn timestamp(&self, field: &str) -> Option<std::result::Result<DateTime<Utc>, String>> {
        let raw = self.metadata.get(field)?;
        let parsed = raw.as_str().and_then(parse_timestamp);
        Some(parsed.ok_or_else(|| raw.to_string()))
    }

    pub fn created_at(&self) -> Option<std::result::Result<DateTime<Utc>, String>> {
        self.timestamp(CREATED_AT)
    }
}

fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f")
        .ok()
        .map(|naive| naive.and_utc())
}

/// Timestamps written into document metadata
pub(crate) fn format_timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Deterministic document id for a conversation summary
pub fn summary_id(conversation_id: &str) -> String {
    let digest = Sha256::digest(format!("conv_summary:{}", conversation_id).as_bytes());
    let hash = hex::encode(digest);
    format!("conv_summary-{}", &hash[..32])
}

/// Turns a conversation into a summary string
///
/// Implementations may call out to a model. Closures of the form
/// `Fn(&[ConversationTurn]) -> String` implement this directly.
#[async_trait]
pub trait Summarizer: Send + Sync {
    async fn summarize(&self, messages: &[ConversationTurn]) -> Result<String>;
}

#[async_trait]
impl<F> Summarizer for F
where
    F: Fn(&[ConversationTurn]) -> String + Send + Sync,
{
    async fn summarize(&self, messages: &[ConversationTurn]) -> Result<String> {
        Ok(self(messages))
    }
}

/// Heuristic summarizer reporting how many turns each side took
#[derive(Debug, Clone, Copy, Default)]
pub struct TurnCountSummarizer;

#[async_trait]
impl Summarizer for TurnCountSummarizer {
    async fn summarize(&self, messages: &[ConversationTurn]) -> Result<String> {
        let user = messages.iter().filter(|m| m.role == Role::User).count();
        let assistant = messages.iter().filter(|m| m.role == Role::Assistant).count();
        Ok(format!(
            "Summary of conversation with {} user turns and {} assistant turns.",
            user, assistant
        ))
    }
}

/// Why a promotion was skipped
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkipReason {
    SummaryTooShort { words: usize, min: usize },
    TooFewTurns { turns: usize, min: usize },
}

impl std::fmt::Display for SkipReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SkipReason::SummaryTooShort { words, min } => {
                write!(f, "summary has {} words, need {}", words, min)
            }
            SkipReason::TooFewTurns { turns, min } => {
                write!(f, "conversation has {} turns, need {}", turns, min)
            }
        }
    }
}

/// Decides whether a summary is worth keeping long-term
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RelevanceGate {
    pub min_summary_words: usize,
    pub min_turn_count: usize,
}

impl Default for RelevanceGate {
    fn default() -> Self {
        Self {
            min_summary_words: 10,
            min_turn_count: 3,
        }
    }
}

impl RelevanceGate {
    pub fn from_config(config: &Config) -> Self {
        Self {
            min_summary_words: config.min_summary_words,
            min_turn_count: config.min_turn_count,
        }
    }

    pub fn evaluate(
        &self,
        summary: &str,
        messages: &[ConversationTurn],
    ) -> std::result::Result<(), SkipReason> {
        let words = summary.split_whitespace().count();
        if words < self.min_summary_words {
            return Err(SkipReason::SummaryTooShort {
                words,
                min: self.min_summary_words,
            });
        }

        if messages.len() < self.min_turn_count {
            return Err(SkipReason::TooFewTurns {
                turns: messages.len(),
                min: self.min_turn_count,
            });
        }

        Ok(())
    }
}

/// Result of a promotion attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PromotionOutcome {
    Stored { id: String },
    Skipped(SkipReason),
}

impl PromotionOutcome {
    pub fn is_stored(&self) -> bool {
        matches!(self, PromotionOutcome::Stored { .. })
    }
}

/// Relevance-gated summary store
#[derive(Clone)]
pub struct LongTermMemory {
    store: Arc<dyn DocumentStore>,
    gate: RelevanceGate,
}

impl LongTermMemory {
    pub fn new(store: Arc<dyn DocumentStore>, gate: RelevanceGate) -> Self {
        Self { store, gate }
    }

    pub fn store(&self) -> &Arc<dyn DocumentStore> {
        &self.store
    }

    pub fn gate(&self) -> RelevanceGate {
        self.gate
    }

    /// Summarize a conversation and upsert it if it passes the relevance gate
    pub async fn promote(
        &self,
        conversation_id: &str,
        messages: &[ConversationTurn],
        summarizer: &dyn Summarizer,
        now: DateTime<Utc>,
    ) -> Result<PromotionOutcome> {
        let summary = summarizer.summarize(messages).await?;

        if let Err(reason) = self.gate.evaluate(&summary, messages) {
            tracing::debug!(conversation_id, %reason, "skipping promotion");
            return Ok(PromotionOutcome::Skipped(reason));
        }

        let id = summary_id(conversation_id);
        let mut metadata = Map::new();
        metadata.insert("conversation_id".into(), json!(conversation_id));
        metadata.insert(CREATED_AT.into(), json!(format_timestamp(now)));
        metadata.insert("turn_count".into(), json!(messages.len()));
        metadata.insert("type".into(), json!(DOCUMENT_TYPE));

        self.store
            .upsert(SummaryDocument::new(id.clone(), summary, metadata))
            .await?;

        tracing::debug!(conversation_id, id = %id, "promoted conversation summary");
        Ok(PromotionOutcome::Stored { id })
    }

    /// Summary for a conversation, if one was promoted
    pub async fn document_for(&self, conversation_id: &str) -> Result<Option<SummaryDocument>> {
        self.store.get(&summary_id(conversation_id)).await
    }

    /// Record that a summary was read, for idle-based pruning
    ///
    /// Returns false if the document does not exist.
    pub async fn record_access(&self, id: &str, now: DateTime<Utc>) -> Result<bool> {
        self.store.touch(id, now).await
    }

    pub async fn delete(&self, ids: &[String]) -> Result<usize> {
        self.store.delete(ids).await
    }

    pub async fn all_documents(&self) -> Result<Vec<SummaryDocument>> {
        self.store.all_documents().await
    }
}
