//! Memory system facade
//!
//! Wires short-term memory, long-term memory, the pruner and the idempotency
//! registry over one set of backends.

use chrono::{DateTime, Utc};
use std::sync::Arc;

use crate::config::Config;
use crate::error::Result;
use crate::long_term::{LongTermMemory, PromotionOutcome, RelevanceGate, Summarizer};
use crate::pruning::{PruneReport, PruningScheduler};
use crate::registry::IdempotencyRegistry;
use crate::short_term::{ConversationMemory, SessionState};
use crate::storage::{
    DocumentStore, EntryBackend, MemoryDocumentStore, MemoryEntryBackend, MemoryRecordBackend,
    RecordBackend, SqliteStorage,
};

/// Outcome of one maintenance run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MaintenanceReport {
    /// `None` when a pruning pass was already running
    pub pruned: Option<PruneReport>,
    pub expired_entries: usize,
    pub purged_records: usize,
}

/// All memory tiers plus the action registry
#[derive(Clone)]
pub struct MemorySystem {
    config: Config,
    entries: Arc<dyn EntryBackend>,
    conversations: ConversationMemory,
    sessions: SessionState,
    long_term: LongTermMemory,
    registry: IdempotencyRegistry,
    pruner: PruningScheduler,
}

impl MemorySystem {
    /// Open a SQLite-backed system under `config.data_dir`
    pub fn open(config: Config) -> Result<Self> {
        config.validate()?;
        config.ensure_dirs()?;

        let storage = Arc::new(SqliteStorage::new(&config)?);
        tracing::info!(path = ?config.sqlite_path(), "opened memory database");

        Ok(Self::assemble(
            config,
            storage.clone(),
            storage.clone(),
            storage,
        ))
    }

    /// A process-local system; nothing survives a restart
    pub fn in_memory(config: Config) -> Result<Self> {
        config.validate()?;

        Ok(Self::assemble(
            config.clone(),
            Arc::new(MemoryEntryBackend::new(config.capacity)),
            Arc::new(MemoryRecordBackend::new()),
            Arc::new(MemoryDocumentStore::new()),
        ))
    }

    fn assemble(
        config: Config,
        entries: Arc<dyn EntryBackend>,
        records: Arc<dyn RecordBackend>,
        documents: Arc<dyn DocumentStore>,
    ) -> Self {
        let conversations = ConversationMemory::new(entries.clone(), config.conversation_ttl())
            .with_max_turns(config.max_conversation_turns);
        let sessions = SessionState::new(entries.clone(), config.session_ttl());
        let long_term = LongTermMemory::new(documents.clone(), RelevanceGate::from_config(&config));
        let registry = IdempotencyRegistry::from_config(records, &config);
        let pruner = PruningScheduler::new(documents, config.prune_cutoff());

        Self {
            config,
            entries,
            conversations,
            sessions,
            long_term,
            registry,
            pruner,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn conversations(&self) -> &ConversationMemory {
        &self.conversations
    }

    pub fn sessions(&self) -> &SessionState {
        &self.sessions
    }

    pub fn long_term(&self) -> &LongTermMemory {
        &self.long_term
    }

    pub fn registry(&self) -> &IdempotencyRegistry {
        &self.registry
    }

    pub fn pruner(&self) -> &PruningScheduler {
        &self.pruner
    }

    /// Promote a finished conversation from short-term memory
    ///
    /// The short-term turns are left alone and expire on their own TTL.
    pub async fn end_conversation(
        &self,
        conversation_id: &str,
        summarizer: &dyn Summarizer,
        now: DateTime<Utc>,
    ) -> Result<PromotionOutcome> {
        let messages = self.conversations.get_messages_at(conversation_id, now).await?;
        self.long_term
            .promote(conversation_id, &messages, summarizer, now)
            .await
    }

    /// Prune old summaries, sweep expired entries and purge old records
    pub async fn run_maintenance(&self, now: DateTime<Utc>) -> Result<MaintenanceReport> {
        let pruned = self.pruner.run_pass(now).await?;
        let expired_entries = self.entries.purge_expired(now).await?;
        let purged_records = self.registry.purge_expired(now).await?;

        let report = MaintenanceReport {
            pruned,
            expired_entries,
            purged_records,
        };
        tracing::info!(?report, "maintenance finished");
        Ok(report)
    }
}
