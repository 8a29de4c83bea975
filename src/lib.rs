//! # Agent Memory
//!
//! Idempotent action coordination and tiered memory for AI agents.
//!
//! ## Architecture
//!
//! The system has four parts over pluggable backends:
//! - **Expiring store** - key-value entries with a per-key TTL
//! - **Idempotency registry** - runs a side-effecting action at most once per key
//! - **Short-term memory** - conversation turns and session state that expire
//! - **Long-term memory** - relevance-gated conversation summaries, pruned by age
//!
//! Every backend has an in-memory and a SQLite implementation.
//!
//! ## Usage
//!
//! ```rust,ignore
//! use agent_memory::{Config, ConversationTurn, MemorySystem, TurnCountSummarizer};
//!
//! let system = MemorySystem::open(Config::default())?;
//!
//! // Charge a card exactly once, even across retries
//! let receipt: String = system
//!     .registry()
//!     .execute("charge:order-42", || async { payments.charge(42).await })
//!     .await?;
//!
//! // Keep the live conversation in short-term memory
//! let mut turns = system.conversations().get_messages(conv_id).await?;
//! turns.push(ConversationTurn::user("Hi, I prefer working in Rust."));
//! system.conversations().save_messages(conv_id, &turns).await?;
//!
//! // Promote it when the conversation ends
//! system.end_conversation(conv_id, &TurnCountSummarizer, Utc::now()).await?;
//!
//! // Periodically prune old summaries and expired entries
//! system.run_maintenance(Utc::now()).await?;
//! ```

pub mod config;
pub mod error;
pub mod expiring;
pub mod long_term;
pub mod message;
pub mod pruning;
pub mod registry;
pub mod short_term;
pub mod storage;
pub mod system;

pub use config::{CapacityPolicy, Config, Eviction, WaitPolicy};
pub use error::{Error, Result};
pub use expiring::ExpiringStore;
pub use long_term::{
    LongTermMemory, PromotionOutcome, RelevanceGate, SkipReason, SummaryDocument, Summarizer,
    TurnCountSummarizer,
};
pub use message::{ConversationTurn, Role};
pub use pruning::{prune_idle, prune_older_than, PruneReport, PruningScheduler};
pub use registry::{ExecuteOptions, IdempotencyRegistry};
pub use short_term::{ConversationMemory, SessionState};
pub use storage::{IdempotencyRecord, RecordStatus};
pub use system::{MaintenanceReport, MemorySystem};
