//! Configuration for agent-memory

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{Error, Result};

/// Upper bound for `prune_cutoff_days` (about a century)
pub const MAX_RETENTION_DAYS: i64 = 36_500;

/// Upper bound for every duration given in seconds
pub const MAX_DURATION_SECS: u64 = MAX_RETENTION_DAYS as u64 * 86_400;

fn secs_to_duration(secs: u64) -> chrono::Duration {
    i64::try_from(secs)
        .ok()
        .and_then(chrono::Duration::try_seconds)
        .unwrap_or(chrono::Duration::MAX)
}

/// Capacity policy for expiring stores
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CapacityPolicy {
    /// No limit on live entries
    Unbounded,

    /// At most `max_entries` live entries
    Bounded {
        max_entries: usize,
        #[serde(default)]
        eviction: Eviction,
    },
}

/// What a bounded store does when a new key arrives and it is full
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Eviction {
    /// Evict the least recently used live entry
    #[default]
    Lru,

    /// Refuse the write with `StoreFull`
    Reject,
}

impl CapacityPolicy {
    pub fn max_entries(&self) -> Option<usize> {
        match self {
            CapacityPolicy::Unbounded => None,
            CapacityPolicy::Bounded { max_entries, .. } => Some(*max_entries),
        }
    }
}

/// What a caller sees when its idempotency key is already in flight
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum WaitPolicy {
    /// Block until the in-flight action resolves, up to `timeout_ms`
    Block { timeout_ms: u64 },

    /// Return `DuplicateInFlight` immediately
    Reject,
}

impl Default for WaitPolicy {
    fn default() -> Self {
        WaitPolicy::Block { timeout_ms: 30_000 }
    }
}

/// Configuration for the memory system
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Base directory for all storage
    pub data_dir: PathBuf,

    /// TTL for raw conversation turns in short-term memory
    pub conversation_ttl_secs: u64,

    /// TTL for structured session state
    pub session_ttl_secs: u64,

    /// Keep only the most recent N turns when saving a conversation
    pub max_conversation_turns: Option<usize>,

    /// Capacity policy for the short-term store
    pub capacity: CapacityPolicy,

    /// Summaries with fewer words are not promoted
    pub min_summary_words: usize,

    /// Conversations with fewer turns are not promoted
    pub min_turn_count: usize,

    /// Summaries older than this are pruned
    pub prune_cutoff_days: i64,

    /// How long resolved idempotency records are kept
    pub registry_retention_secs: u64,

    /// Behaviour when an idempotency key is already in flight
    pub registry_wait: WaitPolicy,

    /// An in-progress record older than this may be reclaimed by a new
    /// attempt. `None` means in-progress records never go stale.
    pub registry_lease_secs: Option<u64>,

    /// Interval between maintenance passes in the maintenance binary
    pub maintenance_interval_secs: u64,
}

impl Default for Config {
    fn default() -> Self {
        let data_dir = dirs::data_local_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("agent-memory");

        Self {
            data_dir,
            conversation_ttl_secs: 3600,
            session_ttl_secs: 86_400,
            max_conversation_turns: None,
            capacity: CapacityPolicy::Unbounded,
            min_summary_words: 10,
            min_turn_count: 3,
            prune_cutoff_days: 90,
            registry_retention_secs: 7 * 86_400,
            registry_wait: WaitPolicy::default(),
            registry_lease_secs: None,
            maintenance_interval_secs: 3600,
        }
    }
}

impl Config {
    /// Create a new config with a custom data directory
    pub fn with_data_dir(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            ..Default::default()
        }
    }

    /// Parse a TOML document. Missing fields take their defaults.
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let config: Config =
            toml::from_str(raw).map_err(|e| Error::config(format!("invalid config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Load a TOML config file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path.as_ref())?;
        Self::from_toml_str(&raw)
    }

    /// Reject settings that would make the stores unusable
    pub fn validate(&self) -> Result<()> {
        if self.conversation_ttl_secs == 0 || self.session_ttl_secs == 0 {
            return Err(Error::config("TTLs must be greater than zero"));
        }
        if self.capacity.max_entries() == Some(0) {
            return Err(Error::config("bounded capacity must allow at least one entry"));
        }
        if self.registry_wait == (WaitPolicy::Block { timeout_ms: 0 }) {
            return Err(Error::config("registry wait timeout must be greater than zero"));
        }
        if !(0..=MAX_RETENTION_DAYS).contains(&self.prune_cutoff_days) {
            return Err(Error::config(format!(
                "prune cutoff must be between 0 and {} days",
                MAX_RETENTION_DAYS
            )));
        }
        let durations = [
            Some(self.conversation_ttl_secs),
            Some(self.session_ttl_secs),
            Some(self.registry_retention_secs),
            self.registry_lease_secs,
            Some(self.maintenance_interval_secs),
        ];
        if durations.into_iter().flatten().any(|secs| secs > MAX_DURATION_SECS) {
            return Err(Error::config(format!(
                "durations may not exceed {} seconds",
                MAX_DURATION_SECS
            )));
        }
        if self.maintenance_interval_secs == 0 {
            return Err(Error::config("maintenance interval must be greater than zero"));
        }
        Ok(())
    }

    /// Get the path to the SQLite database
    pub fn sqlite_path(&self) -> PathBuf {
        self.data_dir.join("memory.db")
    }

    /// Ensure all required directories exist
    pub fn ensure_dirs(&self) -> std::io::Result<()> {
        std::fs::create_dir_all(&self.data_dir)
    }

    pub fn conversation_ttl(&self) -> Duration {
        Duration::from_secs(self.conversation_ttl_secs)
    }

    pub fn session_ttl(&self) -> Duration {
        Duration::from_secs(self.session_ttl_secs)
    }

    /// Saturates at `chrono::Duration::MAX` for values `validate` rejects
    pub fn prune_cutoff(&self) -> chrono::Duration {
        chrono::Duration::try_days(self.prune_cutoff_days).unwrap_or(chrono::Duration::MAX)
    }

    pub fn registry_retention(&self) -> chrono::Duration {
        secs_to_duration(self.registry_retention_secs)
    }

    pub fn registry_lease(&self) -> Option<chrono::Duration> {
        self.registry_lease_secs.map(secs_to_duration)
    }

    pub fn maintenance_interval(&self) -> Duration {
        Duration::from_secs(self.maintenance_interval_secs)
    }
}
