//! Error types for agent-memory

use thiserror::Error;

/// Result type alias for agent-memory operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in agent-memory
///
/// Absent keys and documents are not errors; lookups return `None` or an
/// empty collection instead.
#[derive(Error, Debug)]
pub enum Error {
    #[error("Storage unavailable: {0}")]
    StorageUnavailable(String),

    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Another caller is currently executing the action for this key.
    #[error("Action '{key}' is already in flight")]
    DuplicateInFlight { key: String },

    /// Waited for an in-flight action until the wait timeout elapsed.
    #[error("Action '{key}' is still in progress")]
    StillInProgress { key: String },

    /// The action body failed. The registry recorded the attempt as failed.
    #[error("Action '{key}' failed: {message}")]
    ActionFailed { key: String, message: String },

    #[error("Action '{key}' was cancelled")]
    Cancelled { key: String },

    #[error("Action '{key}' timed out")]
    ActionTimedOut { key: String },

    #[error("Store is full ({capacity} entries)")]
    StoreFull { capacity: usize },

    #[error("Malformed timestamp on '{id}': {value}")]
    MalformedTimestamp { id: String, value: String },
}

impl Error {
    pub fn storage(msg: impl Into<String>) -> Self {
        Self::StorageUnavailable(msg.into())
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    pub fn invalid_input(msg: impl Into<String>) -> Self {
        Self::InvalidInput(msg.into())
    }

    pub fn action_failed(key: impl Into<String>, message: impl Into<String>) -> Self {
        Self::ActionFailed {
            key: key.into(),
            message: message.into(),
        }
    }

    /// Whether this error comes from the backing store itself.
    ///
    /// These are fatal to the current call and are never retried by this
    /// crate.
    pub fn is_storage_unavailable(&self) -> bool {
        matches!(
            self,
            Error::StorageUnavailable(_) | Error::Sqlite(_) | Error::Io(_)
        )
    }
}
