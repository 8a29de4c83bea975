//! Conversation turn types for short-term memory

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Role of a message sender
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Role::System => write!(f, "system"),
            Role::User => write!(f, "user"),
            Role::Assistant => write!(f, "assistant"),
        }
    }
}

/// A single turn in a conversation. Immutable once appended.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationTurn {
    /// Role of the sender
    pub role: Role,

    /// Turn content
    pub content: String,

    /// When the turn was created
    pub timestamp: DateTime<Utc>,
}

impl ConversationTurn {
    /// Create a new turn stamped with the current time
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self::at(role, content, Utc::now())
    }

    /// Create a turn with an explicit timestamp
    pub fn at(role: Role, content: impl Into<String>, timestamp: DateTime<Utc>) -> Self {
        Self {
            role,
            content: content.into(),
            timestamp,
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content)
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new(Role::System, content)
    }
}
