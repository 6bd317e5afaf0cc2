use serde::{Deserialize, Serialize};

use crate::types::{Message, Sender};

/// Role of an entry in the outgoing history.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HistoryRole {
    /// System instruction, for backends that take it inline.
    System,

    /// User role.
    User,

    /// Assistant role.
    Assistant,
}

/// One entry of the history sent to a language-model backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryEntry {
    /// The role of the entry.
    pub role: HistoryRole,

    /// The text content of the entry.
    pub content: String,
}

impl HistoryEntry {
    /// Create a new `HistoryEntry` with the given role and content.
    pub fn new(role: HistoryRole, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }

    /// Create a system entry.
    pub fn system(content: impl Into<String>) -> Self {
        Self::new(HistoryRole::System, content)
    }

    /// Create a user entry.
    pub fn user(content: impl Into<String>) -> Self {
        Self::new(HistoryRole::User, content)
    }

    /// Create an assistant entry.
    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(HistoryRole::Assistant, content)
    }
}

impl From<&Message> for HistoryEntry {
    fn from(message: &Message) -> Self {
        let role = match message.sender {
            Sender::User => HistoryRole::User,
            Sender::Bot => HistoryRole::Assistant,
        };
        Self::new(role, message.text.clone())
    }
}
