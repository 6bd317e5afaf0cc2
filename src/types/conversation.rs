use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::types::{ConversationId, Message, MessageId, Sender};

/// An ordered list of messages plus bookkeeping.
///
/// `revision` increases with every mutation.  Persistence is fire-and-forget,
/// so stores use it to ignore writes that arrive out of order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Conversation {
    /// Unique identifier of the conversation.
    pub id: ConversationId,

    /// Display title, derived from the first user message.
    #[serde(default)]
    pub title: String,

    /// Messages in display order.
    pub messages: Vec<Message>,

    /// Creation time.
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,

    /// Last mutation time.
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,

    /// Monotonic mutation counter.
    #[serde(default)]
    pub revision: u64,
}

impl Conversation {
    /// Create an empty conversation.
    pub fn new() -> Self {
        let now = OffsetDateTime::now_utc();
        Self {
            id: ConversationId::generate(),
            title: String::new(),
            messages: Vec::new(),
            created_at: now,
            updated_at: now,
            revision: 0,
        }
    }

    /// Record that the conversation was mutated.
    pub fn touch(&mut self) {
        self.updated_at = OffsetDateTime::now_utc();
        self.revision += 1;
    }

    /// Append a message, deriving the title from the first user message.
    pub fn push(&mut self, message: Message) {
        if self.title.is_empty() && message.sender == Sender::User {
            self.title = message.text.chars().take(48).collect();
        }
        self.messages.push(message);
        self.touch();
    }

    /// Find a message by id.
    pub fn message(&self, id: MessageId) -> Option<&Message> {
        self.messages.iter().find(|m| m.id == id)
    }

    /// Find a message by id for mutation.
    pub fn message_mut(&mut self, id: MessageId) -> Option<&mut Message> {
        self.messages.iter_mut().find(|m| m.id == id)
    }

    /// Position of a message by id.
    pub fn position(&self, id: MessageId) -> Option<usize> {
        self.messages.iter().position(|m| m.id == id)
    }

    /// Remove a message by id, returning it.
    pub fn remove(&mut self, id: MessageId) -> Option<Message> {
        let index = self.position(id)?;
        let removed = self.messages.remove(index);
        self.touch();
        Some(removed)
    }
}

impl Default for Conversation {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn push_sets_title_and_revision() {
        let mut conversation = Conversation::new();
        conversation.push(Message::bot());
        assert!(conversation.title.is_empty());
        conversation.push(Message::user("What is the weather in Hanoi today?"));
        assert_eq!(conversation.title, "What is the weather in Hanoi today?");
        assert_eq!(conversation.revision, 2);
    }

    #[test]
    fn remove_by_id() {
        let mut conversation = Conversation::new();
        let message = Message::user("hi");
        let id = message.id;
        conversation.push(message);
        assert!(conversation.remove(id).is_some());
        assert!(conversation.remove(id).is_none());
        assert!(conversation.messages.is_empty());
    }
}
