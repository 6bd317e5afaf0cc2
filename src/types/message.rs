use bytes::Bytes;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::types::MessageId;

/// Who authored a message.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Sender {
    /// The human user.
    User,

    /// The assistant.
    Bot,
}

/// Media or structured content carried alongside a message's text.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Attachment {
    /// A generated image.
    Image {
        /// The MIME type of the image data.
        mime: String,

        /// Raw image bytes; base64 encoded when persisted.
        #[serde(with = "base64_bytes")]
        data: Bytes,
    },

    /// A structured result block, e.g. a lookup table rendered as text.
    Structured {
        /// Short title for the block.
        title: String,

        /// Body of the block.
        body: String,
    },
}

/// One message in a conversation.
///
/// The text buffer grows while a reply streams in.  Handlers may replace a
/// directive block within it with enriched content.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Unique identifier of the message.
    pub id: MessageId,

    /// Author of the message.
    pub sender: Sender,

    /// The accumulated text.
    pub text: String,

    /// Attachments produced by handlers.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attachments: Vec<Attachment>,

    /// True when the message was produced by chaining off a handler result
    /// rather than directly from user input.
    #[serde(default)]
    pub follow_up: bool,

    /// Run counter for this message slot; bumped on every regeneration.
    #[serde(default)]
    pub generation: u32,

    /// Creation time of the message.
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

impl Message {
    /// Create a new message with the given sender and text.
    pub fn new(sender: Sender, text: impl Into<String>) -> Self {
        Self {
            id: MessageId::generate(),
            sender,
            text: text.into(),
            attachments: Vec::new(),
            follow_up: false,
            generation: 0,
            created_at: OffsetDateTime::now_utc(),
        }
    }

    /// Create a user message.
    pub fn user(text: impl Into<String>) -> Self {
        Self::new(Sender::User, text)
    }

    /// Create an empty bot message ready to receive a stream.
    pub fn bot() -> Self {
        Self::new(Sender::Bot, String::new())
    }

    /// Mark this message as a follow-up.
    pub fn with_follow_up(mut self, follow_up: bool) -> Self {
        self.follow_up = follow_up;
        self
    }

    /// Returns true if this message was written by the assistant.
    pub fn is_bot(&self) -> bool {
        self.sender == Sender::Bot
    }

    /// Clears text and attachments and starts a new generation of this slot.
    pub fn reset_for_regeneration(&mut self) {
        self.text.clear();
        self.attachments.clear();
        self.generation = self.generation.wrapping_add(1);
    }
}

mod base64_bytes {
    use base64::Engine;
    use base64::engine::general_purpose::STANDARD;
    use bytes::Bytes;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(data: &Bytes, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&STANDARD.encode(data))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Bytes, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        STANDARD
            .decode(s.as_bytes())
            .map(Bytes::from)
            .map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn image_attachment_persists_as_base64() {
        let attachment = Attachment::Image {
            mime: "image/png".to_string(),
            data: Bytes::from_static(b"\x89PNG"),
        };
        let json = serde_json::to_value(&attachment).unwrap();
        assert_eq!(json["type"], "image");
        assert_eq!(json["data"], "iVBORw==");
        let back: Attachment = serde_json::from_value(json).unwrap();
        assert_eq!(back, attachment);
    }

    #[test]
    fn regeneration_clears_and_bumps_generation() {
        let mut message = Message::bot();
        message.text.push_str("hello");
        message.attachments.push(Attachment::Structured {
            title: "t".to_string(),
            body: "b".to_string(),
        });
        message.reset_for_regeneration();
        assert!(message.text.is_empty());
        assert!(message.attachments.is_empty());
        assert_eq!(message.generation, 1);
    }

    #[test]
    fn legacy_records_default_new_fields() {
        let json = serde_json::json!({
            "id": MessageId::generate(),
            "sender": "bot",
            "text": "hi",
            "created_at": "2024-05-01T10:00:00Z",
        });
        let message: Message = serde_json::from_value(json).unwrap();
        assert!(!message.follow_up);
        assert_eq!(message.generation, 0);
        assert!(message.attachments.is_empty());
    }
}
