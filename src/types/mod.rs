// Public modules
pub mod conversation;
pub mod directive;
pub mod history_entry;
pub mod ids;
pub mod message;
pub mod ui;

// Re-exports
pub use conversation::Conversation;
pub use directive::{Directive, DirectiveKind};
pub use history_entry::{HistoryEntry, HistoryRole};
pub use ids::{ConversationId, MessageId};
pub use message::{Attachment, Message, Sender};
pub use ui::{UiEvent, UiMode};
