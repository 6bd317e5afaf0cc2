//! Interactive chat on top of the directive pipeline.
//!
//! This module provides the session controller and a streaming REPL
//! interface. It supports:
//!
//! - Streaming replies with directives dispatched as they complete
//! - Follow-up replies seeded by search results
//! - Cancellation and regeneration of replies
//! - Slash commands for session control
//!
//! # Architecture
//!
//! - [`config`]: CLI argument parsing and configuration
//! - [`session`]: The chat session controller
//! - [`commands`]: Slash command parsing
//! - [`render`]: Terminal output

mod commands;
mod config;
mod render;
mod session;

pub use commands::{ChatCommand, help_text, parse_command};
pub use config::{ChatArgs, ChatConfig, Credentials, ImageSettings};
pub use render::{NullRenderer, PlainTextRenderer, Renderer, describe_event, forward_events};
pub use session::{
    CancelHandle, ChatSession, ChatSessionBuilder, SessionStats, TurnOutcome, TurnReport,
};
