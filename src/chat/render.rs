//! Output rendering for the chat application.
//!
//! This module provides a trait-based rendering abstraction that allows
//! for different output styles. The default implementation writes to stdout
//! and optionally uses ANSI escape codes to set notices apart from replies.

use std::io::{self, Stdout, Write};

use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tracing::warn;

use crate::types::{UiEvent, UiMode};

/// ANSI escape code for dim text (used for follow-up markers).
const ANSI_DIM: &str = "\x1b[2m";

/// ANSI escape code to reset all styling.
const ANSI_RESET: &str = "\x1b[0m";

/// ANSI escape code for cyan text (used for UI events).
const ANSI_CYAN: &str = "\x1b[36m";

/// ANSI escape code for red text (used for errors).
const ANSI_RED: &str = "\x1b[31m";

/// Trait for rendering chat output.
///
/// Every method but the text sinks has an empty default, so a renderer only
/// implements what it shows.
pub trait Renderer: Send {
    /// Called before a bot message starts streaming.
    fn start_message(&mut self, follow_up: bool) {
        _ = follow_up;
    }

    /// Print a chunk of streamed text.
    fn print_text(&mut self, text: &str);

    /// The backend resent the whole message text.
    fn print_snapshot(&mut self, text: &str);

    /// Called when a bot message finished streaming.
    fn finish_message(&mut self) {}

    /// Print an error message.
    fn print_error(&mut self, error: &str) {
        _ = error;
    }

    /// Print an informational message.
    fn print_info(&mut self, info: &str) {
        _ = info;
    }

    /// Print a notification emitted by a handler.
    fn print_event(&mut self, event: &UiEvent) {
        _ = event;
    }
}

/// A renderer that discards everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullRenderer;

impl Renderer for NullRenderer {
    fn print_text(&mut self, _: &str) {}

    fn print_snapshot(&mut self, _: &str) {}
}

/// Describe a UI event for a terminal.
pub fn describe_event(event: &UiEvent) -> String {
    match event {
        UiEvent::WorkspaceReload => "[workspace updated]".to_string(),
        UiEvent::ModeChanged(UiMode::Chat) => "[mode: chat]".to_string(),
        UiEvent::ModeChanged(UiMode::Workspace) => "[mode: workspace]".to_string(),
        UiEvent::OpenFile { name, .. } => format!("[open file: {name}]"),
        UiEvent::OpenMedia { name, .. } => format!("[open media: {name}]"),
    }
}

/// Print every UI event from `events` until the session goes away.
///
/// Events dropped because the renderer fell behind are logged and skipped.
pub async fn forward_events(mut events: broadcast::Receiver<UiEvent>, renderer: &mut dyn Renderer) {
    loop {
        match events.recv().await {
            Ok(event) => renderer.print_event(&event),
            Err(RecvError::Lagged(missed)) => {
                warn!(missed, "ui events dropped; renderer fell behind");
            }
            Err(RecvError::Closed) => break,
        }
    }
}

// What to print to bring a terminal showing `printed` up to `snapshot`.
fn snapshot_suffix<'a>(printed: &str, snapshot: &'a str) -> (bool, &'a str) {
    match snapshot.strip_prefix(printed) {
        Some(rest) => (false, rest),
        None => (true, snapshot),
    }
}

/// Plain text renderer with optional ANSI styling.
pub struct PlainTextRenderer {
    stdout: Stdout,
    use_color: bool,
    printed: String,
}

impl PlainTextRenderer {
    /// Creates a new PlainTextRenderer with ANSI colors enabled.
    pub fn new() -> Self {
        Self::with_color(true)
    }

    /// Creates a new PlainTextRenderer with specified color setting.
    pub fn with_color(use_color: bool) -> Self {
        Self {
            stdout: io::stdout(),
            use_color,
            printed: String::new(),
        }
    }

    /// Flushes stdout to ensure immediate display of streamed content.
    fn flush(&mut self) {
        let _ = self.stdout.flush();
    }
}

impl Default for PlainTextRenderer {
    fn default() -> Self {
        Self::new()
    }
}

impl Renderer for PlainTextRenderer {
    fn start_message(&mut self, follow_up: bool) {
        self.printed.clear();
        if follow_up {
            if self.use_color {
                println!("{ANSI_DIM}[follow-up]{ANSI_RESET}");
            } else {
                println!("[follow-up]");
            }
        }
    }

    fn print_text(&mut self, text: &str) {
        self.printed.push_str(text);
        print!("{text}");
        self.flush();
    }

    fn print_snapshot(&mut self, text: &str) {
        let (rewritten, suffix) = snapshot_suffix(&self.printed, text);
        if rewritten {
            println!();
        }
        print!("{suffix}");
        self.printed = text.to_string();
        self.flush();
    }

    fn finish_message(&mut self) {
        println!();
        self.flush();
    }

    fn print_error(&mut self, error: &str) {
        if self.use_color {
            eprintln!("{ANSI_RED}Error: {error}{ANSI_RESET}");
        } else {
            eprintln!("Error: {error}");
        }
    }

    fn print_info(&mut self, info: &str) {
        println!("{info}");
    }

    fn print_event(&mut self, event: &UiEvent) {
        let line = describe_event(event);
        if self.use_color {
            println!("{ANSI_CYAN}{line}{ANSI_RESET}");
        } else {
            println!("{line}");
        }
        self.flush();
    }
}
