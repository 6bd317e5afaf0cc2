//! Directive handlers and the registry that maps each kind to its handler.
//!
//! Handlers are independent: each runs on its own task, may run concurrently
//! with handlers of other kinds, and never assumes another has run.  A handler
//! reports what to do with the directive's block through [`SpliceMode`]; the
//! dispatcher applies it against the latest message text.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use tokio::sync::broadcast;

use crate::chat::{Credentials, ImageSettings};
use crate::types::{Attachment, Directive, DirectiveKind, UiEvent, UiMode};
use crate::{Error, Result};

mod image;
mod lookup;
mod mode;
mod search;
mod workspace;

pub use image::ImageHandler;
pub use lookup::LookupHandler;
pub use mode::ModeSwitchHandler;
pub use search::{SEARCH_LIMIT_NOTICE, SearchHandler};
pub use workspace::{WorkspaceAction, WorkspaceHandler};

/// How a handler's result is merged into the message text.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
pub enum SpliceMode {
    /// Keep the block and append the text to the end of the message.
    #[default]
    Append,

    /// Replace the block with the text.
    ReplaceBlock,

    /// Remove the block and append the text, if any.
    StripBlock,

    /// Keep the block for later re-display; append the text, if any.
    Leave,
}

/// The result of a successful handler run.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct HandlerOutput {
    /// Text to splice into the message.
    pub text: String,

    /// How to splice it.
    pub splice: SpliceMode,

    /// Attachment to add to the message.
    pub attachment: Option<Attachment>,

    /// Prompt for an automatic follow-up call.
    pub follow_up: Option<String>,
}

impl HandlerOutput {
    /// Append `text` after the message.
    pub fn append(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            splice: SpliceMode::Append,
            ..Self::default()
        }
    }

    /// Replace the block with `text`.
    pub fn replace(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            splice: SpliceMode::ReplaceBlock,
            ..Self::default()
        }
    }

    /// Remove the block.
    pub fn strip() -> Self {
        Self {
            splice: SpliceMode::StripBlock,
            ..Self::default()
        }
    }

    /// Leave the text untouched.
    pub fn leave() -> Self {
        Self {
            splice: SpliceMode::Leave,
            ..Self::default()
        }
    }

    /// Attach content to the message.
    pub fn with_attachment(mut self, attachment: Attachment) -> Self {
        self.attachment = Some(attachment);
        self
    }

    /// Request a follow-up call seeded with `prompt`.
    pub fn with_follow_up(mut self, prompt: impl Into<String>) -> Self {
        self.follow_up = Some(prompt.into());
        self
    }
}

/// An async handler for one directive kind.
#[async_trait::async_trait]
pub trait DirectiveHandler: Send + Sync {
    /// The kind this handler serves.
    fn kind(&self) -> DirectiveKind;

    /// Perform the directive's side effect.
    async fn handle(&self, directive: &Directive, context: &SessionContext)
    -> Result<HandlerOutput>;
}

/// Map from directive kind to handler.
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: HashMap<DirectiveKind, Arc<dyn DirectiveHandler>>,
}

impl HandlerRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` for its kind, replacing any earlier one.
    pub fn with_handler(mut self, handler: impl DirectiveHandler + 'static) -> Self {
        self.handlers.insert(handler.kind(), Arc::new(handler));
        self
    }

    /// The handler for `kind`.
    pub fn get(&self, kind: DirectiveKind) -> Option<Arc<dyn DirectiveHandler>> {
        self.handlers.get(&kind).cloned()
    }

    /// Registered kinds in scan order.
    pub fn kinds(&self) -> Vec<DirectiveKind> {
        DirectiveKind::ALL
            .into_iter()
            .filter(|kind| self.handlers.contains_key(kind))
            .collect()
    }
}

impl std::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("kinds", &self.kinds())
            .finish()
    }
}

/// The per-turn search counter.
///
/// Monotonically increases until it reaches the cap; reset exactly once per
/// user-initiated turn.
#[derive(Debug)]
pub struct SearchBudget {
    used: AtomicU32,
    cap: u32,
}

impl SearchBudget {
    /// A fresh budget allowing `cap` searches.
    pub fn new(cap: u32) -> Self {
        Self {
            used: AtomicU32::new(0),
            cap,
        }
    }

    /// Take one search from the budget, returning the new count.
    ///
    /// Fails with the count unchanged once the cap is reached.
    pub fn try_acquire(&self) -> std::result::Result<u32, u32> {
        self.used
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |used| {
                (used < self.cap).then_some(used + 1)
            })
            .map(|previous| previous + 1)
    }

    /// Searches used this turn.
    pub fn used(&self) -> u32 {
        self.used.load(Ordering::Acquire)
    }

    /// The cap.
    pub fn cap(&self) -> u32 {
        self.cap
    }

    /// Start a new turn.
    pub fn reset(&self) {
        self.used.store(0, Ordering::Release);
    }
}

/// State and settings shared by the handlers of one session.
#[derive(Debug)]
pub struct SessionContext {
    /// Credentials for collaborators.
    pub credentials: Credentials,

    /// The per-turn search budget.
    pub search_budget: SearchBudget,

    /// Number of search results to format.
    pub search_results: usize,

    /// Image synthesis settings.
    pub image: ImageSettings,

    /// The workspace project that workspace directives operate on.
    pub project: String,

    workspace_mode: AtomicBool,
    events: broadcast::Sender<UiEvent>,
}

impl SessionContext {
    /// Create a context in chat mode.
    pub fn new(
        credentials: Credentials,
        search_cap: u32,
        search_results: usize,
        image: ImageSettings,
        project: impl Into<String>,
    ) -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            credentials,
            search_budget: SearchBudget::new(search_cap),
            search_results,
            image,
            project: project.into(),
            workspace_mode: AtomicBool::new(false),
            events,
        }
    }

    /// The current UI mode.
    pub fn ui_mode(&self) -> UiMode {
        if self.workspace_mode.load(Ordering::Acquire) {
            UiMode::Workspace
        } else {
            UiMode::Chat
        }
    }

    /// Set the UI mode, returning true if it changed.
    pub fn set_ui_mode(&self, mode: UiMode) -> bool {
        let workspace = mode == UiMode::Workspace;
        self.workspace_mode.swap(workspace, Ordering::AcqRel) != workspace
    }

    /// Subscribe to UI notifications.
    pub fn subscribe(&self) -> broadcast::Receiver<UiEvent> {
        self.events.subscribe()
    }

    /// Notify the UI.  Having no subscribers is not an error.
    pub fn emit(&self, event: UiEvent) {
        let _ = self.events.send(event);
    }
}

/// Render a handler failure as an inline annotation.
pub fn format_inline_error(kind: DirectiveKind, err: &Error) -> String {
    match err {
        Error::MissingCredentials { message, .. } => {
            format!("\n\n> {} is not configured: {message}", kind.label())
        }
        _ => format!("\n\n> {} failed: {err}", kind.label()),
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use std::sync::atomic::AtomicUsize;

    use super::*;
    use crate::collaborators::{SearchCredentials, SearchResult, SearchService};

    /// A search service returning canned results and counting calls.
    #[derive(Debug, Default)]
    pub struct FixedSearch {
        pub results: Vec<SearchResult>,
        pub calls: AtomicUsize,
        pub queries: std::sync::Mutex<Vec<String>>,
    }

    impl FixedSearch {
        pub fn with_results(count: usize) -> Self {
            Self {
                results: (1..=count)
                    .map(|i| SearchResult {
                        title: format!("Result {i}"),
                        snippet: format!("Snippet {i}"),
                        source_domain: format!("site{i}.example"),
                    })
                    .collect(),
                ..Self::default()
            }
        }

        pub fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait::async_trait]
    impl SearchService for FixedSearch {
        async fn search(
            &self,
            query: &str,
            _: &SearchCredentials,
            limit: usize,
        ) -> Result<Vec<SearchResult>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.queries.lock().unwrap().push(query.to_string());
            Ok(self.results.iter().take(limit).cloned().collect())
        }
    }

    pub fn context() -> SessionContext {
        SessionContext::new(
            Credentials {
                search_key: Some("key".to_string()),
                search_engine_id: Some("cx".to_string()),
                lookup_token: Some("token".to_string()),
                ..Credentials::default()
            },
            10,
            5,
            ImageSettings::default(),
            "demo",
        )
    }

    pub fn directive(kind: DirectiveKind, inner: &str) -> Directive {
        let buffer = format!("{}{inner}{}", kind.start_marker(), kind.end_marker());
        crate::grammar::extract_first(&buffer, kind).expect("well-formed directive")
    }
}
