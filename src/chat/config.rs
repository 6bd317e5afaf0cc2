//! Configuration types for the chat application.
//!
//! This module provides CLI argument parsing via `arrrg`, the YAML-loadable
//! [`ChatConfig`], and the [`Credentials`] handed to directive handlers.

use std::fmt;
use std::time::Duration;

use arrrg_derive::CommandLine;
use serde::{Deserialize, Serialize};

use crate::collaborators::{HistoryShape, SearchCredentials};
use crate::{Error, Result};

/// Default debounce window before a directive is treated as final.
const DEFAULT_DEBOUNCE_MS: u64 = 1000;

/// Default number of searches allowed per user turn.
const DEFAULT_SEARCH_CAP: u32 = 10;

/// Default number of search results formatted into a reply.
const DEFAULT_SEARCH_RESULTS: usize = 5;

/// Default number of follow-up messages chained off one user turn.
const DEFAULT_FOLLOW_UP_LIMIT: u32 = 12;

/// Default workspace project name.
const DEFAULT_PROJECT: &str = "workspace";

/// Command-line arguments for the directive-chat tool.
#[derive(CommandLine, Debug, Default, PartialEq, Eq)]
pub struct ChatArgs {
    /// YAML configuration file.
    #[arrrg(optional, "YAML configuration file", "PATH")]
    pub config: Option<String>,

    /// System prompt to set context for the conversation.
    #[arrrg(optional, "System prompt for the conversation", "PROMPT")]
    pub system: Option<String>,

    /// Streaming completion endpoint.
    #[arrrg(optional, "SSE completion endpoint", "URL")]
    pub endpoint: Option<String>,

    /// Per-turn search cap.
    #[arrrg(optional, "Searches allowed per turn (default: 10)", "N")]
    pub search_cap: Option<u32>,

    /// Disable ANSI colors and styles.
    #[arrrg(flag, "Disable ANSI colors/styles")]
    pub no_color: bool,

    /// Directory where conversations are persisted as JSON.
    #[arrrg(optional, "Persist conversations under this directory", "DIR")]
    pub transcript_dir: Option<String>,
}

/// Image synthesis settings.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ImageSettings {
    /// Output width in pixels.
    pub width: u32,

    /// Output height in pixels.
    pub height: u32,

    /// Inference steps.
    pub steps: u32,
}

impl Default for ImageSettings {
    fn default() -> Self {
        Self {
            width: 1024,
            height: 1024,
            steps: 4,
        }
    }
}

/// Externally supplied credentials.
///
/// Missing credentials are not a configuration error.  A handler that needs
/// one short-circuits with an instructional message instead.
#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Credentials {
    /// Key for the language-model backend.
    pub api_key: Option<String>,

    /// Key for the search API.
    pub search_key: Option<String>,

    /// Search engine id.
    pub search_engine_id: Option<String>,

    /// Bearer token for lookup services.
    pub lookup_token: Option<String>,

    /// Bearer token for the image service.
    pub image_token: Option<String>,
}

impl Credentials {
    /// Fill every unset credential from its `DIRECTIVE_CHAT_*` environment variable.
    pub fn with_env(self) -> Self {
        self.with_lookup(|name| std::env::var(name).ok())
    }

    fn with_lookup(mut self, lookup: impl Fn(&str) -> Option<String>) -> Self {
        let fill = |slot: &mut Option<String>, name: &str| {
            if slot.is_none() {
                *slot = lookup(name).filter(|v| !v.trim().is_empty());
            }
        };
        fill(&mut self.api_key, "DIRECTIVE_CHAT_API_KEY");
        fill(&mut self.search_key, "DIRECTIVE_CHAT_SEARCH_KEY");
        fill(&mut self.search_engine_id, "DIRECTIVE_CHAT_SEARCH_CX");
        fill(&mut self.lookup_token, "DIRECTIVE_CHAT_LOOKUP_TOKEN");
        fill(&mut self.image_token, "DIRECTIVE_CHAT_IMAGE_TOKEN");
        self
    }

    /// Search credentials, or an instructional error naming what is missing.
    pub fn search(&self) -> Result<SearchCredentials> {
        match (&self.search_key, &self.search_engine_id) {
            (Some(key), Some(engine_id)) => Ok(SearchCredentials {
                key: key.clone(),
                engine_id: engine_id.clone(),
            }),
            (None, _) => Err(Error::missing_credentials(
                "search_key",
                "Web search needs an API key. Set DIRECTIVE_CHAT_SEARCH_KEY or `credentials.search_key` in the config file.",
            )),
            (_, None) => Err(Error::missing_credentials(
                "search_engine_id",
                "Web search needs a search engine id. Set DIRECTIVE_CHAT_SEARCH_CX or `credentials.search_engine_id` in the config file.",
            )),
        }
    }

    /// The lookup token, or an instructional error.
    pub fn lookup(&self) -> Result<&str> {
        self.lookup_token.as_deref().ok_or_else(|| {
            Error::missing_credentials(
                "lookup_token",
                "Lookups need an access token. Set DIRECTIVE_CHAT_LOOKUP_TOKEN or `credentials.lookup_token` in the config file.",
            )
        })
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fn redact(value: &Option<String>) -> &'static str {
            if value.is_some() { "<set>" } else { "<unset>" }
        }
        f.debug_struct("Credentials")
            .field("api_key", &redact(&self.api_key))
            .field("search_key", &redact(&self.search_key))
            .field("search_engine_id", &redact(&self.search_engine_id))
            .field("lookup_token", &redact(&self.lookup_token))
            .field("image_token", &redact(&self.image_token))
            .finish()
    }
}

/// Configuration for a chat session.
///
/// Every field has a default, so a YAML file only needs the values it
/// changes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChatConfig {
    /// Optional system prompt to set conversation context.
    pub system_prompt: Option<String>,

    /// Streaming completion endpoint.
    pub endpoint: Option<String>,

    /// How the backend expects the system prompt.
    pub history_shape: HistoryShape,

    /// Debounce window in milliseconds.
    pub debounce_ms: u64,

    /// Searches allowed per user turn.
    pub search_cap: u32,

    /// Search results formatted per search.
    pub search_results: usize,

    /// Follow-up messages allowed per user turn.
    pub follow_up_limit: u32,

    /// Image synthesis settings.
    pub image: ImageSettings,

    /// Image service endpoint.
    pub image_endpoint: Option<String>,

    /// Lookup service base URL.
    pub lookup_endpoint: Option<String>,

    /// Workspace project that workspace directives operate on.
    pub project: String,

    /// Whether to use ANSI colors and styles in output.
    pub use_color: bool,

    /// Directory where conversations are persisted.
    pub transcript_dir: Option<String>,

    /// Credentials for collaborators.
    pub credentials: Credentials,
}

impl ChatConfig {
    /// Creates a new ChatConfig with default values.
    ///
    /// Defaults:
    /// - Debounce: 1000 ms
    /// - Search cap: 10 per turn, 5 results each
    /// - Follow-up limit: 12 per turn
    /// - Images: 1024x1024, 4 steps
    /// - Color: enabled
    pub fn new() -> Self {
        Self {
            system_prompt: None,
            endpoint: None,
            history_shape: HistoryShape::default(),
            debounce_ms: DEFAULT_DEBOUNCE_MS,
            search_cap: DEFAULT_SEARCH_CAP,
            search_results: DEFAULT_SEARCH_RESULTS,
            follow_up_limit: DEFAULT_FOLLOW_UP_LIMIT,
            image: ImageSettings::default(),
            image_endpoint: None,
            lookup_endpoint: None,
            project: DEFAULT_PROJECT.to_string(),
            use_color: true,
            transcript_dir: None,
            credentials: Credentials::default(),
        }
    }

    /// Load a YAML file, taking defaults for every absent field.
    pub fn from_yaml_file(path: &str) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| Error::io(format!("cannot read config {path}"), e))?;
        Self::from_yaml_str(&text)
    }

    /// Parse a YAML document, taking defaults for every absent field.
    pub fn from_yaml_str(text: &str) -> Result<Self> {
        if text.trim().is_empty() {
            return Ok(Self::new());
        }
        Ok(serde_yaml::from_str(text)?)
    }

    /// Apply command-line overrides on top of this configuration.
    pub fn with_args(mut self, args: ChatArgs) -> Self {
        if let Some(system) = args.system {
            self.system_prompt = Some(system);
        }
        if let Some(endpoint) = args.endpoint {
            self.endpoint = Some(endpoint);
        }
        if let Some(cap) = args.search_cap {
            self.search_cap = cap;
        }
        if args.no_color {
            self.use_color = false;
        }
        if let Some(dir) = args.transcript_dir {
            self.transcript_dir = Some(dir);
        }
        self
    }

    /// The debounce window.
    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }

    /// Sets the system prompt.
    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = Some(prompt.into());
        self
    }

    /// Sets the history shape.
    pub fn with_history_shape(mut self, shape: HistoryShape) -> Self {
        self.history_shape = shape;
        self
    }

    /// Sets the debounce window.
    pub fn with_debounce(mut self, debounce: Duration) -> Self {
        self.debounce_ms = debounce.as_millis() as u64;
        self
    }

    /// Sets the per-turn search cap.
    pub fn with_search_cap(mut self, cap: u32) -> Self {
        self.search_cap = cap;
        self
    }

    /// Sets the number of search results formatted per search.
    pub fn with_search_results(mut self, results: usize) -> Self {
        self.search_results = results;
        self
    }

    /// Sets the per-turn follow-up limit.
    pub fn with_follow_up_limit(mut self, limit: u32) -> Self {
        self.follow_up_limit = limit;
        self
    }

    /// Sets the image settings.
    pub fn with_image(mut self, image: ImageSettings) -> Self {
        self.image = image;
        self
    }

    /// Sets the workspace project name.
    pub fn with_project(mut self, project: impl Into<String>) -> Self {
        self.project = project.into();
        self
    }

    /// Sets the credentials.
    pub fn with_credentials(mut self, credentials: Credentials) -> Self {
        self.credentials = credentials;
        self
    }

    /// Disables ANSI color output.
    pub fn without_color(mut self) -> Self {
        self.use_color = false;
        self
    }
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl From<ChatArgs> for ChatConfig {
    fn from(args: ChatArgs) -> Self {
        ChatConfig::new().with_args(args)
    }
}
