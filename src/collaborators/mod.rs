//! Contracts for the external services the pipeline consumes.
//!
//! The core only depends on the traits here.  Concrete implementations are
//! provided where a generic one makes sense: an SSE text backend, a custom
//! search JSON API, simple HTTP image and lookup services, an in-memory
//! workspace, and two conversation stores.

mod backend;
mod image;
mod lookup;
mod sandbox;
mod scripted;
mod search;
mod sse;
mod store;
mod workspace;

pub use backend::{
    ChunkStream, CompletionRequest, HistoryShape, LanguageModel, SseModel, StreamChunk,
};
pub use image::{GeneratedImage, HttpImageService, ImageRequest, ImageService};
pub use lookup::{HttpLookupService, LookupEntry, LookupRequest, LookupResponse, LookupService};
pub use sandbox::Sandbox;
pub use scripted::{ScriptedModel, ScriptedReply};
pub use search::{GoogleSearch, SearchCredentials, SearchResult, SearchService};
pub use sse::process_sse;
pub use store::{ConversationStore, JsonFileStore, MemoryStore};
pub use workspace::{
    EntryKind, MemoryWorkspace, Project, WorkspaceEntry, WorkspaceStore, path_segments, render_tree,
};
