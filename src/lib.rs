// Public modules
pub mod accumulator;
pub mod chat;
pub mod collaborators;
pub mod dispatch;
pub mod error;
pub mod grammar;
pub mod handlers;
pub mod observability;
pub mod types;

// Re-exports
pub use accumulator::{Dispatcher, FollowUp};
pub use chat::{ChatConfig, ChatSession, TurnOutcome, TurnReport};
pub use dispatch::{DispatchState, DispatchTable, Slot};
pub use error::{BackendFailure, Error, Result};
pub use handlers::{DirectiveHandler, HandlerOutput, HandlerRegistry, SessionContext, SpliceMode};
pub use observability::register_biometrics;
pub use types::*;
