//! The stream accumulator and dispatcher.
//!
//! [`Dispatcher::push_chunk`] appends streamed text to a message and rescans
//! it for complete directive blocks.  Each block that survives its debounce
//! window is handed to the registered handler on a background task; the
//! handler's output is spliced into whatever the message text is *then*, not
//! into the text as it was when the block was seen.
//!
//! All timers and handler invocations are spawned on one [`TaskTracker`], so
//! [`Dispatcher::settle`] can wait for the pipeline to drain.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::FutureExt;
use futures::future::BoxFuture;
use tokio::sync::Mutex;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use crate::collaborators::{ConversationStore, StreamChunk};
use crate::dispatch::{DispatchTable, Observation, Slot};
use crate::grammar;
use crate::handlers::{
    HandlerOutput, HandlerRegistry, SessionContext, SpliceMode, format_inline_error,
};
use crate::observability::{
    DEBOUNCE_RESTARTS, DIRECTIVES_DISPATCHED, DIRECTIVES_DUPLICATE, DIRECTIVES_SEEN,
    HANDLER_DURATION, HANDLER_ERRORS, PERSIST_FAILURES, RESULTS_DISCARDED,
};
use crate::types::{Attachment, Conversation, ConversationId, Directive, DirectiveKind, MessageId};
use crate::Result;

///////////////////////////////////////////// FollowUp ////////////////////////////////////////////

/// A prompt a handler asked to be sent back to the model.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FollowUp {
    /// The slot whose directive produced the request.
    pub slot: Slot,

    /// The kind of the directive.
    pub kind: DirectiveKind,

    /// How the directive's block was merged into the message.
    pub splice: SpliceMode,

    /// The prompt to send.
    pub prompt: String,
}

/////////////////////////////////////////////// Edit //////////////////////////////////////////////

// An applied handler result, replayed when a snapshot chunk rewrites the text.
#[derive(Debug, Clone)]
struct Edit {
    raw: String,
    splice: SpliceMode,
    text: String,
}

impl Edit {
    fn apply(&self, text: &mut String) -> bool {
        match self.splice {
            SpliceMode::ReplaceBlock => match grammar::replace_block(text, &self.raw, &self.text) {
                Some(spliced) => {
                    *text = spliced;
                    true
                }
                None => false,
            },
            SpliceMode::StripBlock => {
                let stripped = grammar::strip_block(text, &self.raw);
                let changed = stripped.is_some();
                if let Some(stripped) = stripped {
                    *text = stripped;
                }
                text.push_str(&self.text);
                changed || !self.text.is_empty()
            }
            SpliceMode::Append | SpliceMode::Leave => {
                text.push_str(&self.text);
                !self.text.is_empty()
            }
        }
    }

    // Like `apply`, but a replacement whose block was rewritten away is
    // appended so the result stays visible.
    fn merge(&self, text: &mut String) {
        if !self.apply(text) && self.splice == SpliceMode::ReplaceBlock {
            text.push_str(&self.text);
        }
    }
}

/////////////////////////////////////////// Dispatcher ////////////////////////////////////////////

struct State {
    conversation: Conversation,
    deleted: bool,
    edits: HashMap<Slot, Vec<Edit>>,
    follow_ups: Vec<FollowUp>,
}

struct Inner {
    state: Mutex<State>,
    table: Mutex<DispatchTable>,
    registry: HandlerRegistry,
    context: Arc<SessionContext>,
    store: Arc<dyn ConversationStore>,
    debounce: Duration,
    tracker: TaskTracker,
    // Serializes load-modify-save of conversations that are no longer active.
    stored: Mutex<()>,
}

/// Owns the conversation being streamed into and the per-slot dispatch state.
///
/// Cloning yields another handle onto the same dispatcher.
#[derive(Clone)]
pub struct Dispatcher {
    inner: Arc<Inner>,
}

impl Dispatcher {
    /// Create a dispatcher over an empty conversation.
    pub fn new(
        registry: HandlerRegistry,
        context: Arc<SessionContext>,
        store: Arc<dyn ConversationStore>,
        debounce: Duration,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(State {
                    conversation: Conversation::new(),
                    deleted: false,
                    edits: HashMap::new(),
                    follow_ups: Vec::new(),
                }),
                table: Mutex::new(DispatchTable::new()),
                registry,
                context,
                store,
                debounce,
                tracker: TaskTracker::new(),
                stored: Mutex::new(()),
            }),
        }
    }

    /// A copy of the latest conversation state.
    pub async fn snapshot(&self) -> Conversation {
        self.inner.state.lock().await.conversation.clone()
    }

    /// Mutate the latest conversation state and persist the result.
    pub async fn commit<R>(&self, mutate: impl FnOnce(&mut Conversation) -> R) -> R {
        let (result, snapshot) = {
            let mut state = self.inner.state.lock().await;
            let result = mutate(&mut state.conversation);
            state.conversation.touch();
            let snapshot = (!state.deleted).then(|| state.conversation.clone());
            (result, snapshot)
        };
        if let Some(snapshot) = snapshot {
            self.inner.persist(snapshot);
        }
        result
    }

    /// Replace the conversation wholesale, forgetting all dispatch state.
    ///
    /// Handlers still in flight for the old conversation find their message
    /// missing and discard their results.
    pub async fn reset(&self, conversation: Conversation) {
        let mut state = self.inner.state.lock().await;
        state.conversation = conversation;
        state.deleted = false;
        state.edits.clear();
        state.follow_ups.clear();
        self.inner.table.lock().await.clear();
    }

    /// Stop persisting the current conversation and drop late results for it.
    pub async fn mark_deleted(&self) {
        self.inner.state.lock().await.deleted = true;
    }

    /// Forget all dispatch state of `message` so a new run starts from idle.
    pub async fn reset_message(&self, message: MessageId) {
        let mut state = self.inner.state.lock().await;
        state.edits.retain(|slot, _| slot.message != message);
        state.follow_ups.retain(|f| f.slot.message != message);
        self.inner.table.lock().await.reset_message(message);
    }

    /// Feed one streamed chunk into `slot`.
    ///
    /// Returns false if the slot's message no longer exists or has been
    /// regenerated; the caller should stop streaming into it.
    pub async fn push_chunk(&self, slot: Slot, chunk: StreamChunk) -> bool {
        let (id, text, snapshot) = {
            let mut state = self.inner.state.lock().await;
            let State {
                conversation,
                deleted,
                edits,
                ..
            } = &mut *state;
            let Some(message) = conversation.message_mut(slot.message) else {
                return false;
            };
            if message.generation != slot.generation {
                return false;
            }
            match chunk {
                StreamChunk::Delta(delta) => message.text.push_str(&delta),
                StreamChunk::Snapshot(full) => {
                    let mut text = full;
                    for edit in edits.get(&slot).into_iter().flatten() {
                        edit.apply(&mut text);
                    }
                    message.text = text;
                }
            }
            let text = message.text.clone();
            conversation.touch();
            let snapshot = (!*deleted).then(|| conversation.clone());
            (conversation.id, text, snapshot)
        };
        if let Some(snapshot) = snapshot {
            self.inner.persist(snapshot);
        }
        self.inner.scan(id, slot, &text).await;
        true
    }

    /// Wait until every pending timer and handler has finished.
    pub async fn settle(&self) {
        self.inner.tracker.close();
        self.inner.tracker.wait().await;
        self.inner.tracker.reopen();
    }

    /// Take the follow-up prompts produced by handlers in `slot`.
    pub async fn take_follow_ups(&self, slot: Slot) -> Vec<FollowUp> {
        let mut state = self.inner.state.lock().await;
        let (taken, kept) = state
            .follow_ups
            .drain(..)
            .partition(|f: &FollowUp| f.slot == slot);
        state.follow_ups = kept;
        taken
    }
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("registry", &self.inner.registry)
            .field("debounce", &self.inner.debounce)
            .finish()
    }
}

impl Inner {
    fn persist(&self, snapshot: Conversation) {
        let store = Arc::clone(&self.store);
        self.tracker.spawn(async move {
            if let Err(err) = store.save(&snapshot).await {
                PERSIST_FAILURES.click();
                warn!(conversation = %snapshot.id, error = %err, "could not persist conversation");
            }
        });
    }

    async fn scan(self: &Arc<Self>, conversation: ConversationId, slot: Slot, text: &str) {
        let mut table = self.table.lock().await;
        for kind in self.registry.kinds() {
            let blocks = grammar::extract_all(text, kind);
            let (observation, duplicates) = table.observe(slot, kind, blocks);
            if duplicates > 0 {
                DIRECTIVES_DUPLICATE.click();
            }
            match observation {
                Observation::Unchanged | Observation::Busy => {}
                Observation::Arm { timer, restarted } => {
                    if restarted {
                        DEBOUNCE_RESTARTS.click();
                        debug!(message = %slot.message, ?kind, timer, "directive rewritten; debounce restarted");
                    } else {
                        DIRECTIVES_SEEN.click();
                        debug!(message = %slot.message, ?kind, timer, "directive seen");
                    }
                    self.tracker
                        .spawn(debounce(Arc::clone(self), conversation, slot, kind, timer));
                }
                Observation::Withdrawn => {
                    debug!(message = %slot.message, ?kind, "pending directive withdrawn");
                }
            }
        }
    }

    async fn rescan(self: &Arc<Self>, conversation: ConversationId, slot: Slot) {
        let text = {
            let state = self.state.lock().await;
            if state.conversation.id != conversation {
                return;
            }
            match state.conversation.message(slot.message) {
                Some(message) if message.generation == slot.generation => message.text.clone(),
                _ => return,
            }
        };
        self.scan(conversation, slot, &text).await;
    }

    async fn apply(
        &self,
        id: ConversationId,
        slot: Slot,
        directive: &Directive,
        result: Result<HandlerOutput>,
    ) {
        let kind = directive.kind;
        let (edit, attachment, follow_up) = match result {
            Ok(output) => (
                Edit {
                    raw: directive.raw.clone(),
                    splice: output.splice,
                    text: output.text,
                },
                output.attachment,
                output.follow_up,
            ),
            Err(err) => {
                HANDLER_ERRORS.click();
                warn!(message = %slot.message, ?kind, error = %err, "directive handler failed");
                let edit = Edit {
                    raw: directive.raw.clone(),
                    splice: SpliceMode::Append,
                    text: format_inline_error(kind, &err),
                };
                (edit, None, None)
            }
        };
        let snapshot = {
            let mut state = self.state.lock().await;
            if state.conversation.id != id {
                drop(state);
                self.apply_stored(id, slot, kind, edit, attachment).await;
                return;
            }
            if state.deleted {
                RESULTS_DISCARDED.click();
                info!(?kind, "conversation deleted; discarding handler result");
                return;
            }
            let State {
                conversation,
                edits,
                follow_ups,
                ..
            } = &mut *state;
            let Some(message) = conversation
                .message_mut(slot.message)
                .filter(|m| m.generation == slot.generation)
            else {
                RESULTS_DISCARDED.click();
                info!(message = %slot.message, ?kind, "message gone or regenerated; discarding handler result");
                return;
            };
            if let Some(attachment) = attachment {
                message.attachments.push(attachment);
            }
            if let Some(prompt) = follow_up {
                follow_ups.push(FollowUp {
                    slot,
                    kind,
                    splice: edit.splice,
                    prompt,
                });
            }
            edit.merge(&mut message.text);
            edits.entry(slot).or_default().push(edit);
            conversation.touch();
            conversation.clone()
        };
        self.persist(snapshot);
    }

    // The session moved on to another conversation; merge into the stored
    // record instead.  Deleted conversations are gone from the store.
    async fn apply_stored(
        &self,
        id: ConversationId,
        slot: Slot,
        kind: DirectiveKind,
        edit: Edit,
        attachment: Option<Attachment>,
    ) {
        let _guard = self.stored.lock().await;
        let mut conversation = match self.store.load(id).await {
            Ok(Some(conversation)) => conversation,
            Ok(None) => {
                RESULTS_DISCARDED.click();
                info!(conversation = %id, ?kind, "conversation deleted; discarding handler result");
                return;
            }
            Err(err) => {
                PERSIST_FAILURES.click();
                warn!(conversation = %id, ?kind, error = %err, "could not load conversation for handler result");
                return;
            }
        };
        let Some(message) = conversation
            .message_mut(slot.message)
            .filter(|m| m.generation == slot.generation)
        else {
            RESULTS_DISCARDED.click();
            info!(conversation = %id, message = %slot.message, ?kind, "message gone or regenerated; discarding handler result");
            return;
        };
        if let Some(attachment) = attachment {
            message.attachments.push(attachment);
        }
        edit.merge(&mut message.text);
        conversation.touch();
        match self.store.save(&conversation).await {
            Ok(true) => {
                debug!(conversation = %id, message = %slot.message, ?kind, "handler result merged into stored conversation");
            }
            Ok(false) => {
                RESULTS_DISCARDED.click();
                info!(conversation = %id, ?kind, "stored conversation changed or was deleted; discarding handler result");
            }
            Err(err) => {
                PERSIST_FAILURES.click();
                warn!(conversation = %id, error = %err, "could not persist conversation");
            }
        }
    }
}

fn debounce(
    inner: Arc<Inner>,
    conversation: ConversationId,
    slot: Slot,
    kind: DirectiveKind,
    timer: u64,
) -> BoxFuture<'static, ()> {
    async move {
        tokio::time::sleep(inner.debounce).await;
        let Some(directive) = inner.table.lock().await.fire(slot, kind, timer) else {
            return;
        };
        let Some(handler) = inner.registry.get(kind) else {
            return;
        };
        DIRECTIVES_DISPATCHED.click();
        debug!(message = %slot.message, ?kind, key = %directive.key(), "dispatching directive");
        let start = Instant::now();
        let result = handler.handle(&directive, &inner.context).await;
        HANDLER_DURATION.add(start.elapsed().as_secs_f64());
        inner.apply(conversation, slot, &directive, result).await;
        let idle = inner
            .table
            .lock()
            .await
            .complete(slot, kind, &directive.key());
        if idle {
            inner.rescan(conversation, slot).await;
        }
    }
    .boxed()
}
