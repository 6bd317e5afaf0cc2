//! The chat session controller.
//!
//! A [`ChatSession`] drives one user turn end to end: it builds the history
//! payload, streams the backend's reply into a fresh bot message through the
//! [`Dispatcher`], and chains follow-up replies when handlers ask for them.

use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::StreamExt;
use tokio::sync::{broadcast, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::accumulator::Dispatcher;
use crate::chat::ChatConfig;
use crate::chat::render::{NullRenderer, Renderer};
use crate::collaborators::{
    CompletionRequest, ConversationStore, LanguageModel, MemoryStore, StreamChunk, WorkspaceStore,
    render_tree,
};
use crate::dispatch::Slot;
use crate::error::BackendFailure;
use crate::handlers::{HandlerRegistry, SessionContext, SpliceMode};
use crate::observability::{
    FOLLOW_UPS, REGENERATIONS, STREAM_CANCELLED, STREAM_CHUNKS, STREAM_DURATION, STREAM_ERRORS,
};
use crate::types::{
    Conversation, ConversationId, DirectiveKind, Message, MessageId, UiEvent, UiMode,
};
use crate::{Error, Result};

/// How a turn ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnOutcome {
    /// The backend finished and every follow-up ran.
    Completed,

    /// The user cancelled the in-flight stream.  Committed text is kept.
    Cancelled,

    /// The backend rejected the request; the user-facing text was written
    /// into the bot message.
    BackendRejected(BackendFailure),
}

/// The result of [`ChatSession::submit`] or [`ChatSession::regenerate`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TurnReport {
    /// How the turn ended.
    pub outcome: TurnOutcome,

    /// Bot messages produced by the turn that are still in the conversation.
    pub messages: Vec<MessageId>,
}

/// Aggregated stats for a chat session.
#[derive(Debug, Clone)]
pub struct SessionStats {
    /// The active conversation.
    pub conversation_id: ConversationId,
    /// Title of the active conversation.
    pub title: String,
    /// The number of messages in the conversation.
    pub message_count: usize,
    /// The conversation's mutation counter.
    pub revision: u64,
    /// Searches used this turn.
    pub searches_used: u32,
    /// Searches allowed per turn.
    pub search_cap: u32,
    /// Follow-ups allowed per turn.
    pub follow_up_limit: u32,
    /// The current UI mode.
    pub ui_mode: UiMode,
    /// The debounce window.
    pub debounce: Duration,
    /// The system prompt, if any.
    pub system_prompt: Option<String>,
}

/////////////////////////////////////////// CancelHandle //////////////////////////////////////////

/// Cancels whichever stream the session is currently reading.
///
/// Only the network read loop observes cancellation; handlers that were
/// already dispatched run to completion.
#[derive(Clone, Debug)]
pub struct CancelHandle {
    current: Arc<watch::Sender<CancellationToken>>,
}

impl CancelHandle {
    /// Cancel the in-flight stream, if any.
    pub fn cancel(&self) {
        self.current.borrow().cancel();
    }
}

//////////////////////////////////////////// ChatSession //////////////////////////////////////////

/// Builds a [`ChatSession`].
pub struct ChatSessionBuilder {
    model: Arc<dyn LanguageModel>,
    config: ChatConfig,
    registry: HandlerRegistry,
    store: Option<Arc<dyn ConversationStore>>,
    workspace: Option<Arc<dyn WorkspaceStore>>,
}

impl ChatSessionBuilder {
    /// Use `registry` to dispatch directives.
    pub fn with_handlers(mut self, registry: HandlerRegistry) -> Self {
        self.registry = registry;
        self
    }

    /// Persist conversations to `store` instead of memory.
    pub fn with_store(mut self, store: Arc<dyn ConversationStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Include `workspace`'s tree in the system prompt while in workspace mode.
    pub fn with_workspace(mut self, workspace: Arc<dyn WorkspaceStore>) -> Self {
        self.workspace = Some(workspace);
        self
    }

    /// Finish building the session.
    pub fn build(self) -> ChatSession {
        let context = Arc::new(SessionContext::new(
            self.config.credentials.clone(),
            self.config.search_cap,
            self.config.search_results,
            self.config.image,
            self.config.project.clone(),
        ));
        let store = self
            .store
            .unwrap_or_else(|| Arc::new(MemoryStore::new()));
        let dispatcher = Dispatcher::new(
            self.registry,
            Arc::clone(&context),
            Arc::clone(&store),
            self.config.debounce(),
        );
        let (cancel, _) = watch::channel(CancellationToken::new());
        ChatSession {
            model: self.model,
            config: self.config,
            context,
            dispatcher,
            store,
            workspace: self.workspace,
            cancel: Arc::new(cancel),
        }
    }
}

/// A chat session over one conversation at a time.
pub struct ChatSession {
    model: Arc<dyn LanguageModel>,
    config: ChatConfig,
    context: Arc<SessionContext>,
    dispatcher: Dispatcher,
    store: Arc<dyn ConversationStore>,
    workspace: Option<Arc<dyn WorkspaceStore>>,
    cancel: Arc<watch::Sender<CancellationToken>>,
}

impl ChatSession {
    /// Start building a session around `model`.
    pub fn builder(model: Arc<dyn LanguageModel>, config: ChatConfig) -> ChatSessionBuilder {
        ChatSessionBuilder {
            model,
            config,
            registry: HandlerRegistry::new(),
            store: None,
            workspace: None,
        }
    }

    /// Sends a user message and waits for the turn to finish.
    pub async fn submit(&self, text: &str) -> Result<TurnReport> {
        self.submit_streaming(text, &mut NullRenderer).await
    }

    /// Sends a user message, rendering the reply as it streams.
    ///
    /// The search budget is reset here and nowhere else; follow-ups continue
    /// the same turn.
    pub async fn submit_streaming(
        &self,
        text: &str,
        renderer: &mut dyn Renderer,
    ) -> Result<TurnReport> {
        let text = text.trim();
        if text.is_empty() {
            return Err(Error::validation("message is empty", None));
        }
        self.context.search_budget.reset();
        let reply = Message::bot();
        let slot = Slot::new(reply.id, reply.generation);
        self.dispatcher
            .commit(|c| {
                c.push(Message::user(text));
                c.push(reply);
            })
            .await;
        self.run_turn(slot, None, renderer).await
    }

    /// Regenerates a bot message in place.
    pub async fn regenerate(&self, message: MessageId) -> Result<TurnReport> {
        self.regenerate_streaming(message, &mut NullRenderer).await
    }

    /// Regenerates a bot message in place, rendering the new reply.
    ///
    /// The message keeps its id and gets a new generation, so directives that
    /// fired in the discarded run fire again.  Follow-ups chained directly off
    /// the message are removed along with its old content.
    pub async fn regenerate_streaming(
        &self,
        message: MessageId,
        renderer: &mut dyn Renderer,
    ) -> Result<TurnReport> {
        let conversation = self.dispatcher.snapshot().await;
        let target = conversation
            .message(message)
            .ok_or_else(|| Error::not_found(format!("no message {message}"), None))?;
        if !target.is_bot() {
            return Err(Error::validation(
                "only assistant messages can be regenerated",
                None,
            ));
        }
        REGENERATIONS.click();
        self.context.search_budget.reset();
        self.dispatcher.reset_message(message).await;
        let slot = self
            .dispatcher
            .commit(|c| {
                let position = c.position(message)?;
                while c
                    .messages
                    .get(position + 1)
                    .is_some_and(|m| m.is_bot() && m.follow_up)
                {
                    c.messages.remove(position + 1);
                }
                let target = &mut c.messages[position];
                target.reset_for_regeneration();
                Some(Slot::new(target.id, target.generation))
            })
            .await
            .ok_or_else(|| Error::not_found(format!("no message {message}"), None))?;
        info!(%message, generation = slot.generation, "regenerating");
        self.run_turn(slot, None, renderer).await
    }

    /// A handle that cancels the in-flight stream from another task or thread.
    pub fn cancel_handle(&self) -> CancelHandle {
        CancelHandle {
            current: Arc::clone(&self.cancel),
        }
    }

    /// Deletes one message.  Returns false if it did not exist.
    pub async fn delete_message(&self, message: MessageId) -> bool {
        self.dispatcher.reset_message(message).await;
        self.dispatcher
            .commit(|c| c.remove(message).is_some())
            .await
    }

    /// Deletes the conversation from the store and starts a new one.
    ///
    /// Handler results that land afterwards are discarded.
    pub async fn delete_conversation(&self) -> Result<()> {
        self.cancel_handle().cancel();
        let id = self.dispatcher.snapshot().await.id;
        self.dispatcher.mark_deleted().await;
        self.store.delete(id).await?;
        self.dispatcher.reset(Conversation::new()).await;
        info!(conversation = %id, "conversation deleted");
        Ok(())
    }

    /// Starts a new, empty conversation.  The old one stays persisted.
    pub async fn clear(&self) {
        self.cancel_handle().cancel();
        self.dispatcher.reset(Conversation::new()).await;
    }

    /// Loads a persisted conversation.  Returns false if it does not exist.
    ///
    /// Loading does not reset the search budget.
    pub async fn load(&self, id: ConversationId) -> Result<bool> {
        let Some(conversation) = self.store.load(id).await? else {
            return Ok(false);
        };
        self.cancel_handle().cancel();
        self.dispatcher.reset(conversation).await;
        Ok(true)
    }

    /// Ids of every persisted conversation.
    pub async fn conversations(&self) -> Result<Vec<ConversationId>> {
        self.store.list().await
    }

    /// A snapshot of the active conversation.
    pub async fn conversation(&self) -> Conversation {
        self.dispatcher.snapshot().await
    }

    /// Subscribe to UI notifications emitted by handlers.
    pub fn events(&self) -> broadcast::Receiver<UiEvent> {
        self.context.subscribe()
    }

    /// The current UI mode.
    pub fn ui_mode(&self) -> UiMode {
        self.context.ui_mode()
    }

    /// Switch the UI mode by hand.
    pub fn set_ui_mode(&self, mode: UiMode) {
        if self.context.set_ui_mode(mode) {
            self.context.emit(UiEvent::ModeChanged(mode));
        }
    }

    /// Returns the current session statistics snapshot.
    pub async fn stats(&self) -> SessionStats {
        let conversation = self.dispatcher.snapshot().await;
        SessionStats {
            conversation_id: conversation.id,
            title: conversation.title,
            message_count: conversation.messages.len(),
            revision: conversation.revision,
            searches_used: self.context.search_budget.used(),
            search_cap: self.context.search_budget.cap(),
            follow_up_limit: self.config.follow_up_limit,
            ui_mode: self.context.ui_mode(),
            debounce: self.config.debounce(),
            system_prompt: self.config.system_prompt.clone(),
        }
    }

    /// Saves the active conversation as pretty-printed JSON.
    pub async fn save_transcript_to(&self, path: &str) -> Result<()> {
        let conversation = self.dispatcher.snapshot().await;
        let json = serde_json::to_vec_pretty(&conversation).map_err(|err| {
            Error::serialization("failed to serialize transcript", Some(Box::new(err)))
        })?;
        tokio::fs::write(path, json)
            .await
            .map_err(|err| Error::io("failed to write transcript file", err))
    }

    async fn run_turn(
        &self,
        mut slot: Slot,
        mut prompt: Option<String>,
        renderer: &mut dyn Renderer,
    ) -> Result<TurnReport> {
        let token = CancellationToken::new();
        self.cancel.send_replace(token.clone());
        let mut produced = vec![slot.message];
        let mut follow_ups = 0;
        loop {
            let request = self.request_for(slot, prompt.as_deref()).await;
            renderer.start_message(prompt.is_some());
            let outcome = self.stream_into(slot, request, &token, renderer).await;
            renderer.finish_message();
            match outcome {
                TurnOutcome::Completed => {}
                TurnOutcome::Cancelled => {
                    renderer.print_info("[cancelled]");
                    return Ok(TurnReport { outcome, messages: produced });
                }
                TurnOutcome::BackendRejected(failure) => {
                    self.write_failure(slot, failure).await;
                    renderer.print_error(failure.user_message());
                    return Ok(TurnReport { outcome, messages: produced });
                }
            }
            self.dispatcher.settle().await;
            let pending = self.dispatcher.take_follow_ups(slot).await;
            if pending.is_empty() {
                break;
            }
            if token.is_cancelled() {
                return Ok(TurnReport {
                    outcome: TurnOutcome::Cancelled,
                    messages: produced,
                });
            }
            if follow_ups >= self.config.follow_up_limit {
                warn!(limit = self.config.follow_up_limit, "follow-up limit reached; ending turn");
                renderer.print_info("[follow-up limit reached]");
                break;
            }
            follow_ups += 1;
            FOLLOW_UPS.click();
            let searched = pending
                .iter()
                .any(|f| f.kind == DirectiveKind::Search && f.splice == SpliceMode::ReplaceBlock);
            let next = Message::bot().with_follow_up(true);
            let next_slot = Slot::new(next.id, next.generation);
            let dropped = self
                .dispatcher
                .commit(|c| {
                    let ordinary = c
                        .message(slot.message)
                        .is_some_and(|m| !m.follow_up);
                    let dropped = searched && ordinary && c.remove(slot.message).is_some();
                    c.push(next);
                    dropped
                })
                .await;
            if dropped {
                self.dispatcher.reset_message(slot.message).await;
                produced.retain(|id| *id != slot.message);
            }
            debug!(from = %slot.message, to = %next_slot.message, dropped, "chaining follow-up");
            produced.push(next_slot.message);
            prompt = Some(
                pending
                    .into_iter()
                    .map(|f| f.prompt)
                    .collect::<Vec<_>>()
                    .join("\n\n"),
            );
            slot = next_slot;
        }
        Ok(TurnReport {
            outcome: TurnOutcome::Completed,
            messages: produced,
        })
    }

    async fn request_for(&self, slot: Slot, prompt: Option<&str>) -> CompletionRequest {
        let conversation = self.dispatcher.snapshot().await;
        let end = conversation
            .position(slot.message)
            .unwrap_or(conversation.messages.len());
        let system = self.system_prompt().await;
        let request = CompletionRequest::from_messages(
            conversation.messages[..end].iter(),
            system.as_deref(),
            self.model.history_shape(),
        );
        match prompt {
            Some(prompt) => request.with_prompt(prompt),
            None => request,
        }
    }

    async fn system_prompt(&self) -> Option<String> {
        let base = self.config.system_prompt.clone();
        if self.context.ui_mode() != UiMode::Workspace {
            return base;
        }
        let Some(workspace) = &self.workspace else {
            return base;
        };
        let tree = match workspace.project_by_name(&self.context.project).await {
            Ok(Some(project)) => match workspace.list_tree(&project.id).await {
                Ok(entries) => render_tree(&project, &entries),
                Err(err) => {
                    warn!(error = %err, "could not list workspace tree");
                    return base;
                }
            },
            Ok(None) => format!("{}/ (empty)\n", self.context.project),
            Err(err) => {
                warn!(error = %err, "could not load workspace project");
                return base;
            }
        };
        let section = format!("Current workspace:\n{tree}");
        Some(match base {
            Some(base) => format!("{base}\n\n{section}"),
            None => section,
        })
    }

    async fn stream_into(
        &self,
        slot: Slot,
        request: CompletionRequest,
        token: &CancellationToken,
        renderer: &mut dyn Renderer,
    ) -> TurnOutcome {
        let start = Instant::now();
        let stream = tokio::select! {
            biased;
            _ = token.cancelled() => return cancelled(),
            stream = self.model.stream_completion(request, token.clone()) => stream,
        };
        let mut stream = match stream {
            Ok(stream) => stream,
            Err(err) => return failed(err),
        };
        loop {
            let next = tokio::select! {
                biased;
                _ = token.cancelled() => return cancelled(),
                next = stream.next() => next,
            };
            match next {
                None => break,
                Some(Ok(chunk)) => {
                    STREAM_CHUNKS.click();
                    match &chunk {
                        StreamChunk::Delta(text) => renderer.print_text(text),
                        StreamChunk::Snapshot(text) => renderer.print_snapshot(text),
                    }
                    if !self.dispatcher.push_chunk(slot, chunk).await {
                        debug!(message = %slot.message, "stream target is gone; stopping");
                        break;
                    }
                }
                Some(Err(err)) => return failed(err),
            }
        }
        STREAM_DURATION.add(start.elapsed().as_secs_f64());
        TurnOutcome::Completed
    }

    async fn write_failure(&self, slot: Slot, failure: BackendFailure) {
        self.dispatcher
            .commit(|c| {
                if let Some(message) = c
                    .message_mut(slot.message)
                    .filter(|m| m.generation == slot.generation)
                {
                    if !message.text.is_empty() {
                        message.text.push_str("\n\n");
                    }
                    message.text.push_str(failure.user_message());
                }
            })
            .await;
    }
}

fn cancelled() -> TurnOutcome {
    STREAM_CANCELLED.click();
    TurnOutcome::Cancelled
}

fn failed(err: Error) -> TurnOutcome {
    match BackendFailure::classify(&err) {
        Some(failure) => {
            STREAM_ERRORS.click();
            warn!(error = %err, ?failure, "backend rejected the request");
            TurnOutcome::BackendRejected(failure)
        }
        None => cancelled(),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::chat::Credentials;
    use crate::collaborators::{HistoryShape, MemoryWorkspace, ScriptedModel, ScriptedReply};
    use crate::handlers::testing::FixedSearch;
    use crate::handlers::{
        DirectiveHandler, HandlerOutput, ModeSwitchHandler, SEARCH_LIMIT_NOTICE, SearchHandler,
        WorkspaceHandler,
    };
    use crate::types::{Attachment, Directive, HistoryRole};

    fn config() -> ChatConfig {
        ChatConfig::default().with_credentials(Credentials {
            search_key: Some("key".to_string()),
            search_engine_id: Some("cx".to_string()),
            ..Credentials::default()
        })
    }

    #[derive(Default)]
    struct Counting {
        calls: Arc<AtomicUsize>,
    }

    #[async_trait::async_trait]
    impl DirectiveHandler for Counting {
        fn kind(&self) -> DirectiveKind {
            DirectiveKind::Image
        }

        async fn handle(&self, _: &Directive, _: &SessionContext) -> Result<HandlerOutput> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(HandlerOutput::strip())
        }
    }

    struct SlowImage;

    #[async_trait::async_trait]
    impl DirectiveHandler for SlowImage {
        fn kind(&self) -> DirectiveKind {
            DirectiveKind::Image
        }

        async fn handle(&self, _: &Directive, _: &SessionContext) -> Result<HandlerOutput> {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(HandlerOutput::replace("<IMAGE DONE>").with_attachment(Attachment::Structured {
                title: "image".to_string(),
                body: "fox".to_string(),
            }))
        }
    }

    #[tokio::test(start_paused = true)]
    async fn plain_turn_streams_into_one_message() {
        let model = Arc::new(ScriptedModel::new([ScriptedReply::deltas([
            "Hello", ", ", "world",
        ])]));
        let session = ChatSession::builder(model.clone(), config().with_system_prompt("Be brief."))
            .build();
        let report = session.submit("hi").await.unwrap();
        assert_eq!(report.outcome, TurnOutcome::Completed);
        let conversation = session.conversation().await;
        assert_eq!(conversation.messages.len(), 2);
        assert_eq!(conversation.messages[1].text, "Hello, world");
        assert_eq!(report.messages, vec![conversation.messages[1].id]);
        let requests = model.requests().await;
        assert_eq!(requests[0].system.as_deref(), Some("Be brief."));
        assert_eq!(requests[0].messages.len(), 1);
        assert_eq!(requests[0].messages[0].role, HistoryRole::User);
    }

    #[tokio::test(start_paused = true)]
    async fn inline_system_shape_prepends_instruction() {
        let model = Arc::new(
            ScriptedModel::new([ScriptedReply::deltas(["ok"])])
                .with_history_shape(HistoryShape::InlineSystem),
        );
        let session =
            ChatSession::builder(model.clone(), config().with_system_prompt("Rules")).build();
        session.submit("hi").await.unwrap();
        let requests = model.requests().await;
        assert!(requests[0].system.is_none());
        assert_eq!(requests[0].messages[0].role, HistoryRole::System);
        assert_eq!(requests[0].messages[0].content, "Rules");
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_keeps_committed_text_only() {
        let model = Arc::new(ScriptedModel::new([ScriptedReply::new()
            .delta("Hello")
            .pause(Duration::from_secs(10))
            .delta(" world")]));
        let session = ChatSession::builder(model, config()).build();
        let handle = session.cancel_handle();
        let (report, _) = tokio::join!(session.submit("hi"), async {
            tokio::time::sleep(Duration::from_secs(1)).await;
            handle.cancel();
        });
        let report = report.unwrap();
        assert_eq!(report.outcome, TurnOutcome::Cancelled);
        tokio::time::sleep(Duration::from_secs(20)).await;
        let conversation = session.conversation().await;
        assert_eq!(conversation.messages[1].text, "Hello");
    }

    #[tokio::test(start_paused = true)]
    async fn handler_result_reaches_a_conversation_cleared_mid_flight() {
        let model = Arc::new(ScriptedModel::new([ScriptedReply::new()
            .delta("[IMAGE_PROMPT]fox[/IMAGE_PROMPT]")
            .pause(Duration::from_secs(10))
            .delta(" tail")]));
        let store = Arc::new(MemoryStore::new());
        let session = ChatSession::builder(model, config())
            .with_handlers(HandlerRegistry::new().with_handler(SlowImage))
            .with_store(store.clone())
            .build();
        let handle = session.cancel_handle();
        let (report, _) = tokio::join!(session.submit("draw"), async {
            tokio::time::sleep(Duration::from_secs(2)).await;
            handle.cancel();
        });
        assert_eq!(report.unwrap().outcome, TurnOutcome::Cancelled);
        let old = session.conversation().await.id;
        session.clear().await;
        session.dispatcher.settle().await;

        let stored = store.load(old).await.unwrap().unwrap();
        assert_eq!(stored.messages[1].text, "<IMAGE DONE>");
        assert_eq!(stored.messages[1].attachments.len(), 1);
        assert!(session.conversation().await.messages.is_empty());

        assert!(session.load(old).await.unwrap());
        assert_eq!(session.conversation().await.messages[1].text, "<IMAGE DONE>");
    }

    #[tokio::test(start_paused = true)]
    async fn backend_rejection_is_written_into_the_message() {
        let model = Arc::new(ScriptedModel::new([ScriptedReply::rejected(
            Error::quota("out of credits"),
        )]));
        let session = ChatSession::builder(model, config()).build();
        let report = session.submit("hi").await.unwrap();
        assert_eq!(
            report.outcome,
            TurnOutcome::BackendRejected(BackendFailure::Quota)
        );
        let conversation = session.conversation().await;
        assert_eq!(
            conversation.messages[1].text,
            BackendFailure::Quota.user_message()
        );
    }

    #[tokio::test(start_paused = true)]
    async fn search_chains_a_follow_up_and_drops_the_searching_message() {
        let search = Arc::new(FixedSearch::with_results(3));
        let model = Arc::new(ScriptedModel::new([
            ScriptedReply::deltas(["Checking. ", "[SEARCH_QUERY]weather Hanoi[/SEARCH_QUERY]"]),
            ScriptedReply::deltas(["It is sunny in Hanoi."]),
        ]));
        let session = ChatSession::builder(model.clone(), config())
            .with_handlers(HandlerRegistry::new().with_handler(SearchHandler::new(search.clone())))
            .build();
        let report = session.submit("weather?").await.unwrap();
        assert_eq!(report.outcome, TurnOutcome::Completed);
        assert_eq!(search.calls(), 1);
        let conversation = session.conversation().await;
        assert_eq!(conversation.messages.len(), 2);
        let answer = &conversation.messages[1];
        assert!(answer.follow_up);
        assert_eq!(answer.text, "It is sunny in Hanoi.");
        assert_eq!(report.messages, vec![answer.id]);
        let requests = model.requests().await;
        assert_eq!(requests.len(), 2);
        let seeded = requests[1].messages.last().unwrap();
        assert_eq!(seeded.role, HistoryRole::User);
        assert!(seeded.content.starts_with("Search results for \"weather Hanoi\""));
    }

    #[tokio::test(start_paused = true)]
    async fn chained_searches_keep_follow_ups_and_respect_the_limit() {
        let search = Arc::new(FixedSearch::with_results(1));
        let model = Arc::new(ScriptedModel::new(
            (0..5).map(|i| ScriptedReply::deltas([format!("[SEARCH_QUERY]q{i}[/SEARCH_QUERY]")])),
        ));
        let session = ChatSession::builder(model.clone(), config().with_follow_up_limit(2))
            .with_handlers(HandlerRegistry::new().with_handler(SearchHandler::new(search.clone())))
            .build();
        let report = session.submit("dig deep").await.unwrap();
        assert_eq!(report.outcome, TurnOutcome::Completed);
        assert_eq!(model.requests().await.len(), 3);
        let conversation = session.conversation().await;
        let bots: Vec<_> = conversation.messages.iter().filter(|m| m.is_bot()).collect();
        assert_eq!(bots.len(), 2);
        assert!(bots.iter().all(|m| m.follow_up));
        assert_eq!(report.messages.len(), 2);
        assert_eq!(session.stats().await.searches_used, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_budget_injects_the_notice() {
        let search = Arc::new(FixedSearch::with_results(1));
        let model = Arc::new(ScriptedModel::new([
            ScriptedReply::deltas(["[SEARCH_QUERY]again[/SEARCH_QUERY]"]),
            ScriptedReply::deltas(["Here is what I know."]),
        ]));
        let session = ChatSession::builder(model.clone(), config().with_search_cap(0))
            .with_handlers(HandlerRegistry::new().with_handler(SearchHandler::new(search.clone())))
            .build();
        session.submit("search forever").await.unwrap();
        assert_eq!(search.calls(), 0);
        let requests = model.requests().await;
        assert_eq!(
            requests[1].messages.last().unwrap().content,
            SEARCH_LIMIT_NOTICE
        );
        let conversation = session.conversation().await;
        assert!(conversation.messages[1].text.ends_with(SEARCH_LIMIT_NOTICE));
    }

    #[tokio::test(start_paused = true)]
    async fn budget_resets_per_user_turn_not_on_load() {
        let search = Arc::new(FixedSearch::with_results(1));
        let model = Arc::new(ScriptedModel::new([
            ScriptedReply::deltas(["[SEARCH_QUERY]a[/SEARCH_QUERY]"]),
            ScriptedReply::deltas(["done"]),
        ]));
        let session = ChatSession::builder(model.clone(), config())
            .with_handlers(HandlerRegistry::new().with_handler(SearchHandler::new(search)))
            .build();
        session.submit("one").await.unwrap();
        assert_eq!(session.stats().await.searches_used, 1);
        let id = session.conversation().await.id;
        session.clear().await;
        assert!(session.load(id).await.unwrap());
        assert_eq!(session.stats().await.searches_used, 1);
        model.push_reply(ScriptedReply::deltas(["no search"])).await;
        session.submit("two").await.unwrap();
        assert_eq!(session.stats().await.searches_used, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn regenerate_refires_directives_in_the_same_slot() {
        let calls = Arc::new(AtomicUsize::new(0));
        let model = Arc::new(ScriptedModel::new([
            ScriptedReply::deltas(["[IMAGE_PROMPT]a fox[/IMAGE_PROMPT]Here."]),
            ScriptedReply::deltas(["[IMAGE_PROMPT]a fox[/IMAGE_PROMPT]Again."]),
        ]));
        let session = ChatSession::builder(model.clone(), config())
            .with_handlers(HandlerRegistry::new().with_handler(Counting {
                calls: calls.clone(),
            }))
            .build();
        let first = session.submit("draw").await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        let target = first.messages[0];
        let second = session.regenerate(target).await.unwrap();
        assert_eq!(second.messages, vec![target]);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        let conversation = session.conversation().await;
        let message = conversation.message(target).unwrap();
        assert_eq!(message.text, "Again.");
        assert_eq!(message.generation, 1);
        let requests = model.requests().await;
        assert_eq!(requests[1].messages.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn regenerate_rejects_user_messages() {
        let model = Arc::new(ScriptedModel::new([ScriptedReply::deltas(["ok"])]));
        let session = ChatSession::builder(model, config()).build();
        session.submit("hi").await.unwrap();
        let user = session.conversation().await.messages[0].id;
        assert!(session.regenerate(user).await.unwrap_err().is_validation());
    }

    #[tokio::test(start_paused = true)]
    async fn deleted_conversation_is_gone_from_the_store() {
        let store = Arc::new(MemoryStore::new());
        let model = Arc::new(ScriptedModel::new([ScriptedReply::deltas(["ok"])]));
        let session = ChatSession::builder(model, config())
            .with_store(store.clone())
            .build();
        session.submit("hi").await.unwrap();
        let id = session.conversation().await.id;
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(store.load(id).await.unwrap().is_some());
        session.delete_conversation().await.unwrap();
        assert!(store.load(id).await.unwrap().is_none());
        assert_ne!(session.conversation().await.id, id);
        assert!(session.conversation().await.messages.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn workspace_mode_puts_the_tree_in_the_system_prompt() {
        let workspace = Arc::new(MemoryWorkspace::new());
        let model = Arc::new(ScriptedModel::new([
            ScriptedReply::deltas([
                "[MODE_SWITCH]workspace[/MODE_SWITCH]",
                "[WORKSPACE_ACTION]\nACTION: create_file\nPATH: app.py\nCONTENT: print(1)\n[/WORKSPACE_ACTION]",
            ]),
            ScriptedReply::deltas(["ok"]),
        ]));
        let session = ChatSession::builder(model.clone(), config().with_project("demo"))
            .with_handlers(
                HandlerRegistry::new()
                    .with_handler(ModeSwitchHandler)
                    .with_handler(WorkspaceHandler::new(workspace.clone())),
            )
            .with_workspace(workspace)
            .build();
        let mut events = session.events();
        session.submit("make an app").await.unwrap();
        assert_eq!(session.ui_mode(), UiMode::Workspace);
        let mut seen = Vec::new();
        while let Ok(event) = events.try_recv() {
            seen.push(event);
        }
        assert!(seen.contains(&UiEvent::ModeChanged(UiMode::Workspace)));
        assert!(seen.contains(&UiEvent::WorkspaceReload));
        session.submit("and now?").await.unwrap();
        let requests = model.requests().await;
        assert!(requests[0].system.is_none());
        let system = requests[1].system.as_deref().unwrap();
        assert!(system.contains("Current workspace:\ndemo/\n  app.py\n"));
    }
}
