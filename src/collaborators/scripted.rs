use std::collections::VecDeque;
use std::time::Duration;

use futures::StreamExt;
use futures::stream;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::collaborators::{ChunkStream, CompletionRequest, HistoryShape, LanguageModel, StreamChunk};
use crate::{Error, Result};

#[derive(Debug, Clone)]
enum Step {
    Chunk(StreamChunk),
    Pause(Duration),
    Fail(Error),
}

/// One pre-scripted backend reply.
#[derive(Debug, Clone, Default)]
pub struct ScriptedReply {
    steps: Vec<Step>,
    rejection: Option<Error>,
}

impl ScriptedReply {
    /// An empty reply.
    pub fn new() -> Self {
        Self::default()
    }

    /// A reply that streams `chunks` as deltas with no delay.
    pub fn deltas<S: Into<String>>(chunks: impl IntoIterator<Item = S>) -> Self {
        chunks
            .into_iter()
            .fold(Self::new(), |reply, chunk| reply.delta(chunk))
    }

    /// A call that is refused before any chunk streams.
    pub fn rejected(err: Error) -> Self {
        Self {
            steps: Vec::new(),
            rejection: Some(err),
        }
    }

    /// Stream a delta.
    pub fn delta(mut self, text: impl Into<String>) -> Self {
        self.steps.push(Step::Chunk(StreamChunk::Delta(text.into())));
        self
    }

    /// Stream a snapshot of the whole reply so far.
    pub fn snapshot(mut self, text: impl Into<String>) -> Self {
        self.steps
            .push(Step::Chunk(StreamChunk::Snapshot(text.into())));
        self
    }

    /// Wait before the next step.
    pub fn pause(mut self, duration: Duration) -> Self {
        self.steps.push(Step::Pause(duration));
        self
    }

    /// Fail the stream mid-way.
    pub fn fail(mut self, err: Error) -> Self {
        self.steps.push(Step::Fail(err));
        self
    }
}

/// A [`LanguageModel`] that replays scripted replies in order.
///
/// Each call consumes the next reply.  Every request is recorded so callers
/// can inspect the history that was sent.
#[derive(Debug, Default)]
pub struct ScriptedModel {
    replies: Mutex<VecDeque<ScriptedReply>>,
    requests: Mutex<Vec<CompletionRequest>>,
    shape: HistoryShape,
}

impl ScriptedModel {
    /// Create a model that plays `replies` in order.
    pub fn new(replies: impl IntoIterator<Item = ScriptedReply>) -> Self {
        Self {
            replies: Mutex::new(replies.into_iter().collect()),
            requests: Mutex::new(Vec::new()),
            shape: HistoryShape::default(),
        }
    }

    /// Use a different history shape.
    pub fn with_history_shape(mut self, shape: HistoryShape) -> Self {
        self.shape = shape;
        self
    }

    /// Queue another reply.
    pub async fn push_reply(&self, reply: ScriptedReply) {
        self.replies.lock().await.push_back(reply);
    }

    /// Every request received so far.
    pub async fn requests(&self) -> Vec<CompletionRequest> {
        self.requests.lock().await.clone()
    }
}

#[async_trait::async_trait]
impl LanguageModel for ScriptedModel {
    fn history_shape(&self) -> HistoryShape {
        self.shape
    }

    async fn stream_completion(
        &self,
        request: CompletionRequest,
        cancel: CancellationToken,
    ) -> Result<ChunkStream> {
        self.requests.lock().await.push(request);
        let reply = self
            .replies
            .lock()
            .await
            .pop_front()
            .ok_or_else(|| Error::service_unavailable("no scripted reply left", None))?;
        if let Some(err) = reply.rejection {
            return Err(err);
        }
        let steps: VecDeque<Step> = reply.steps.into();
        let stream = stream::unfold(steps, |mut steps| async move {
            loop {
                match steps.pop_front()? {
                    Step::Pause(duration) => tokio::time::sleep(duration).await,
                    Step::Chunk(chunk) => return Some((Ok(chunk), steps)),
                    Step::Fail(err) => return Some((Err(err), VecDeque::new())),
                }
            }
        });
        Ok(Box::pin(stream.take_until(cancel.cancelled_owned())))
    }
}
