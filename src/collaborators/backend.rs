use std::pin::Pin;
use std::time::Duration;

use futures::{Stream, StreamExt};
use reqwest::header::{self, HeaderMap, HeaderValue};
use reqwest::{Client as ReqwestClient, Response};
use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::collaborators::process_sse;
use crate::types::{HistoryEntry, Message};
use crate::{Error, Result};

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(120);

/// One piece of a streamed reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamChunk {
    /// Text to append to the reply so far.
    Delta(String),

    /// The complete reply so far, replacing everything streamed before.
    Snapshot(String),
}

/// A boxed stream of reply chunks.
pub type ChunkStream = Pin<Box<dyn Stream<Item = Result<StreamChunk>> + Send>>;

/// How a backend expects to receive the system instruction.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HistoryShape {
    /// The system instruction travels in its own request field.
    #[default]
    SystemField,

    /// The system instruction is the first history entry.
    InlineSystem,
}

/// The outgoing payload for one completion.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CompletionRequest {
    /// Conversation history, oldest first.
    pub messages: Vec<HistoryEntry>,

    /// Separate system instruction, for backends that take one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system: Option<String>,
}

impl CompletionRequest {
    /// Build a request from conversation messages.
    ///
    /// Empty messages (e.g. a bot slot that has not streamed yet) are skipped.
    /// With [`HistoryShape::InlineSystem`] the system instruction becomes the
    /// first history entry instead of a separate field.
    pub fn from_messages<'a>(
        messages: impl IntoIterator<Item = &'a Message>,
        system: Option<&str>,
        shape: HistoryShape,
    ) -> Self {
        let mut history: Vec<HistoryEntry> = messages
            .into_iter()
            .filter(|m| !m.text.trim().is_empty())
            .map(HistoryEntry::from)
            .collect();
        let system = system.filter(|s| !s.trim().is_empty()).map(String::from);
        match (shape, system) {
            (HistoryShape::InlineSystem, Some(system)) => {
                history.insert(0, HistoryEntry::system(system));
                Self {
                    messages: history,
                    system: None,
                }
            }
            (_, system) => Self {
                messages: history,
                system,
            },
        }
    }

    /// Append an extra user prompt, e.g. seeded search results.
    pub fn with_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.messages.push(HistoryEntry::user(prompt));
        self
    }
}

/// A streaming language-model backend.
#[async_trait::async_trait]
pub trait LanguageModel: Send + Sync {
    /// How this backend wants the system instruction delivered.
    fn history_shape(&self) -> HistoryShape {
        HistoryShape::SystemField
    }

    /// Begin a streamed completion.
    ///
    /// The returned stream should end promptly once `cancel` fires, but the
    /// caller stops reading on cancellation regardless.
    async fn stream_completion(
        &self,
        request: CompletionRequest,
        cancel: CancellationToken,
    ) -> Result<ChunkStream>;
}

/// A backend that POSTs the history as JSON and reads an SSE text stream.
#[derive(Debug, Clone)]
pub struct SseModel {
    endpoint: String,
    api_key: Option<String>,
    shape: HistoryShape,
    client: ReqwestClient,
}

impl SseModel {
    /// Create a new SSE backend for `endpoint`.
    pub fn new(
        endpoint: impl Into<String>,
        api_key: Option<String>,
        shape: HistoryShape,
    ) -> Result<Self> {
        let endpoint = endpoint.into();
        url::Url::parse(&endpoint)?;
        let client = ReqwestClient::builder()
            .timeout(DEFAULT_TIMEOUT)
            .build()
            .map_err(|e| {
                Error::http_client(
                    format!("Failed to build HTTP client: {e}"),
                    Some(Box::new(e)),
                )
            })?;
        Ok(Self {
            endpoint,
            api_key,
            shape,
            client,
        })
    }

    fn headers(&self) -> Result<HeaderMap> {
        let mut headers = HeaderMap::new();
        headers.insert(
            header::CONTENT_TYPE,
            HeaderValue::from_static("application/json"),
        );
        headers.insert(
            header::ACCEPT,
            HeaderValue::from_static("text/event-stream"),
        );
        if let Some(api_key) = &self.api_key {
            let value = HeaderValue::from_str(&format!("Bearer {api_key}"))
                .map_err(|_| Error::validation("API key is not a valid header value", None))?;
            headers.insert(header::AUTHORIZATION, value);
        }
        Ok(headers)
    }
}

#[derive(Serialize)]
struct SseRequestBody<'a> {
    #[serde(flatten)]
    request: &'a CompletionRequest,
    stream: bool,
}

#[async_trait::async_trait]
impl LanguageModel for SseModel {
    fn history_shape(&self) -> HistoryShape {
        self.shape
    }

    async fn stream_completion(
        &self,
        request: CompletionRequest,
        cancel: CancellationToken,
    ) -> Result<ChunkStream> {
        let body = SseRequestBody {
            request: &request,
            stream: true,
        };
        let send = self
            .client
            .post(&self.endpoint)
            .headers(self.headers()?)
            .json(&body)
            .send();
        let response = tokio::select! {
            _ = cancel.cancelled() => return Err(Error::abort("cancelled before the stream began")),
            response = send => response?,
        };
        if !response.status().is_success() {
            return Err(error_from_response(response).await);
        }
        let stream = process_sse(response.bytes_stream()).take_until(cancel.cancelled_owned());
        Ok(Box::pin(stream))
    }
}

/// Convert a non-success HTTP response into an error.
pub(crate) async fn error_from_response(response: Response) -> Error {
    let status_code = response.status().as_u16();
    let retry_after = response
        .headers()
        .get("retry-after")
        .and_then(|val| val.to_str().ok())
        .and_then(|val| val.parse::<u64>().ok());

    #[derive(serde::Deserialize)]
    struct ErrorResponse {
        error: Option<ErrorDetail>,
        message: Option<String>,
    }

    #[derive(serde::Deserialize)]
    struct ErrorDetail {
        message: Option<String>,
    }

    let body = match response.text().await {
        Ok(body) => body,
        Err(e) => {
            return Error::http_client(
                format!("Failed to read error response: {e}"),
                Some(Box::new(e)),
            );
        }
    };
    let message = serde_json::from_str::<ErrorResponse>(&body)
        .ok()
        .and_then(|parsed| parsed.error.and_then(|e| e.message).or(parsed.message))
        .unwrap_or(body);
    Error::from_status(status_code, message, retry_after)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::HistoryRole;

    fn messages() -> Vec<Message> {
        let mut bot = Message::bot();
        bot.text.push_str("Hello!");
        vec![Message::user("Hi"), bot, Message::bot()]
    }

    #[test]
    fn system_field_shape() {
        let request =
            CompletionRequest::from_messages(&messages(), Some("Be brief."), HistoryShape::SystemField);
        assert_eq!(request.system.as_deref(), Some("Be brief."));
        assert_eq!(request.messages.len(), 2);
        assert_eq!(request.messages[0].role, HistoryRole::User);
        assert_eq!(request.messages[1].role, HistoryRole::Assistant);
    }

    #[test]
    fn inline_system_shape() {
        let request = CompletionRequest::from_messages(
            &messages(),
            Some("Be brief."),
            HistoryShape::InlineSystem,
        );
        assert!(request.system.is_none());
        assert_eq!(request.messages.len(), 3);
        assert_eq!(request.messages[0], HistoryEntry::system("Be brief."));
    }

    #[test]
    fn with_prompt_appends_user_entry() {
        let request = CompletionRequest::from_messages(&messages(), None, HistoryShape::InlineSystem)
            .with_prompt("Here are the results");
        assert_eq!(request.messages.len(), 3);
        assert_eq!(request.messages[2], HistoryEntry::user("Here are the results"));
    }

    #[test]
    fn request_body_serializes_flat() {
        let request = CompletionRequest::from_messages(&messages(), Some("sys"), HistoryShape::SystemField);
        let body = SseRequestBody {
            request: &request,
            stream: true,
        };
        let json = serde_json::to_value(&body).unwrap();
        assert_eq!(json["system"], "sys");
        assert_eq!(json["stream"], true);
        assert_eq!(json["messages"][0]["role"], "user");
    }

    #[test]
    fn rejects_invalid_endpoint() {
        assert!(SseModel::new("not a url", None, HistoryShape::SystemField).is_err());
    }
}
