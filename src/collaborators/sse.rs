//! Server-Sent Events (SSE) processing for streaming text backends.
//!
//! The wire shape is deliberately generic: each event carries a JSON `data:`
//! line holding either `{"text": ..}` (a delta) or `{"snapshot": ..}` (the
//! whole reply so far).  `data: [DONE]` ends the stream and `event: error`
//! carries `{"status": .., "message": ..}`.

use std::str::Utf8Error;

use bytes::Bytes;
use futures::stream::{self, Stream, StreamExt};
use serde::Deserialize;

use crate::collaborators::StreamChunk;
use crate::{Error, Result};

/// Process a stream of bytes into a stream of text chunks.
///
/// This function takes a byte stream from an HTTP response and converts it into
/// a stream of [`StreamChunk`]s, handling SSE parsing, buffering, and error
/// conditions.
pub fn process_sse<S>(byte_stream: S) -> impl Stream<Item = Result<StreamChunk>>
where
    S: Stream<Item = std::result::Result<Bytes, reqwest::Error>> + Unpin + Send + 'static,
{
    let stream = byte_stream.map(|result| {
        result
            .map_err(|e| Error::streaming(format!("Error in HTTP stream: {e}"), Some(Box::new(e))))
    });

    stream::unfold(
        (stream, String::new(), Vec::new(), false),
        move |(mut stream, mut buffer, mut pending, done)| async move {
            if done {
                return None;
            }
            loop {
                if let Some((event, remaining)) = extract_event(&buffer) {
                    buffer = remaining;
                    match event {
                        Parsed::Chunk(chunk) => {
                            return Some((Ok(chunk), (stream, buffer, pending, false)));
                        }
                        Parsed::Error(err) => {
                            return Some((Err(err), (stream, buffer, pending, false)));
                        }
                        Parsed::Done => return None,
                        Parsed::Skip => continue,
                    }
                }

                match stream.next().await {
                    Some(Ok(bytes)) => {
                        pending.extend_from_slice(&bytes);
                        match decode_prefix(&mut pending) {
                            Ok(text) => {
                                buffer.push_str(&text);
                                if buffer.contains('\r') {
                                    buffer = buffer.replace("\r\n", "\n");
                                }
                            }
                            Err(e) => {
                                return Some((
                                    Err(Error::encoding(
                                        format!("Invalid UTF-8 in stream: {e}"),
                                        Some(Box::new(e)),
                                    )),
                                    (stream, buffer, pending, true),
                                ));
                            }
                        }
                    }
                    Some(Err(e)) => {
                        return Some((Err(e), (stream, buffer, pending, true)));
                    }
                    None => {
                        if !pending.is_empty() {
                            return Some((
                                Err(Error::encoding(
                                    "Stream ended inside a UTF-8 sequence",
                                    None,
                                )),
                                (stream, buffer, pending, true),
                            ));
                        }
                        // A trailing event without its blank-line terminator.
                        if !buffer.trim().is_empty() {
                            buffer.push_str("\n\n");
                            if let Some((Parsed::Chunk(chunk), _)) = extract_event(&buffer) {
                                return Some((Ok(chunk), (stream, String::new(), pending, true)));
                            }
                        }
                        return None;
                    }
                }
            }
        },
    )
}

// Take the longest valid UTF-8 prefix of `pending`, leaving an incomplete
// trailing sequence behind for the next network chunk.
fn decode_prefix(pending: &mut Vec<u8>) -> std::result::Result<String, Utf8Error> {
    let valid = match std::str::from_utf8(pending) {
        Ok(_) => pending.len(),
        Err(e) if e.error_len().is_none() => e.valid_up_to(),
        Err(e) => return Err(e),
    };
    let rest = pending.split_off(valid);
    let complete = std::mem::replace(pending, rest);
    String::from_utf8(complete).map_err(|e| e.utf8_error())
}

enum Parsed {
    Chunk(StreamChunk),
    Error(Error),
    Done,
    Skip,
}

#[derive(Deserialize)]
struct ChunkData {
    text: Option<String>,
    snapshot: Option<String>,
}

#[derive(Deserialize)]
struct ErrorData {
    status: Option<u16>,
    message: Option<String>,
}

/// Extract a complete SSE event from a buffer string.
///
/// Events are delimited by a blank line.  Comment lines (leading `:`) and
/// events with no `data:` line are skipped.
fn extract_event(buffer: &str) -> Option<(Parsed, String)> {
    let (event_text, rest) = buffer.split_once("\n\n")?;
    let rest = rest.to_string();

    let mut event_type = "message";
    let mut data = String::new();
    for line in event_text.lines() {
        if let Some(value) = line.strip_prefix("event:") {
            event_type = value.trim();
        } else if let Some(value) = line.strip_prefix("data:") {
            if !data.is_empty() {
                data.push('\n');
            }
            data.push_str(value.trim());
        }
    }
    if data.is_empty() {
        return Some((Parsed::Skip, rest));
    }
    if data == "[DONE]" {
        return Some((Parsed::Done, rest));
    }

    match event_type {
        "error" => {
            let parsed = serde_json::from_str::<ErrorData>(&data).ok();
            let status = parsed.as_ref().and_then(|e| e.status).unwrap_or(500);
            let message = parsed
                .and_then(|e| e.message)
                .unwrap_or_else(|| data.clone());
            Some((Parsed::Error(Error::from_status(status, message, None)), rest))
        }
        "message" | "delta" => match serde_json::from_str::<ChunkData>(&data) {
            Ok(ChunkData {
                snapshot: Some(snapshot),
                ..
            }) => Some((Parsed::Chunk(StreamChunk::Snapshot(snapshot)), rest)),
            Ok(ChunkData {
                text: Some(text), ..
            }) => Some((Parsed::Chunk(StreamChunk::Delta(text)), rest)),
            Ok(_) => Some((Parsed::Skip, rest)),
            Err(e) => Some((Parsed::Error(e.into()), rest)),
        },
        "ping" => Some((Parsed::Skip, rest)),
        _ => Some((
            Parsed::Error(Error::serialization(
                format!("Unknown SSE event type: {event_type}"),
                None,
            )),
            rest,
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::stream;

    fn bytes_stream(
        chunks: Vec<&'static str>,
    ) -> impl Stream<Item = std::result::Result<Bytes, reqwest::Error>> + Unpin + Send + 'static
    {
        stream::iter(
            chunks
                .into_iter()
                .map(|c| Ok(Bytes::from_static(c.as_bytes()))),
        )
    }

    #[tokio::test]
    async fn parse_delta_events() {
        let data = "data: {\"text\": \"Hel\"}\n\ndata: {\"text\": \"lo\"}\n\ndata: [DONE]\n\n";
        let chunks: Vec<_> = process_sse(bytes_stream(vec![data])).collect().await;
        assert_eq!(chunks.len(), 2);
        assert!(matches!(&chunks[0], Ok(StreamChunk::Delta(t)) if t == "Hel"));
        assert!(matches!(&chunks[1], Ok(StreamChunk::Delta(t)) if t == "lo"));
    }

    #[tokio::test]
    async fn handle_split_event() {
        let chunks: Vec<_> = process_sse(bytes_stream(vec![
            "data: {\"te",
            "xt\": \"[SEARCH_QUERY]\"}\n",
            "\n",
        ]))
        .collect()
        .await;
        assert_eq!(chunks.len(), 1);
        assert!(matches!(&chunks[0], Ok(StreamChunk::Delta(t)) if t == "[SEARCH_QUERY]"));
    }

    #[tokio::test]
    async fn handle_codepoint_split_across_chunks() {
        let chunks: Vec<_> = process_sse(stream::iter(
            [
                &b"data: {\"text\": \"H\xc3"[..],
                &b"\xa0 N\xe1"[..],
                &b"\xbb\x99i\"}\r"[..],
                &b"\n\r\n"[..],
            ]
            .into_iter()
            .map(|c| Ok(Bytes::from_static(c))),
        ))
        .collect()
        .await;
        assert_eq!(chunks.len(), 1);
        assert!(matches!(&chunks[0], Ok(StreamChunk::Delta(t)) if t == "H\u{e0} N\u{1ed9}i"));
    }

    #[tokio::test]
    async fn invalid_utf8_is_an_encoding_error() {
        let chunks: Vec<_> = process_sse(stream::iter(
            [&b"data: {\"text\": \"\xff\"}\n\n"[..]]
                .into_iter()
                .map(|c| Ok(Bytes::from_static(c))),
        ))
        .collect()
        .await;
        assert_eq!(chunks.len(), 1);
        assert!(matches!(&chunks[0], Err(Error::Encoding { .. })));
    }

    #[tokio::test]
    async fn snapshot_and_ping() {
        let chunks: Vec<_> = process_sse(bytes_stream(vec![
            "event: ping\ndata: {}\n\n: keepalive\n\nevent: delta\ndata: {\"snapshot\": \"all of it\"}\n\n",
        ]))
        .collect()
        .await;
        assert_eq!(chunks.len(), 1);
        assert!(matches!(&chunks[0], Ok(StreamChunk::Snapshot(t)) if t == "all of it"));
    }

    #[tokio::test]
    async fn error_event_maps_status() {
        let chunks: Vec<_> = process_sse(bytes_stream(vec![
            "event: error\ndata: {\"status\": 429, \"message\": \"quota exceeded\"}\n\n",
        ]))
        .collect()
        .await;
        assert_eq!(chunks.len(), 1);
        assert!(matches!(&chunks[0], Err(Error::Quota { .. })));
    }

    #[tokio::test]
    async fn handle_unknown_event_type() {
        let chunks: Vec<_> = process_sse(bytes_stream(vec!["event: unknown\ndata: {}\n\n"]))
            .collect()
            .await;
        let err = chunks[0].as_ref().unwrap_err();
        assert!(err.to_string().contains("Unknown SSE event type"));
    }

    #[tokio::test]
    async fn trailing_event_without_terminator() {
        let chunks: Vec<_> = process_sse(bytes_stream(vec!["data: {\"text\": \"tail\"}"]))
            .collect()
            .await;
        assert_eq!(chunks.len(), 1);
        assert!(matches!(&chunks[0], Ok(StreamChunk::Delta(t)) if t == "tail"));
    }
}
