//! Operation events and server-sent-event framing.
//!
//! The control plane publishes one JSON [`OperationEvent`] per `data:` line.
//! [`SseDecoder`] turns arbitrary byte chunks into those payload lines, and
//! [`OperationEvent::step`] decides whether an event ends the operation.

use crate::error::{CoreError, OperationError};
use bytes::Bytes;
use futures::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use std::pin::Pin;

/// A stream of decoded operation events, in arrival order.
///
/// Dropping the stream closes the underlying connection.
pub type EventStream = Pin<Box<dyn Stream<Item = Result<OperationEvent, CoreError>> + Send>>;

/// Kind of an operation event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    /// Subscription accepted by the server.
    Connected,
    /// Intermediate progress report.
    Progress,
    /// Final result of the operation.
    Result,
    /// Operation failed.
    Error,
    /// Any type this client does not know about yet.
    #[serde(other)]
    Unknown,
}

/// One event of an operation's stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationEvent {
    /// Event type.
    #[serde(rename = "type")]
    pub kind: EventKind,
    /// Terminal flag; present on result events.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub success: Option<bool>,
    /// Human-readable status message.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// Error detail for failed operations.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// What the monitor should do after seeing an event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Step {
    /// Keep listening.
    Continue,
    /// The stream reached a terminal state.
    Done(Result<(), OperationError>),
}

impl OperationEvent {
    /// Create an event of the given kind with no payload.
    pub fn new(kind: EventKind) -> Self {
        Self {
            kind,
            success: None,
            message: None,
            error: None,
        }
    }

    /// Shorthand for a `connected` event.
    pub fn connected() -> Self {
        Self::new(EventKind::Connected)
    }

    /// Shorthand for a `progress` event carrying `message`.
    pub fn progress(message: impl Into<String>) -> Self {
        Self {
            message: Some(message.into()),
            ..Self::new(EventKind::Progress)
        }
    }

    /// Shorthand for a `result` event.
    pub fn result(success: bool, message: Option<String>) -> Self {
        Self {
            success: Some(success),
            message,
            ..Self::new(EventKind::Result)
        }
    }

    /// Shorthand for an `error` event.
    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            error: Some(error.into()),
            ..Self::new(EventKind::Error)
        }
    }

    /// Whether this event ends the stream.
    pub fn is_terminal(&self) -> bool {
        matches!(self.kind, EventKind::Result | EventKind::Error) || self.success.is_some()
    }

    /// Reduce this event given the last progress message seen so far.
    pub fn step(&self, last_message: Option<&str>) -> Step {
        if !self.is_terminal() {
            return Step::Continue;
        }

        if self.kind != EventKind::Error && self.success == Some(true) {
            return Step::Done(Ok(()));
        }

        // `result` without a success flag is not treated as success.
        let message = self
            .error
            .clone()
            .or_else(|| self.message.clone())
            .or_else(|| last_message.map(str::to_string))
            .unwrap_or_else(|| match self.success {
                Some(false) => "operation reported failure".to_string(),
                _ => format!("{:?} event without success flag", self.kind).to_lowercase(),
            });
        Step::Done(Err(OperationError::Failed { message }))
    }
}

/// Incremental decoder for `text/event-stream` bodies.
///
/// Every `data:` line carries one complete payload and is surfaced as soon
/// as its line ends; blank separator lines are not required. `event:`,
/// `id:`, `retry:` and comment lines are ignored.
#[derive(Debug, Default)]
pub struct SseDecoder {
    buffer: Vec<u8>,
}

impl SseDecoder {
    /// Create an empty decoder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk and return every payload whose line it completes.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.buffer.extend_from_slice(chunk);
        let mut out = Vec::new();

        while let Some(pos) = self.buffer.iter().position(|b| *b == b'\n') {
            let raw: Vec<u8> = self.buffer.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&raw);
            if let Some(data) = data_payload(line.trim_end_matches(['\n', '\r'])) {
                out.push(data);
            }
        }
        out
    }

    /// Flush a trailing `data:` line left without a newline when the body ends.
    pub fn finish(&mut self) -> Option<String> {
        if self.buffer.is_empty() {
            return None;
        }
        let raw = std::mem::take(&mut self.buffer);
        let line = String::from_utf8_lossy(&raw);
        data_payload(line.trim_end_matches('\r'))
    }
}

fn data_payload(line: &str) -> Option<String> {
    let value = line.strip_prefix("data:")?;
    let value = value.strip_prefix(' ').unwrap_or(value);
    (!value.trim().is_empty()).then(|| value.to_string())
}

/// Decode a raw SSE body into an [`EventStream`].
///
/// Payloads that are not valid event JSON are logged and skipped. A
/// transport error ends the stream with that error.
pub fn decode_event_stream<S, E>(body: S, correlation_id: String) -> EventStream
where
    S: Stream<Item = Result<Bytes, E>> + Send + 'static,
    E: std::fmt::Display + Send + 'static,
{
    let stream = async_stream::stream! {
        let mut body = Box::pin(body);
        let mut decoder = SseDecoder::new();

        while let Some(chunk) = body.next().await {
            match chunk {
                Ok(bytes) => {
                    for payload in decoder.push(&bytes) {
                        if let Some(event) = parse_payload(&payload, &correlation_id) {
                            yield Ok(event);
                        }
                    }
                }
                Err(e) => {
                    tracing::debug!(correlation_id = %correlation_id, error = %e, "Event stream read failed");
                    yield Err(CoreError::Transport(e.to_string()));
                    return;
                }
            }
        }

        if let Some(payload) = decoder.finish() {
            if let Some(event) = parse_payload(&payload, &correlation_id) {
                yield Ok(event);
            }
        }
    };
    Box::pin(stream)
}

fn parse_payload(payload: &str, correlation_id: &str) -> Option<OperationEvent> {
    match serde_json::from_str::<OperationEvent>(payload) {
        Ok(event) => {
            tracing::trace!(correlation_id = %correlation_id, payload = %payload, "Event received");
            Some(event)
        }
        Err(e) => {
            tracing::warn!(correlation_id = %correlation_id, error = %e, payload = %payload, "Skipping malformed event");
            None
        }
    }
}
