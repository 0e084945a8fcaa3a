//! Outbound event framing for the streaming chat endpoint.
//!
//! Every fragment travels as a JSON string literal, so line breaks inside a
//! fragment are escaped and never split an SSE `data:` line.

use axum::response::sse::Event;
use serde::Serialize;
use serde_json::json;

use parley_core::ids::SessionId;

pub const EVENT_SESSION: &str = "session";
pub const EVENT_DELTA: &str = "delta";
pub const EVENT_ERROR: &str = "error";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Upstream,
    Timeout,
}

/// One event sent from a relay to its caller.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RelayEvent {
    Session { session_id: SessionId },
    Delta(String),
    Error { kind: ErrorKind, message: String },
}

impl RelayEvent {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Session { .. } => EVENT_SESSION,
            Self::Delta(_) => EVENT_DELTA,
            Self::Error { .. } => EVENT_ERROR,
        }
    }

    /// The `data` payload, always a single line of JSON.
    pub fn payload(&self) -> String {
        match self {
            Self::Session { session_id } => json!({ "sessionId": session_id }).to_string(),
            Self::Delta(fragment) => encode_fragment(fragment),
            Self::Error { kind, message } => json!({ "kind": kind, "message": message }).to_string(),
        }
    }

    pub fn into_sse(self) -> Event {
        Event::default().event(self.name()).data(self.payload())
    }
}

/// Wrap a fragment for a line-oriented transport.
pub fn encode_fragment(fragment: &str) -> String {
    serde_json::Value::String(fragment.to_owned()).to_string()
}

/// Inverse of [`encode_fragment`].
pub fn decode_fragment(payload: &str) -> Result<String, serde_json::Error> {
    serde_json::from_str(payload)
}

/// A received SSE frame: event name and joined data lines.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Frame {
    pub event: String,
    pub data: String,
}

/// Split a complete `text/event-stream` body into frames.
pub fn parse_frames(body: &str) -> Vec<Frame> {
    let mut frames = Vec::new();
    let mut event = String::new();
    let mut data: Vec<&str> = Vec::new();

    for line in body.lines() {
        if line.is_empty() {
            if !data.is_empty() || !event.is_empty() {
                frames.push(Frame {
                    event: if event.is_empty() { "message".into() } else { std::mem::take(&mut event) },
                    data: data.join("\n"),
                });
                data.clear();
            }
            continue;
        }
        if let Some(rest) = line.strip_prefix("event:") {
            event = rest.trim_start().to_string();
        } else if let Some(rest) = line.strip_prefix("data:") {
            data.push(rest.strip_prefix(' ').unwrap_or(rest));
        }
    }
    if !data.is_empty() {
        frames.push(Frame {
            event: if event.is_empty() { "message".into() } else { event },
            data: data.join("\n"),
        });
    }
    frames
}
