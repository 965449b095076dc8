//! # Event Model
//!
//! In-memory representation of one streamed unit plus the typed payloads
//! carried by terminal events.
//!
//! ## Event Types
//!
//! | Kind | Wire name | Payload |
//! |------|-----------|---------|
//! | [`EventKind::Fragment`] | `fragment` | opaque JSON produced upstream |
//! | [`EventKind::Liveness`] | `liveness` | `null` |
//! | [`EventKind::Done`] | `done` | [`Completion`] |
//! | [`EventKind::Error`] | `error` | [`StreamFailure`] |
//!
//! Every kind consumes an event id, so the ids of one stream form a gap-free
//! sequence starting at 0 regardless of how many liveness events were mixed in.

use std::fmt::{Display, Formatter};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{StreamId, UtcDateTime, ValidationError};

/// Per-stream sequence number assigned at emission.
pub type EventId = u64;

/// Type of a streamed event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    /// Content fragment destined for the application.
    Fragment,
    /// Keep-alive proving the stream is still producing.
    Liveness,
    /// Successful end of stream carrying usage totals.
    Done,
    /// Failed end of stream carrying a sanitized failure.
    Error,
}

impl EventKind {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Fragment => "fragment",
            Self::Liveness => "liveness",
            Self::Done => "done",
            Self::Error => "error",
        }
    }

    /// `done` and `error` close the stream; nothing follows them.
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Done | Self::Error)
    }
}

impl Display for EventKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventKind {
    type Err = ValidationError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "fragment" => Ok(Self::Fragment),
            "liveness" => Ok(Self::Liveness),
            "done" => Ok(Self::Done),
            "error" => Ok(Self::Error),
            other => Err(ValidationError::InvalidEventKind {
                value: other.to_owned(),
            }),
        }
    }
}

/// One atomically delivered unit of a stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub stream_id: StreamId,
    pub event_id: EventId,
    pub kind: EventKind,
    pub payload: Value,
    pub emitted_at: UtcDateTime,
}

impl Event {
    pub fn new(stream_id: StreamId, event_id: EventId, kind: EventKind, payload: Value) -> Self {
        Self {
            stream_id,
            event_id,
            kind,
            payload,
            emitted_at: UtcDateTime::now(),
        }
    }

    pub const fn is_terminal(&self) -> bool {
        self.kind.is_terminal()
    }

    /// Decode the usage summary of a `done` event.
    pub fn completion(&self) -> Option<Completion> {
        match self.kind {
            EventKind::Done => serde_json::from_value(self.payload.clone()).ok(),
            _ => None,
        }
    }

    /// Decode the failure carried by an `error` event.
    ///
    /// A malformed error payload still yields a failure so the stream never
    /// ends without an outcome.
    pub fn failure(&self) -> Option<StreamFailure> {
        match self.kind {
            EventKind::Error => Some(
                serde_json::from_value(self.payload.clone())
                    .unwrap_or_else(|_| StreamFailure::new(FailureCode::Protocol)),
            ),
            _ => None,
        }
    }
}

/// Aggregate usage counters reported with the terminal `done` event.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Usage {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cost_usd: f64,
    pub latency_ms: u64,
}

impl Usage {
    pub fn new(input_tokens: u64, output_tokens: u64, cost_usd: f64) -> Self {
        Self {
            input_tokens,
            output_tokens,
            cost_usd,
            latency_ms: 0,
        }
    }

    pub fn with_latency_ms(mut self, latency_ms: u64) -> Self {
        self.latency_ms = latency_ms;
        self
    }
}

/// Payload of the `done` event.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Completion {
    pub usage: Usage,
    /// Number of fragment events emitted before `done`.
    pub fragments: u64,
}

/// Machine-readable failure classes that may reach the wire or the application.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureCode {
    /// Upstream generation failed.
    Producer,
    /// The stream is unknown to the server.
    NotFound,
    /// The requested resume point fell outside the server's retention window.
    RetentionExceeded,
    /// The server kept sending data the client could not sequence.
    Protocol,
}

impl FailureCode {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Producer => "stream.producer_failed",
            Self::NotFound => "stream.not_found",
            Self::RetentionExceeded => "stream.retention_exceeded",
            Self::Protocol => "stream.protocol_violation",
        }
    }

    /// Fixed public description; internal detail never leaves the server.
    pub const fn public_message(self) -> &'static str {
        match self {
            Self::Producer => "response generation failed",
            Self::NotFound => "stream does not exist or has expired",
            Self::RetentionExceeded => "stream history is no longer available for resumption",
            Self::Protocol => "stream data could not be sequenced",
        }
    }
}

/// Sanitized failure delivered through `error` events and `on_error`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamFailure {
    pub code: FailureCode,
    pub message: String,
}

impl StreamFailure {
    pub fn new(code: FailureCode) -> Self {
        Self {
            code,
            message: code.public_message().to_owned(),
        }
    }
}

impl Display for StreamFailure {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.message, self.code.as_str())
    }
}
