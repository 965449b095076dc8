use thiserror::Error;

use crate::store::StoreError;
use crate::transport::TransportError;
use crate::wire::WireError;

/// Validation and contract errors exposed by `tidewire-core`.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ValidationError {
    #[error("stream id cannot be empty")]
    EmptyStreamId,
    #[error("stream id length {len} exceeds max {max}")]
    StreamIdTooLong { len: usize, max: usize },
    #[error("stream id contains invalid character '{ch}' at index {index}")]
    StreamIdInvalidChar { ch: char, index: usize },

    #[error("timestamp must be RFC3339 UTC (suffix Z): '{value}'")]
    TimestampNotUtc { value: String },

    #[error("invalid event type '{value}', expected one of fragment, liveness, done, error")]
    InvalidEventKind { value: String },
    #[error("invalid last event id '{value}'")]
    InvalidLastEventId { value: String },
    #[error("invalid request body: {message}")]
    InvalidRequestBody { message: String },

    #[error("config field '{field}' must be greater than zero")]
    ZeroDuration { field: &'static str },
    #[error("config field '{field}' must be greater than zero")]
    ZeroLimit { field: &'static str },
    #[error("stall window ({stall_ms}ms) must be at least twice the check interval ({check_ms}ms)")]
    StallWindowTooShort { stall_ms: u64, check_ms: u64 },
    #[error("backoff jitter ratio must be within 0.0..1.0, got {value}")]
    InvalidJitter { value: f64 },
    #[error("backoff factor must be a finite value of at least 1.0, got {value}")]
    InvalidBackoffFactor { value: f64 },
    #[error("backoff max delay ({max_ms}ms) must not be below the base delay ({base_ms}ms)")]
    BackoffMaxBelowBase { base_ms: u64, max_ms: u64 },
}

/// Top-level error type for core operations.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Wire(#[from] WireError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}
