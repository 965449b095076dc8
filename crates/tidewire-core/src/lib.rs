//! # Tidewire Core
//!
//! Resumable streaming delivery: an ordered, exactly-once-to-the-application
//! event stream that survives dropped connections, silent stalls and client
//! reconnects without losing or duplicating fragments.
//!
//! ## Overview
//!
//! - **Server side**: a [`StreamStore`] keeps a bounded, append-only log per
//!   stream; an [`Emitter`] drives an upstream [`Producer`] into it, adding
//!   liveness events while the producer is quiet.
//! - **Wire**: one text block per event (`event`, `id`, optional `retry`,
//!   `data`), see [`wire`].
//! - **Client side**: a [`ResilientConnection`] reconnects with backoff and
//!   the last delivered id, a [`StallDetector`] turns silence into a
//!   reconnect, and a [`Sequencer`] releases every fragment exactly once, in
//!   id order, to a [`DeliverySink`].
//!
//! ## Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | [`config`] | Emitter, retention and client tunables |
//! | [`connection`] | Reconnecting client state machine |
//! | [`domain`] | Stream ids and UTC timestamps |
//! | [`emitter`] | Producer driver and liveness emission |
//! | [`error`] | Validation and umbrella error types |
//! | [`event`] | Event model, usage and failure payloads |
//! | [`http_transport`] | reqwest client for the HTTP wire endpoint |
//! | [`producer`] | Upstream producer contract and stock producers |
//! | [`retry`] | Capped exponential backoff with jitter |
//! | [`sequencer`] | Dedup window and in-order release |
//! | [`stall`] | Silence watchdog |
//! | [`store`] | Per-stream event log with replay and retention |
//! | [`transport`] | Transport contract and fault-injecting memory transport |
//! | [`wire`] | Block encoding, incremental decoding, capture validation |
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────┐    ┌──────────┐    ┌─────────────┐
//! │ Producer │───▶│ Emitter  │───▶│ StreamStore │
//! └──────────┘    └──────────┘    └──────┬──────┘
//!                                        │ replay + live tail
//!                                        ▼
//!                                 ┌─────────────┐
//!                                 │  Transport  │ (memory / HTTP)
//!                                 └──────┬──────┘
//!                                        │ wire blocks
//!                                        ▼
//! ┌─────────────┐   ┌───────────┐  ┌─────────────────────┐
//! │DeliverySink │◀──│ Sequencer │◀─│ ResilientConnection │◀─ StallDetector
//! └─────────────┘   └───────────┘  └─────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use tidewire_core::{
//!     ClientConfig, CollectingSink, Emitter, EmitterConfig, MemoryTransport,
//!     ResilientConnection, ScriptedProducer, StreamId, StreamStore, Usage,
//! };
//!
//! let store = StreamStore::default();
//! let stream_id = StreamId::generate();
//! let writer = store.open(stream_id.clone())?;
//! Emitter::new(writer, EmitterConfig::default())
//!     .spawn(ScriptedProducer::numbered(10, Usage::default()));
//!
//! let mut connection =
//!     ResilientConnection::new(MemoryTransport::new(store), ClientConfig::default())?;
//! let mut sink = CollectingSink::default();
//! let report = connection.start(stream_id, &mut sink).await;
//! assert_eq!(report.delivered, 10);
//! ```

pub mod config;
pub mod connection;
pub mod domain;
pub mod emitter;
pub mod error;
pub mod event;
pub mod http_transport;
pub mod producer;
pub mod retry;
pub mod sequencer;
pub mod stall;
pub mod store;
pub mod transport;
pub mod wire;

pub use config::{ClientConfig, EmitterConfig, RetentionConfig};
pub use connection::{
    CollectingSink, ConnectionAttempt, ConnectionHandle, ConnectionReport, ConnectionState,
    DeliverySink, ResilientConnection, StreamOutcome,
};
pub use domain::{StreamId, UtcDateTime};
pub use emitter::{Emitter, EmitterOutcome, EmitterSummary};
pub use error::{CoreError, ValidationError};
pub use event::{Completion, Event, EventId, EventKind, FailureCode, StreamFailure, Usage};
pub use http_transport::HttpTransport;
pub use producer::{ChannelProducer, Producer, ProducerError, ProducerItem, ScriptedProducer};
pub use retry::{Backoff, ScheduledDelay};
pub use sequencer::{SequenceError, Sequencer, SequencerStats};
pub use stall::StallDetector;
pub use store::{EventCursor, StoreError, StoreStats, StreamCounters, StreamStore, StreamWriter};
pub use transport::{
    BoxedStream, ConnectionFaults, MemoryTransport, Transport, TransportError, TransportErrorKind,
    TransportStream,
};
pub use wire::{
    decode_block, encode_event, resolve_last_event_id, validate_capture, BlockDecoder,
    CaptureError, CaptureSummary, Frame, WireError,
};
