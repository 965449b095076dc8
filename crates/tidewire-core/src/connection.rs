//! # Resilient Connection
//!
//! Client-side state machine that owns the transport for one stream:
//!
//! ```text
//! Idle → Connecting → Connected → (Stalled | TransportError) → Reconnecting → Connecting → …
//!                         │
//!                         └──▶ Terminal (done/error released)    any state ──▶ Abandoned (cancel)
//! ```
//!
//! Every connect sends the last delivered event id, so the server replays
//! exactly what the client is missing. Received frames go through the
//! [`Sequencer`]; only released fragments reach the [`DeliverySink`], and the
//! sink sees exactly one terminal callback. Reconnect delays follow
//! [`Backoff`](crate::retry::Backoff); the attempt counter resets once a
//! fragment or terminal event is released on a fresh connection.
//!
//! The driver is a single task multiplexing "next chunk", "stall check tick"
//! and "cancel" with `tokio::select!`, so transitions are serialized and the
//! previous transport is dropped before the next one is opened.

use std::time::Duration;

use serde::{Serialize, Serializer};
use serde_json::Value;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::config::ClientConfig;
use crate::event::{Completion, EventId, EventKind, FailureCode, StreamFailure, Usage};
use crate::sequencer::{SequenceError, Sequencer};
use crate::stall::StallDetector;
use crate::transport::{BoxedStream, Transport, TransportError};
use crate::wire::BlockDecoder;
use crate::{StreamId, ValidationError};

/// Connection lifecycle state, published on a `watch` channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Idle,
    Connecting,
    Connected,
    Stalled,
    TransportError,
    Reconnecting,
    Terminal,
    Abandoned,
}

impl ConnectionState {
    pub const fn is_final(self) -> bool {
        matches!(self, Self::Terminal | Self::Abandoned)
    }
}

/// One reconnect cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ConnectionAttempt {
    /// 1-based count of consecutive reconnects since the last delivery.
    pub attempt_number: u32,
    #[serde(rename = "scheduled_delay_ms", serialize_with = "as_millis")]
    pub scheduled_delay: Duration,
    /// Signed jitter (ms) included in `scheduled_delay`.
    pub jitter_applied: i64,
    pub last_event_id_sent: Option<EventId>,
}

fn as_millis<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_u64(duration.as_millis() as u64)
}

/// Application-facing callbacks. Raw events never reach the sink.
pub trait DeliverySink: Send {
    fn on_delivered(&mut self, stream_id: &StreamId, payload: &Value);
    fn on_complete(&mut self, stream_id: &StreamId, completion: &Completion);
    fn on_error(&mut self, stream_id: &StreamId, failure: &StreamFailure);
}

/// How the connection ended.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum StreamOutcome {
    Completed(Completion),
    Failed(StreamFailure),
    /// The caller cancelled before a terminal event arrived.
    Abandoned,
}

/// Sink that keeps everything in memory.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CollectingSink {
    pub payloads: Vec<Value>,
    pub outcome: Option<StreamOutcome>,
}

impl DeliverySink for CollectingSink {
    fn on_delivered(&mut self, _stream_id: &StreamId, payload: &Value) {
        self.payloads.push(payload.clone());
    }

    fn on_complete(&mut self, _stream_id: &StreamId, completion: &Completion) {
        self.outcome = Some(StreamOutcome::Completed(*completion));
    }

    fn on_error(&mut self, _stream_id: &StreamId, failure: &StreamFailure) {
        self.outcome = Some(StreamOutcome::Failed(failure.clone()));
    }
}

/// Statistics for a finished connection run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConnectionReport {
    pub stream_id: StreamId,
    pub outcome: StreamOutcome,
    pub attempts: Vec<ConnectionAttempt>,
    /// Unique fragments handed to the sink.
    pub delivered: u64,
    pub duplicates_dropped: u64,
    pub liveness_seen: u64,
    pub malformed_blocks: u64,
    pub stalls: u64,
    pub last_event_id: Option<EventId>,
}

impl ConnectionReport {
    fn new(stream_id: StreamId) -> Self {
        Self {
            stream_id,
            outcome: StreamOutcome::Abandoned,
            attempts: Vec::new(),
            delivered: 0,
            duplicates_dropped: 0,
            liveness_seen: 0,
            malformed_blocks: 0,
            stalls: 0,
            last_event_id: None,
        }
    }

    /// Unique fragments delivered divided by `expected`.
    pub fn completion_rate(&self, expected: u64) -> f64 {
        if expected == 0 {
            return 1.0;
        }
        self.delivered as f64 / expected as f64
    }
}

/// Why a connected transport stopped being read.
enum PumpExit {
    Finished(StreamOutcome),
    Cancelled,
    Stalled,
    Dropped(TransportError),
    Fatal(StreamFailure),
}

/// Explicit reconnecting reader for one stream at a time.
#[derive(Debug)]
pub struct ResilientConnection<T> {
    transport: T,
    config: ClientConfig,
    rng: fastrand::Rng,
    state: watch::Sender<ConnectionState>,
}

impl<T: Transport> ResilientConnection<T> {
    pub fn new(transport: T, config: ClientConfig) -> Result<Self, ValidationError> {
        config.validate()?;
        let (state, _) = watch::channel(ConnectionState::Idle);
        Ok(Self {
            transport,
            config,
            rng: fastrand::Rng::new(),
            state,
        })
    }

    /// Seed the jitter source.
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.rng = fastrand::Rng::with_seed(seed);
        self
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    /// Follow `stream_id` until it ends. Never cancelled.
    pub async fn start<S>(&mut self, stream_id: StreamId, sink: &mut S) -> ConnectionReport
    where
        S: DeliverySink + ?Sized,
    {
        let (_keep, cancel) = watch::channel(false);
        self.run(stream_id, sink, cancel).await
    }

    /// Follow `stream_id` until a terminal event, a non-retryable failure, or
    /// `cancel` turning `true`.
    pub async fn run<S>(
        &mut self,
        stream_id: StreamId,
        sink: &mut S,
        mut cancel: watch::Receiver<bool>,
    ) -> ConnectionReport
    where
        S: DeliverySink + ?Sized,
    {
        let mut report = ConnectionReport::new(stream_id.clone());
        let mut sequencer = Sequencer::new(stream_id.clone(), self.config.max_pending);
        let mut attempt: u32 = 0;
        let mut retry_hint: Option<Duration> = None;
        let mut first_connect = true;

        let outcome = loop {
            if !first_connect {
                self.transition(&stream_id, ConnectionState::Reconnecting);
                let delay = self
                    .config
                    .backoff
                    .schedule_with(attempt, retry_hint, &mut self.rng);
                attempt = attempt.saturating_add(1);
                report.attempts.push(ConnectionAttempt {
                    attempt_number: attempt,
                    scheduled_delay: delay.scheduled,
                    jitter_applied: delay.jitter_ms,
                    last_event_id_sent: sequencer.last_delivered(),
                });
                tracing::info!(
                    stream_id = %stream_id,
                    attempt,
                    delay_ms = delay.scheduled.as_millis() as u64,
                    jitter_ms = delay.jitter_ms,
                    "reconnect scheduled"
                );

                tokio::select! {
                    () = cancelled(&mut cancel) => break StreamOutcome::Abandoned,
                    () = tokio::time::sleep(delay.scheduled) => {}
                }
            }
            first_connect = false;

            self.transition(&stream_id, ConnectionState::Connecting);
            let last_event_id = sequencer.last_delivered();
            let connected = tokio::select! {
                () = cancelled(&mut cancel) => break StreamOutcome::Abandoned,
                result = tokio::time::timeout(
                    self.config.connect_timeout,
                    self.transport.connect(&stream_id, last_event_id),
                ) => result,
            };

            let mut stream = match connected {
                Ok(Ok(stream)) => stream,
                Ok(Err(error)) if !error.is_retryable() => {
                    let failure = StreamFailure::new(error.failure_code());
                    tracing::warn!(stream_id = %stream_id, error = %error, "connect failed permanently");
                    sink.on_error(&stream_id, &failure);
                    break StreamOutcome::Failed(failure);
                }
                Ok(Err(error)) => {
                    tracing::warn!(stream_id = %stream_id, error = %error, "connect failed");
                    self.transition(&stream_id, ConnectionState::TransportError);
                    continue;
                }
                Err(_) => {
                    tracing::warn!(
                        stream_id = %stream_id,
                        timeout_ms = self.config.connect_timeout.as_millis() as u64,
                        "connect timed out"
                    );
                    self.transition(&stream_id, ConnectionState::TransportError);
                    continue;
                }
            };

            self.transition(&stream_id, ConnectionState::Connected);
            tracing::debug!(stream_id = %stream_id, last_event_id = ?last_event_id, "transport connected");

            let exit = self
                .pump(
                    &mut stream,
                    &mut sequencer,
                    sink,
                    &mut cancel,
                    &mut report,
                    &mut attempt,
                    &mut retry_hint,
                )
                .await;
            drop(stream);

            match exit {
                PumpExit::Finished(outcome) => break outcome,
                PumpExit::Cancelled => break StreamOutcome::Abandoned,
                PumpExit::Fatal(failure) => {
                    sink.on_error(&stream_id, &failure);
                    break StreamOutcome::Failed(failure);
                }
                PumpExit::Stalled => {
                    report.stalls += 1;
                    self.transition(&stream_id, ConnectionState::Stalled);
                }
                PumpExit::Dropped(error) => {
                    tracing::warn!(
                        stream_id = %stream_id,
                        error = %error,
                        last_event_id = ?sequencer.last_delivered(),
                        "transport dropped"
                    );
                    self.transition(&stream_id, ConnectionState::TransportError);
                }
            }
        };

        let final_state = match outcome {
            StreamOutcome::Abandoned => ConnectionState::Abandoned,
            _ => ConnectionState::Terminal,
        };
        self.transition(&stream_id, final_state);

        report.outcome = outcome;
        report.duplicates_dropped = sequencer.stats().duplicates;
        report.last_event_id = sequencer.last_delivered();
        report
    }

    /// Run in the background; the returned handle cancels and observes it.
    pub fn spawn<S>(mut self, stream_id: StreamId, mut sink: S) -> ConnectionHandle<S>
    where
        T: 'static,
        S: DeliverySink + 'static,
    {
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let state = self.subscribe();
        let task = tokio::spawn(async move {
            let report = self.run(stream_id, &mut sink, cancel_rx).await;
            (report, sink)
        });
        ConnectionHandle {
            cancel: cancel_tx,
            state,
            task,
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn pump<S>(
        &self,
        stream: &mut BoxedStream,
        sequencer: &mut Sequencer,
        sink: &mut S,
        cancel: &mut watch::Receiver<bool>,
        report: &mut ConnectionReport,
        attempt: &mut u32,
        retry_hint: &mut Option<Duration>,
    ) -> PumpExit
    where
        S: DeliverySink + ?Sized,
    {
        let stream_id = sequencer.stream_id().clone();
        let mut decoder = BlockDecoder::new();
        let mut stall = StallDetector::new(self.config.stall_window);
        let mut ticker = tokio::time::interval(self.config.stall_check_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut malformed_streak: u32 = 0;

        loop {
            // One read stays in flight across stall ticks; it is only dropped
            // when the whole transport is abandoned.
            let chunk = {
                let mut read = stream.next_chunk();
                loop {
                    tokio::select! {
                        biased;
                        () = cancelled(cancel) => return PumpExit::Cancelled,
                        _ = ticker.tick() => {
                            if stall.is_stalled() {
                                tracing::warn!(
                                    stream_id = %stream_id,
                                    silence_ms = stall.silence().as_millis() as u64,
                                    "stall detected"
                                );
                                return PumpExit::Stalled;
                            }
                        }
                        chunk = &mut read => break chunk,
                    }
                }
            };

            match chunk {
                Ok(Some(bytes)) => decoder.push(&bytes),
                Ok(None) => {
                    return PumpExit::Dropped(TransportError::reset(
                        "server closed the stream before its terminal event",
                    ))
                }
                Err(error) if error.is_retryable() => return PumpExit::Dropped(error),
                Err(error) => {
                    tracing::warn!(stream_id = %stream_id, error = %error, "transport failed permanently");
                    return PumpExit::Fatal(StreamFailure::new(error.failure_code()));
                }
            }

            while let Some(frame) = decoder.next_frame() {
                let frame = match frame {
                    Ok(frame) => frame,
                    Err(error) => {
                        report.malformed_blocks += 1;
                        malformed_streak += 1;
                        tracing::warn!(stream_id = %stream_id, error = %error, "malformed block dropped");
                        if malformed_streak >= self.config.malformed_limit {
                            return PumpExit::Dropped(TransportError::unexpected(format!(
                                "{malformed_streak} consecutive malformed blocks"
                            )));
                        }
                        continue;
                    }
                };
                malformed_streak = 0;
                stall.touch();
                if let Some(hint) = frame.retry_hint {
                    *retry_hint = Some(hint);
                }

                let released = match sequencer.process(frame.event) {
                    Ok(released) => released,
                    Err(error @ SequenceError::PendingOverflow { .. }) => {
                        return PumpExit::Dropped(TransportError::unexpected(error.to_string()))
                    }
                    Err(error @ SequenceError::ForeignStream { .. }) => {
                        report.malformed_blocks += 1;
                        tracing::warn!(stream_id = %stream_id, error = %error, "foreign event dropped");
                        continue;
                    }
                };
                // Liveness alone does not prove the connection is useful.
                if released.iter().any(|event| event.kind != EventKind::Liveness) {
                    *attempt = 0;
                }

                for event in released {
                    match event.kind {
                        EventKind::Fragment => {
                            report.delivered += 1;
                            sink.on_delivered(&stream_id, &event.payload);
                        }
                        EventKind::Liveness => report.liveness_seen += 1,
                        EventKind::Done => {
                            let completion = event.completion().unwrap_or(Completion {
                                usage: Usage::default(),
                                fragments: report.delivered,
                            });
                            sink.on_complete(&stream_id, &completion);
                            return PumpExit::Finished(StreamOutcome::Completed(completion));
                        }
                        EventKind::Error => {
                            let failure = event
                                .failure()
                                .unwrap_or_else(|| StreamFailure::new(FailureCode::Protocol));
                            sink.on_error(&stream_id, &failure);
                            return PumpExit::Finished(StreamOutcome::Failed(failure));
                        }
                    }
                }
            }
        }
    }

    fn transition(&self, stream_id: &StreamId, next: ConnectionState) {
        let previous = self.state.send_replace(next);
        if previous != next {
            tracing::debug!(stream_id = %stream_id, from = ?previous, to = ?next, "connection state changed");
        }
    }
}

/// Resolves once the cancel flag is set; pends forever if the sender is gone.
async fn cancelled(cancel: &mut watch::Receiver<bool>) {
    loop {
        if *cancel.borrow_and_update() {
            return;
        }
        if cancel.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

/// Control handle for a spawned [`ResilientConnection`].
#[derive(Debug)]
pub struct ConnectionHandle<S> {
    cancel: watch::Sender<bool>,
    state: watch::Receiver<ConnectionState>,
    task: JoinHandle<(ConnectionReport, S)>,
}

impl<S> ConnectionHandle<S> {
    /// Abandon the stream. The sink receives no further callbacks.
    pub fn cancel(&self) {
        self.cancel.send_replace(true);
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Watch transitions, e.g. to show a transient "reconnecting" status.
    pub fn states(&self) -> watch::Receiver<ConnectionState> {
        self.state.clone()
    }

    pub async fn join(self) -> Result<(ConnectionReport, S), tokio::task::JoinError> {
        self.task.await
    }
}
