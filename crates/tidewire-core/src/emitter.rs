//! # Stream Emitter
//!
//! Drives a [`Producer`] and appends what it yields to the stream's log
//! through the stream's single [`StreamWriter`].
//!
//! - every fragment becomes a `fragment` event;
//! - when nothing has been appended for `liveness_interval`, a `liveness`
//!   event is appended so idle-timeout intermediaries keep the connection up;
//! - completion appends `done` with usage totals, failure appends a sanitized
//!   `error` event. Either one ends the stream.
//!
//! Liveness events consume ids like any other event, which keeps the
//! gap-free numbering uniform for the sequencer.

use serde::Serialize;
use serde_json::Value;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::config::EmitterConfig;
use crate::event::{Completion, EventId, EventKind, FailureCode, StreamFailure, Usage};
use crate::producer::{Producer, ProducerError, ProducerItem};
use crate::store::{StoreError, StreamCounters, StreamWriter};
use crate::StreamId;

/// How the producer's sequence ended.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum EmitterOutcome {
    Completed(Completion),
    Failed(StreamFailure),
}

/// Result of a full emitter run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EmitterSummary {
    pub stream_id: StreamId,
    /// Id of the terminal event.
    pub terminal_event_id: EventId,
    pub counters: StreamCounters,
    pub outcome: EmitterOutcome,
}

/// Single writer for one stream.
#[derive(Debug)]
pub struct Emitter {
    writer: StreamWriter,
    config: EmitterConfig,
    opened_at: Instant,
}

impl Emitter {
    pub fn new(writer: StreamWriter, config: EmitterConfig) -> Self {
        Self {
            writer,
            config,
            opened_at: Instant::now(),
        }
    }

    pub fn stream_id(&self) -> &StreamId {
        self.writer.stream_id()
    }

    pub fn emit_fragment(&mut self, payload: Value) -> Result<EventId, StoreError> {
        self.writer.append(EventKind::Fragment, payload)
    }

    pub fn emit_liveness(&mut self) -> Result<EventId, StoreError> {
        let event_id = self.writer.append(EventKind::Liveness, Value::Null)?;
        tracing::debug!(stream_id = %self.writer.stream_id(), event_id, "liveness emitted");
        Ok(event_id)
    }

    /// Append the `done` event. Latency is measured from emitter creation.
    pub fn complete(self, usage: Usage) -> Result<EmitterSummary, StoreError> {
        let latency_ms = self.opened_at.elapsed().as_millis() as u64;
        let counters = self.writer.counters();
        let stream_id = self.writer.stream_id().clone();
        let completion = Completion {
            usage: usage.with_latency_ms(latency_ms),
            fragments: counters.fragments,
        };
        let terminal_event_id = self.writer.close(completion)?;

        tracing::info!(
            stream_id = %stream_id,
            fragments = completion.fragments,
            latency_ms,
            "stream completed"
        );
        Ok(EmitterSummary {
            stream_id,
            terminal_event_id,
            counters,
            outcome: EmitterOutcome::Completed(completion),
        })
    }

    /// Append a sanitized `error` event; `error`'s detail is only logged.
    pub fn fail(mut self, error: &ProducerError) -> Result<EmitterSummary, StoreError> {
        let failure = StreamFailure::new(FailureCode::Producer);
        let payload = serde_json::to_value(&failure).unwrap_or(Value::Null);
        let terminal_event_id = self.writer.append(EventKind::Error, payload)?;

        tracing::warn!(
            stream_id = %self.writer.stream_id(),
            detail = %error,
            "producer failed; stream terminated"
        );
        Ok(self.summary(terminal_event_id, EmitterOutcome::Failed(failure)))
    }

    /// Drain `producer` into the stream until it completes or fails.
    pub async fn run<P>(mut self, producer: &mut P) -> Result<EmitterSummary, StoreError>
    where
        P: Producer + ?Sized,
    {
        let interval = self.config.liveness_interval;
        let idle = tokio::time::sleep(interval);
        tokio::pin!(idle);

        loop {
            let item = {
                let next = producer.next_item();
                tokio::pin!(next);
                loop {
                    tokio::select! {
                        item = &mut next => break item,
                        () = &mut idle => {
                            self.emit_liveness()?;
                            idle.as_mut().reset(Instant::now() + interval);
                        }
                    }
                }
            };

            match item {
                Some(ProducerItem::Fragment(payload)) => {
                    self.emit_fragment(payload)?;
                    idle.as_mut().reset(Instant::now() + interval);
                }
                Some(ProducerItem::Complete(usage)) => return self.complete(usage),
                Some(ProducerItem::Failed(error)) => return self.fail(&error),
                None => {
                    return self.fail(&ProducerError::new(
                        "producer ended without a completion marker",
                    ))
                }
            }
        }
    }

    /// Run the emitter as its own task.
    pub fn spawn<P>(self, mut producer: P) -> JoinHandle<Result<EmitterSummary, StoreError>>
    where
        P: Producer + 'static,
    {
        tokio::spawn(async move { self.run(&mut producer).await })
    }

    fn summary(&self, terminal_event_id: EventId, outcome: EmitterOutcome) -> EmitterSummary {
        EmitterSummary {
            stream_id: self.writer.stream_id().clone(),
            terminal_event_id,
            counters: self.writer.counters(),
            outcome,
        }
    }
}
