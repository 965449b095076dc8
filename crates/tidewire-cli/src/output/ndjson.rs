//! NDJSON rendering of a delivered stream.
//!
//! | Event | Emitted when |
//! |-------|--------------|
//! | `start` | Before the first connect |
//! | `chunk` | A fragment is delivered |
//! | `end` | The stream completed (carries usage) |
//! | `error` | The stream failed |

use std::io::Write;

use serde::Serialize;
use serde_json::{json, Value};
use tidewire_core::{Completion, DeliverySink, StreamFailure, StreamId, UtcDateTime};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LineType {
    Start,
    Chunk,
    End,
    Error,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LineError {
    pub code: String,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Line {
    pub event: LineType,
    /// Starts at 1 and increases by one per line.
    pub seq: u64,
    pub ts: UtcDateTime,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<LineError>,
}

/// Line-per-event writer.
pub struct NdjsonWriter<W: Write> {
    writer: W,
    next_seq: u64,
}

impl<W: Write> NdjsonWriter<W> {
    pub fn new(writer: W) -> Self {
        Self {
            writer,
            next_seq: 1,
        }
    }

    pub fn emit_start(&mut self, data: Option<Value>) -> std::io::Result<()> {
        self.emit(LineType::Start, data, None)
    }

    pub fn emit_chunk(&mut self, data: Option<Value>) -> std::io::Result<()> {
        self.emit(LineType::Chunk, data, None)
    }

    pub fn emit_end(&mut self, data: Option<Value>) -> std::io::Result<()> {
        self.emit(LineType::End, data, None)
    }

    pub fn emit_error(&mut self, error: LineError) -> std::io::Result<()> {
        self.emit(LineType::Error, None, Some(error))
    }

    pub fn into_inner(self) -> W {
        self.writer
    }

    fn emit(
        &mut self,
        event: LineType,
        data: Option<Value>,
        error: Option<LineError>,
    ) -> std::io::Result<()> {
        let line = Line {
            event,
            seq: self.next_seq,
            ts: UtcDateTime::now(),
            data,
            error,
        };
        self.next_seq += 1;

        let payload = serde_json::to_string(&line)?;
        self.writer.write_all(payload.as_bytes())?;
        self.writer.write_all(b"\n")?;
        self.writer.flush()
    }
}

/// [`DeliverySink`] that renders deliveries as NDJSON lines.
///
/// Write failures cannot be returned through the sink callbacks; the first
/// one is kept and reported by [`NdjsonSink::finish`].
pub struct NdjsonSink<W: Write> {
    writer: NdjsonWriter<W>,
    failed: Option<std::io::Error>,
}

impl<W: Write> NdjsonSink<W> {
    pub fn new(writer: W) -> Self {
        Self {
            writer: NdjsonWriter::new(writer),
            failed: None,
        }
    }

    pub fn start(&mut self, stream_id: &StreamId) {
        let result = self
            .writer
            .emit_start(Some(json!({ "stream_id": stream_id })));
        self.record(result);
    }

    pub fn finish(self) -> std::io::Result<W> {
        match self.failed {
            Some(error) => Err(error),
            None => Ok(self.writer.into_inner()),
        }
    }

    fn record(&mut self, result: std::io::Result<()>) {
        if let Err(error) = result {
            tracing::warn!(error = %error, "failed to write output line");
            self.failed.get_or_insert(error);
        }
    }
}

impl<W: Write + Send> DeliverySink for NdjsonSink<W> {
    fn on_delivered(&mut self, _stream_id: &StreamId, payload: &Value) {
        let result = self.writer.emit_chunk(Some(payload.clone()));
        self.record(result);
    }

    fn on_complete(&mut self, _stream_id: &StreamId, completion: &Completion) {
        let data = serde_json::to_value(completion).ok();
        let result = self.writer.emit_end(data);
        self.record(result);
    }

    fn on_error(&mut self, _stream_id: &StreamId, failure: &StreamFailure) {
        let result = self.writer.emit_error(LineError {
            code: failure.code.as_str().to_owned(),
            message: failure.message.clone(),
        });
        self.record(result);
    }
}
