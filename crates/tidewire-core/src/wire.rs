//! # Wire Format
//!
//! One event per text block, blocks separated by a blank line:
//!
//! ```text
//! event:fragment
//! id:12
//! retry:1000
//! data:{"stream_id":"reply-1","emitted_at":"2024-01-01T00:00:00Z","payload":{"text":"Hel"}}
//!
//! ```
//!
//! `retry` is optional and carries the server's suggested reconnect delay in
//! milliseconds. `data` is always a single line: the JSON serializer escapes
//! embedded newlines, so block framing survives arbitrary payload text.
//! Lines starting with `:` are comments and are skipped, which lets
//! intermediaries inject their own keep-alives without breaking decoding.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::event::{Event, EventId, EventKind};
use crate::{StreamId, UtcDateTime, ValidationError};

/// Header a reconnecting client uses to report its last delivered id.
pub const LAST_EVENT_ID_HEADER: &str = "last-event-id";
/// Query parameter equivalent of [`LAST_EVENT_ID_HEADER`].
pub const LAST_EVENT_ID_QUERY: &str = "last_event_id";
/// Content type of a wire stream.
pub const CONTENT_TYPE: &str = "text/event-stream";

const MAX_BLOCK_BYTES: usize = 1024 * 1024;

/// Malformed wire data (the protocol-error category).
#[derive(Debug, thiserror::Error, Clone, PartialEq)]
pub enum WireError {
    #[error("block is missing the '{field}' field")]
    MissingField { field: &'static str },
    #[error("block repeats the '{field}' field")]
    DuplicateField { field: &'static str },
    #[error("line without field separator: '{line}'")]
    MalformedLine { line: String },
    #[error(transparent)]
    InvalidKind(#[from] ValidationError),
    #[error("invalid numeric value for '{field}': '{value}'")]
    InvalidNumber { field: &'static str, value: String },
    #[error("data is not valid JSON: {message}")]
    InvalidData { message: String },
    #[error("block exceeds {max} bytes without a terminator")]
    BlockTooLarge { max: usize },
    #[error("block is not valid UTF-8")]
    InvalidUtf8,
}

/// A decoded block: the event plus the optional server retry hint.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    pub event: Event,
    pub retry_hint: Option<Duration>,
}

#[derive(Debug, Serialize, Deserialize)]
struct WireData {
    stream_id: StreamId,
    emitted_at: UtcDateTime,
    payload: Value,
}

/// Serialize one event into a wire block, including the trailing blank line.
pub fn encode_event(event: &Event, retry_hint: Option<Duration>) -> Result<String, serde_json::Error> {
    let data = serde_json::to_string(&WireData {
        stream_id: event.stream_id.clone(),
        emitted_at: event.emitted_at,
        payload: event.payload.clone(),
    })?;

    let mut block = String::with_capacity(data.len() + 48);
    block.push_str("event:");
    block.push_str(event.kind.as_str());
    block.push_str("\nid:");
    block.push_str(&event.event_id.to_string());
    block.push('\n');
    if let Some(retry) = retry_hint {
        block.push_str("retry:");
        block.push_str(&retry.as_millis().to_string());
        block.push('\n');
    }
    block.push_str("data:");
    block.push_str(&data);
    block.push_str("\n\n");
    Ok(block)
}

/// Parse a single block (without its terminating blank line).
///
/// Returns `Ok(None)` for blocks made only of comments.
pub fn decode_block(block: &str) -> Result<Option<Frame>, WireError> {
    let mut kind = None;
    let mut id = None;
    let mut retry = None;
    let mut data = None;
    let mut saw_field = false;

    for line in block.lines() {
        if line.is_empty() || line.starts_with(':') {
            continue;
        }
        let (name, value) = line.split_once(':').ok_or_else(|| WireError::MalformedLine {
            line: line.chars().take(80).collect(),
        })?;
        let value = value.strip_prefix(' ').unwrap_or(value);
        saw_field = true;

        match name {
            "event" => set_once(&mut kind, "event", value.parse::<EventKind>()?)?,
            "id" => set_once(&mut id, "id", parse_number::<EventId>("id", value)?)?,
            "retry" => set_once(
                &mut retry,
                "retry",
                Duration::from_millis(parse_number::<u64>("retry", value)?),
            )?,
            "data" => set_once(&mut data, "data", value)?,
            // Unknown fields are ignored for forward compatibility.
            _ => {}
        }
    }

    if !saw_field {
        return Ok(None);
    }

    let kind = kind.ok_or(WireError::MissingField { field: "event" })?;
    let event_id = id.ok_or(WireError::MissingField { field: "id" })?;
    let data = data.ok_or(WireError::MissingField { field: "data" })?;
    let data: WireData = serde_json::from_str(data).map_err(|error| WireError::InvalidData {
        message: error.to_string(),
    })?;

    Ok(Some(Frame {
        event: Event {
            stream_id: data.stream_id,
            event_id,
            kind,
            payload: data.payload,
            emitted_at: data.emitted_at,
        },
        retry_hint: retry,
    }))
}

fn set_once<T>(slot: &mut Option<T>, field: &'static str, value: T) -> Result<(), WireError> {
    if slot.is_some() {
        return Err(WireError::DuplicateField { field });
    }
    *slot = Some(value);
    Ok(())
}

fn parse_number<T: std::str::FromStr>(field: &'static str, value: &str) -> Result<T, WireError> {
    value.trim().parse::<T>().map_err(|_| WireError::InvalidNumber {
        field,
        value: value.to_owned(),
    })
}

/// Incremental decoder for a byte stream that may split blocks (and UTF-8
/// sequences) at arbitrary chunk boundaries.
#[derive(Debug, Default)]
pub struct BlockDecoder {
    buffer: Vec<u8>,
}

impl BlockDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append raw transport bytes. Carriage returns are dropped so CRLF
    /// framing decodes like LF framing.
    pub fn push(&mut self, chunk: &[u8]) {
        self.buffer.extend(chunk.iter().copied().filter(|byte| *byte != b'\r'));
    }

    /// Bytes received but not yet framed into a complete block.
    pub fn buffered_len(&self) -> usize {
        self.buffer.len()
    }

    /// Pop the next complete frame, skipping comment-only blocks.
    ///
    /// Returns `None` once no complete block is buffered.
    pub fn next_frame(&mut self) -> Option<Result<Frame, WireError>> {
        loop {
            let Some(end) = find_block_end(&self.buffer) else {
                if self.buffer.len() > MAX_BLOCK_BYTES {
                    self.buffer.clear();
                    return Some(Err(WireError::BlockTooLarge {
                        max: MAX_BLOCK_BYTES,
                    }));
                }
                return None;
            };

            let block: Vec<u8> = self.buffer.drain(..end + 2).collect();
            let text = match std::str::from_utf8(&block[..end]) {
                Ok(text) => text,
                Err(_) => return Some(Err(WireError::InvalidUtf8)),
            };

            match decode_block(text) {
                Ok(Some(frame)) => return Some(Ok(frame)),
                Ok(None) => continue,
                Err(error) => return Some(Err(error)),
            }
        }
    }
}

fn find_block_end(buffer: &[u8]) -> Option<usize> {
    buffer.windows(2).position(|pair| pair == b"\n\n")
}

/// Resolve the resume point from the header and query parameter.
///
/// The header wins when both are present; blank values count as absent, and
/// absence means "replay from the start".
pub fn resolve_last_event_id(
    header: Option<&str>,
    query: Option<&str>,
) -> Result<Option<EventId>, ValidationError> {
    let raw = header
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .or_else(|| query.map(str::trim).filter(|value| !value.is_empty()));

    raw.map(|value| {
        value
            .parse::<EventId>()
            .map_err(|_| ValidationError::InvalidLastEventId {
                value: value.to_owned(),
            })
    })
    .transpose()
}

/// Summary of a validated wire capture.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CaptureSummary {
    pub events: usize,
    pub fragments: usize,
    pub liveness: usize,
    pub first_event_id: Option<EventId>,
    pub last_event_id: Option<EventId>,
    pub terminal: Option<EventKind>,
}

/// Error from capture validation.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("capture validation error at block {block}: {message}")]
pub struct CaptureError {
    /// 1-based index of the offending block.
    pub block: usize,
    pub message: String,
}

/// Validate a capture of a single connection's wire output.
///
/// Checks framing, that ids increase by exactly one, that only one stream is
/// present and that nothing follows a terminal event.
pub fn validate_capture(input: &str) -> Result<CaptureSummary, CaptureError> {
    let mut decoder = BlockDecoder::new();
    decoder.push(input.as_bytes());
    if !input.ends_with("\n\n") {
        decoder.push(b"\n\n");
    }

    let mut summary = CaptureSummary {
        events: 0,
        fragments: 0,
        liveness: 0,
        first_event_id: None,
        last_event_id: None,
        terminal: None,
    };
    let mut stream: Option<StreamId> = None;

    while let Some(frame) = decoder.next_frame() {
        let block = summary.events + 1;
        let fail = |message: String| CaptureError { block, message };
        let event = frame.map_err(|error| fail(error.to_string()))?.event;

        if let Some(kind) = summary.terminal {
            return Err(fail(format!("event follows terminal '{kind}' event")));
        }
        let expected = stream.get_or_insert_with(|| event.stream_id.clone());
        if *expected != event.stream_id {
            return Err(fail(format!(
                "stream id changed from '{expected}' to '{}'",
                event.stream_id
            )));
        }
        if let Some(previous) = summary.last_event_id {
            if event.event_id != previous + 1 {
                return Err(fail(format!(
                    "event id {} does not follow {previous}",
                    event.event_id
                )));
            }
        }

        summary.first_event_id.get_or_insert(event.event_id);
        summary.last_event_id = Some(event.event_id);
        summary.events += 1;
        match event.kind {
            EventKind::Fragment => summary.fragments += 1,
            EventKind::Liveness => summary.liveness += 1,
            kind => summary.terminal = Some(kind),
        }
    }

    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::Usage;
    use serde_json::json;

    fn event(id: EventId, kind: EventKind, payload: Value) -> Event {
        Event::new(StreamId::parse("reply-1").expect("valid"), id, kind, payload)
    }

    #[test]
    fn encodes_fields_in_order_with_retry_hint() {
        let block = encode_event(
            &event(7, EventKind::Fragment, json!({ "text": "hi" })),
            Some(Duration::from_millis(1500)),
        )
        .expect("encode");

        let lines: Vec<&str> = block.lines().collect();
        assert_eq!(lines[0], "event:fragment");
        assert_eq!(lines[1], "id:7");
        assert_eq!(lines[2], "retry:1500");
        assert!(lines[3].starts_with("data:{"));
        assert!(block.ends_with("\n\n"));
    }

    #[test]
    fn multi_line_payload_is_escaped_onto_one_data_line() {
        let original = event(3, EventKind::Fragment, json!({ "text": "line one\n\nline two" }));
        let block = encode_event(&original, None).expect("encode");

        assert_eq!(block.matches("data:").count(), 1);
        assert_eq!(block.matches("\n\n").count(), 1);

        let mut decoder = BlockDecoder::new();
        decoder.push(block.as_bytes());
        let frame = decoder.next_frame().expect("frame").expect("valid");
        assert_eq!(frame.event.payload, original.payload);
        assert_eq!(frame.retry_hint, None);
    }

    #[test]
    fn decoder_reassembles_blocks_split_across_chunks() {
        let first = encode_event(&event(0, EventKind::Fragment, json!("héllo")), None).expect("encode");
        let second = encode_event(&event(1, EventKind::Liveness, Value::Null), None).expect("encode");
        let bytes = format!("{first}{second}").into_bytes();

        let mut decoder = BlockDecoder::new();
        let mut frames = Vec::new();
        for chunk in bytes.chunks(5) {
            decoder.push(chunk);
            while let Some(frame) = decoder.next_frame() {
                frames.push(frame.expect("valid frame"));
            }
        }

        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].event.payload, json!("héllo"));
        assert_eq!(frames[1].event.kind, EventKind::Liveness);
        assert_eq!(decoder.buffered_len(), 0);
    }

    #[test]
    fn comment_blocks_and_crlf_are_tolerated() {
        let block = encode_event(&event(4, EventKind::Fragment, json!(1)), None)
            .expect("encode")
            .replace('\n', "\r\n");
        let mut decoder = BlockDecoder::new();
        decoder.push(b": keep-alive\r\n\r\n");
        decoder.push(block.as_bytes());

        let frame = decoder.next_frame().expect("frame").expect("valid");
        assert_eq!(frame.event.event_id, 4);
        assert!(decoder.next_frame().is_none());
    }

    #[test]
    fn malformed_blocks_are_reported_and_skipped() {
        let mut decoder = BlockDecoder::new();
        decoder.push(b"event:fragment\nid:abc\ndata:{}\n\n");
        decoder.push(
            encode_event(&event(9, EventKind::Fragment, json!(2)), None)
                .expect("encode")
                .as_bytes(),
        );

        let error = decoder.next_frame().expect("frame").expect_err("bad id");
        assert!(matches!(error, WireError::InvalidNumber { field: "id", .. }));
        let frame = decoder.next_frame().expect("frame").expect("valid");
        assert_eq!(frame.event.event_id, 9);
    }

    #[test]
    fn missing_data_and_unknown_kind_are_rejected() {
        assert_eq!(
            decode_block("event:fragment\nid:1"),
            Err(WireError::MissingField { field: "data" })
        );
        assert!(matches!(
            decode_block("event:chunk\nid:1\ndata:{}"),
            Err(WireError::InvalidKind(_))
        ));
        assert!(matches!(
            decode_block("event:done\nid:1\nid:2\ndata:{}"),
            Err(WireError::DuplicateField { field: "id" })
        ));
    }

    #[test]
    fn header_takes_precedence_over_query() {
        assert_eq!(resolve_last_event_id(Some("29"), Some("5")), Ok(Some(29)));
        assert_eq!(resolve_last_event_id(None, Some("5")), Ok(Some(5)));
        assert_eq!(resolve_last_event_id(Some("  "), Some("5")), Ok(Some(5)));
        assert_eq!(resolve_last_event_id(None, None), Ok(None));
        assert!(resolve_last_event_id(Some("-1"), None).is_err());
    }

    #[test]
    fn validate_capture_accepts_resumed_window() {
        let mut capture = String::new();
        for id in 30..50 {
            capture.push_str(&encode_event(&event(id, EventKind::Fragment, json!(id)), None).expect("encode"));
        }
        capture.push_str(
            &encode_event(
                &event(50, EventKind::Done, json!({ "usage": Usage::default(), "fragments": 50 })),
                None,
            )
            .expect("encode"),
        );

        let summary = validate_capture(&capture).expect("valid capture");
        assert_eq!(summary.events, 21);
        assert_eq!(summary.fragments, 20);
        assert_eq!(summary.first_event_id, Some(30));
        assert_eq!(summary.last_event_id, Some(50));
        assert_eq!(summary.terminal, Some(EventKind::Done));
    }

    #[test]
    fn validate_capture_rejects_gaps_and_trailing_events() {
        let a = encode_event(&event(0, EventKind::Fragment, json!(0)), None).expect("encode");
        let c = encode_event(&event(2, EventKind::Fragment, json!(2)), None).expect("encode");
        let gap = validate_capture(&format!("{a}{c}")).expect_err("gap");
        assert_eq!(gap.block, 2);

        let done = encode_event(&event(1, EventKind::Done, json!({})), None).expect("encode");
        let trailing = validate_capture(&format!("{a}{done}{c}")).expect_err("trailing");
        assert!(trailing.message.contains("terminal"));
    }
}
