//! Transport contract plus an in-process transport with fault injection.
//!
//! A [`Transport`] opens one connection for a stream, sending the last
//! delivered event id (if any) so the server can compute the replay window.
//! The connection yields raw wire bytes in arbitrary chunks; framing is the
//! caller's job (see [`crate::wire::BlockDecoder`]).

use std::collections::{BTreeSet, VecDeque};
use std::fmt::{Display, Formatter};
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::event::{Event, EventId, FailureCode};
use crate::store::{EventCursor, StoreError, StreamStore};
use crate::wire::encode_event;
use crate::StreamId;

/// Transport failure classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportErrorKind {
    Refused,
    Reset,
    TimedOut,
    /// The server does not know the stream.
    NotFound,
    /// The server can no longer serve the requested resume point.
    Gone,
    /// The server refused the request itself (bad resume point, auth, ...).
    Rejected,
    /// Any other unexpected server response.
    Unexpected,
}

/// Transport-level error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportError {
    kind: TransportErrorKind,
    message: String,
    retryable: bool,
}

impl TransportError {
    pub fn refused(message: impl Into<String>) -> Self {
        Self::retryable(TransportErrorKind::Refused, message)
    }

    pub fn reset(message: impl Into<String>) -> Self {
        Self::retryable(TransportErrorKind::Reset, message)
    }

    pub fn timed_out(message: impl Into<String>) -> Self {
        Self::retryable(TransportErrorKind::TimedOut, message)
    }

    pub fn unexpected(message: impl Into<String>) -> Self {
        Self::retryable(TransportErrorKind::Unexpected, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::fatal(TransportErrorKind::NotFound, message)
    }

    pub fn gone(message: impl Into<String>) -> Self {
        Self::fatal(TransportErrorKind::Gone, message)
    }

    pub fn rejected(message: impl Into<String>) -> Self {
        Self::fatal(TransportErrorKind::Rejected, message)
    }

    fn retryable(kind: TransportErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            retryable: true,
        }
    }

    fn fatal(kind: TransportErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            retryable: false,
        }
    }

    pub const fn kind(&self) -> TransportErrorKind {
        self.kind
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub const fn is_retryable(&self) -> bool {
        self.retryable
    }

    /// Public failure reported to the application for non-retryable errors.
    pub const fn failure_code(&self) -> FailureCode {
        match self.kind {
            TransportErrorKind::Gone => FailureCode::RetentionExceeded,
            TransportErrorKind::NotFound => FailureCode::NotFound,
            _ => FailureCode::Protocol,
        }
    }
}

impl Display for TransportError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.message)
    }
}

impl std::error::Error for TransportError {}

impl From<StoreError> for TransportError {
    fn from(error: StoreError) -> Self {
        match error {
            StoreError::RetentionExceeded { .. } => Self::gone(error.to_string()),
            _ => Self::not_found(error.to_string()),
        }
    }
}

pub type BoxedStream = Box<dyn TransportStream>;

/// Opens connections to a stream.
pub trait Transport: Send + Sync {
    fn connect<'a>(
        &'a self,
        stream_id: &'a StreamId,
        last_event_id: Option<EventId>,
    ) -> Pin<Box<dyn Future<Output = Result<BoxedStream, TransportError>> + Send + 'a>>;
}

/// One open connection. `Ok(None)` means the server closed it cleanly.
///
/// Callers poll a `next_chunk` future to completion before asking for the
/// next one, so implementations may take buffered bytes eagerly.
pub trait TransportStream: Send {
    fn next_chunk<'a>(
        &'a mut self,
    ) -> Pin<Box<dyn Future<Output = Result<Option<Vec<u8>>, TransportError>> + Send + 'a>>;
}

impl<T: Transport + ?Sized> Transport for Arc<T> {
    fn connect<'a>(
        &'a self,
        stream_id: &'a StreamId,
        last_event_id: Option<EventId>,
    ) -> Pin<Box<dyn Future<Output = Result<BoxedStream, TransportError>> + Send + 'a>> {
        (**self).connect(stream_id, last_event_id)
    }
}

/// Misbehaviour applied to a single connection of a [`MemoryTransport`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConnectionFaults {
    refuse: bool,
    disconnect_after: Option<usize>,
    hang_after: Option<usize>,
    discard: BTreeSet<EventId>,
    duplicate_every: Option<usize>,
    swap_adjacent: bool,
    chunk_size: Option<usize>,
}

impl ConnectionFaults {
    /// A clean connection.
    pub fn clean() -> Self {
        Self::default()
    }

    /// Fail the connect attempt itself.
    pub fn refuse() -> Self {
        Self {
            refuse: true,
            ..Self::default()
        }
    }

    /// Reset the connection after `events` events went out.
    pub fn disconnect_after(mut self, events: usize) -> Self {
        self.disconnect_after = Some(events);
        self
    }

    /// Stop sending anything (without closing) after `events` events.
    pub fn hang_after(mut self, events: usize) -> Self {
        self.hang_after = Some(events);
        self
    }

    /// Lose these ids in transit.
    pub fn discard(mut self, ids: impl IntoIterator<Item = EventId>) -> Self {
        self.discard.extend(ids);
        self
    }

    /// Send every `n`th event twice.
    pub fn duplicate_every(mut self, n: usize) -> Self {
        self.duplicate_every = Some(n.max(1));
        self
    }

    /// Deliver events pairwise swapped (1, 0, 3, 2, ...).
    pub fn swap_adjacent(mut self) -> Self {
        self.swap_adjacent = true;
        self
    }

    /// Split the byte stream into chunks of at most `size` bytes.
    pub fn chunked(mut self, size: usize) -> Self {
        self.chunk_size = Some(size.max(1));
        self
    }
}

#[derive(Debug, Default)]
struct MemoryState {
    plan: VecDeque<ConnectionFaults>,
    connects: Vec<Option<EventId>>,
}

/// In-process transport reading straight from a [`StreamStore`].
///
/// Each connect consumes the next [`ConnectionFaults`] of the plan; once the
/// plan is exhausted connections are clean.
#[derive(Debug, Clone)]
pub struct MemoryTransport {
    store: StreamStore,
    retry_hint: Option<Duration>,
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryTransport {
    pub fn new(store: StreamStore) -> Self {
        Self {
            store,
            retry_hint: None,
            state: Arc::new(Mutex::new(MemoryState::default())),
        }
    }

    pub fn with_faults(self, plan: impl IntoIterator<Item = ConnectionFaults>) -> Self {
        self.lock().plan.extend(plan);
        self
    }

    /// Advertise `retry` on the first block of every connection.
    pub fn with_retry_hint(mut self, retry_hint: Duration) -> Self {
        self.retry_hint = Some(retry_hint);
        self
    }

    /// The `last_event_id` sent by each connect attempt so far, in order.
    pub fn connect_log(&self) -> Vec<Option<EventId>> {
        self.lock().connects.clone()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MemoryState> {
        self.state
            .lock()
            .expect("memory transport lock is not poisoned")
    }
}

impl Transport for MemoryTransport {
    fn connect<'a>(
        &'a self,
        stream_id: &'a StreamId,
        last_event_id: Option<EventId>,
    ) -> Pin<Box<dyn Future<Output = Result<BoxedStream, TransportError>> + Send + 'a>> {
        Box::pin(async move {
            let faults = {
                let mut state = self.lock();
                state.connects.push(last_event_id);
                state.plan.pop_front().unwrap_or_default()
            };
            if faults.refuse {
                return Err(TransportError::refused("connection refused by fault plan"));
            }

            let cursor = self.store.cursor(stream_id, last_event_id)?;
            Ok(Box::new(MemoryStream {
                cursor,
                faults,
                retry_hint: self.retry_hint,
                sent: 0,
                held: None,
                queued: VecDeque::new(),
                drained: false,
            }) as BoxedStream)
        })
    }
}

struct MemoryStream {
    cursor: EventCursor,
    faults: ConnectionFaults,
    retry_hint: Option<Duration>,
    sent: usize,
    held: Option<Event>,
    queued: VecDeque<Vec<u8>>,
    drained: bool,
}

impl MemoryStream {
    fn enqueue(&mut self, event: &Event) -> Result<(), TransportError> {
        let retry = if self.sent == 0 { self.retry_hint } else { None };
        let block = encode_event(event, retry)
            .map_err(|error| TransportError::unexpected(error.to_string()))?;
        let copies = match self.faults.duplicate_every {
            Some(n) if (self.sent + 1) % n == 0 => 2,
            _ => 1,
        };
        self.sent += 1;

        for _ in 0..copies {
            match self.faults.chunk_size {
                Some(size) => self
                    .queued
                    .extend(block.as_bytes().chunks(size).map(<[u8]>::to_vec)),
                None => self.queued.push_back(block.clone().into_bytes()),
            }
        }
        Ok(())
    }

    async fn pull(&mut self) -> Result<(), TransportError> {
        if self.drained {
            return Ok(());
        }
        match self.cursor.next().await? {
            Some(event) => {
                if self.faults.discard.contains(&event.event_id) {
                    self.sent += 1;
                    return Ok(());
                }
                if self.faults.swap_adjacent {
                    match self.held.take() {
                        Some(held) => {
                            self.enqueue(&event)?;
                            self.enqueue(&held)?;
                        }
                        None if event.is_terminal() => self.enqueue(&event)?,
                        None => self.held = Some(event),
                    }
                } else {
                    self.enqueue(&event)?;
                }
            }
            None => {
                self.drained = true;
                if let Some(held) = self.held.take() {
                    self.enqueue(&held)?;
                }
            }
        }
        Ok(())
    }
}

impl TransportStream for MemoryStream {
    fn next_chunk<'a>(
        &'a mut self,
    ) -> Pin<Box<dyn Future<Output = Result<Option<Vec<u8>>, TransportError>> + Send + 'a>> {
        Box::pin(async move {
            loop {
                if let Some(chunk) = self.queued.pop_front() {
                    return Ok(Some(chunk));
                }
                if self.faults.hang_after.is_some_and(|limit| self.sent >= limit) {
                    std::future::pending::<()>().await;
                }
                if self
                    .faults
                    .disconnect_after
                    .is_some_and(|limit| self.sent >= limit)
                {
                    return Err(TransportError::reset("connection reset by fault plan"));
                }
                if self.drained {
                    return Ok(None);
                }
                self.pull().await?;
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::EventKind;
    use crate::wire::BlockDecoder;
    use serde_json::json;

    fn stream_with(count: u64) -> (StreamStore, StreamId) {
        let store = StreamStore::default();
        let stream_id = StreamId::parse("s").expect("valid");
        let mut writer = store.open(stream_id.clone()).expect("open");
        for n in 0..count {
            writer.append(EventKind::Fragment, json!(n)).expect("append");
        }
        writer.append(EventKind::Done, json!({})).expect("done");
        (store, stream_id)
    }

    async fn read_ids(stream: &mut BoxedStream) -> Result<Vec<EventId>, TransportError> {
        let mut decoder = BlockDecoder::new();
        let mut ids = Vec::new();
        while let Some(chunk) = stream.next_chunk().await? {
            decoder.push(&chunk);
            while let Some(frame) = decoder.next_frame() {
                ids.push(frame.expect("valid frame").event.event_id);
            }
        }
        Ok(ids)
    }

    #[tokio::test]
    async fn clean_connection_replays_after_last_id() {
        let (store, stream_id) = stream_with(5);
        let transport = MemoryTransport::new(store);

        let mut stream = transport.connect(&stream_id, Some(2)).await.expect("connect");
        assert_eq!(read_ids(&mut stream).await.expect("read"), vec![3, 4, 5]);
        assert_eq!(transport.connect_log(), vec![Some(2)]);
    }

    #[tokio::test]
    async fn faults_apply_per_connection_in_order() {
        let (store, stream_id) = stream_with(5);
        let transport = MemoryTransport::new(store).with_faults([
            ConnectionFaults::refuse(),
            ConnectionFaults::clean().disconnect_after(2).chunked(7),
        ]);

        let refused = transport.connect(&stream_id, None).await.err().expect("refused");
        assert_eq!(refused.kind(), TransportErrorKind::Refused);
        assert!(refused.is_retryable());

        let mut stream = transport.connect(&stream_id, None).await.expect("connect");
        let error = read_ids(&mut stream).await.expect_err("reset");
        assert_eq!(error.kind(), TransportErrorKind::Reset);

        let mut clean = transport.connect(&stream_id, None).await.expect("connect");
        assert_eq!(read_ids(&mut clean).await.expect("read").len(), 6);
    }

    #[tokio::test]
    async fn discard_duplicate_and_swap_faults_shape_the_feed() {
        let (store, stream_id) = stream_with(4);
        let transport = MemoryTransport::new(store).with_faults([ConnectionFaults::clean()
            .discard([1])
            .duplicate_every(3)
            .swap_adjacent()]);

        let mut stream = transport.connect(&stream_id, None).await.expect("connect");
        let ids = read_ids(&mut stream).await.expect("read");
        // 0 held, 1 lost, 2 releases (2, 0) with 0 duplicated as the 3rd send,
        // 3 held, terminal 4 releases (4, 3).
        assert_eq!(ids, vec![2, 0, 0, 4, 3]);
    }

    #[tokio::test]
    async fn unknown_stream_is_not_retryable() {
        let transport = MemoryTransport::new(StreamStore::default());
        let missing = StreamId::parse("missing").expect("valid");
        let error = transport.connect(&missing, None).await.err().expect("not found");
        assert_eq!(error.kind(), TransportErrorKind::NotFound);
        assert!(!error.is_retryable());
        assert_eq!(error.failure_code(), FailureCode::NotFound);
    }
}
