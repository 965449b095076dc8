//! # Stream State Store
//!
//! Server-side, per-stream append-only event log.
//!
//! Each stream has exactly one [`StreamWriter`] (handed out by
//! [`StreamStore::open`]) and any number of readers. The writer assigns
//! `event_id = next_event_id++` under the stream's own mutex, so ids are
//! gap-free and never reused; replayed events keep their original ids.
//!
//! Readers either take a snapshot with [`StreamStore::replay_after`] or follow
//! the stream with an [`EventCursor`], which replays the retained history and
//! then waits on a `watch` channel for live appends.
//!
//! ## Retention
//!
//! The per-stream buffer is bounded by count and age ([`RetentionConfig`]).
//! Asking to resume from an id that has already been trimmed yields
//! [`StoreError::RetentionExceeded`] instead of a silent gap. Whole streams are
//! evicted by [`StreamStore::sweep`] once they have been terminal for
//! `terminal_ttl`, or have seen no append for `idle_ttl`.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, RwLock};

use serde::Serialize;
use serde_json::Value;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::config::RetentionConfig;
use crate::event::{Completion, Event, EventId, EventKind, FailureCode, StreamFailure};
use crate::StreamId;

/// Errors raised by the stream store.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    #[error("stream '{0}' does not exist")]
    NotFound(StreamId),
    #[error("stream '{0}' is already open")]
    AlreadyExists(StreamId),
    #[error("stream '{0}' already reached its terminal event")]
    Closed(StreamId),
    #[error("stream '{stream_id}' no longer retains events after {requested:?} (oldest retained: {oldest})")]
    RetentionExceeded {
        stream_id: StreamId,
        requested: Option<EventId>,
        oldest: EventId,
    },
}

impl StoreError {
    /// Public failure class for this error when it has to reach a client.
    pub const fn failure_code(&self) -> FailureCode {
        match self {
            Self::RetentionExceeded { .. } => FailureCode::RetentionExceeded,
            Self::NotFound(_) | Self::AlreadyExists(_) | Self::Closed(_) => FailureCode::NotFound,
        }
    }
}

/// Running counters kept alongside each stream.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StreamCounters {
    pub fragments: u64,
    pub liveness: u64,
    pub payload_bytes: u64,
}

/// Snapshot of store occupancy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StoreStats {
    pub open_streams: usize,
    pub terminal_streams: usize,
    pub buffered_events: usize,
}

#[derive(Debug)]
struct RetainedEvent {
    appended_at: Instant,
    event: Event,
}

#[derive(Debug)]
struct StreamState {
    stream_id: StreamId,
    next_event_id: EventId,
    buffer: VecDeque<RetainedEvent>,
    terminal: bool,
    evicted: bool,
    counters: StreamCounters,
    last_append_at: Instant,
    closed_at: Option<Instant>,
}

impl StreamState {
    fn new(stream_id: StreamId) -> Self {
        Self {
            stream_id,
            next_event_id: 0,
            buffer: VecDeque::new(),
            terminal: false,
            evicted: false,
            counters: StreamCounters::default(),
            last_append_at: Instant::now(),
            closed_at: None,
        }
    }

    /// Id of the oldest retained event, or `next_event_id` when empty.
    fn oldest_retained(&self) -> EventId {
        self.buffer
            .front()
            .map(|retained| retained.event.event_id)
            .unwrap_or(self.next_event_id)
    }

    /// Fails when events after `last` have been trimmed already.
    fn check_retained(&self, last: Option<EventId>) -> Result<(), StoreError> {
        let wanted = last.map_or(0, |id| id.saturating_add(1));
        let oldest = self.oldest_retained();
        if wanted < oldest {
            return Err(StoreError::RetentionExceeded {
                stream_id: self.stream_id.clone(),
                requested: last,
                oldest,
            });
        }
        Ok(())
    }

    fn event_at(&self, event_id: EventId) -> Option<&Event> {
        let oldest = self.oldest_retained();
        let index = usize::try_from(event_id.checked_sub(oldest)?).ok()?;
        self.buffer.get(index).map(|retained| &retained.event)
    }

    fn trim(&mut self, config: &RetentionConfig, now: Instant) {
        // The newest event (possibly the terminal one) is always kept.
        while self.buffer.len() > 1 {
            let Some(front) = self.buffer.front() else {
                break;
            };
            let too_many = self.buffer.len() > config.max_events;
            let too_old = now.duration_since(front.appended_at) > config.max_age;
            if !(too_many || too_old) {
                break;
            }
            self.buffer.pop_front();
        }
    }
}

#[derive(Debug)]
struct StreamSlot {
    state: Mutex<StreamState>,
    /// Carries `next_event_id`; every append or eviction bumps it.
    notify: watch::Sender<EventId>,
}

impl StreamSlot {
    fn lock(&self) -> std::sync::MutexGuard<'_, StreamState> {
        self.state.lock().expect("stream state lock is not poisoned")
    }
}

#[derive(Debug)]
struct StoreInner {
    config: RetentionConfig,
    streams: RwLock<HashMap<StreamId, Arc<StreamSlot>>>,
}

/// Registry of live streams keyed by stream id.
#[derive(Debug, Clone)]
pub struct StreamStore {
    inner: Arc<StoreInner>,
}

impl Default for StreamStore {
    fn default() -> Self {
        Self::new(RetentionConfig::default())
    }
}

impl StreamStore {
    pub fn new(config: RetentionConfig) -> Self {
        Self {
            inner: Arc::new(StoreInner {
                config,
                streams: RwLock::new(HashMap::new()),
            }),
        }
    }

    pub fn config(&self) -> &RetentionConfig {
        &self.inner.config
    }

    /// Open a new stream and hand out its single writer.
    pub fn open(&self, stream_id: StreamId) -> Result<StreamWriter, StoreError> {
        let mut streams = self
            .inner
            .streams
            .write()
            .expect("stream registry lock is not poisoned");
        if streams.contains_key(&stream_id) {
            return Err(StoreError::AlreadyExists(stream_id));
        }

        let (notify, _) = watch::channel(0);
        let slot = Arc::new(StreamSlot {
            state: Mutex::new(StreamState::new(stream_id.clone())),
            notify,
        });
        streams.insert(stream_id.clone(), Arc::clone(&slot));
        drop(streams);

        tracing::debug!(stream_id = %stream_id, "stream opened");
        Ok(StreamWriter {
            stream_id,
            slot,
            config: self.inner.config,
        })
    }

    pub fn contains(&self, stream_id: &StreamId) -> bool {
        self.read_streams().contains_key(stream_id)
    }

    pub fn len(&self) -> usize {
        self.read_streams().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Events with id greater than `last` (all retained events when `None`).
    pub fn replay_after(
        &self,
        stream_id: &StreamId,
        last: Option<EventId>,
    ) -> Result<Vec<Event>, StoreError> {
        let slot = self.slot(stream_id)?;
        let state = slot.lock();
        state.check_retained(last)?;

        let events: Vec<Event> = state
            .buffer
            .iter()
            .filter(|retained| last.map_or(true, |last| retained.event.event_id > last))
            .map(|retained| retained.event.clone())
            .collect();
        tracing::debug!(
            stream_id = %stream_id,
            last_event_id = ?last,
            replayed = events.len(),
            "replay window computed"
        );
        Ok(events)
    }

    /// Follow a stream from just after `last`: replay first, then the live tail.
    pub fn cursor(
        &self,
        stream_id: &StreamId,
        last: Option<EventId>,
    ) -> Result<EventCursor, StoreError> {
        let slot = self.slot(stream_id)?;
        slot.lock().check_retained(last)?;
        let receiver = slot.notify.subscribe();
        Ok(EventCursor {
            stream_id: stream_id.clone(),
            slot,
            receiver,
            position: last.map_or(0, |id| id.saturating_add(1)),
            finished: false,
        })
    }

    /// Whether the stream has reached its terminal event.
    pub fn is_terminal(&self, stream_id: &StreamId) -> Result<bool, StoreError> {
        Ok(self.slot(stream_id)?.lock().terminal)
    }

    pub fn stats(&self) -> StoreStats {
        let streams = self.read_streams();
        let mut stats = StoreStats::default();
        for slot in streams.values() {
            let state = slot.lock();
            if state.terminal {
                stats.terminal_streams += 1;
            } else {
                stats.open_streams += 1;
            }
            stats.buffered_events += state.buffer.len();
        }
        stats
    }

    /// Evict expired streams and trim aged events. Returns the number evicted.
    pub fn sweep(&self) -> usize {
        self.sweep_at(Instant::now())
    }

    fn sweep_at(&self, now: Instant) -> usize {
        let config = self.inner.config;
        let mut streams = self
            .inner
            .streams
            .write()
            .expect("stream registry lock is not poisoned");

        let mut evicted = Vec::new();
        for (stream_id, slot) in streams.iter() {
            let mut state = slot.lock();
            let expired = match state.closed_at {
                Some(closed_at) => now.duration_since(closed_at) >= config.terminal_ttl,
                None => now.duration_since(state.last_append_at) >= config.idle_ttl,
            };
            if expired {
                if !state.terminal {
                    tracing::warn!(stream_id = %stream_id, "evicting abandoned stream");
                }
                state.evicted = true;
                evicted.push(stream_id.clone());
            } else {
                state.trim(&config, now);
            }
        }

        for stream_id in &evicted {
            if let Some(slot) = streams.remove(stream_id) {
                slot.notify.send_modify(|_| {});
                tracing::debug!(stream_id = %stream_id, "stream evicted");
            }
        }
        evicted.len()
    }

    /// Run [`StreamStore::sweep`] every `sweep_interval` until the task is aborted.
    pub fn spawn_sweeper(&self) -> JoinHandle<()> {
        let store = self.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(store.inner.config.sweep_interval);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                let evicted = store.sweep();
                if evicted > 0 {
                    tracing::info!(evicted, "store sweep evicted streams");
                }
            }
        })
    }

    fn slot(&self, stream_id: &StreamId) -> Result<Arc<StreamSlot>, StoreError> {
        self.read_streams()
            .get(stream_id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(stream_id.clone()))
    }

    fn read_streams(
        &self,
    ) -> std::sync::RwLockReadGuard<'_, HashMap<StreamId, Arc<StreamSlot>>> {
        self.inner
            .streams
            .read()
            .expect("stream registry lock is not poisoned")
    }
}

/// Exclusive write handle for one stream.
///
/// Dropping a writer whose stream never reached a terminal event appends a
/// producer-failure `error` event, so readers always see an ending.
#[derive(Debug)]
pub struct StreamWriter {
    stream_id: StreamId,
    slot: Arc<StreamSlot>,
    config: RetentionConfig,
}

impl StreamWriter {
    pub fn stream_id(&self) -> &StreamId {
        &self.stream_id
    }

    /// Append an event and return its id.
    ///
    /// Appending `done` or `error` marks the stream terminal; later appends fail.
    pub fn append(&mut self, kind: EventKind, payload: Value) -> Result<EventId, StoreError> {
        let now = Instant::now();
        let event_id = {
            let mut state = self.slot.lock();
            if state.terminal || state.evicted {
                return Err(StoreError::Closed(self.stream_id.clone()));
            }

            let event_id = state.next_event_id;
            state.next_event_id += 1;
            match kind {
                EventKind::Fragment => {
                    state.counters.fragments += 1;
                    state.counters.payload_bytes += payload.to_string().len() as u64;
                }
                EventKind::Liveness => state.counters.liveness += 1,
                EventKind::Done | EventKind::Error => {
                    state.terminal = true;
                    state.closed_at = Some(now);
                }
            }
            state.last_append_at = now;
            state.buffer.push_back(RetainedEvent {
                appended_at: now,
                event: Event::new(self.stream_id.clone(), event_id, kind, payload),
            });
            state.trim(&self.config, now);
            event_id
        };

        self.slot.notify.send_replace(event_id + 1);
        tracing::trace!(stream_id = %self.stream_id, event_id, kind = %kind, "event appended");
        Ok(event_id)
    }

    pub fn counters(&self) -> StreamCounters {
        self.slot.lock().counters
    }

    pub fn next_event_id(&self) -> EventId {
        self.slot.lock().next_event_id
    }

    pub fn is_terminal(&self) -> bool {
        self.slot.lock().terminal
    }

    /// Finish the stream normally: append `done` with `completion` and start
    /// the terminal TTL. Returns the terminal event id.
    ///
    /// Dropping the writer without closing it ends the stream with a
    /// producer-failure `error` event instead.
    pub fn close(mut self, completion: Completion) -> Result<EventId, StoreError> {
        let payload = serde_json::to_value(completion).unwrap_or(Value::Null);
        self.append(EventKind::Done, payload)
    }
}

impl Drop for StreamWriter {
    fn drop(&mut self) {
        if self.is_terminal() {
            return;
        }
        let failure = StreamFailure::new(FailureCode::Producer);
        let payload = serde_json::to_value(&failure).unwrap_or(Value::Null);
        if self.append(EventKind::Error, payload).is_ok() {
            tracing::warn!(stream_id = %self.stream_id, "stream closed without terminal event");
        }
    }
}

/// Reader that replays retained history and then follows live appends.
#[derive(Debug)]
pub struct EventCursor {
    stream_id: StreamId,
    slot: Arc<StreamSlot>,
    receiver: watch::Receiver<EventId>,
    position: EventId,
    finished: bool,
}

impl EventCursor {
    pub fn stream_id(&self) -> &StreamId {
        &self.stream_id
    }

    /// Id of the next event this cursor will yield.
    pub fn position(&self) -> EventId {
        self.position
    }

    /// Next event in id order; `Ok(None)` after the terminal event.
    pub async fn next(&mut self) -> Result<Option<Event>, StoreError> {
        if self.finished {
            return Ok(None);
        }

        loop {
            self.receiver.borrow_and_update();
            {
                let state = self.slot.lock();
                if state.evicted {
                    return Err(StoreError::NotFound(self.stream_id.clone()));
                }
                if self.position < state.oldest_retained() {
                    return Err(StoreError::RetentionExceeded {
                        stream_id: self.stream_id.clone(),
                        requested: self.position.checked_sub(1),
                        oldest: state.oldest_retained(),
                    });
                }
                if let Some(event) = state.event_at(self.position) {
                    let event = event.clone();
                    self.position += 1;
                    self.finished = event.is_terminal();
                    return Ok(Some(event));
                }
                if state.terminal {
                    self.finished = true;
                    return Ok(None);
                }
            }

            if self.receiver.changed().await.is_err() {
                self.finished = true;
                return Ok(None);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::time::Duration;

    fn id(raw: &str) -> StreamId {
        StreamId::parse(raw).expect("valid")
    }

    #[test]
    fn assigns_contiguous_ids_from_zero() {
        let store = StreamStore::default();
        let mut writer = store.open(id("s")).expect("open");

        assert_eq!(writer.append(EventKind::Fragment, json!("a")), Ok(0));
        assert_eq!(writer.append(EventKind::Liveness, Value::Null), Ok(1));
        assert_eq!(writer.append(EventKind::Fragment, json!("b")), Ok(2));
        assert_eq!(writer.next_event_id(), 3);
        assert_eq!(writer.counters().fragments, 2);
        assert_eq!(writer.counters().liveness, 1);
    }

    #[test]
    fn rejects_second_writer_for_same_stream() {
        let store = StreamStore::default();
        let _writer = store.open(id("s")).expect("open");
        assert_eq!(store.open(id("s")).err(), Some(StoreError::AlreadyExists(id("s"))));
    }

    #[test]
    fn replay_after_returns_only_newer_events() {
        let store = StreamStore::default();
        let mut writer = store.open(id("s")).expect("open");
        for n in 0..5 {
            writer.append(EventKind::Fragment, json!(n)).expect("append");
        }

        let replay = store.replay_after(&id("s"), Some(2)).expect("replay");
        let ids: Vec<EventId> = replay.iter().map(|event| event.event_id).collect();
        assert_eq!(ids, vec![3, 4]);

        assert!(store.replay_after(&id("s"), Some(4)).expect("replay").is_empty());
        assert_eq!(store.replay_after(&id("s"), None).expect("replay").len(), 5);
    }

    #[test]
    fn terminal_event_closes_stream() {
        let store = StreamStore::default();
        let mut writer = store.open(id("s")).expect("open");
        writer.append(EventKind::Done, json!({})).expect("done");

        assert!(writer.is_terminal());
        assert_eq!(
            writer.append(EventKind::Fragment, json!("late")),
            Err(StoreError::Closed(id("s")))
        );
    }

    #[test]
    fn close_appends_done_and_marks_stream_terminal() {
        let store = StreamStore::default();
        let mut writer = store.open(id("s")).expect("open");
        writer.append(EventKind::Fragment, json!("a")).expect("append");
        let completion = Completion {
            usage: crate::event::Usage::new(2, 1, 0.0),
            fragments: 1,
        };

        assert_eq!(writer.close(completion), Ok(1));

        let events = store.replay_after(&id("s"), None).expect("replay");
        assert_eq!(events.len(), 2);
        assert_eq!(events[1].kind, EventKind::Done);
        assert_eq!(events[1].completion(), Some(completion));
        assert!(store.is_terminal(&id("s")).expect("exists"));
    }

    #[test]
    fn close_after_terminal_event_is_rejected() {
        let store = StreamStore::default();
        let mut writer = store.open(id("s")).expect("open");
        writer.append(EventKind::Done, json!({})).expect("done");
        let completion = Completion {
            usage: crate::event::Usage::default(),
            fragments: 0,
        };

        assert_eq!(writer.close(completion), Err(StoreError::Closed(id("s"))));
        assert_eq!(store.replay_after(&id("s"), None).expect("replay").len(), 1);
    }

    #[test]
    fn dropping_unfinished_writer_appends_error_event() {
        let store = StreamStore::default();
        let mut writer = store.open(id("s")).expect("open");
        writer.append(EventKind::Fragment, json!("a")).expect("append");
        drop(writer);

        let events = store.replay_after(&id("s"), None).expect("replay");
        assert_eq!(events.len(), 2);
        assert_eq!(events[1].kind, EventKind::Error);
        assert_eq!(
            events[1].failure().map(|failure| failure.code),
            Some(FailureCode::Producer)
        );
    }

    #[test]
    fn count_retention_reports_trimmed_resume_points() {
        let store = StreamStore::new(RetentionConfig::default().with_max_events(3));
        let mut writer = store.open(id("s")).expect("open");
        for n in 0..6 {
            writer.append(EventKind::Fragment, json!(n)).expect("append");
        }

        let replay = store.replay_after(&id("s"), Some(2)).expect("still retained");
        assert_eq!(replay.len(), 3);

        let error = store.replay_after(&id("s"), Some(1)).expect_err("trimmed");
        assert!(matches!(error, StoreError::RetentionExceeded { oldest: 3, .. }));
        assert_eq!(error.failure_code(), FailureCode::RetentionExceeded);
    }

    #[test]
    fn sweep_evicts_terminal_streams_after_ttl() {
        let store = StreamStore::new(
            RetentionConfig::default().with_terminal_ttl(Duration::from_secs(60)),
        );
        let mut writer = store.open(id("done")).expect("open");
        writer.append(EventKind::Done, json!({})).expect("done");
        let _live = store.open(id("live")).expect("open");

        assert_eq!(store.sweep(), 0);
        let later = Instant::now() + Duration::from_secs(61);
        assert_eq!(store.sweep_at(later), 1);
        assert!(!store.contains(&id("done")));
        assert!(store.contains(&id("live")));
    }

    #[test]
    fn sweep_evicts_idle_streams() {
        let store = StreamStore::new(RetentionConfig::default().with_idle_ttl(Duration::from_secs(30)));
        let _writer = store.open(id("idle")).expect("open");

        let later = Instant::now() + Duration::from_secs(31);
        assert_eq!(store.sweep_at(later), 1);
        assert!(store.is_empty());
    }

    #[test]
    fn stats_count_open_and_terminal_streams() {
        let store = StreamStore::default();
        let mut done = store.open(id("a")).expect("open");
        done.append(EventKind::Done, json!({})).expect("done");
        let mut live = store.open(id("b")).expect("open");
        live.append(EventKind::Fragment, json!(1)).expect("append");

        let stats = store.stats();
        assert_eq!(stats.open_streams, 1);
        assert_eq!(stats.terminal_streams, 1);
        assert_eq!(stats.buffered_events, 2);
    }

    #[tokio::test]
    async fn cursor_replays_then_follows_live_appends() {
        let store = StreamStore::default();
        let mut writer = store.open(id("s")).expect("open");
        writer.append(EventKind::Fragment, json!(0)).expect("append");
        writer.append(EventKind::Fragment, json!(1)).expect("append");

        let mut cursor = store.cursor(&id("s"), Some(0)).expect("cursor");
        let replayed = cursor.next().await.expect("next").expect("event");
        assert_eq!(replayed.event_id, 1);

        let tail = tokio::spawn(async move {
            let mut seen = Vec::new();
            while let Some(event) = cursor.next().await.expect("next") {
                seen.push(event.event_id);
            }
            seen
        });

        tokio::task::yield_now().await;
        writer.append(EventKind::Fragment, json!(2)).expect("append");
        writer.append(EventKind::Done, json!({})).expect("done");

        assert_eq!(tail.await.expect("join"), vec![2, 3]);
    }

    #[tokio::test]
    async fn cursor_fails_when_stream_is_evicted() {
        let store = StreamStore::new(RetentionConfig::default().with_idle_ttl(Duration::from_secs(1)));
        let _writer = store.open(id("s")).expect("open");
        let mut cursor = store.cursor(&id("s"), None).expect("cursor");

        store.sweep_at(Instant::now() + Duration::from_secs(2));
        assert_eq!(cursor.next().await, Err(StoreError::NotFound(id("s"))));
    }
}
