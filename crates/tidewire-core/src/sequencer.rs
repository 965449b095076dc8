//! # Sequencer / Deduplicator
//!
//! Client-side bookkeeping that turns a possibly reordered, possibly
//! duplicated event feed into an exactly-once, in-order one.
//!
//! For an arriving id `e` and the window's `next_expected`:
//!
//! | Case | Action |
//! |------|--------|
//! | `e < next_expected` or already buffered | duplicate, dropped |
//! | `e == next_expected` | released, then buffered successors drained |
//! | `e > next_expected` | buffered until the gap closes |
//!
//! Dedup is strictly by event id: two distinct ids carrying identical payloads
//! are both released.
//!
//! The seen-set is implicit: an id is seen when it is below `next_expected`
//! or present in the pending buffer, which keeps the window bounded by the
//! pending buffer alone.

use std::collections::BTreeMap;

use serde::Serialize;

use crate::event::{Event, EventId};
use crate::StreamId;

/// Sequencing failures that require the connection to resynchronise.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SequenceError {
    #[error("event for stream '{got}' arrived on stream '{expected}'")]
    ForeignStream { expected: StreamId, got: StreamId },
    #[error("pending buffer full ({limit} events) while waiting for event {waiting_for}")]
    PendingOverflow { limit: usize, waiting_for: EventId },
}

/// Counters describing what the window has seen so far.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SequencerStats {
    pub released: u64,
    pub duplicates: u64,
    pub reordered: u64,
    pub peak_pending: usize,
}

/// Dedup window for one stream.
#[derive(Debug, Clone)]
pub struct Sequencer {
    stream_id: StreamId,
    next_expected: EventId,
    pending: BTreeMap<EventId, Event>,
    max_pending: usize,
    finished: bool,
    stats: SequencerStats,
}

impl Sequencer {
    pub fn new(stream_id: StreamId, max_pending: usize) -> Self {
        Self {
            stream_id,
            next_expected: 0,
            pending: BTreeMap::new(),
            max_pending: max_pending.max(1),
            finished: false,
            stats: SequencerStats::default(),
        }
    }

    /// Start over for a different stream. Reconnects of the same stream must
    /// keep the window.
    pub fn reset(&mut self, stream_id: StreamId) {
        *self = Self::new(stream_id, self.max_pending);
    }

    pub fn stream_id(&self) -> &StreamId {
        &self.stream_id
    }

    pub fn next_expected(&self) -> EventId {
        self.next_expected
    }

    /// Highest id released so far; this is what a reconnect reports.
    pub fn last_delivered(&self) -> Option<EventId> {
        self.next_expected.checked_sub(1)
    }

    pub fn is_seen(&self, event_id: EventId) -> bool {
        event_id < self.next_expected || self.pending.contains_key(&event_id)
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Whether the terminal event has been released.
    pub fn is_finished(&self) -> bool {
        self.finished
    }

    pub fn stats(&self) -> SequencerStats {
        self.stats
    }

    /// Admit one event and return the events it releases, in id order.
    pub fn process(&mut self, event: Event) -> Result<Vec<Event>, SequenceError> {
        if event.stream_id != self.stream_id {
            return Err(SequenceError::ForeignStream {
                expected: self.stream_id.clone(),
                got: event.stream_id,
            });
        }

        let event_id = event.event_id;
        if self.finished || self.is_seen(event_id) {
            self.stats.duplicates += 1;
            tracing::trace!(stream_id = %self.stream_id, event_id, "duplicate dropped");
            return Ok(Vec::new());
        }

        if event_id > self.next_expected {
            if self.pending.len() >= self.max_pending {
                return Err(SequenceError::PendingOverflow {
                    limit: self.max_pending,
                    waiting_for: self.next_expected,
                });
            }
            self.stats.reordered += 1;
            self.pending.insert(event_id, event);
            self.stats.peak_pending = self.stats.peak_pending.max(self.pending.len());
            return Ok(Vec::new());
        }

        let mut released = vec![event];
        self.advance(&mut released);
        while let Some(next) = self.pending.remove(&self.next_expected) {
            released.push(next);
            self.advance(&mut released);
        }
        Ok(released)
    }

    fn advance(&mut self, released: &mut Vec<Event>) {
        self.next_expected += 1;
        self.stats.released += 1;
        if released.last().is_some_and(Event::is_terminal) {
            self.finished = true;
            // Nothing legitimately follows a terminal event.
            self.pending.clear();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::EventKind;
    use serde_json::json;

    fn stream() -> StreamId {
        StreamId::parse("s").expect("valid")
    }

    fn fragment(id: EventId) -> Event {
        Event::new(stream(), id, EventKind::Fragment, json!(id))
    }

    fn ids(events: &[Event]) -> Vec<EventId> {
        events.iter().map(|event| event.event_id).collect()
    }

    #[test]
    fn in_order_events_are_released_immediately() {
        let mut sequencer = Sequencer::new(stream(), 16);
        for id in 0..3 {
            assert_eq!(ids(&sequencer.process(fragment(id)).expect("ok")), vec![id]);
        }
        assert_eq!(sequencer.last_delivered(), Some(2));
    }

    #[test]
    fn gap_holds_events_until_it_closes() {
        let mut sequencer = Sequencer::new(stream(), 16);
        assert!(sequencer.process(fragment(2)).expect("ok").is_empty());
        assert!(sequencer.process(fragment(1)).expect("ok").is_empty());
        assert_eq!(sequencer.pending_len(), 2);

        let released = sequencer.process(fragment(0)).expect("ok");
        assert_eq!(ids(&released), vec![0, 1, 2]);
        assert_eq!(sequencer.pending_len(), 0);
        assert_eq!(sequencer.stats().reordered, 2);
    }

    #[test]
    fn duplicates_are_dropped_whether_delivered_or_pending() {
        let mut sequencer = Sequencer::new(stream(), 16);
        sequencer.process(fragment(0)).expect("ok");
        sequencer.process(fragment(2)).expect("ok");

        assert!(sequencer.process(fragment(0)).expect("ok").is_empty());
        assert!(sequencer.process(fragment(2)).expect("ok").is_empty());
        assert_eq!(sequencer.stats().duplicates, 2);
        assert!(sequencer.is_seen(2));
        assert!(!sequencer.is_seen(1));
    }

    #[test]
    fn equal_payloads_with_distinct_ids_are_both_released() {
        let mut sequencer = Sequencer::new(stream(), 16);
        for id in 0..5 {
            sequencer.process(fragment(id)).expect("ok");
        }
        let same = json!({ "text": "again" });
        let first = Event::new(stream(), 5, EventKind::Fragment, same.clone());
        let second = Event::new(stream(), 6, EventKind::Fragment, same);

        assert_eq!(sequencer.process(first).expect("ok").len(), 1);
        assert_eq!(sequencer.process(second).expect("ok").len(), 1);
    }

    #[test]
    fn terminal_event_finishes_window() {
        let mut sequencer = Sequencer::new(stream(), 16);
        sequencer.process(fragment(0)).expect("ok");
        let done = Event::new(stream(), 1, EventKind::Done, json!({}));
        assert_eq!(sequencer.process(done).expect("ok").len(), 1);
        assert!(sequencer.is_finished());

        assert!(sequencer.process(fragment(2)).expect("ok").is_empty());
    }

    #[test]
    fn foreign_stream_events_are_rejected() {
        let mut sequencer = Sequencer::new(stream(), 16);
        let other = Event::new(StreamId::parse("other").expect("valid"), 0, EventKind::Fragment, json!(0));
        assert!(matches!(
            sequencer.process(other),
            Err(SequenceError::ForeignStream { .. })
        ));
    }

    #[test]
    fn pending_overflow_is_reported_without_losing_state() {
        let mut sequencer = Sequencer::new(stream(), 2);
        sequencer.process(fragment(1)).expect("ok");
        sequencer.process(fragment(2)).expect("ok");

        let error = sequencer.process(fragment(3)).expect_err("overflow");
        assert_eq!(
            error,
            SequenceError::PendingOverflow {
                limit: 2,
                waiting_for: 0
            }
        );
        assert_eq!(ids(&sequencer.process(fragment(0)).expect("ok")), vec![0, 1, 2]);
    }

    #[test]
    fn reset_starts_a_new_window() {
        let mut sequencer = Sequencer::new(stream(), 16);
        sequencer.process(fragment(0)).expect("ok");
        let next = StreamId::parse("next").expect("valid");
        sequencer.reset(next.clone());

        assert_eq!(sequencer.stream_id(), &next);
        assert_eq!(sequencer.last_delivered(), None);
        assert_eq!(sequencer.stats(), SequencerStats::default());
    }
}
