//! Behavior-driven tests for the sequencer/deduplicator.
//!
//! Feeds are generated from seeded `fastrand` generators so failures are
//! reproducible from the seed in the assertion message.

use serde_json::json;
use tidewire_core::{Event, EventId, EventKind, Sequencer, StreamId};

const SEEDS: u64 = 64;

fn stream() -> StreamId {
    StreamId::parse("property").expect("valid")
}

/// `fragments` fragment events followed by a terminal `done`.
fn emission(fragments: u64) -> Vec<Event> {
    let mut events: Vec<Event> = (0..fragments)
        .map(|id| Event::new(stream(), id, EventKind::Fragment, json!({ "index": id })))
        .collect();
    events.push(Event::new(stream(), fragments, EventKind::Done, json!({})));
    events
}

fn feed(sequencer: &mut Sequencer, events: Vec<Event>) -> Vec<Event> {
    let mut released = Vec::new();
    for event in events {
        released.extend(sequencer.process(event).expect("within pending bound"));
    }
    released
}

// =============================================================================
// Ordering
// =============================================================================

#[test]
fn any_reordering_is_delivered_in_emission_order() {
    for seed in 0..SEEDS {
        // Given: a finite emission, shuffled arbitrarily
        let mut rng = fastrand::Rng::with_seed(seed);
        let fragments = rng.u64(1..80);
        let original = emission(fragments);
        let mut shuffled = original.clone();
        rng.shuffle(&mut shuffled);

        // When: the shuffled feed goes through the sequencer
        let mut sequencer = Sequencer::new(stream(), 4096);
        let released = feed(&mut sequencer, shuffled);

        // Then: the application sees exactly the original order
        assert_eq!(released, original, "seed {seed}");
        assert!(sequencer.is_finished(), "seed {seed}");
    }
}

#[test]
fn released_ids_increase_by_exactly_one() {
    for seed in 0..SEEDS {
        // Given: a feed with shuffles and random duplicates
        let mut rng = fastrand::Rng::with_seed(seed);
        let original = emission(50);
        let mut noisy = original.clone();
        for _ in 0..rng.usize(0..100) {
            let pick = rng.usize(0..original.len());
            noisy.push(original[pick].clone());
        }
        rng.shuffle(&mut noisy);

        // When: it is sequenced
        let mut sequencer = Sequencer::new(stream(), 4096);
        let released = feed(&mut sequencer, noisy);

        // Then: ids observed post-dedup are 0, 1, 2, ... with no gaps
        let ids: Vec<EventId> = released.iter().map(|event| event.event_id).collect();
        assert_eq!(ids, (0..=50).collect::<Vec<_>>(), "seed {seed}");
    }
}

// =============================================================================
// Idempotence
// =============================================================================

#[test]
fn redelivering_delivered_ids_produces_no_callbacks() {
    for seed in 0..SEEDS {
        // Given: a sequencer that already delivered ids 0..20
        let mut rng = fastrand::Rng::with_seed(seed);
        let mut sequencer = Sequencer::new(stream(), 4096);
        let delivered = feed(&mut sequencer, emission(30).into_iter().take(20).collect());
        assert_eq!(delivered.len(), 20);

        // When: any of them is redelivered any number of times
        let mut replays = Vec::new();
        for _ in 0..rng.usize(1..200) {
            replays.push(delivered[rng.usize(0..delivered.len())].clone());
        }
        let count = replays.len() as u64;
        let released = feed(&mut sequencer, replays);

        // Then: nothing new is released and every copy counts as a duplicate
        assert!(released.is_empty(), "seed {seed}");
        assert_eq!(sequencer.stats().duplicates, count, "seed {seed}");
        assert_eq!(sequencer.last_delivered(), Some(19), "seed {seed}");
    }
}

#[test]
fn replay_after_reconnect_overlapping_pending_is_absorbed() {
    // Given: ids 0..=9 delivered, 12..=15 buffered behind a gap
    let events = emission(20);
    let mut sequencer = Sequencer::new(stream(), 4096);
    feed(&mut sequencer, events[..10].to_vec());
    feed(&mut sequencer, events[12..16].to_vec());
    assert_eq!(sequencer.pending_len(), 4);

    // When: the server replays everything after the last delivered id
    let released = feed(&mut sequencer, events[10..].to_vec());

    // Then: 10..=20 come out once each; buffered copies are dropped
    let ids: Vec<EventId> = released.iter().map(|event| event.event_id).collect();
    assert_eq!(ids, (10..=20).collect::<Vec<_>>());
    assert_eq!(sequencer.stats().duplicates, 4);
    assert_eq!(sequencer.pending_len(), 0);
}

// =============================================================================
// Boundaries
// =============================================================================

#[test]
fn dedup_is_by_id_not_payload() {
    // Given: ids 5 and 6 carry byte-identical payloads
    let mut sequencer = Sequencer::new(stream(), 16);
    feed(&mut sequencer, emission(5).into_iter().take(5).collect());
    let same = json!({ "text": "repeat" });

    // When: both arrive
    let released = feed(
        &mut sequencer,
        vec![
            Event::new(stream(), 5, EventKind::Fragment, same.clone()),
            Event::new(stream(), 6, EventKind::Fragment, same),
        ],
    );

    // Then: both are delivered
    assert_eq!(released.len(), 2);
    assert_eq!(sequencer.stats().duplicates, 0);
}

#[test]
fn liveness_events_consume_ids_in_sequence() {
    // Given: a feed interleaving liveness and fragments, reversed
    let mut events = vec![
        Event::new(stream(), 0, EventKind::Liveness, json!(null)),
        Event::new(stream(), 1, EventKind::Fragment, json!("a")),
        Event::new(stream(), 2, EventKind::Liveness, json!(null)),
        Event::new(stream(), 3, EventKind::Fragment, json!("b")),
    ];
    events.reverse();

    // When: sequenced
    let mut sequencer = Sequencer::new(stream(), 16);
    let released = feed(&mut sequencer, events);

    // Then: liveness events hold their slot in the order
    let kinds: Vec<EventKind> = released.iter().map(|event| event.kind).collect();
    assert_eq!(
        kinds,
        vec![
            EventKind::Liveness,
            EventKind::Fragment,
            EventKind::Liveness,
            EventKind::Fragment
        ]
    );
}

#[test]
fn a_gap_that_never_closes_is_bounded_by_max_pending() {
    // Given: id 0 never arrives and the window holds at most 8 events
    let mut sequencer = Sequencer::new(stream(), 8);
    let events = emission(20);
    for event in events[1..9].iter().cloned() {
        assert!(sequencer.process(event).expect("buffered").is_empty());
    }

    // When: one more out-of-order event arrives
    let overflow = sequencer.process(events[9].clone());

    // Then: the sequencer refuses to grow and nothing is force-delivered
    assert!(overflow.is_err());
    assert_eq!(sequencer.pending_len(), 8);
    assert_eq!(sequencer.last_delivered(), None);
}
