//! Tests for the shared test doubles working together

#![allow(clippy::unwrap_used)] // Tests can unwrap
#![allow(clippy::expect_used)] // Tests can expect

use futures::StreamExt;
use proptest::prelude::*;
use stayflow_core::activity::ActivityEvent;
use stayflow_core::event_store::EventStore;
use stayflow_core::projection::{ApplyOutcome, Projection, Result};
use stayflow_core::stream::{ExpectedSequence, Sequence, StreamId};
use stayflow_core::subscription::{PersistentSubscription, StreamFilter};
use stayflow_testing::{InMemoryEventStore, ProjectionTestHarness, fixtures};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

// Counts reservations per accommodation, skipping sequences it has already seen
#[derive(Clone, Default)]
struct ReservationCounter {
    counts: Arc<Mutex<HashMap<String, (u64, Option<Sequence>)>>>,
}

impl ReservationCounter {
    fn count(&self, accommodation: &str) -> u64 {
        self.counts
            .lock()
            .unwrap()
            .get(accommodation)
            .map_or(0, |(count, _)| *count)
    }
}

impl Projection for ReservationCounter {
    type Event = ActivityEvent;

    fn name(&self) -> &'static str {
        "reservation_counter"
    }

    async fn apply_event(&self, sequence: Sequence, event: &Self::Event) -> Result<ApplyOutcome> {
        let ActivityEvent::UserReserved(reserved) = event else {
            return Ok(ApplyOutcome::Inconsistent);
        };
        let mut counts = self.counts.lock().unwrap();
        let entry = counts.entry(reserved.accommodation_id.clone()).or_default();
        if entry.1.is_some_and(|last| last >= sequence) {
            return Ok(ApplyOutcome::Duplicate);
        }
        entry.0 += 1;
        entry.1 = Some(sequence);
        Ok(ApplyOutcome::Applied)
    }

    async fn rebuild(&self) -> Result<()> {
        self.counts.lock().unwrap().clear();
        Ok(())
    }
}

#[tokio::test]
async fn harness_records_outcomes_in_order() {
    let mut harness = ProjectionTestHarness::new(ReservationCounter::default());

    harness
        .given_events(vec![
            (Sequence::new(0), fixtures::reserved("u1", "A1", "2024-01-01 10:00")),
            (Sequence::new(0), fixtures::reserved("u1", "A1", "2024-01-01 10:00")),
            (Sequence::new(1), fixtures::rated("u1", "A1", "2024-01-01 10:05")),
        ])
        .await
        .unwrap()
        .then_outcomes(&[
            ApplyOutcome::Applied,
            ApplyOutcome::Duplicate,
            ApplyOutcome::Inconsistent,
        ]);

    assert_eq!(harness.projection().count("A1"), 1);
}

#[tokio::test]
async fn harness_reset_rebuilds_projection() {
    let mut harness = ProjectionTestHarness::new(ReservationCounter::default());
    harness
        .given_event(Sequence::new(0), fixtures::reserved("u1", "A1", "2024-01-01 10:00"))
        .await
        .unwrap();

    harness.reset().await.unwrap();

    assert_eq!(harness.projection().count("A1"), 0);
    assert_eq!(harness.last_outcome(), None);
}

#[tokio::test]
async fn subscription_feeds_appended_activity_into_projection() {
    let store = InMemoryEventStore::new();
    let projection = ReservationCounter::default();
    let registry = ActivityEvent::registry();

    for user in ["u1", "u2", "u3"] {
        let event = fixtures::reserved(user, "A1", "2024-01-01 10:00");
        store
            .append(event.stream_id(), ExpectedSequence::Any, vec![event.to_serialized(None).unwrap()])
            .await
            .unwrap();
    }

    store
        .ensure_group("counter", &StreamFilter::Category(StreamId::ACCOMMODATION_CATEGORY.into()))
        .await
        .unwrap();
    let mut deliveries = store.connect("counter").await.unwrap();

    for _ in 0..3 {
        let delivery = tokio::time::timeout(Duration::from_secs(1), deliveries.next())
            .await
            .expect("delivery in time")
            .unwrap()
            .unwrap();
        let event = registry
            .decode(delivery.event.event_type(), &delivery.event.event.data)
            .unwrap();
        projection
            .apply_event(delivery.event.sequence, &event)
            .await
            .unwrap();
        delivery.ack().await.unwrap();
    }

    assert_eq!(projection.count("A1"), 3);
    assert!(store.wait_until_settled("counter", Duration::from_secs(1)).await);
}

proptest! {
    // Whatever the batch sizes, a stream's sequences are 0..n with no gaps
    #[test]
    fn sequences_are_gapless(batches in proptest::collection::vec(1usize..5, 1..10)) {
        let runtime = tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap();
        let sequences = runtime.block_on(async {
            let store = InMemoryEventStore::new();
            let stream = StreamId::for_accommodation("A1");
            for size in &batches {
                let events = (0..*size)
                    .map(|_| fixtures::rated("u1", "A1", "2024-01-01 10:00").to_serialized(None).unwrap())
                    .collect();
                store.append(stream.clone(), ExpectedSequence::Any, events).await.unwrap();
            }
            store.stream(&stream).iter().map(|e| e.sequence.value()).collect::<Vec<_>>()
        });

        let total: usize = batches.iter().sum();
        let expected: Vec<u64> = (0..u64::try_from(total).unwrap()).collect();
        prop_assert_eq!(sequences, expected);
    }
}
