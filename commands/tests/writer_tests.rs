//! Command writer against the in-memory event store.

#![allow(clippy::unwrap_used)]
#![allow(clippy::expect_used)]

use proptest::prelude::*;
use stayflow_commands::{
    Command, CommandWriter, NO_EXPECTATION, UserJoinedRequest, UserLeftRequest, UserRatedRequest,
    UserReservedRequest, WriteError,
};
use stayflow_core::activity::{ActivityEvent, EventKind};
use stayflow_core::stream::{ExpectedSequence, Sequence, StreamId};
use stayflow_testing::InMemoryEventStore;
use std::sync::Arc;

fn reserved(accommodation: &str, hint: i64) -> Command {
    UserReservedRequest {
        user_id: "u1".to_string(),
        accommodation_id: accommodation.to_string(),
        reserved_at: "2024-01-01 10:00".to_string(),
        expected_sequence: hint,
    }
    .into()
}

fn writer() -> (Arc<InMemoryEventStore>, CommandWriter) {
    let store = Arc::new(InMemoryEventStore::new());
    (store.clone(), CommandWriter::new(store))
}

#[tokio::test]
async fn every_kind_lands_on_the_accommodation_stream() {
    let (store, writer) = writer();
    let commands: Vec<Command> = vec![
        UserJoinedRequest {
            user_id: "u1".into(),
            accommodation_id: "A1".into(),
            joined_at: "2024-01-01 10:00".into(),
            custom_uuid: "S1".into(),
            expected_sequence: NO_EXPECTATION,
        }
        .into(),
        UserLeftRequest {
            user_id: "u1".into(),
            accommodation_id: "A1".into(),
            left_at: "2024-01-01 10:30".into(),
            custom_uuid: "S1".into(),
            expected_sequence: NO_EXPECTATION,
        }
        .into(),
        reserved("A1", NO_EXPECTATION),
        UserRatedRequest {
            user_id: "u1".into(),
            accommodation_id: "A1".into(),
            rated_at: "2024-01-02 09:00".into(),
            expected_sequence: NO_EXPECTATION,
        }
        .into(),
    ];

    for (index, command) in commands.into_iter().enumerate() {
        let sequence = writer.handle(command).await.unwrap();
        assert_eq!(sequence, Sequence::new(index as u64));
    }

    let registry = ActivityEvent::registry();
    let kinds: Vec<EventKind> = store
        .stream(&StreamId::for_accommodation("A1"))
        .iter()
        .map(|recorded| {
            registry
                .decode(recorded.event_type(), &recorded.event.data)
                .unwrap()
                .kind()
        })
        .collect();
    assert_eq!(kinds, EventKind::ALL.to_vec());
}

#[tokio::test]
async fn stale_hint_conflicts_and_leaves_stream_alone() {
    let (store, writer) = writer();
    for _ in 0..8 {
        writer.handle(reserved("A1", NO_EXPECTATION)).await.unwrap();
    }
    let stream = StreamId::for_accommodation("A1");
    assert_eq!(store.stream(&stream).len(), 8);

    let error = writer.handle(reserved("A1", 5)).await.unwrap_err();

    assert_eq!(
        error,
        WriteError::ConcurrencyConflict {
            stream_id: stream.clone(),
            expected: ExpectedSequence::Exact(Sequence::new(5)),
            actual: Some(Sequence::new(7)),
        }
    );
    assert_eq!(error.status_code(), 409);
    assert!(!error.is_retryable());
    assert_eq!(store.stream(&stream).len(), 8);
}

#[tokio::test]
async fn current_hint_appends() {
    let (_store, writer) = writer();
    writer.handle(reserved("A1", NO_EXPECTATION)).await.unwrap();

    let sequence = writer.handle(reserved("A1", 0)).await.unwrap();

    assert_eq!(sequence, Sequence::new(1));
}

#[tokio::test]
async fn streams_are_independent() {
    let (_store, writer) = writer();

    writer.handle(reserved("A1", NO_EXPECTATION)).await.unwrap();
    writer.handle(reserved("A1", NO_EXPECTATION)).await.unwrap();
    let first_of_b = writer.handle(reserved("B7", NO_EXPECTATION)).await.unwrap();

    assert_eq!(first_of_b, Sequence::FIRST);
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn sequences_are_gapless_per_stream(targets in proptest::collection::vec(0usize..3, 1..40)) {
        let runtime = tokio::runtime::Builder::new_current_thread().build().unwrap();
        let accommodations = ["A1", "B2", "C3"];

        runtime.block_on(async {
            let (store, writer) = writer();
            for target in &targets {
                writer.handle(reserved(accommodations[*target], NO_EXPECTATION)).await.unwrap();
            }

            for accommodation in accommodations {
                let sequences: Vec<u64> = store
                    .stream(&StreamId::for_accommodation(accommodation))
                    .iter()
                    .map(|recorded| recorded.sequence.value())
                    .collect();
                let expected: Vec<u64> = (0..sequences.len() as u64).collect();
                prop_assert_eq!(sequences, expected);
            }
            Ok(())
        })?;
    }
}
