//! In-memory event store with persistent-subscription support.
//!
//! [`InMemoryEventStore`] implements both [`EventStore`] and [`PersistentSubscription`]
//! on the same log, so a test can append through the command side and watch the
//! consumer pick the events up, exactly as against the real broker.
//!
//! Consumer groups start from the beginning of the log, track per-event retry counts,
//! and park an event once it was retried `max_retry_count` times. Tests can inject
//! append and connect failures and drop live connections.

#![allow(clippy::unwrap_used)] // Test infrastructure uses unwrap for simplicity
#![allow(clippy::missing_panics_doc)] // Only panics on a poisoned lock

use chrono::Utc;
use stayflow_core::event::SerializedEvent;
use stayflow_core::event_store::{EventStore, EventStoreError, RecordedEvent};
use stayflow_core::stream::{ExpectedSequence, Sequence, StreamId};
use stayflow_core::subscription::{
    Acknowledger, Delivery, DeliveryStream, GroupStatus, NackAction, PersistentSubscription,
    StreamFilter, SubscriptionError,
};
use std::collections::{HashMap, HashSet, VecDeque};
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;

/// Default number of retries before an event is parked.
pub const DEFAULT_MAX_RETRY_COUNT: u32 = 10;

/// An event the group gave up on.
#[derive(Clone, Debug, PartialEq)]
pub struct ParkedEvent {
    /// The event
    pub event: RecordedEvent,
    /// Why it was parked
    pub reason: String,
}

struct GroupState {
    filter: StreamFilter,
    /// Global log positions waiting to be delivered
    pending: VecDeque<usize>,
    /// Delivered, not yet settled
    in_flight: HashSet<usize>,
    retry_counts: HashMap<usize, u32>,
    acked: HashSet<usize>,
    parked: Vec<ParkedEvent>,
    /// Bumped to drop every live connection
    generation: u64,
}

#[derive(Default)]
struct StoreState {
    streams: HashMap<StreamId, Vec<RecordedEvent>>,
    log: Vec<RecordedEvent>,
    groups: HashMap<String, GroupState>,
    failing_appends: usize,
    failing_connects: usize,
}

struct Shared {
    state: Mutex<StoreState>,
    changed: Notify,
    max_retry_count: u32,
}

/// In-memory event store and persistent-subscription broker.
///
/// Clones share the same log.
///
/// # Example
///
/// ```
/// use stayflow_testing::InMemoryEventStore;
/// use stayflow_core::event::SerializedEvent;
/// use stayflow_core::event_store::EventStore;
/// use stayflow_core::stream::{ExpectedSequence, Sequence, StreamId};
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let store = InMemoryEventStore::new();
/// let stream = StreamId::for_accommodation("A1");
/// let event = SerializedEvent::new("UserRated".into(), vec![1, 2, 3], None);
///
/// let last = store.append(stream.clone(), ExpectedSequence::NoStream, vec![event]).await?;
/// assert_eq!(last, Sequence::FIRST);
/// assert_eq!(store.last_sequence(stream).await?, Some(Sequence::FIRST));
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct InMemoryEventStore {
    shared: Arc<Shared>,
}

impl Default for InMemoryEventStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryEventStore {
    /// Create an empty store with the default retry limit.
    #[must_use]
    pub fn new() -> Self {
        Self::with_max_retry_count(DEFAULT_MAX_RETRY_COUNT)
    }

    /// Create an empty store that parks events after `max_retry_count` retries.
    #[must_use]
    pub fn with_max_retry_count(max_retry_count: u32) -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(StoreState::default()),
                changed: Notify::new(),
                max_retry_count,
            }),
        }
    }

    /// Make the next `count` appends fail with a transport error.
    pub fn fail_next_appends(&self, count: usize) {
        self.shared.state.lock().unwrap().failing_appends = count;
    }

    /// Make the next `count` connects fail with a transport error.
    pub fn fail_next_connects(&self, count: usize) {
        self.shared.state.lock().unwrap().failing_connects = count;
    }

    /// Drop every live connection of `group`, like a broker restart would.
    ///
    /// Unsettled deliveries go back to the front of the queue.
    pub fn drop_connections(&self, group: &str) {
        {
            let mut state = self.shared.state.lock().unwrap();
            if let Some(group) = state.groups.get_mut(group) {
                group.generation += 1;
                let mut unsettled: Vec<usize> = group.in_flight.drain().collect();
                unsettled.sort_unstable();
                for index in unsettled.into_iter().rev() {
                    group.pending.push_front(index);
                }
            }
        }
        self.shared.changed.notify_waiters();
    }

    /// Every event in global append order.
    #[must_use]
    pub fn all_events(&self) -> Vec<RecordedEvent> {
        self.shared.state.lock().unwrap().log.clone()
    }

    /// Events of one stream.
    #[must_use]
    pub fn stream(&self, stream_id: &StreamId) -> Vec<RecordedEvent> {
        self.shared
            .state
            .lock()
            .unwrap()
            .streams
            .get(stream_id)
            .cloned()
            .unwrap_or_default()
    }

    /// Events parked by `group`.
    #[must_use]
    pub fn parked(&self, group: &str) -> Vec<ParkedEvent> {
        self.shared
            .state
            .lock()
            .unwrap()
            .groups
            .get(group)
            .map(|group| group.parked.clone())
            .unwrap_or_default()
    }

    /// Number of events `group` acknowledged.
    #[must_use]
    pub fn acked_count(&self, group: &str) -> usize {
        self.shared
            .state
            .lock()
            .unwrap()
            .groups
            .get(group)
            .map_or(0, |group| group.acked.len())
    }

    /// Number of events `group` still has to settle (queued or in flight).
    #[must_use]
    pub fn outstanding(&self, group: &str) -> usize {
        self.shared
            .state
            .lock()
            .unwrap()
            .groups
            .get(group)
            .map_or(0, |group| group.pending.len() + group.in_flight.len())
    }

    /// Wait until `group` has nothing left to settle.
    ///
    /// Returns `false` if `timeout` passed first.
    pub async fn wait_until_settled(&self, group: &str, timeout: std::time::Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let notified = self.shared.changed.notified();
            if self.outstanding(group) == 0 {
                return true;
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return self.outstanding(group) == 0;
            }
        }
    }
}

impl EventStore for InMemoryEventStore {
    fn append(
        &self,
        stream_id: StreamId,
        expected: ExpectedSequence,
        events: Vec<SerializedEvent>,
    ) -> Pin<Box<dyn Future<Output = Result<Sequence, EventStoreError>> + Send + '_>> {
        Box::pin(async move {
            if events.is_empty() {
                return Err(EventStoreError::Serialization(
                    "cannot append an empty batch".to_string(),
                ));
            }

            let last = {
                let mut state = self.shared.state.lock().unwrap();
                if state.failing_appends > 0 {
                    state.failing_appends -= 1;
                    return Err(EventStoreError::Transport("injected failure".to_string()));
                }

                let actual = state
                    .streams
                    .get(&stream_id)
                    .and_then(|stream| stream.last())
                    .map(|event| event.sequence);
                if !expected.matches(actual) {
                    return Err(EventStoreError::ConcurrencyConflict {
                        stream_id,
                        expected,
                        actual,
                    });
                }

                let mut next = actual.map_or(Sequence::FIRST, Sequence::next);
                let mut last = next;
                for event in events {
                    let recorded = RecordedEvent {
                        stream_id: stream_id.clone(),
                        sequence: next,
                        event,
                        recorded_at: Utc::now(),
                    };
                    let index = state.log.len();
                    for group in state.groups.values_mut() {
                        if group.filter.accepts(&stream_id) {
                            group.pending.push_back(index);
                        }
                    }
                    state.log.push(recorded.clone());
                    state.streams.entry(stream_id.clone()).or_default().push(recorded);
                    last = next;
                    next = next.next();
                }
                last
            };

            self.shared.changed.notify_waiters();
            Ok(last)
        })
    }

    fn read_stream(
        &self,
        stream_id: StreamId,
        from: Sequence,
        max_count: usize,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<RecordedEvent>, EventStoreError>> + Send + '_>>
    {
        Box::pin(async move {
            let state = self.shared.state.lock().unwrap();
            Ok(state
                .streams
                .get(&stream_id)
                .map(|stream| {
                    stream
                        .iter()
                        .filter(|event| event.sequence >= from)
                        .take(max_count)
                        .cloned()
                        .collect()
                })
                .unwrap_or_default())
        })
    }

    fn last_sequence(
        &self,
        stream_id: StreamId,
    ) -> Pin<Box<dyn Future<Output = Result<Option<Sequence>, EventStoreError>> + Send + '_>> {
        Box::pin(async move {
            let state = self.shared.state.lock().unwrap();
            Ok(state
                .streams
                .get(&stream_id)
                .and_then(|stream| stream.last())
                .map(|event| event.sequence))
        })
    }
}

enum Next {
    Deliver(Delivery),
    Dropped,
    Wait,
}

struct InMemoryAcker {
    shared: Arc<Shared>,
    group: String,
    index: usize,
}

impl InMemoryAcker {
    fn settle(&self, action: Option<(NackAction, &str)>) -> Result<(), SubscriptionError> {
        {
            let mut state = self.shared.state.lock().unwrap();
            let max_retry_count = self.shared.max_retry_count;
            let event = state.log[self.index].clone();
            let group = state
                .groups
                .get_mut(&self.group)
                .ok_or_else(|| SubscriptionError::GroupNotFound(self.group.clone()))?;

            group.in_flight.remove(&self.index);
            group.pending.retain(|index| *index != self.index);

            match action {
                None | Some((NackAction::Skip, _)) => {
                    group.acked.insert(self.index);
                },
                Some((NackAction::Park, reason)) => {
                    group.parked.push(ParkedEvent {
                        event,
                        reason: reason.to_string(),
                    });
                },
                Some((NackAction::Retry, reason)) => {
                    let retries = group.retry_counts.entry(self.index).or_insert(0);
                    if *retries >= max_retry_count {
                        group.parked.push(ParkedEvent {
                            event,
                            reason: format!("retry limit reached: {reason}"),
                        });
                    } else {
                        *retries += 1;
                        // Back ahead of every later event, which includes the rest of its stream
                        let at = group.pending.partition_point(|index| *index < self.index);
                        group.pending.insert(at, self.index);
                    }
                },
            }
        }
        self.shared.changed.notify_waiters();
        Ok(())
    }
}

impl Acknowledger for InMemoryAcker {
    fn ack<'a>(
        &'a self,
        _event: &'a RecordedEvent,
    ) -> Pin<Box<dyn Future<Output = Result<(), SubscriptionError>> + Send + 'a>> {
        Box::pin(async move { self.settle(None) })
    }

    fn nack<'a>(
        &'a self,
        _event: &'a RecordedEvent,
        action: NackAction,
        reason: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<(), SubscriptionError>> + Send + 'a>> {
        Box::pin(async move { self.settle(Some((action, reason))) })
    }
}

fn next_delivery(shared: &Arc<Shared>, group_name: &str, generation: u64) -> Next {
    let mut state = shared.state.lock().unwrap();
    let StoreState { groups, log, .. } = &mut *state;
    let Some(group) = groups.get_mut(group_name) else {
        return Next::Dropped;
    };
    if group.generation != generation {
        return Next::Dropped;
    }
    let Some(index) = group.pending.pop_front() else {
        return Next::Wait;
    };

    group.in_flight.insert(index);
    let retry_count = group.retry_counts.get(&index).copied().unwrap_or(0);
    let acker = InMemoryAcker {
        shared: Arc::clone(shared),
        group: group_name.to_string(),
        index,
    };
    Next::Deliver(Delivery::new(log[index].clone(), retry_count, Box::new(acker)))
}

impl PersistentSubscription for InMemoryEventStore {
    fn ensure_group<'a>(
        &'a self,
        group: &'a str,
        filter: &'a StreamFilter,
    ) -> Pin<Box<dyn Future<Output = Result<GroupStatus, SubscriptionError>> + Send + 'a>> {
        Box::pin(async move {
            let mut state = self.shared.state.lock().unwrap();
            if state.groups.contains_key(group) {
                return Ok(GroupStatus::AlreadyExists);
            }

            let pending = state
                .log
                .iter()
                .enumerate()
                .filter(|(_, event)| filter.accepts(&event.stream_id))
                .map(|(index, _)| index)
                .collect();
            state.groups.insert(
                group.to_string(),
                GroupState {
                    filter: filter.clone(),
                    pending,
                    in_flight: HashSet::new(),
                    retry_counts: HashMap::new(),
                    acked: HashSet::new(),
                    parked: Vec::new(),
                    generation: 0,
                },
            );
            Ok(GroupStatus::Created)
        })
    }

    fn connect<'a>(
        &'a self,
        group: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<DeliveryStream, SubscriptionError>> + Send + 'a>> {
        Box::pin(async move {
            let generation = {
                let mut state = self.shared.state.lock().unwrap();
                if state.failing_connects > 0 {
                    state.failing_connects -= 1;
                    return Err(SubscriptionError::Transport("injected failure".to_string()));
                }
                state
                    .groups
                    .get(group)
                    .map(|group| group.generation)
                    .ok_or_else(|| SubscriptionError::GroupNotFound(group.to_string()))?
            };

            let shared = Arc::clone(&self.shared);
            let group = group.to_string();
            let stream = async_stream::stream! {
                loop {
                    let notified = shared.changed.notified();
                    match next_delivery(&shared, &group, generation) {
                        Next::Deliver(delivery) => yield Ok(delivery),
                        Next::Dropped => {
                            yield Err(SubscriptionError::Dropped(format!("group {group} connection dropped")));
                            break;
                        },
                        Next::Wait => notified.await,
                    }
                }
            };
            Ok(Box::pin(stream) as DeliveryStream)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use std::time::Duration;

    fn raw(tag: &str) -> SerializedEvent {
        SerializedEvent::new(tag.to_string(), vec![0], None)
    }

    fn accommodation(id: &str) -> StreamId {
        StreamId::for_accommodation(id)
    }

    #[tokio::test]
    async fn sequences_are_gapless_per_stream() {
        let store = InMemoryEventStore::new();
        let a1 = accommodation("A1");

        let last = store
            .append(a1.clone(), ExpectedSequence::Any, vec![raw("x"), raw("y")])
            .await
            .unwrap();
        assert_eq!(last, Sequence::new(1));

        store
            .append(accommodation("A2"), ExpectedSequence::Any, vec![raw("z")])
            .await
            .unwrap();
        let last = store
            .append(a1.clone(), ExpectedSequence::Exact(Sequence::new(1)), vec![raw("w")])
            .await
            .unwrap();
        assert_eq!(last, Sequence::new(2));

        let sequences: Vec<u64> = store.stream(&a1).iter().map(|e| e.sequence.value()).collect();
        assert_eq!(sequences, vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn stale_expectation_conflicts_and_writes_nothing() {
        let store = InMemoryEventStore::new();
        let a1 = accommodation("A1");
        let batch: Vec<_> = (0..8).map(|_| raw("x")).collect();
        store.append(a1.clone(), ExpectedSequence::Any, batch).await.unwrap();

        let err = store
            .append(a1.clone(), ExpectedSequence::Exact(Sequence::new(5)), vec![raw("y")])
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            EventStoreError::ConcurrencyConflict { actual: Some(actual), .. } if actual == Sequence::new(7)
        ));
        assert_eq!(store.stream(&a1).len(), 8);
    }

    #[tokio::test]
    async fn read_stream_pages() {
        let store = InMemoryEventStore::new();
        let a1 = accommodation("A1");
        let batch: Vec<_> = (0..5).map(|_| raw("x")).collect();
        store.append(a1.clone(), ExpectedSequence::Any, batch).await.unwrap();

        let page = store.read_stream(a1.clone(), Sequence::new(2), 2).await.unwrap();
        let sequences: Vec<u64> = page.iter().map(|e| e.sequence.value()).collect();
        assert_eq!(sequences, vec![2, 3]);
        assert!(
            store
                .read_stream(accommodation("missing"), Sequence::FIRST, 10)
                .await
                .unwrap()
                .is_empty()
        );
    }

    #[tokio::test]
    async fn ensure_group_is_idempotent() {
        let store = InMemoryEventStore::new();
        let filter = StreamFilter::All;
        assert_eq!(
            store.ensure_group("g", &filter).await.unwrap(),
            GroupStatus::Created
        );
        assert_eq!(
            store.ensure_group("g", &filter).await.unwrap(),
            GroupStatus::AlreadyExists
        );
    }

    #[tokio::test]
    async fn connect_to_unknown_group_fails() {
        let store = InMemoryEventStore::new();
        assert!(matches!(
            store.connect("nope").await,
            Err(SubscriptionError::GroupNotFound(_))
        ));
    }

    #[tokio::test]
    async fn group_starts_from_beginning_and_follows_new_events() {
        let store = InMemoryEventStore::new();
        store
            .append(accommodation("A1"), ExpectedSequence::Any, vec![raw("old")])
            .await
            .unwrap();
        store.ensure_group("g", &StreamFilter::All).await.unwrap();
        let mut deliveries = store.connect("g").await.unwrap();

        let first = deliveries.next().await.unwrap().unwrap();
        assert_eq!(first.event.event_type(), "old");
        first.ack().await.unwrap();

        store
            .append(accommodation("A1"), ExpectedSequence::Any, vec![raw("new")])
            .await
            .unwrap();
        let second = deliveries.next().await.unwrap().unwrap();
        assert_eq!(second.event.event_type(), "new");
        second.ack().await.unwrap();

        assert_eq!(store.acked_count("g"), 2);
        assert_eq!(store.outstanding("g"), 0);
    }

    #[tokio::test]
    async fn retried_event_is_parked_after_limit() {
        let store = InMemoryEventStore::with_max_retry_count(2);
        store.ensure_group("g", &StreamFilter::All).await.unwrap();
        store
            .append(accommodation("A1"), ExpectedSequence::Any, vec![raw("poison")])
            .await
            .unwrap();
        let mut deliveries = store.connect("g").await.unwrap();

        for expected_retry in 0..=2 {
            let delivery = deliveries.next().await.unwrap().unwrap();
            assert_eq!(delivery.retry_count, expected_retry);
            delivery.nack(NackAction::Retry, "boom").await.unwrap();
        }

        let parked = store.parked("g");
        assert_eq!(parked.len(), 1);
        assert!(parked[0].reason.contains("boom"));
        assert_eq!(store.outstanding("g"), 0);
    }

    #[tokio::test]
    async fn retried_event_is_delivered_before_the_rest_of_its_stream() {
        let store = InMemoryEventStore::new();
        store.ensure_group("g", &StreamFilter::All).await.unwrap();
        store
            .append(accommodation("A1"), ExpectedSequence::Any, vec![raw("joined"), raw("left")])
            .await
            .unwrap();
        let mut deliveries = store.connect("g").await.unwrap();

        let first = deliveries.next().await.unwrap().unwrap();
        assert_eq!(first.event.sequence, Sequence::FIRST);
        first.nack(NackAction::Retry, "busy").await.unwrap();

        let again = deliveries.next().await.unwrap().unwrap();
        assert_eq!(again.event.sequence, Sequence::FIRST);
        assert_eq!(again.retry_count, 1);
        again.ack().await.unwrap();

        let second = deliveries.next().await.unwrap().unwrap();
        assert_eq!(second.event.sequence, Sequence::new(1));
        second.ack().await.unwrap();
    }

    #[tokio::test]
    async fn category_filter_skips_other_streams() {
        let store = InMemoryEventStore::new();
        store
            .ensure_group("g", &StreamFilter::Category("accommodation".into()))
            .await
            .unwrap();
        store
            .append(StreamId::new("user-1"), ExpectedSequence::Any, vec![raw("x")])
            .await
            .unwrap();
        assert_eq!(store.outstanding("g"), 0);
    }

    #[tokio::test]
    async fn dropped_connection_redelivers_unsettled_event() {
        let store = InMemoryEventStore::new();
        store.ensure_group("g", &StreamFilter::All).await.unwrap();
        store
            .append(accommodation("A1"), ExpectedSequence::Any, vec![raw("x")])
            .await
            .unwrap();

        let mut deliveries = store.connect("g").await.unwrap();
        let unsettled = deliveries.next().await.unwrap().unwrap();
        store.drop_connections("g");
        assert!(matches!(
            deliveries.next().await,
            Some(Err(SubscriptionError::Dropped(_)))
        ));
        assert!(deliveries.next().await.is_none());
        drop(unsettled);

        let mut reconnected = store.connect("g").await.unwrap();
        let again = tokio::time::timeout(Duration::from_secs(1), reconnected.next())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(again.event.sequence, Sequence::FIRST);
        again.ack().await.unwrap();
        assert!(store.wait_until_settled("g", Duration::from_secs(1)).await);
    }

    #[tokio::test]
    async fn injected_connect_failure_is_transport_error() {
        let store = InMemoryEventStore::new();
        store.ensure_group("g", &StreamFilter::All).await.unwrap();
        store.fail_next_connects(1);
        assert!(matches!(
            store.connect("g").await,
            Err(SubscriptionError::Transport(_))
        ));
        assert!(store.connect("g").await.is_ok());
    }
}
