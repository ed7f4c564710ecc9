//! `EventStreamConsumer`: feeds a persistent subscription into a projection.
//!
//! # Overview
//!
//! The consumer owns the lifecycle of one consumer group:
//! - Creates the group if needed and connects to it
//! - Decodes each delivery through the projection's decoder registry
//! - Applies it and settles the delivery with the broker
//! - Reconnects with jittered exponential backoff when the connection drops
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────┐
//! │ PersistentSubscription│ (Postgres / in-memory)
//! └──────────┬───────────┘
//!            │ Delivery
//!            ▼
//! ┌──────────────────────┐   decode   ┌─────────────────┐
//! │  EventStreamConsumer │ ─────────► │ DecoderRegistry │
//! └──────────┬───────────┘            └─────────────────┘
//!            │ apply_event
//!            ▼
//! ┌──────────────────────┐
//! │      Projection      │
//! └──────────────────────┘
//! ```
//!
//! # Settling deliveries
//!
//! | situation | action |
//! |---|---|
//! | applied (or duplicate / inconsistent) | ack |
//! | unknown type tag | warn, ack |
//! | payload does not decode | warn, park |
//! | projection error | nack with retry |
//!
//! # Example
//!
//! ```ignore
//! let (consumer, shutdown) = EventStreamConsumer::new(
//!     Arc::new(PostgresSubscription::new(pool)),
//!     AccommodationProjector::new(store),
//!     ActivityEvent::registry(),
//!     ConsumerConfig::new("metrics-query"),
//! );
//!
//! let task = tokio::spawn(consumer.run());
//! // ...
//! shutdown.send(true).ok();
//! task.await?;
//! ```

use futures::StreamExt;
use stayflow_core::event::{DecoderRegistry, EventError};
use stayflow_core::projection::{ApplyOutcome, Projection};
use stayflow_core::stream::StreamId;
use stayflow_core::subscription::{
    Delivery, DeliveryStream, NackAction, PersistentSubscription, StreamFilter, SubscriptionError,
};
use stayflow_runtime::retry::{Backoff, RetryPolicy};
use std::sync::Arc;
use tokio::sync::watch;

/// Consumer group settings.
#[derive(Debug, Clone)]
pub struct ConsumerConfig {
    /// Consumer group name
    pub group: String,
    /// Streams the group follows
    pub filter: StreamFilter,
    /// Reconnection backoff (`max_retries` is ignored: reconnection never gives up)
    pub reconnect: RetryPolicy,
}

impl ConsumerConfig {
    /// Group `group` over every accommodation stream, default reconnect policy.
    #[must_use]
    pub fn new(group: impl Into<String>) -> Self {
        Self {
            group: group.into(),
            filter: StreamFilter::Category(StreamId::ACCOMMODATION_CATEGORY.to_string()),
            reconnect: RetryPolicy::default(),
        }
    }

    /// Follow `filter` instead of the accommodation category.
    #[must_use]
    pub fn with_filter(mut self, filter: StreamFilter) -> Self {
        self.filter = filter;
        self
    }

    /// Use `policy` for reconnection delays.
    #[must_use]
    pub fn with_reconnect_policy(mut self, policy: RetryPolicy) -> Self {
        self.reconnect = policy;
        self
    }
}

/// How a connection ended.
enum Disconnect {
    Shutdown,
    Dropped(String),
}

/// Runs a projection off a persistent subscription.
///
/// One consumer per group per process; it is the only writer of its projection.
pub struct EventStreamConsumer<P>
where
    P: Projection,
{
    subscription: Arc<dyn PersistentSubscription>,
    projection: Arc<P>,
    registry: DecoderRegistry<P::Event>,
    config: ConsumerConfig,
    shutdown: watch::Receiver<bool>,
}

impl<P> EventStreamConsumer<P>
where
    P: Projection,
{
    /// Create a consumer.
    ///
    /// Returns the consumer and a shutdown sender. Send `true` (or drop the sender) to
    /// make [`run`](Self::run) return.
    #[must_use]
    pub fn new(
        subscription: Arc<dyn PersistentSubscription>,
        projection: P,
        registry: DecoderRegistry<P::Event>,
        config: ConsumerConfig,
    ) -> (Self, watch::Sender<bool>) {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let consumer = Self {
            subscription,
            projection: Arc::new(projection),
            registry,
            config,
            shutdown: shutdown_rx,
        };

        (consumer, shutdown_tx)
    }

    /// The projection being fed.
    #[must_use]
    pub fn projection(&self) -> Arc<P> {
        Arc::clone(&self.projection)
    }

    /// Consume until shutdown is signalled.
    ///
    /// Every (re)connection calls `ensure_group` first, so a group deleted behind the
    /// consumer's back is recreated. Failed connections and dropped streams are retried
    /// forever with the configured backoff; the delay sequence restarts after each
    /// successful connect.
    pub async fn run(self) {
        let projection_name = self.projection.name().to_string();
        let group = self.config.group.clone();
        let mut shutdown = self.shutdown.clone();
        let mut backoff = Backoff::new(self.config.reconnect.clone());

        tracing::info!(
            projection = %projection_name,
            group = %group,
            filter = %self.config.filter,
            "Starting event stream consumer"
        );

        loop {
            if *shutdown.borrow() {
                break;
            }

            match self.open().await {
                Ok(deliveries) => {
                    backoff.reset();
                    tracing::info!(group = %group, "Consumer connected");

                    match self.drain(deliveries, &mut shutdown).await {
                        Disconnect::Shutdown => break,
                        Disconnect::Dropped(reason) => {
                            tracing::warn!(group = %group, reason = %reason, "Subscription dropped");
                        },
                    }
                },
                Err(error) => {
                    tracing::warn!(group = %group, error = %error, "Failed to connect to subscription");
                },
            }

            let delay = backoff.next_delay();
            metrics::counter!("consumer.reconnects", "group" => group.clone()).increment(1);
            tracing::info!(
                group = %group,
                attempt = backoff.attempts(),
                delay_ms = delay.as_millis(),
                "Reconnecting"
            );

            tokio::select! {
                () = tokio::time::sleep(delay) => {},
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                },
            }
        }

        tracing::info!(projection = %projection_name, group = %group, "Event stream consumer stopped");
    }

    async fn open(&self) -> Result<DeliveryStream, SubscriptionError> {
        let status = self
            .subscription
            .ensure_group(&self.config.group, &self.config.filter)
            .await?;
        tracing::debug!(group = %self.config.group, ?status, "Consumer group ensured");

        self.subscription.connect(&self.config.group).await
    }

    async fn drain(
        &self,
        mut deliveries: DeliveryStream,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Disconnect {
        loop {
            tokio::select! {
                item = deliveries.next() => match item {
                    Some(Ok(delivery)) => self.handle(delivery).await,
                    Some(Err(error)) => return Disconnect::Dropped(error.to_string()),
                    None => return Disconnect::Dropped("stream ended".to_string()),
                },
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        tracing::info!(group = %self.config.group, "Shutdown signal received");
                        return Disconnect::Shutdown;
                    }
                },
            }
        }
    }

    /// Decode, apply and settle one delivery.
    async fn handle(&self, delivery: Delivery) {
        let group = self.config.group.as_str();
        let event_type = delivery.event.event_type().to_string();
        let stream_id = delivery.event.stream_id.clone();
        let sequence = delivery.event.sequence;

        let event = match self.registry.decode(&event_type, &delivery.event.event.data) {
            Ok(event) => event,
            Err(EventError::UnknownType(_)) => {
                tracing::warn!(
                    group,
                    stream_id = %stream_id,
                    sequence = %sequence,
                    event_type = %event_type,
                    "Skipping event with unknown type"
                );
                metrics::counter!("projection.skipped", "reason" => "unknown_type").increment(1);
                Self::settle(delivery.ack().await, group);
                return;
            },
            Err(error) => {
                tracing::warn!(
                    group,
                    stream_id = %stream_id,
                    sequence = %sequence,
                    event_type = %event_type,
                    error = %error,
                    "Parking event that does not decode"
                );
                metrics::counter!("projection.skipped", "reason" => "undecodable").increment(1);
                Self::settle(
                    delivery.nack(NackAction::Park, &error.to_string()).await,
                    group,
                );
                return;
            },
        };

        match self.projection.apply_event(sequence, &event).await {
            Ok(outcome) => {
                tracing::debug!(
                    group,
                    stream_id = %stream_id,
                    sequence = %sequence,
                    event_type = %event_type,
                    ?outcome,
                    "Event projected"
                );
                let label = match outcome {
                    ApplyOutcome::Applied => "applied",
                    ApplyOutcome::Duplicate => "duplicate",
                    ApplyOutcome::Inconsistent => "inconsistent",
                };
                metrics::counter!("projection.events", "outcome" => label).increment(1);
                Self::settle(delivery.ack().await, group);
            },
            Err(error) => {
                tracing::error!(
                    group,
                    stream_id = %stream_id,
                    sequence = %sequence,
                    retry_count = delivery.retry_count,
                    error = %error,
                    "Projection failed, asking for redelivery"
                );
                metrics::counter!("projection.failed").increment(1);
                Self::settle(
                    delivery.nack(NackAction::Retry, &error.to_string()).await,
                    group,
                );
            },
        }
    }

    fn settle(result: Result<(), SubscriptionError>, group: &str) {
        // The broker redelivers anything left unsettled
        if let Err(error) = result {
            tracing::warn!(group, error = %error, "Failed to settle delivery");
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::{AccommodationProjector, AccommodationStore};
    use stayflow_core::activity::ActivityEvent;
    use stayflow_core::event::SerializedEvent;
    use stayflow_core::event_store::EventStore;
    use stayflow_core::stream::ExpectedSequence;
    use stayflow_core::subscription::PersistentSubscription as _;
    use stayflow_testing::{InMemoryEventStore, fixtures};
    use std::time::Duration;

    fn fast_config() -> ConsumerConfig {
        ConsumerConfig::new("metrics-query").with_reconnect_policy(
            RetryPolicy::builder()
                .initial_delay(Duration::from_millis(5))
                .max_delay(Duration::from_millis(20))
                .build(),
        )
    }

    async fn append(store: &InMemoryEventStore, event: &ActivityEvent) {
        store
            .append(event.stream_id(), ExpectedSequence::Any, vec![event.to_serialized(None).unwrap()])
            .await
            .unwrap();
    }

    async fn start(
        events: &InMemoryEventStore,
        projections: &AccommodationStore,
    ) -> (tokio::task::JoinHandle<()>, watch::Sender<bool>) {
        let config = fast_config();
        // Created up front so `wait_until_settled` sees the group's backlog
        events.ensure_group(&config.group, &config.filter).await.unwrap();

        let (consumer, shutdown) = EventStreamConsumer::new(
            Arc::new(events.clone()),
            AccommodationProjector::new(projections.clone()),
            ActivityEvent::registry(),
            config,
        );
        (tokio::spawn(consumer.run()), shutdown)
    }

    #[tokio::test]
    async fn projects_the_viewing_session() {
        let events = InMemoryEventStore::new();
        let projections = AccommodationStore::new();
        append(&events, &fixtures::joined("u1", "A1", "S1", "2024-01-01 10:00")).await;
        append(&events, &fixtures::left("u1", "A1", "S1", "2024-01-01 10:30")).await;

        let (task, shutdown) = start(&events, &projections).await;
        assert!(events.wait_until_settled("metrics-query", Duration::from_secs(2)).await);

        let projection = projections.read("A1").await.unwrap();
        assert_eq!(projection.number_of_visits, 1);
        assert!((projection.on_screen_time - 30.0).abs() < f64::EPSILON);

        shutdown.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .expect("consumer stops on shutdown")
            .unwrap();
    }

    #[tokio::test]
    async fn unknown_types_are_acked_and_garbage_is_parked() {
        let events = InMemoryEventStore::new();
        let projections = AccommodationStore::new();
        let stream = StreamId::for_accommodation("A1");
        events
            .append(
                stream.clone(),
                ExpectedSequence::Any,
                vec![
                    SerializedEvent::new("UserShared".to_string(), vec![1, 2, 3], None),
                    SerializedEvent::new("UserRated".to_string(), vec![0xff], None),
                ],
            )
            .await
            .unwrap();
        append(&events, &fixtures::rated("u1", "A1", "2024-01-01 10:00")).await;

        let (task, shutdown) = start(&events, &projections).await;
        assert!(events.wait_until_settled("metrics-query", Duration::from_secs(2)).await);

        let parked = events.parked("metrics-query");
        assert_eq!(parked.len(), 1);
        assert_eq!(parked[0].event.event_type(), "UserRated");
        assert_eq!(events.acked_count("metrics-query"), 2);
        assert_eq!(projections.read("A1").await.unwrap().number_of_ratings, 1);

        shutdown.send(true).unwrap();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn reconnects_after_drop_and_resumes() {
        let events = InMemoryEventStore::new();
        let projections = AccommodationStore::new();
        append(&events, &fixtures::reserved("u1", "A1", "2024-01-01 10:00")).await;

        let (task, shutdown) = start(&events, &projections).await;
        assert!(events.wait_until_settled("metrics-query", Duration::from_secs(2)).await);

        events.fail_next_connects(2);
        events.drop_connections("metrics-query");
        append(&events, &fixtures::reserved("u2", "A1", "2024-01-01 11:00")).await;

        assert!(events.wait_until_settled("metrics-query", Duration::from_secs(2)).await);
        assert_eq!(projections.read("A1").await.unwrap().number_of_reservations, 2);

        shutdown.send(true).unwrap();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn dropping_the_sender_stops_the_consumer() {
        let events = InMemoryEventStore::new();
        let (task, shutdown) = start(&events, &AccommodationStore::new()).await;

        drop(shutdown);

        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .expect("consumer stops when the sender is gone")
            .unwrap();
    }
}
