//! Persistent subscriptions: durable, broker-tracked consumption of the event log.
//!
//! A persistent subscription belongs to a named consumer group. The broker remembers
//! which events the group has acknowledged, so a consumer that restarts resumes where
//! the group left off. Delivery is at-least-once and ordered within one stream; there
//! is no ordering guarantee across streams.
//!
//! ```text
//!  event store ──► group "metrics-query" ──► Delivery ──► consumer
//!                     ▲                                     │
//!                     └──────────── ack / nack(retry) ◄─────┘
//! ```
//!
//! A negative acknowledgement with [`NackAction::Retry`] hands the event back to the
//! broker, which owns redelivery timing. After too many retries the broker parks the
//! event instead of redelivering it forever.

use crate::event_store::RecordedEvent;
use crate::stream::StreamId;
use futures::Stream;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use thiserror::Error;

/// Errors raised by persistent subscriptions.
#[derive(Error, Debug, Clone)]
pub enum SubscriptionError {
    /// The consumer group does not exist (call `ensure_group` first)
    #[error("Consumer group not found: {0}")]
    GroupNotFound(String),

    /// The live connection was lost; reconnect
    #[error("Subscription dropped: {0}")]
    Dropped(String),

    /// The broker could not be reached
    #[error("Transport error: {0}")]
    Transport(String),

    /// Acknowledgement could not be recorded
    #[error("Acknowledgement failed: {0}")]
    Acknowledgement(String),
}

/// Which streams a consumer group follows.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StreamFilter {
    /// Every stream in the store
    All,
    /// Streams of one category (`{category}-{id}`)
    Category(String),
}

impl StreamFilter {
    /// Whether events of `stream_id` belong to this filter.
    #[must_use]
    pub fn accepts(&self, stream_id: &StreamId) -> bool {
        match self {
            Self::All => true,
            Self::Category(category) => stream_id.category() == category,
        }
    }

    /// SQL `LIKE` pattern matching the filter's stream names.
    #[must_use]
    pub fn like_pattern(&self) -> String {
        match self {
            Self::All => "%".to_string(),
            Self::Category(category) => format!("{category}-%"),
        }
    }
}

impl fmt::Display for StreamFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::All => write!(f, "$all"),
            Self::Category(category) => write!(f, "$ce-{category}"),
        }
    }
}

/// Outcome of `ensure_group`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum GroupStatus {
    /// The group was created by this call
    Created,
    /// The group already existed (not an error)
    AlreadyExists,
}

/// What the broker should do with a negatively acknowledged event.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NackAction {
    /// Redeliver later
    Retry,
    /// Move aside for manual inspection; do not redeliver
    Park,
    /// Drop it; the group will not see it again
    Skip,
}

/// Broker-side handle that settles one delivery.
///
/// Implemented by each subscription backend.
pub trait Acknowledger: Send + Sync {
    /// Mark `event` as processed for the group.
    fn ack<'a>(
        &'a self,
        event: &'a RecordedEvent,
    ) -> Pin<Box<dyn Future<Output = Result<(), SubscriptionError>> + Send + 'a>>;

    /// Hand `event` back to the broker.
    fn nack<'a>(
        &'a self,
        event: &'a RecordedEvent,
        action: NackAction,
        reason: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<(), SubscriptionError>> + Send + 'a>>;
}

/// One event delivered to a consumer group, together with its ack/nack callback.
pub struct Delivery {
    /// The delivered event
    pub event: RecordedEvent,
    /// How many times this event was delivered to the group before
    pub retry_count: u32,
    acker: Box<dyn Acknowledger>,
}

impl Delivery {
    /// Create a delivery settled through `acker`.
    #[must_use]
    pub fn new(event: RecordedEvent, retry_count: u32, acker: Box<dyn Acknowledger>) -> Self {
        Self {
            event,
            retry_count,
            acker,
        }
    }

    /// Acknowledge: the event leaves the redelivery queue.
    ///
    /// # Errors
    ///
    /// Returns [`SubscriptionError::Acknowledgement`] if the broker rejects it.
    pub async fn ack(self) -> Result<(), SubscriptionError> {
        self.acker.ack(&self.event).await
    }

    /// Negatively acknowledge with the given directive.
    ///
    /// # Errors
    ///
    /// Returns [`SubscriptionError::Acknowledgement`] if the broker rejects it.
    pub async fn nack(self, action: NackAction, reason: &str) -> Result<(), SubscriptionError> {
        self.acker.nack(&self.event, action, reason).await
    }
}

impl fmt::Debug for Delivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Delivery")
            .field("stream_id", &self.event.stream_id)
            .field("sequence", &self.event.sequence)
            .field("event_type", &self.event.event.event_type)
            .field("retry_count", &self.retry_count)
            .finish_non_exhaustive()
    }
}

/// Live connection of one consumer to its group.
///
/// An `Err` item or the end of the stream means the connection dropped.
pub type DeliveryStream = Pin<Box<dyn Stream<Item = Result<Delivery, SubscriptionError>> + Send>>;

/// Persistent subscription backend.
///
/// # Dyn Compatibility
///
/// Explicit `Pin<Box<dyn Future>>` returns keep the trait usable as
/// `Arc<dyn PersistentSubscription>`.
pub trait PersistentSubscription: Send + Sync {
    /// Create the consumer group if it does not exist yet.
    ///
    /// Idempotent: an existing group is reported as [`GroupStatus::AlreadyExists`].
    ///
    /// # Errors
    ///
    /// Returns [`SubscriptionError::Transport`] if the broker is unreachable.
    fn ensure_group<'a>(
        &'a self,
        group: &'a str,
        filter: &'a StreamFilter,
    ) -> Pin<Box<dyn Future<Output = Result<GroupStatus, SubscriptionError>> + Send + 'a>>;

    /// Open a live connection to an existing group.
    ///
    /// # Errors
    ///
    /// - [`SubscriptionError::GroupNotFound`] if the group was never created
    /// - [`SubscriptionError::Transport`] if the broker is unreachable
    fn connect<'a>(
        &'a self,
        group: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<DeliveryStream, SubscriptionError>> + Send + 'a>>;
}
