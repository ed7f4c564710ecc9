//! Message channel abstraction for command/reply exchange between services.
//!
//! This module provides the [`MessageChannel`] trait, the publish/subscribe primitive
//! that the saga orchestrator and its participants talk through. Messages are published
//! on named subjects and consumed by queue groups with competing-consumer semantics.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────┐  command subject  ┌──────────────────────────┐
//! │ Orchestrator │ ────────────────► │ queue group "reservations"│
//! │              │                   │  ┌────────┐  ┌────────┐   │
//! │              │                   │  │ inst 1 │  │ inst 2 │   │  one of them
//! │              │                   │  └────────┘  └────────┘   │  gets each message
//! │              │  reply subject    └──────────┬───────────────┘
//! │              │ ◄──────────────────────────── ┘
//! └──────────────┘
//! ```
//!
//! # Key Principles
//!
//! - **Competing consumers**: within one queue group each message reaches exactly one member
//! - **Fan-out across groups**: every distinct queue group receives its own copy
//! - **Transport errors are retryable**: the caller decides whether and when to retry
//! - **Subscribe failures are fatal**: a service must not run with an unregistered handler
//!
//! # Wire Format
//!
//! Payloads are JSON documents (see [`ChannelMessage::json`]); the channel itself only
//! moves bytes and never interprets them.
//!
//! # Settlement
//!
//! A received message carries a [`Receipt`]. Subscribers call [`ChannelMessage::ack`]
//! once the message is handled and [`ChannelMessage::nack`] when it should come again.
//! Buses that track consumer positions only move past acked messages.
//!
//! # Implementations
//!
//! - `InMemoryChannel` in `stayflow-testing` - for tests (queue groups, failure injection)
//! - `RedpandaChannel` in `stayflow-redpanda` - for production (Kafka-compatible)

use futures::Stream;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use thiserror::Error;

/// Errors that can occur during message channel operations.
#[derive(Error, Debug, Clone)]
pub enum ChannelError {
    /// Failed to reach the underlying bus
    #[error("Transport error: {0}")]
    Transport(String),

    /// Failed to publish a message to a subject
    #[error("Publish failed for subject '{subject}': {reason}")]
    PublishFailed {
        /// The subject that failed
        subject: String,
        /// The reason for failure
        reason: String,
    },

    /// Failed to register a subscription
    #[error("Subscription failed for subject '{subject}' (group '{group}'): {reason}")]
    SubscriptionFailed {
        /// The subject that failed to subscribe
        subject: String,
        /// The queue group of the subscriber
        group: String,
        /// The reason for failure
        reason: String,
    },

    /// Message payload could not be encoded
    #[error("Serialization failed: {0}")]
    Serialization(String),

    /// Message payload could not be decoded
    #[error("Deserialization failed: {0}")]
    Deserialization(String),

    /// Subject name is empty or otherwise unusable
    #[error("Invalid subject: {0}")]
    InvalidSubject(String),
}

impl ChannelError {
    /// Whether retrying the same operation later may succeed.
    ///
    /// Transport and publish failures are infrastructure problems; encoding
    /// problems and invalid subjects will fail the same way every time.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Transport(_) | Self::PublishFailed { .. } | Self::SubscriptionFailed { .. }
        )
    }
}

/// How a subscriber finished with a received message.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Settlement {
    /// Handled; the bus may commit past it
    Ack,
    /// Not handled; the bus should deliver it again
    Nack,
}

/// Bus-side hook that settles one received message.
///
/// Implementations only honor the first settlement of a message.
pub trait MessageAcknowledger: Send + Sync {
    /// Record how the subscriber finished with the message.
    fn settle(&self, settlement: Settlement);
}

/// Settlement handle carried by a received message.
///
/// Messages built locally carry an empty receipt; settling it does nothing.
#[derive(Clone, Default)]
pub struct Receipt(Option<Arc<dyn MessageAcknowledger>>);

impl Receipt {
    /// Wrap a bus-side acknowledger.
    #[must_use]
    pub fn new(acknowledger: Arc<dyn MessageAcknowledger>) -> Self {
        Self(Some(acknowledger))
    }

    fn settle(&self, settlement: Settlement) {
        if let Some(acknowledger) = &self.0 {
            acknowledger.settle(settlement);
        }
    }
}

impl fmt::Debug for Receipt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Receipt").field(&self.0.is_some()).finish()
    }
}

/// A message as it travels over the channel.
///
/// Equality compares subject and payload only.
#[derive(Clone, Debug)]
pub struct ChannelMessage {
    /// Subject the message was published on
    pub subject: String,
    /// Encoded payload (JSON)
    pub payload: Vec<u8>,
    receipt: Receipt,
}

impl PartialEq for ChannelMessage {
    fn eq(&self, other: &Self) -> bool {
        self.subject == other.subject && self.payload == other.payload
    }
}

impl Eq for ChannelMessage {}

impl ChannelMessage {
    /// Create a message from raw bytes.
    #[must_use]
    pub fn new(subject: impl Into<String>, payload: Vec<u8>) -> Self {
        Self {
            subject: subject.into(),
            payload,
            receipt: Receipt::default(),
        }
    }

    /// Attach the bus-side receipt of a received message.
    #[must_use]
    pub fn with_receipt(mut self, receipt: Receipt) -> Self {
        self.receipt = receipt;
        self
    }

    /// Tell the bus the message was handled.
    pub fn ack(&self) {
        self.receipt.settle(Settlement::Ack);
    }

    /// Tell the bus the message should be delivered again.
    pub fn nack(&self) {
        self.receipt.settle(Settlement::Nack);
    }

    /// Encode a value as a JSON message.
    ///
    /// # Errors
    ///
    /// Returns [`ChannelError::Serialization`] if the value cannot be encoded.
    pub fn json<T: Serialize>(subject: impl Into<String>, value: &T) -> Result<Self, ChannelError> {
        let payload =
            serde_json::to_vec(value).map_err(|e| ChannelError::Serialization(e.to_string()))?;
        Ok(Self::new(subject, payload))
    }

    /// Decode the JSON payload into a typed value.
    ///
    /// # Errors
    ///
    /// Returns [`ChannelError::Deserialization`] if the payload is not valid for `T`.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, ChannelError> {
        serde_json::from_slice(&self.payload)
            .map_err(|e| ChannelError::Deserialization(e.to_string()))
    }
}

/// Stream of messages delivered to one subscriber.
pub type MessageStream = Pin<Box<dyn Stream<Item = Result<ChannelMessage, ChannelError>> + Send>>;

/// Trait for message channel implementations.
///
/// # Thread Safety
///
/// Implementations are shared across handler tasks (`Arc<dyn MessageChannel>`), so they
/// must be `Send + Sync`. Messages from one subscription may be processed concurrently
/// by the caller; the channel gives no single-threaded guarantee.
///
/// # Dyn Compatibility
///
/// This trait uses explicit `Pin<Box<dyn Future>>` returns instead of `async fn`
/// so that saga handlers can hold it as a trait object.
pub trait MessageChannel: Send + Sync {
    /// Publish a message.
    ///
    /// # Errors
    ///
    /// Returns [`ChannelError::PublishFailed`] or [`ChannelError::Transport`] if the bus
    /// does not accept the message.
    fn publish(
        &self,
        message: ChannelMessage,
    ) -> Pin<Box<dyn Future<Output = Result<(), ChannelError>> + Send + '_>>;

    /// Subscribe to a subject as a member of `queue_group`.
    ///
    /// All subscribers sharing a queue group split the messages of the subject between
    /// them; distinct groups each receive every message.
    ///
    /// # Errors
    ///
    /// Returns [`ChannelError::SubscriptionFailed`] if the subscription cannot be
    /// registered. Callers treat this as fatal at start-up.
    fn subscribe(
        &self,
        subject: &str,
        queue_group: &str,
    ) -> Pin<Box<dyn Future<Output = Result<MessageStream, ChannelError>> + Send + '_>>;
}

/// Validate a subject name before it reaches the bus.
///
/// # Errors
///
/// Returns [`ChannelError::InvalidSubject`] for empty or whitespace-containing names.
pub fn validate_subject(subject: &str) -> Result<(), ChannelError> {
    if subject.is_empty() || subject.chars().any(char::is_whitespace) {
        return Err(ChannelError::InvalidSubject(subject.to_string()));
    }
    Ok(())
}
