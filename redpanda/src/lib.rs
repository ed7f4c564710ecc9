//! Redpanda message channel for Stayflow.
//!
//! This crate provides the production [`MessageChannel`] used by the saga services.
//! It uses rdkafka, so any Kafka-compatible broker works (Redpanda, Apache Kafka, MSK).
//!
//! # Mapping
//!
//! | channel concept | Kafka concept |
//! |---|---|
//! | subject | topic |
//! | queue group | consumer group (`group.id`) |
//! | competing consumers | partitions split across the group's members |
//!
//! # Delivery Semantics
//!
//! **At-least-once** with manual offset commits:
//! - a message's offset is committed once the subscriber acks it
//! - a nacked message is delivered again after a backoff from the redelivery
//!   [`RetryPolicy`]; once the policy is exhausted it is logged and committed
//! - the next message of a subscription waits until the current one is settled
//! - if the process crashes before the commit, the message is redelivered
//! - handlers must be idempotent (the participant deduplicates by command id)
//!
//! New consumer groups start from the earliest offset by default, so a command
//! published before its participant first subscribed is not lost.
//!
//! # Example
//!
//! ```no_run
//! use stayflow_redpanda::RedpandaChannel;
//! use stayflow_core::channel::{ChannelMessage, MessageChannel};
//! use futures::StreamExt;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let channel = RedpandaChannel::new("localhost:9092")?;
//!
//! channel
//!     .publish(ChannelMessage::new("create-accommodation.command", b"{}".to_vec()))
//!     .await?;
//!
//! let mut inbox = channel
//!     .subscribe("create-accommodation.command", "reservations-service")
//!     .await?;
//! while let Some(message) = inbox.next().await {
//!     println!("received {} bytes", message?.payload.len());
//! }
//! # Ok(())
//! # }
//! ```

use rdkafka::config::ClientConfig;
use rdkafka::consumer::{Consumer, StreamConsumer};
use rdkafka::message::{BorrowedMessage, Message};
use rdkafka::producer::{FutureProducer, FutureRecord};
use rdkafka::util::Timeout;
use stayflow_core::channel::{
    ChannelError, ChannelMessage, MessageAcknowledger, MessageChannel, MessageStream, Receipt,
    Settlement, validate_subject,
};
use stayflow_runtime::retry::RetryPolicy;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::oneshot;

/// Redpanda-backed [`MessageChannel`].
///
/// One producer is shared by all publishes; every `subscribe` call creates its own
/// consumer, owned by a background task that forwards messages into the returned
/// stream.
///
/// # Example
///
/// ```no_run
/// use stayflow_redpanda::RedpandaChannel;
/// use std::time::Duration;
///
/// # fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let channel = RedpandaChannel::builder()
///     .brokers("localhost:9092,localhost:9093")
///     .producer_acks("all")
///     .timeout(Duration::from_secs(10))
///     .build()?;
/// # Ok(())
/// # }
/// ```
pub struct RedpandaChannel {
    /// Kafka producer for publishing messages
    producer: FutureProducer,
    /// Broker addresses (for creating consumers)
    brokers: String,
    /// Producer timeout
    timeout: Duration,
    /// Message buffer size per subscriber
    buffer_size: usize,
    /// Auto offset reset policy for new consumer groups
    auto_offset_reset: String,
    /// Backoff between redeliveries of a nacked message
    redelivery: RetryPolicy,
}

impl RedpandaChannel {
    /// Create a channel with default configuration.
    ///
    /// # Errors
    ///
    /// Returns [`ChannelError::Transport`] if the producer cannot be created.
    pub fn new(brokers: &str) -> Result<Self, ChannelError> {
        Self::builder().brokers(brokers).build()
    }

    /// Create a new builder for configuring the channel.
    #[must_use]
    pub fn builder() -> RedpandaChannelBuilder {
        RedpandaChannelBuilder::default()
    }

    /// Get a reference to the brokers string.
    #[must_use]
    pub fn brokers(&self) -> &str {
        &self.brokers
    }
}

/// Builder for configuring a [`RedpandaChannel`].
#[derive(Default)]
pub struct RedpandaChannelBuilder {
    brokers: Option<String>,
    producer_acks: Option<String>,
    compression: Option<String>,
    timeout: Option<Duration>,
    buffer_size: Option<usize>,
    auto_offset_reset: Option<String>,
    redelivery: Option<RetryPolicy>,
}

impl RedpandaChannelBuilder {
    /// Set the broker addresses (comma-separated, e.g. `"localhost:9092"`).
    #[must_use]
    pub fn brokers(mut self, brokers: impl Into<String>) -> Self {
        self.brokers = Some(brokers.into());
        self
    }

    /// Set the producer acknowledgment mode: `"0"`, `"1"` or `"all"`.
    ///
    /// Default: `"all"`
    #[must_use]
    pub fn producer_acks(mut self, acks: impl Into<String>) -> Self {
        self.producer_acks = Some(acks.into());
        self
    }

    /// Set the compression codec: `"none"`, `"gzip"`, `"snappy"`, `"lz4"`, `"zstd"`.
    ///
    /// Default: `"none"`
    #[must_use]
    pub fn compression(mut self, compression: impl Into<String>) -> Self {
        self.compression = Some(compression.into());
        self
    }

    /// Set the producer send timeout.
    ///
    /// Default: 5 seconds
    #[must_use]
    pub const fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Set how many messages may wait between the consumer and the subscriber.
    ///
    /// Values below 1 are raised to 1. Default: 1000
    #[must_use]
    pub fn buffer_size(mut self, buffer_size: usize) -> Self {
        self.buffer_size = Some(buffer_size.max(1));
        self
    }

    /// Set where new consumer groups start reading: `"earliest"` or `"latest"`.
    ///
    /// Default: `"earliest"`
    #[must_use]
    pub fn auto_offset_reset(mut self, policy: impl Into<String>) -> Self {
        self.auto_offset_reset = Some(policy.into());
        self
    }

    /// Set how nacked messages are redelivered.
    ///
    /// Default: 5 redeliveries, 500ms doubling up to 30 seconds, 20% jitter
    #[must_use]
    pub fn redelivery(mut self, policy: RetryPolicy) -> Self {
        self.redelivery = Some(policy);
        self
    }

    /// Build the [`RedpandaChannel`].
    ///
    /// # Errors
    ///
    /// Returns [`ChannelError::Transport`] if brokers are not set or the producer
    /// cannot be created.
    pub fn build(self) -> Result<RedpandaChannel, ChannelError> {
        let brokers = self
            .brokers
            .ok_or_else(|| ChannelError::Transport("Brokers not configured".to_string()))?;
        let acks = self.producer_acks.as_deref().unwrap_or("all");
        let compression = self.compression.as_deref().unwrap_or("none");

        let producer: FutureProducer = ClientConfig::new()
            .set("bootstrap.servers", &brokers)
            .set("message.timeout.ms", "5000")
            .set("acks", acks)
            .set("compression.type", compression)
            .create()
            .map_err(|e| ChannelError::Transport(format!("Failed to create producer: {e}")))?;

        let buffer_size = self.buffer_size.unwrap_or(1000);
        let auto_offset_reset = self
            .auto_offset_reset
            .unwrap_or_else(|| "earliest".to_string());

        tracing::info!(
            brokers = %brokers,
            acks,
            compression,
            buffer_size,
            auto_offset_reset = %auto_offset_reset,
            "RedpandaChannel created"
        );

        Ok(RedpandaChannel {
            producer,
            brokers,
            timeout: self.timeout.unwrap_or(Duration::from_secs(5)),
            buffer_size,
            auto_offset_reset,
            redelivery: self.redelivery.unwrap_or_else(default_redelivery),
        })
    }
}

fn default_redelivery() -> RetryPolicy {
    RetryPolicy::builder()
        .max_retries(5)
        .initial_delay(Duration::from_millis(500))
        .max_delay(Duration::from_secs(30))
        .build()
}

/// Hands the subscriber's settlement back to the consumer task.
struct OffsetReceipt(Mutex<Option<oneshot::Sender<Settlement>>>);

impl OffsetReceipt {
    fn new(sender: oneshot::Sender<Settlement>) -> Self {
        Self(Mutex::new(Some(sender)))
    }
}

impl MessageAcknowledger for OffsetReceipt {
    fn settle(&self, settlement: Settlement) {
        let sender = self.0.lock().ok().and_then(|mut slot| slot.take());
        if let Some(sender) = sender {
            let _ = sender.send(settlement);
        }
    }
}

fn commit(
    consumer: &StreamConsumer,
    message: &BorrowedMessage<'_>,
    mode: rdkafka::consumer::CommitMode,
) {
    if let Err(e) = consumer.commit_message(message, mode) {
        tracing::warn!(
            topic = message.topic(),
            partition = message.partition(),
            offset = message.offset(),
            error = %e,
            "Failed to commit offset (message may be redelivered)"
        );
    }
}

impl MessageChannel for RedpandaChannel {
    fn publish(
        &self,
        message: ChannelMessage,
    ) -> Pin<Box<dyn Future<Output = Result<(), ChannelError>> + Send + '_>> {
        let timeout = self.timeout;

        Box::pin(async move {
            validate_subject(&message.subject)?;

            let record: FutureRecord<'_, (), Vec<u8>> =
                FutureRecord::to(&message.subject).payload(&message.payload);

            match self.producer.send(record, Timeout::After(timeout)).await {
                Ok((partition, offset)) => {
                    tracing::debug!(
                        subject = %message.subject,
                        partition,
                        offset,
                        bytes = message.payload.len(),
                        "Message published"
                    );
                    metrics::counter!("channel.published", "subject" => message.subject.clone())
                        .increment(1);
                    Ok(())
                },
                Err((kafka_error, _)) => {
                    tracing::error!(
                        subject = %message.subject,
                        error = %kafka_error,
                        "Failed to publish message"
                    );
                    metrics::counter!("channel.publish_failed", "subject" => message.subject.clone())
                        .increment(1);
                    Err(ChannelError::PublishFailed {
                        subject: message.subject,
                        reason: kafka_error.to_string(),
                    })
                },
            }
        })
    }

    fn subscribe(
        &self,
        subject: &str,
        queue_group: &str,
    ) -> Pin<Box<dyn Future<Output = Result<MessageStream, ChannelError>> + Send + '_>> {
        let subject = subject.to_string();
        let queue_group = queue_group.to_string();
        let brokers = self.brokers.clone();
        let buffer_size = self.buffer_size;
        let auto_offset_reset = self.auto_offset_reset.clone();
        let redelivery = self.redelivery.clone();

        Box::pin(async move {
            validate_subject(&subject)?;
            let subscription_failed = |reason: String| ChannelError::SubscriptionFailed {
                subject: subject.clone(),
                group: queue_group.clone(),
                reason,
            };

            let consumer: StreamConsumer = ClientConfig::new()
                .set("bootstrap.servers", &brokers)
                .set("group.id", &queue_group)
                .set("enable.auto.commit", "false")
                .set("auto.offset.reset", &auto_offset_reset)
                .set("session.timeout.ms", "6000")
                .set("enable.partition.eof", "false")
                .create()
                .map_err(|e| subscription_failed(format!("Failed to create consumer: {e}")))?;

            consumer
                .subscribe(&[subject.as_str()])
                .map_err(|e| subscription_failed(format!("Failed to subscribe: {e}")))?;

            tracing::info!(
                subject = %subject,
                queue_group = %queue_group,
                buffer_size,
                auto_offset_reset = %auto_offset_reset,
                "Subscribed"
            );

            let (tx, mut rx) = tokio::sync::mpsc::channel(buffer_size);

            // The task owns the consumer; it stops once the subscriber drops the stream.
            tokio::spawn(async move {
                use futures::StreamExt;
                use rdkafka::consumer::CommitMode;

                let mut stream = consumer.stream();

                'consume: loop {
                    let received = tokio::select! {
                        received = stream.next() => received,
                        () = tx.closed() => break,
                    };
                    let Some(received) = received else {
                        break;
                    };
                    let message = match received {
                        Ok(message) => message,
                        Err(e) => {
                            let err =
                                ChannelError::Transport(format!("Failed to receive message: {e}"));
                            if tx.send(Err(err)).await.is_err() {
                                break;
                            }
                            continue;
                        },
                    };

                    let Some(payload) = message.payload() else {
                        let err =
                            ChannelError::Deserialization("Message has no payload".to_string());
                        if tx.send(Err(err)).await.is_err() {
                            break;
                        }
                        commit(&consumer, &message, CommitMode::Async);
                        continue;
                    };

                    let mut attempt = 0;
                    loop {
                        let (settle_tx, settle_rx) = oneshot::channel();
                        let item = ChannelMessage::new(message.topic(), payload.to_vec())
                            .with_receipt(Receipt::new(Arc::new(OffsetReceipt::new(settle_tx))));
                        if tx.send(Ok(item)).await.is_err() {
                            tracing::debug!("Subscriber dropped, exiting consumer task");
                            break 'consume;
                        }

                        match settle_rx.await {
                            Ok(Settlement::Ack) => {
                                commit(&consumer, &message, CommitMode::Async);
                                break;
                            },
                            Ok(Settlement::Nack) if attempt < redelivery.max_retries => {
                                let delay = redelivery.jittered_delay_for_attempt(attempt);
                                attempt += 1;
                                tracing::warn!(
                                    topic = message.topic(),
                                    partition = message.partition(),
                                    offset = message.offset(),
                                    attempt,
                                    delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                                    "Message nacked, redelivering"
                                );
                                metrics::counter!(
                                    "channel.redelivered",
                                    "subject" => message.topic().to_string()
                                )
                                .increment(1);
                                tokio::time::sleep(delay).await;
                            },
                            Ok(Settlement::Nack) => {
                                tracing::error!(
                                    topic = message.topic(),
                                    partition = message.partition(),
                                    offset = message.offset(),
                                    attempts = attempt + 1,
                                    "Message still nacked after redeliveries, moving past it"
                                );
                                metrics::counter!(
                                    "channel.abandoned",
                                    "subject" => message.topic().to_string()
                                )
                                .increment(1);
                                commit(&consumer, &message, CommitMode::Async);
                                break;
                            },
                            Err(_) => {
                                // Dropped unsettled: leave this offset to a later commit
                                tracing::debug!(
                                    topic = message.topic(),
                                    offset = message.offset(),
                                    "Message dropped without settlement"
                                );
                                break;
                            },
                        }
                    }
                }

                tracing::debug!("Consumer task exiting");
            });

            let stream = async_stream::stream! {
                while let Some(item) = rx.recv().await {
                    yield item;
                }
            };

            Ok(Box::pin(stream) as MessageStream)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn redpanda_channel_is_send_sync() {
        fn assert_send<T: Send>() {}
        fn assert_sync<T: Sync>() {}

        assert_send::<RedpandaChannel>();
        assert_sync::<RedpandaChannel>();
    }

    #[test]
    fn build_without_brokers_fails() {
        let result = RedpandaChannel::builder().build();
        assert!(matches!(result, Err(ChannelError::Transport(_))));
    }

    #[test]
    fn buffer_size_is_at_least_one() {
        let builder = RedpandaChannel::builder().buffer_size(0);
        assert_eq!(builder.buffer_size, Some(1));
    }

    #[tokio::test]
    async fn receipt_forwards_only_the_first_settlement() {
        let (tx, rx) = oneshot::channel();
        let receipt = OffsetReceipt::new(tx);

        receipt.settle(Settlement::Nack);
        receipt.settle(Settlement::Ack);

        assert_eq!(rx.await.ok(), Some(Settlement::Nack));
    }

    #[test]
    fn default_redelivery_is_bounded() {
        let policy = default_redelivery();
        assert_eq!(policy.max_retries, 5);
        assert!(policy.jittered_delay_for_attempt(10) <= Duration::from_secs(30));
    }
}
