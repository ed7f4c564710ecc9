//! In-memory message channel with queue-group semantics.
//!
//! Behaves like a NATS-style bus confined to one process:
//!
//! - every queue group subscribed to a subject receives each message once
//! - inside a group, members take turns (round robin)
//! - messages published on a subject nobody subscribed to are dropped
//!
//! Every publish is recorded so tests can assert on what went over the wire, and
//! failures can be injected for both publish and subscribe. Delivered messages carry a
//! receipt; acks and nacks are counted but a nacked message is not delivered again.

#![allow(clippy::unwrap_used)] // Test infrastructure uses unwrap for simplicity
#![allow(clippy::missing_panics_doc)] // Only panics on a poisoned lock

use stayflow_core::channel::{
    ChannelError, ChannelMessage, MessageAcknowledger, MessageChannel, MessageStream, Receipt,
    Settlement, validate_subject,
};
use serde::de::DeserializeOwned;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::sync::{Notify, mpsc};

type MemberSender = mpsc::UnboundedSender<Result<ChannelMessage, ChannelError>>;

#[derive(Default)]
struct QueueGroup {
    members: Vec<MemberSender>,
    next: usize,
}

impl QueueGroup {
    /// Hand the message to the next live member. Returns false if none is left.
    fn deliver(&mut self, message: &ChannelMessage, shared: &Weak<Shared>) -> bool {
        self.members.retain(|member| !member.is_closed());
        if self.members.is_empty() {
            return false;
        }
        let index = self.next % self.members.len();
        self.next = self.next.wrapping_add(1);
        let receipt = Receipt::new(Arc::new(Tally {
            shared: Weak::clone(shared),
            settled: AtomicBool::new(false),
        }));
        self.members[index]
            .send(Ok(message.clone().with_receipt(receipt)))
            .is_ok()
    }
}

/// Counts the first settlement of one delivered message.
struct Tally {
    shared: Weak<Shared>,
    settled: AtomicBool,
}

impl MessageAcknowledger for Tally {
    fn settle(&self, settlement: Settlement) {
        if self.settled.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(shared) = self.shared.upgrade() {
            let mut state = shared.state.lock().unwrap();
            match settlement {
                Settlement::Ack => state.acked += 1,
                Settlement::Nack => state.nacked += 1,
            }
        }
    }
}

#[derive(Default)]
struct ChannelState {
    /// subject → queue group → members
    subjects: HashMap<String, HashMap<String, QueueGroup>>,
    published: Vec<ChannelMessage>,
    failing_publishes: usize,
    failing_subscriptions: bool,
    acked: usize,
    nacked: usize,
}

#[derive(Default)]
struct Shared {
    state: Mutex<ChannelState>,
    published: Notify,
}

/// In-memory [`MessageChannel`] for tests.
///
/// Clones share the same bus.
///
/// # Example
///
/// ```
/// use stayflow_testing::InMemoryChannel;
/// use stayflow_core::channel::{ChannelMessage, MessageChannel};
/// use futures::StreamExt;
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let channel = InMemoryChannel::new();
/// let mut inbox = channel.subscribe("pings", "workers").await?;
///
/// channel.publish(ChannelMessage::new("pings", b"{}".to_vec())).await?;
///
/// let received = inbox.next().await.unwrap()?;
/// assert_eq!(received.subject, "pings");
/// assert_eq!(channel.published_on("pings").len(), 1);
/// # Ok(())
/// # }
/// ```
#[derive(Clone, Default)]
pub struct InMemoryChannel {
    shared: Arc<Shared>,
}

impl InMemoryChannel {
    /// Create an empty bus.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `count` publishes fail with a retryable error.
    pub fn fail_next_publishes(&self, count: usize) {
        self.shared.state.lock().unwrap().failing_publishes = count;
    }

    /// Make every subscribe call fail (or succeed again).
    pub fn fail_subscriptions(&self, failing: bool) {
        self.shared.state.lock().unwrap().failing_subscriptions = failing;
    }

    /// Every message accepted so far, in publish order.
    #[must_use]
    pub fn published(&self) -> Vec<ChannelMessage> {
        self.shared.state.lock().unwrap().published.clone()
    }

    /// Messages accepted on one subject, in publish order.
    #[must_use]
    pub fn published_on(&self, subject: &str) -> Vec<ChannelMessage> {
        self.shared
            .state
            .lock()
            .unwrap()
            .published
            .iter()
            .filter(|message| message.subject == subject)
            .cloned()
            .collect()
    }

    /// Decode every message on `subject` as JSON `T`.
    ///
    /// Panics if a payload does not decode; tests want to know.
    #[must_use]
    pub fn decoded_on<T: DeserializeOwned>(&self, subject: &str) -> Vec<T> {
        self.published_on(subject)
            .iter()
            .map(|message| message.decode().unwrap())
            .collect()
    }

    /// Delivered messages a subscriber acked.
    #[must_use]
    pub fn acked(&self) -> usize {
        self.shared.state.lock().unwrap().acked
    }

    /// Delivered messages a subscriber nacked.
    #[must_use]
    pub fn nacked(&self) -> usize {
        self.shared.state.lock().unwrap().nacked
    }

    /// Number of live members of a queue group.
    #[must_use]
    pub fn members(&self, subject: &str, queue_group: &str) -> usize {
        self.shared
            .state
            .lock()
            .unwrap()
            .subjects
            .get(subject)
            .and_then(|groups| groups.get(queue_group))
            .map_or(0, |group| {
                group.members.iter().filter(|member| !member.is_closed()).count()
            })
    }

    /// Wait until at least `count` messages were published on `subject`.
    ///
    /// Returns the messages, or whatever was published if `timeout` passed first.
    pub async fn wait_for(
        &self,
        subject: &str,
        count: usize,
        timeout: Duration,
    ) -> Vec<ChannelMessage> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let notified = self.shared.published.notified();
            let messages = self.published_on(subject);
            if messages.len() >= count {
                return messages;
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return self.published_on(subject);
            }
        }
    }
}

impl MessageChannel for InMemoryChannel {
    fn publish(
        &self,
        message: ChannelMessage,
    ) -> Pin<Box<dyn Future<Output = Result<(), ChannelError>> + Send + '_>> {
        Box::pin(async move {
            validate_subject(&message.subject)?;
            let weak = Arc::downgrade(&self.shared);

            {
                let mut state = self.shared.state.lock().unwrap();
                if state.failing_publishes > 0 {
                    state.failing_publishes -= 1;
                    return Err(ChannelError::PublishFailed {
                        subject: message.subject,
                        reason: "injected failure".to_string(),
                    });
                }

                if let Some(groups) = state.subjects.get_mut(&message.subject) {
                    for group in groups.values_mut() {
                        group.deliver(&message, &weak);
                    }
                }
                state.published.push(message);
            }

            self.shared.published.notify_waiters();
            Ok(())
        })
    }

    fn subscribe(
        &self,
        subject: &str,
        queue_group: &str,
    ) -> Pin<Box<dyn Future<Output = Result<MessageStream, ChannelError>> + Send + '_>> {
        let subject = subject.to_string();
        let queue_group = queue_group.to_string();

        Box::pin(async move {
            validate_subject(&subject)?;

            let mut receiver = {
                let mut state = self.shared.state.lock().unwrap();
                if state.failing_subscriptions {
                    return Err(ChannelError::SubscriptionFailed {
                        subject,
                        group: queue_group,
                        reason: "injected failure".to_string(),
                    });
                }

                let (sender, receiver) = mpsc::unbounded_channel();
                state
                    .subjects
                    .entry(subject)
                    .or_default()
                    .entry(queue_group)
                    .or_default()
                    .members
                    .push(sender);
                receiver
            };

            let stream = async_stream::stream! {
                while let Some(item) = receiver.recv().await {
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
    use futures::StreamExt;

    fn message(subject: &str, body: &str) -> ChannelMessage {
        ChannelMessage::new(subject, body.as_bytes().to_vec())
    }

    #[tokio::test]
    async fn queue_group_members_take_turns() {
        let channel = InMemoryChannel::new();
        let mut first = channel.subscribe("jobs", "workers").await.unwrap();
        let mut second = channel.subscribe("jobs", "workers").await.unwrap();

        for body in ["a", "b", "c", "d"] {
            channel.publish(message("jobs", body)).await.unwrap();
        }

        let mut first_bodies = Vec::new();
        let mut second_bodies = Vec::new();
        for _ in 0..2 {
            first_bodies.push(first.next().await.unwrap().unwrap().payload);
            second_bodies.push(second.next().await.unwrap().unwrap().payload);
        }
        assert_eq!(first_bodies, vec![b"a".to_vec(), b"c".to_vec()]);
        assert_eq!(second_bodies, vec![b"b".to_vec(), b"d".to_vec()]);
    }

    #[tokio::test]
    async fn every_group_gets_a_copy() {
        let channel = InMemoryChannel::new();
        let mut audit = channel.subscribe("jobs", "audit").await.unwrap();
        let mut workers = channel.subscribe("jobs", "workers").await.unwrap();

        channel.publish(message("jobs", "x")).await.unwrap();

        assert_eq!(audit.next().await.unwrap().unwrap().payload, b"x".to_vec());
        assert_eq!(workers.next().await.unwrap().unwrap().payload, b"x".to_vec());
    }

    #[tokio::test]
    async fn dropped_member_leaves_the_rotation() {
        let channel = InMemoryChannel::new();
        let gone = channel.subscribe("jobs", "workers").await.unwrap();
        let mut stays = channel.subscribe("jobs", "workers").await.unwrap();
        drop(gone);

        channel.publish(message("jobs", "1")).await.unwrap();
        channel.publish(message("jobs", "2")).await.unwrap();

        assert_eq!(stays.next().await.unwrap().unwrap().payload, b"1".to_vec());
        assert_eq!(stays.next().await.unwrap().unwrap().payload, b"2".to_vec());
        assert_eq!(channel.members("jobs", "workers"), 1);
    }

    #[tokio::test]
    async fn injected_publish_failures_are_not_recorded() {
        let channel = InMemoryChannel::new();
        channel.fail_next_publishes(1);

        let err = channel.publish(message("jobs", "1")).await.unwrap_err();
        assert!(err.is_retryable());
        assert!(channel.published().is_empty());

        channel.publish(message("jobs", "2")).await.unwrap();
        assert_eq!(channel.published_on("jobs").len(), 1);
    }

    #[tokio::test]
    async fn injected_subscribe_failure() {
        let channel = InMemoryChannel::new();
        channel.fail_subscriptions(true);
        let result = channel.subscribe("jobs", "workers").await;
        assert!(matches!(
            result,
            Err(ChannelError::SubscriptionFailed { .. })
        ));
    }

    #[tokio::test]
    async fn settlements_are_counted_once() {
        let channel = InMemoryChannel::new();
        let mut inbox = channel.subscribe("jobs", "workers").await.unwrap();
        channel.publish(message("jobs", "1")).await.unwrap();
        channel.publish(message("jobs", "2")).await.unwrap();

        let first = inbox.next().await.unwrap().unwrap();
        first.ack();
        first.nack();
        inbox.next().await.unwrap().unwrap().nack();

        assert_eq!(channel.acked(), 1);
        assert_eq!(channel.nacked(), 1);
    }

    #[tokio::test]
    async fn wait_for_sees_later_publish() {
        let channel = InMemoryChannel::new();
        let publisher = channel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            publisher.publish(message("jobs", "late")).await.unwrap();
        });

        let seen = channel.wait_for("jobs", 1, Duration::from_secs(1)).await;
        assert_eq!(seen.len(), 1);
    }
}
