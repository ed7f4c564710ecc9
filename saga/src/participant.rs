//! Availability participant: the reservations side of the saga.
//!
//! Listens for `CreateAvailability`, records the accommodation's free dates through an
//! [`AvailabilityRepository`] and answers with exactly one reply per command:
//!
//! | command | repository | reply |
//! |---|---|---|
//! | `CreateAvailability` | ok | `AvailabilityCreated` |
//! | `CreateAvailability` | error | `AvailabilityNotCreated` |
//! | anything else | not called | `UnknownReply` |
//!
//! Replies echo the command's payload unchanged.
//!
//! Commands are deduplicated by command id. A redelivered command does not touch the
//! repository again; the recorded reply is published once more, which recovers a reply
//! that was lost on its way back.
//!
//! Reply publishes that fail with a retryable channel error are retried with the
//! configured [`RetryPolicy`]. If every attempt fails the command is nacked and the
//! bus delivers it again.

use crate::dispatch::{self, DispatchTable};
use crate::error::Result;
use crate::messages::{AccommodationAvailability, Command, CommandId, CommandType, Reply, ReplyType};
use stayflow_core::channel::{ChannelError, MessageChannel};
use stayflow_runtime::retry::{RetryPolicy, retry_with_predicate};
use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Default number of command ids remembered for deduplication.
pub const DEFAULT_DEDUP_CAPACITY: usize = 10_000;

/// One priced date range, as stored by the reservations side.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DateRangeWithPrice {
    /// Dates of the range
    pub date_range: Vec<String>,
    /// Price for the range
    pub price: i64,
}

/// Free dates of an accommodation, ready to be stored.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FreeReservation {
    /// Accommodation id
    pub accommodation_id: String,
    /// Location of the accommodation
    pub location: String,
    /// Priced ranges
    pub date_ranges: Vec<DateRangeWithPrice>,
}

impl From<&AccommodationAvailability> for FreeReservation {
    fn from(payload: &AccommodationAvailability) -> Self {
        Self {
            accommodation_id: payload.accommodation_id.clone(),
            location: payload.location.clone(),
            date_ranges: payload
                .date_ranges
                .iter()
                .map(|range| DateRangeWithPrice {
                    date_range: range.date_range.clone(),
                    price: range.price,
                })
                .collect(),
        }
    }
}

/// Storage for free dates.
pub trait AvailabilityRepository: Send + Sync {
    /// Store the free dates of one accommodation.
    ///
    /// # Errors
    ///
    /// Returns [`SagaError::Repository`](crate::error::SagaError::Repository) if the
    /// dates could not be stored; the saga then rolls the accommodation back.
    fn create_availability(
        &self,
        reservation: FreeReservation,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>>;
}

/// Bounded memory of handled command ids and the reply each one got.
///
/// Evicts the oldest id once full.
#[derive(Debug)]
pub struct ProcessedCommands {
    capacity: usize,
    order: VecDeque<CommandId>,
    replies: HashMap<CommandId, ReplyType>,
}

impl ProcessedCommands {
    /// Remember at most `capacity` ids (at least one).
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            order: VecDeque::with_capacity(capacity.min(1024)),
            replies: HashMap::with_capacity(capacity.min(1024)),
        }
    }

    /// Reply recorded for `id`, if it was handled.
    #[must_use]
    pub fn get(&self, id: &CommandId) -> Option<ReplyType> {
        self.replies.get(id).copied()
    }

    /// Record the reply for `id`.
    pub fn record(&mut self, id: CommandId, reply: ReplyType) {
        if self.replies.insert(id.clone(), reply).is_some() {
            return;
        }
        self.order.push_back(id);
        while self.order.len() > self.capacity {
            if let Some(evicted) = self.order.pop_front() {
                self.replies.remove(&evicted);
            }
        }
    }

    /// Number of remembered ids.
    #[must_use]
    pub fn len(&self) -> usize {
        self.order.len()
    }

    /// Whether nothing is remembered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}

/// Participant settings.
#[derive(Clone, Debug)]
pub struct ParticipantConfig {
    /// Subject commands arrive on
    pub command_subject: String,
    /// Subject replies are published on
    pub reply_subject: String,
    /// Queue group of the command subscription
    pub queue_group: String,
    /// Command ids remembered for deduplication
    pub dedup_capacity: usize,
    /// Backoff for reply publishes
    pub reply_retry: RetryPolicy,
}

impl Default for ParticipantConfig {
    fn default() -> Self {
        Self {
            command_subject: "create-accommodation.command".to_string(),
            reply_subject: "create-accommodation.reply".to_string(),
            queue_group: "reservations-service".to_string(),
            dedup_capacity: DEFAULT_DEDUP_CAPACITY,
            reply_retry: RetryPolicy::builder()
                .max_retries(5)
                .initial_delay(Duration::from_millis(100))
                .max_delay(Duration::from_secs(5))
                .build(),
        }
    }
}

/// Handles `CreateAvailability` commands.
pub struct AvailabilityParticipant {
    channel: Arc<dyn MessageChannel>,
    repository: Arc<dyn AvailabilityRepository>,
    config: ParticipantConfig,
    processed: Mutex<ProcessedCommands>,
}

impl AvailabilityParticipant {
    /// Participant storing free dates in `repository`.
    #[must_use]
    pub fn new(
        channel: Arc<dyn MessageChannel>,
        repository: Arc<dyn AvailabilityRepository>,
        config: ParticipantConfig,
    ) -> Self {
        let processed = Mutex::new(ProcessedCommands::new(config.dedup_capacity));
        Self {
            channel,
            repository,
            config,
            processed,
        }
    }

    /// Handle one command and publish its reply.
    ///
    /// The reply is recorded before it is published, so a redelivery after a failed
    /// publish sends the same reply without a second repository write.
    ///
    /// # Errors
    ///
    /// Returns [`SagaError::Channel`](crate::error::SagaError::Channel) if the reply
    /// could not be published.
    #[tracing::instrument(skip(self, command), fields(
        correlation_id = %command.correlation_id,
        command_id = %command.command_id,
        kind = %command.kind,
    ))]
    pub async fn handle(&self, command: Command) -> Result<()> {
        if let Some(recorded) = self.recorded(&command.command_id) {
            tracing::info!(reply = %recorded, "Command already handled, re-sending reply");
            metrics::counter!("saga.participant.redelivered").increment(1);
            return self.reply(&command, recorded).await;
        }

        let kind = match command.kind {
            CommandType::CreateAvailability => self.create_availability(&command).await,
            other => {
                tracing::warn!(kind = %other, "Participant does not handle this command");
                ReplyType::UnknownReply
            },
        };

        self.processed
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .record(command.command_id.clone(), kind);
        self.reply(&command, kind).await
    }

    async fn create_availability(&self, command: &Command) -> ReplyType {
        let reservation = FreeReservation::from(&command.payload);
        match self.repository.create_availability(reservation).await {
            Ok(()) => {
                tracing::info!(
                    accommodation_id = %command.payload.accommodation_id,
                    ranges = command.payload.date_ranges.len(),
                    "Availability created"
                );
                ReplyType::AvailabilityCreated
            },
            Err(error) => {
                tracing::warn!(
                    accommodation_id = %command.payload.accommodation_id,
                    error = %error,
                    "Availability not created"
                );
                ReplyType::AvailabilityNotCreated
            },
        }
    }

    async fn reply(&self, command: &Command, kind: ReplyType) -> Result<()> {
        let message = Reply::answering(command, kind).to_message(&self.config.reply_subject)?;
        let published = retry_with_predicate(
            self.config.reply_retry.clone(),
            || self.channel.publish(message.clone()),
            ChannelError::is_retryable,
        )
        .await;
        if let Err(error) = published {
            tracing::error!(reply = %kind, error = %error, "Failed to publish saga reply");
            metrics::counter!("saga.replies.failed").increment(1);
            return Err(error.into());
        }
        metrics::counter!("saga.replies.published", "kind" => kind.as_str()).increment(1);
        Ok(())
    }

    fn recorded(&self, id: &CommandId) -> Option<ReplyType> {
        self.processed
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(id)
    }

    /// Number of command ids currently remembered.
    #[must_use]
    pub fn processed_count(&self) -> usize {
        self.processed
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Subscribe to the command subject and handle commands until shutdown.
    ///
    /// # Errors
    ///
    /// Returns [`SagaError::Channel`](crate::error::SagaError::Channel) if the
    /// subscription cannot be registered.
    pub async fn listen(self: &Arc<Self>, shutdown: watch::Receiver<bool>) -> Result<JoinHandle<()>> {
        let create = Arc::clone(self);
        let other = Arc::clone(self);
        let table = DispatchTable::builder()
            .on(CommandType::CreateAvailability, move |command: Command| {
                let participant = Arc::clone(&create);
                async move { participant.handle(command).await }
            })
            .fallback(move |command: Command| {
                let participant = Arc::clone(&other);
                async move { participant.handle(command).await }
            })
            .build(&[CommandType::CreateAvailability])?;

        let commands = self
            .channel
            .subscribe(&self.config.command_subject, &self.config.queue_group)
            .await?;

        tracing::info!(
            subject = %self.config.command_subject,
            group = %self.config.queue_group,
            "Availability participant listening for commands"
        );
        Ok(tokio::spawn(dispatch::serve(commands, Arc::new(table), shutdown)))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::error::SagaError;
    use crate::messages::{AvailableDates, CorrelationId};
    use stayflow_testing::InMemoryChannel;
    use std::sync::atomic::{AtomicUsize, Ordering};

    const REPLIES: &str = "create-accommodation.reply";

    #[derive(Default)]
    struct CountingRepository {
        calls: AtomicUsize,
        failing: bool,
        stored: Mutex<Vec<FreeReservation>>,
    }

    impl AvailabilityRepository for CountingRepository {
        fn create_availability(
            &self,
            reservation: FreeReservation,
        ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
            Box::pin(async move {
                self.calls.fetch_add(1, Ordering::SeqCst);
                if self.failing {
                    return Err(SagaError::Repository("disk full".to_string()));
                }
                self.stored.lock().unwrap().push(reservation);
                Ok(())
            })
        }
    }

    fn participant(
        repository: Arc<CountingRepository>,
    ) -> (AvailabilityParticipant, InMemoryChannel) {
        let channel = InMemoryChannel::new();
        let participant = AvailabilityParticipant::new(
            Arc::new(channel.clone()),
            repository,
            ParticipantConfig {
                reply_retry: fast_retry(2),
                ..ParticipantConfig::default()
            },
        );
        (participant, channel)
    }

    fn fast_retry(max_retries: usize) -> RetryPolicy {
        RetryPolicy::builder()
            .max_retries(max_retries)
            .initial_delay(Duration::from_millis(1))
            .max_delay(Duration::from_millis(5))
            .build()
    }

    fn create_command() -> Command {
        Command::new(
            CommandType::CreateAvailability,
            AccommodationAvailability {
                accommodation_id: "A1".to_string(),
                location: "Novi Sad".to_string(),
                date_ranges: vec![AvailableDates {
                    accommodation_id: "A1".to_string(),
                    date_range: vec!["2024-07-01".to_string(), "2024-07-05".to_string()],
                    location: "Novi Sad".to_string(),
                    price: 150,
                }],
            },
            CorrelationId::new(),
        )
    }

    #[test]
    fn payload_converts_to_free_reservation() {
        let command = create_command();
        let reservation = FreeReservation::from(&command.payload);

        assert_eq!(reservation.accommodation_id, "A1");
        assert_eq!(
            reservation.date_ranges,
            vec![DateRangeWithPrice {
                date_range: vec!["2024-07-01".to_string(), "2024-07-05".to_string()],
                price: 150,
            }]
        );
    }

    #[tokio::test]
    async fn successful_write_replies_created() {
        let repository = Arc::new(CountingRepository::default());
        let (participant, channel) = participant(Arc::clone(&repository));
        let command = create_command();

        participant.handle(command.clone()).await.unwrap();

        let replies: Vec<Reply> = channel.decoded_on(REPLIES);
        assert_eq!(replies.len(), 1);
        assert_eq!(replies[0].kind, ReplyType::AvailabilityCreated);
        assert_eq!(replies[0].payload, command.payload);
        assert_eq!(repository.stored.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn failed_write_replies_not_created_with_original_payload() {
        let repository = Arc::new(CountingRepository {
            failing: true,
            ..CountingRepository::default()
        });
        let (participant, channel) = participant(repository);
        let command = create_command();

        participant.handle(command.clone()).await.unwrap();

        let replies: Vec<Reply> = channel.decoded_on(REPLIES);
        assert_eq!(replies.len(), 1);
        assert_eq!(replies[0].kind, ReplyType::AvailabilityNotCreated);
        assert_eq!(replies[0].payload, command.payload);
        assert_eq!(replies[0].correlation_id, command.correlation_id);
    }

    #[tokio::test]
    async fn other_commands_reply_unknown() {
        let repository = Arc::new(CountingRepository::default());
        let (participant, channel) = participant(Arc::clone(&repository));
        let mut command = create_command();
        command.kind = CommandType::UpdateAccommodation;

        participant.handle(command).await.unwrap();

        let replies: Vec<Reply> = channel.decoded_on(REPLIES);
        assert_eq!(replies[0].kind, ReplyType::UnknownReply);
        assert_eq!(repository.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn redelivery_republishes_without_second_write() {
        let repository = Arc::new(CountingRepository::default());
        let (participant, channel) = participant(Arc::clone(&repository));
        let command = create_command();

        participant.handle(command.clone()).await.unwrap();
        participant.handle(command).await.unwrap();

        assert_eq!(repository.calls.load(Ordering::SeqCst), 1);
        let replies: Vec<Reply> = channel.decoded_on(REPLIES);
        assert_eq!(replies.len(), 2);
        assert!(replies.iter().all(|r| r.kind == ReplyType::AvailabilityCreated));
    }

    #[tokio::test]
    async fn transient_reply_failure_is_retried() {
        let repository = Arc::new(CountingRepository::default());
        let (participant, channel) = participant(Arc::clone(&repository));
        channel.fail_next_publishes(1);

        participant.handle(create_command()).await.unwrap();

        assert_eq!(repository.calls.load(Ordering::SeqCst), 1);
        assert_eq!(channel.decoded_on::<Reply>(REPLIES).len(), 1);
    }

    #[tokio::test]
    async fn exhausted_reply_is_resent_on_redelivery_without_second_write() {
        let repository = Arc::new(CountingRepository::default());
        let (participant, channel) = participant(Arc::clone(&repository));
        let command = create_command();
        // First attempt plus two retries
        channel.fail_next_publishes(3);

        let err = participant.handle(command.clone()).await.unwrap_err();
        assert!(matches!(err, SagaError::Channel(_)));
        assert!(channel.decoded_on::<Reply>(REPLIES).is_empty());
        assert_eq!(participant.processed_count(), 1);

        participant.handle(command).await.unwrap();
        assert_eq!(repository.calls.load(Ordering::SeqCst), 1);
        let replies: Vec<Reply> = channel.decoded_on(REPLIES);
        assert_eq!(replies.len(), 1);
        assert_eq!(replies[0].kind, ReplyType::AvailabilityCreated);
    }

    #[tokio::test]
    async fn listening_participant_replies_despite_a_failed_publish() {
        let repository = Arc::new(CountingRepository::default());
        let (participant, channel) = participant(Arc::clone(&repository));
        let participant = Arc::new(participant);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = participant.listen(shutdown_rx).await.unwrap();

        let command = create_command()
            .to_message("create-accommodation.command")
            .unwrap();
        channel.publish(command).await.unwrap();
        // Armed before the listener runs, so it hits the reply
        channel.fail_next_publishes(1);

        let replies = channel
            .wait_for(REPLIES, 1, Duration::from_secs(5))
            .await;
        shutdown_tx.send(true).unwrap();
        task.await.unwrap();

        assert_eq!(replies.len(), 1);
        assert_eq!(repository.calls.load(Ordering::SeqCst), 1);
        assert_eq!(channel.acked(), 1);
    }

    #[test]
    fn dedup_table_evicts_oldest() {
        let mut processed = ProcessedCommands::new(2);
        let first = CommandId::from("k-1");
        processed.record(first.clone(), ReplyType::AvailabilityCreated);
        processed.record(CommandId::from("k-2"), ReplyType::AvailabilityCreated);
        processed.record(CommandId::from("k-3"), ReplyType::AvailabilityNotCreated);

        assert_eq!(processed.len(), 2);
        assert_eq!(processed.get(&first), None);
        assert_eq!(
            processed.get(&CommandId::from("k-3")),
            Some(ReplyType::AvailabilityNotCreated)
        );
    }

    #[test]
    fn dedup_table_rerecord_keeps_position() {
        let mut processed = ProcessedCommands::new(2);
        processed.record(CommandId::from("k-1"), ReplyType::AvailabilityCreated);
        processed.record(CommandId::from("k-1"), ReplyType::AvailabilityCreated);

        assert_eq!(processed.len(), 1);
    }
}
