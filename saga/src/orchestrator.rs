//! Create-accommodation saga orchestrator.
//!
//! Drives one saga instance per new accommodation:
//! 1. Publish `CreateAvailability` to the reservations side (reply timeout starts)
//! 2. On `AvailabilityCreated`: publish `UpdateAccommodation`, instance is committed
//! 3. On `AvailabilityNotCreated`: publish `RollbackAccommodation`, instance is rolled back
//! 4. On timeout: publish `RollbackAccommodation`, instance is timed out
//!
//! The decision logic is [`SagaReducer`], a pure state machine over [`SagaBook`];
//! [`Orchestrator`] runs it in a [`Store`] and connects it to the message channel.
//!
//! ```text
//!   Start ──► Started ──publish ok──► AwaitingReply ──┬─ Created ────► Committed
//!                │                                    ├─ NotCreated ─► RolledBack
//!                │ publish failed or                  ├─ other ──────► Unknown
//!                │ start gave up                      └─ timeout ────► TimedOut
//!                ▼
//!            (removed)
//! ```
//!
//! Terminal states are final. Replies for terminal or unknown instances are logged and
//! ignored. Finished instances are kept up to a capacity, oldest dropped first.

use crate::dispatch::{self, DispatchTable};
use crate::error::{Result, SagaError};
use crate::messages::{AccommodationAvailability, Command, CommandType, CorrelationId, Reply, ReplyType};
use chrono::{DateTime, Utc};
use stayflow_core::channel::{ChannelError, MessageChannel};
use stayflow_core::effect::Effect;
use stayflow_core::environment::{Clock, SystemClock};
use stayflow_core::reducer::Reducer;
use stayflow_runtime::{Store, StoreError};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

// ============================================================================
// State
// ============================================================================

/// Where one saga instance stands.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SagaState {
    /// `CreateAvailability` is being published
    Started,
    /// `CreateAvailability` was published; waiting for the participant
    AwaitingReply,
    /// Availability created, accommodation approved
    Committed,
    /// Availability not created, accommodation compensated
    RolledBack,
    /// The participant answered with a reply this saga does not know
    Unknown,
    /// No reply in time, accommodation compensated
    TimedOut,
}

impl SagaState {
    /// Whether the instance will never change again.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Committed | Self::RolledBack | Self::Unknown | Self::TimedOut
        )
    }

    /// Whether a reply or timeout is still expected.
    #[must_use]
    pub const fn is_pending(self) -> bool {
        matches!(self, Self::Started | Self::AwaitingReply)
    }
}

/// One saga instance.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SagaInstance {
    /// Key of the instance
    pub correlation_id: CorrelationId,
    /// Accommodation and its free dates
    pub payload: AccommodationAvailability,
    /// Current state
    pub state: SagaState,
    /// When `start` was called
    pub started_at: DateTime<Utc>,
    /// Last transition
    pub updated_at: DateTime<Utc>,
}

/// Default number of finished instances kept for inspection.
pub const DEFAULT_TERMINAL_CAPACITY: usize = 10_000;

/// Every saga instance this process started, by correlation id.
///
/// Pending instances are kept until they finish. Finished ones are kept up to
/// `terminal_capacity`; beyond that the instance that finished first is dropped.
#[derive(Clone, Debug)]
pub struct SagaBook {
    instances: HashMap<CorrelationId, SagaInstance>,
    finished: VecDeque<CorrelationId>,
    terminal_capacity: usize,
}

impl Default for SagaBook {
    fn default() -> Self {
        Self::with_terminal_capacity(DEFAULT_TERMINAL_CAPACITY)
    }
}

impl SagaBook {
    /// Empty book.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Empty book keeping at most `capacity` finished instances (at least one).
    #[must_use]
    pub fn with_terminal_capacity(capacity: usize) -> Self {
        Self {
            instances: HashMap::new(),
            finished: VecDeque::new(),
            terminal_capacity: capacity.max(1),
        }
    }

    /// The instance keyed by `correlation_id`.
    #[must_use]
    pub fn get(&self, correlation_id: &CorrelationId) -> Option<&SagaInstance> {
        self.instances.get(correlation_id)
    }

    /// Every instance, oldest first.
    #[must_use]
    pub fn all(&self) -> Vec<SagaInstance> {
        let mut all: Vec<_> = self.instances.values().cloned().collect();
        all.sort_by(|a, b| {
            a.started_at
                .cmp(&b.started_at)
                .then_with(|| a.correlation_id.cmp(&b.correlation_id))
        });
        all
    }

    /// Number of instances.
    #[must_use]
    pub fn len(&self) -> usize {
        self.instances.len()
    }

    /// Whether no instance was started.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.instances.is_empty()
    }

    /// Register `instance`, replacing any previous one with the same key.
    pub fn insert(&mut self, instance: SagaInstance) {
        let correlation_id = instance.correlation_id.clone();
        let terminal = instance.state.is_terminal();
        let previous = self.instances.insert(correlation_id.clone(), instance);
        if terminal && !previous.is_some_and(|previous| previous.state.is_terminal()) {
            self.finish(correlation_id);
        }
    }

    fn remove(&mut self, correlation_id: &CorrelationId) {
        self.instances.remove(correlation_id);
    }

    fn transition(&mut self, correlation_id: &CorrelationId, state: SagaState, at: DateTime<Utc>) {
        let Some(instance) = self.instances.get_mut(correlation_id) else {
            return;
        };
        let was_terminal = instance.state.is_terminal();
        instance.state = state;
        instance.updated_at = at;
        if state.is_terminal() && !was_terminal {
            self.finish(correlation_id.clone());
        }
    }

    fn finish(&mut self, correlation_id: CorrelationId) {
        self.finished.push_back(correlation_id);
        while self.finished.len() > self.terminal_capacity {
            if let Some(evicted) = self.finished.pop_front() {
                self.instances.remove(&evicted);
            }
        }
    }
}

// ============================================================================
// Actions
// ============================================================================

/// Inputs of the saga state machine.
#[derive(Clone, Debug)]
pub enum SagaAction {
    /// Begin a new instance
    Start {
        /// Key of the new instance
        correlation_id: CorrelationId,
        /// Accommodation and its free dates
        payload: AccommodationAvailability,
    },

    /// A command of an instance reached the bus
    CommandPublished {
        /// Instance the command belongs to
        correlation_id: CorrelationId,
        /// Command that was published
        kind: CommandType,
    },

    /// A command of an instance could not be published
    PublishFailed {
        /// Instance the command belongs to
        correlation_id: CorrelationId,
        /// Command that failed
        kind: CommandType,
        /// Channel error returned by the publish
        error: ChannelError,
    },

    /// The participant answered
    ReplyReceived(Reply),

    /// The reply timeout of an instance expired
    ReplyTimedOut {
        /// Instance whose timeout fired
        correlation_id: CorrelationId,
    },

    /// `start` gave up waiting for the first publish
    StartAbandoned {
        /// Instance the caller was told failed
        correlation_id: CorrelationId,
    },
}

// ============================================================================
// Environment
// ============================================================================

/// Dependencies of the saga state machine.
#[derive(Clone)]
pub struct SagaEnvironment {
    /// Bus the commands are published on
    pub channel: Arc<dyn MessageChannel>,
    /// Subject the commands are published on
    pub command_subject: String,
    /// How long an instance waits for its reply
    pub reply_timeout: Duration,
    /// Timestamps for instances
    pub clock: Arc<dyn Clock>,
}

impl SagaEnvironment {
    /// Environment with the system clock.
    #[must_use]
    pub fn new(
        channel: Arc<dyn MessageChannel>,
        command_subject: impl Into<String>,
        reply_timeout: Duration,
    ) -> Self {
        Self {
            channel,
            command_subject: command_subject.into(),
            reply_timeout,
            clock: Arc::new(SystemClock),
        }
    }

    /// Replace the clock.
    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }
}

// ============================================================================
// Reducer
// ============================================================================

/// Next command and terminal state for a reply.
#[must_use]
pub const fn next_step(reply: ReplyType) -> (CommandType, SagaState) {
    match reply {
        ReplyType::AvailabilityCreated => (CommandType::UpdateAccommodation, SagaState::Committed),
        ReplyType::AvailabilityNotCreated => {
            (CommandType::RollbackAccommodation, SagaState::RolledBack)
        },
        ReplyType::UnknownReply => (CommandType::UnknownCommand, SagaState::Unknown),
    }
}

/// The create-accommodation state machine.
#[derive(Clone, Copy, Debug, Default)]
pub struct SagaReducer;

impl SagaReducer {
    /// Create the reducer.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    fn publish(env: &SagaEnvironment, command: Command) -> Effect<SagaAction> {
        let channel = Arc::clone(&env.channel);
        let subject = env.command_subject.clone();

        Effect::Future(Box::pin(async move {
            let correlation_id = command.correlation_id.clone();
            let kind = command.kind;
            let published = match command.to_message(&subject) {
                Ok(message) => channel.publish(message).await,
                Err(error) => Err(error),
            };

            Some(match published {
                Ok(()) => {
                    metrics::counter!("saga.commands.published", "kind" => kind.as_str())
                        .increment(1);
                    SagaAction::CommandPublished {
                        correlation_id,
                        kind,
                    }
                },
                Err(error) => SagaAction::PublishFailed {
                    correlation_id,
                    kind,
                    error,
                },
            })
        }))
    }

    fn follow_up(
        state: &SagaBook,
        env: &SagaEnvironment,
        correlation_id: &CorrelationId,
        kind: CommandType,
    ) -> Vec<Effect<SagaAction>> {
        // UnknownCommand marks "nothing to do"; it is never put on the bus.
        if kind == CommandType::UnknownCommand {
            return vec![Effect::None];
        }
        let Some(instance) = state.get(correlation_id) else {
            return vec![Effect::None];
        };
        let command = Command::new(kind, instance.payload.clone(), correlation_id.clone());
        vec![Self::publish(env, command)]
    }
}

impl Reducer for SagaReducer {
    type State = SagaBook;
    type Action = SagaAction;
    type Environment = SagaEnvironment;

    #[allow(clippy::too_many_lines)] // One arm per saga step
    fn reduce(
        &self,
        state: &mut SagaBook,
        action: SagaAction,
        env: &SagaEnvironment,
    ) -> Vec<Effect<SagaAction>> {
        let now = env.clock.now();

        match action {
            // ========== Step 1: start and publish CreateAvailability ==========
            SagaAction::Start {
                correlation_id,
                payload,
            } => {
                if state.get(&correlation_id).is_some() {
                    tracing::warn!(%correlation_id, "Saga already started, ignoring");
                    return vec![Effect::None];
                }

                tracing::info!(
                    %correlation_id,
                    accommodation_id = %payload.accommodation_id,
                    "Starting create-accommodation saga"
                );
                metrics::counter!("saga.started").increment(1);

                let command = Command::new(
                    CommandType::CreateAvailability,
                    payload.clone(),
                    correlation_id.clone(),
                );
                state.insert(SagaInstance {
                    correlation_id,
                    payload,
                    state: SagaState::Started,
                    started_at: now,
                    updated_at: now,
                });

                vec![Self::publish(env, command)]
            },

            // ========== Step 2: command on the bus ==========
            SagaAction::CommandPublished {
                correlation_id,
                kind,
            } => {
                tracing::debug!(%correlation_id, %kind, "Saga command published");

                if kind == CommandType::CreateAvailability && state.get(&correlation_id).is_none() {
                    tracing::warn!(
                        %correlation_id,
                        "CreateAvailability reached the bus after its saga was abandoned"
                    );
                    metrics::counter!("saga.commands.orphaned").increment(1);
                    return vec![Effect::None];
                }

                let awaiting = kind == CommandType::CreateAvailability
                    && state
                        .get(&correlation_id)
                        .is_some_and(|instance| instance.state == SagaState::Started);
                if !awaiting {
                    return vec![Effect::None];
                }

                state.transition(&correlation_id, SagaState::AwaitingReply, now);
                vec![Effect::Delay {
                    duration: env.reply_timeout,
                    action: Box::new(SagaAction::ReplyTimedOut { correlation_id }),
                }]
            },

            SagaAction::PublishFailed {
                correlation_id,
                kind,
                error,
            } => {
                tracing::error!(%correlation_id, %kind, %error, "Failed to publish saga command");
                metrics::counter!("saga.commands.failed", "kind" => kind.as_str()).increment(1);

                // A saga whose first command never left cannot receive a reply.
                if kind == CommandType::CreateAvailability
                    && state
                        .get(&correlation_id)
                        .is_some_and(|instance| instance.state == SagaState::Started)
                {
                    state.remove(&correlation_id);
                }
                vec![Effect::None]
            },

            // ========== Step 3: reply decides commit or compensation ==========
            SagaAction::ReplyReceived(reply) => {
                let correlation_id = reply.correlation_id.clone();
                let Some(current) = state.get(&correlation_id).map(|instance| instance.state)
                else {
                    tracing::warn!(
                        %correlation_id,
                        kind = %reply.kind,
                        "Reply for unknown saga instance, ignoring"
                    );
                    metrics::counter!("saga.replies.ignored", "reason" => "unknown_instance")
                        .increment(1);
                    return vec![Effect::None];
                };

                if current.is_terminal() {
                    tracing::warn!(
                        %correlation_id,
                        kind = %reply.kind,
                        state = ?current,
                        "Reply for finished saga instance, ignoring"
                    );
                    metrics::counter!("saga.replies.ignored", "reason" => "terminal").increment(1);
                    return vec![Effect::None];
                }

                let (next, terminal) = next_step(reply.kind);
                tracing::info!(
                    %correlation_id,
                    reply = %reply.kind,
                    next = %next,
                    state = ?terminal,
                    "Saga reply handled"
                );
                metrics::counter!("saga.completed", "state" => format!("{terminal:?}"))
                    .increment(1);

                state.transition(&correlation_id, terminal, now);
                Self::follow_up(state, env, &correlation_id, next)
            },

            // ========== Step 4: timeout compensates ==========
            SagaAction::ReplyTimedOut { correlation_id } => {
                let pending = state
                    .get(&correlation_id)
                    .is_some_and(|instance| instance.state.is_pending());
                if !pending {
                    return vec![Effect::None];
                }

                tracing::warn!(
                    %correlation_id,
                    timeout_ms = env.reply_timeout.as_millis(),
                    "No saga reply in time, rolling back"
                );
                metrics::counter!("saga.completed", "state" => "TimedOut").increment(1);

                state.transition(&correlation_id, SagaState::TimedOut, now);
                Self::follow_up(state, env, &correlation_id, CommandType::RollbackAccommodation)
            },

            SagaAction::StartAbandoned { correlation_id } => {
                let started = state
                    .get(&correlation_id)
                    .is_some_and(|instance| instance.state == SagaState::Started);
                if started {
                    tracing::warn!(%correlation_id, "First saga publish did not finish in time, abandoning");
                    metrics::counter!("saga.abandoned").increment(1);
                    state.remove(&correlation_id);
                }
                vec![Effect::None]
            },
        }
    }
}

// ============================================================================
// Orchestrator
// ============================================================================

/// Orchestrator settings.
#[derive(Clone, Debug)]
pub struct OrchestratorConfig {
    /// Subject commands are published on
    pub command_subject: String,
    /// Subject replies arrive on
    pub reply_subject: String,
    /// Queue group of the reply subscription
    pub queue_group: String,
    /// How long an instance waits for its reply
    pub reply_timeout: Duration,
    /// How long `start` waits for the first publish to finish
    pub publish_timeout: Duration,
    /// Finished instances kept for inspection
    pub terminal_capacity: usize,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            command_subject: "create-accommodation.command".to_string(),
            reply_subject: "create-accommodation.reply".to_string(),
            queue_group: "accommodations-service".to_string(),
            reply_timeout: Duration::from_secs(30),
            publish_timeout: Duration::from_secs(10),
            terminal_capacity: DEFAULT_TERMINAL_CAPACITY,
        }
    }
}

type SagaStore = Store<SagaBook, SagaAction, SagaEnvironment, SagaReducer>;

/// Runs [`SagaReducer`] against a message channel.
///
/// Cloning yields a handle to the same saga book.
#[derive(Clone)]
pub struct Orchestrator {
    store: SagaStore,
    channel: Arc<dyn MessageChannel>,
    config: OrchestratorConfig,
}

impl Orchestrator {
    /// Orchestrator on `channel` with the system clock.
    #[must_use]
    pub fn new(channel: Arc<dyn MessageChannel>, config: OrchestratorConfig) -> Self {
        Self::with_clock(channel, config, Arc::new(SystemClock))
    }

    /// Orchestrator with an injected clock.
    #[must_use]
    pub fn with_clock(
        channel: Arc<dyn MessageChannel>,
        config: OrchestratorConfig,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let env = SagaEnvironment::new(
            Arc::clone(&channel),
            config.command_subject.clone(),
            config.reply_timeout,
        )
        .with_clock(clock);

        Self {
            store: Store::new(
                SagaBook::with_terminal_capacity(config.terminal_capacity),
                SagaReducer::new(),
                env,
            ),
            channel,
            config,
        }
    }

    /// Begin a saga for `accommodation`.
    ///
    /// Returns once `CreateAvailability` is on the bus; the reply is handled later by
    /// the subscription started with [`listen`](Self::listen).
    ///
    /// # Errors
    ///
    /// - [`SagaError::Channel`]: the publish failed (not retried)
    /// - [`SagaError::Runtime`]: the state machine is shutting down or the publish did not
    ///   finish within the configured publish timeout. A timed out instance is removed, so
    ///   calling `start` again does not leave two sagas for one accommodation. If the late
    ///   publish still reaches the bus, its reply is ignored.
    #[tracing::instrument(skip(self, accommodation), fields(accommodation_id = %accommodation.accommodation_id))]
    pub async fn start(&self, accommodation: AccommodationAvailability) -> Result<CorrelationId> {
        let correlation_id = CorrelationId::new();
        let key = correlation_id.clone();

        let outcome = self
            .store
            .send_and_wait_for(
                SagaAction::Start {
                    correlation_id: correlation_id.clone(),
                    payload: accommodation,
                },
                move |action| match action {
                    SagaAction::CommandPublished {
                        correlation_id,
                        kind: CommandType::CreateAvailability,
                    }
                    | SagaAction::PublishFailed {
                        correlation_id,
                        kind: CommandType::CreateAvailability,
                        ..
                    } => *correlation_id == key,
                    _ => false,
                },
                self.config.publish_timeout,
            )
            .await;

        let outcome = match outcome {
            Ok(outcome) => outcome,
            Err(StoreError::Timeout) => {
                self.store
                    .send(SagaAction::StartAbandoned {
                        correlation_id: correlation_id.clone(),
                    })
                    .await?;
                return Err(StoreError::Timeout.into());
            },
            Err(error) => return Err(error.into()),
        };

        match outcome {
            SagaAction::PublishFailed { error, .. } => Err(SagaError::Channel(error)),
            _ => Ok(correlation_id),
        }
    }

    /// Feed a reply into the state machine.
    ///
    /// # Errors
    ///
    /// Returns [`SagaError::Runtime`] if the state machine is shutting down.
    pub async fn on_reply(&self, reply: Reply) -> Result<()> {
        self.store.send(SagaAction::ReplyReceived(reply)).await?;
        Ok(())
    }

    /// Subscribe to the reply subject and handle replies until shutdown.
    ///
    /// # Errors
    ///
    /// Returns [`SagaError::Channel`] if the subscription cannot be registered; the
    /// service must not run without it.
    pub async fn listen(&self, shutdown: watch::Receiver<bool>) -> Result<JoinHandle<()>> {
        let table = self.reply_table()?;
        let replies = self
            .channel
            .subscribe(&self.config.reply_subject, &self.config.queue_group)
            .await?;

        tracing::info!(
            subject = %self.config.reply_subject,
            group = %self.config.queue_group,
            "Saga orchestrator listening for replies"
        );
        Ok(tokio::spawn(dispatch::serve(replies, Arc::new(table), shutdown)))
    }

    fn reply_table(&self) -> Result<DispatchTable<ReplyType, Reply>> {
        let created = self.clone();
        let not_created = self.clone();
        let other = self.clone();

        let table = DispatchTable::builder()
            .on(ReplyType::AvailabilityCreated, move |reply: Reply| {
                let orchestrator = created.clone();
                async move { orchestrator.on_reply(reply).await }
            })
            .on(ReplyType::AvailabilityNotCreated, move |reply: Reply| {
                let orchestrator = not_created.clone();
                async move { orchestrator.on_reply(reply).await }
            })
            .fallback(move |reply: Reply| {
                let orchestrator = other.clone();
                async move { orchestrator.on_reply(reply).await }
            })
            .build(&[ReplyType::AvailabilityCreated, ReplyType::AvailabilityNotCreated])?;
        Ok(table)
    }

    /// Current view of one instance.
    pub async fn instance(&self, correlation_id: &CorrelationId) -> Option<SagaInstance> {
        self.store
            .state(|book| book.get(correlation_id).cloned())
            .await
    }

    /// Current view of every instance, oldest first.
    pub async fn instances(&self) -> Vec<SagaInstance> {
        self.store.state(SagaBook::all).await
    }

    /// Stop accepting work and wait for in-flight publishes.
    ///
    /// Pending reply timeouts count as in-flight work, so a short `timeout` usually
    /// ends with [`SagaError::Runtime`]; the timeouts are simply abandoned.
    ///
    /// # Errors
    ///
    /// Returns [`SagaError::Runtime`] if effects are still running after `timeout`.
    pub async fn shutdown(&self, timeout: Duration) -> Result<()> {
        self.store.shutdown(timeout).await?;
        Ok(())
    }
}
