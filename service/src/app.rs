//! One process running every Stayflow component.
//!
//! ```text
//!            ┌──────────── saga (MessageChannel) ────────────┐
//!  Orchestrator ◄──► AvailabilityParticipant      AccommodationHandler
//!
//!  CommandWriter ──► EventStore ──► PersistentSubscription ─┬─► EventStreamConsumer ──► AccommodationStore
//!                                                          └─► EventStreamConsumer ──► PeriodStore
//! ```
//!
//! The two projections read through separate subscription groups, so each keeps its
//! own position.
//!
//! [`Stayflow::start`] takes the infrastructure as trait objects, so the same wiring
//! runs against Postgres and Redpanda in the binary and against the in-memory adapters
//! in tests.

use crate::config::ServiceConfig;
use crate::repositories::{InMemoryAccommodations, InMemoryAvailability};
use stayflow_commands::CommandWriter;
use stayflow_core::activity::ActivityEvent;
use stayflow_core::channel::MessageChannel;
use stayflow_core::event_store::EventStore;
use stayflow_core::projection::ProjectionError;
use stayflow_core::subscription::PersistentSubscription;
use stayflow_projections::{
    AccommodationProjection, AccommodationProjector, AccommodationStore, ConsumerConfig,
    EventStreamConsumer, PeriodProjector, PeriodReport, PeriodStore, StoreError,
};
use stayflow_runtime::retry::RetryPolicy;
use stayflow_saga::error::SagaError;
use stayflow_saga::{
    AccommodationHandler, AccommodationHandlerConfig, AvailabilityParticipant, Orchestrator,
    OrchestratorConfig, ParticipantConfig,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Running components and the handles needed to stop them.
pub struct Stayflow {
    /// Starts create-accommodation sagas
    pub orchestrator: Orchestrator,
    /// Appends user activity
    pub commands: CommandWriter,
    /// Free dates stored by the participant
    pub availability: Arc<InMemoryAvailability>,
    /// Accommodation statuses decided by the saga
    pub accommodations: Arc<InMemoryAccommodations>,
    metrics: AccommodationProjector,
    periods: PeriodProjector,
    event_store: Arc<dyn EventStore>,
    shutdown: watch::Sender<bool>,
    consumer_shutdown: watch::Sender<bool>,
    periods_shutdown: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl Stayflow {
    /// Wire and start every component.
    ///
    /// Saga subscriptions are registered before this returns; the projection consumers
    /// connect in the background and keep reconnecting on their own.
    ///
    /// # Errors
    ///
    /// Returns [`SagaError`] if a saga subscription cannot be registered.
    pub async fn start(
        config: &ServiceConfig,
        channel: Arc<dyn MessageChannel>,
        event_store: Arc<dyn EventStore>,
        subscription: Arc<dyn PersistentSubscription>,
    ) -> Result<Self, SagaError> {
        let (shutdown, stop) = watch::channel(false);
        let mut tasks = Vec::new();

        let availability = Arc::new(InMemoryAvailability::new());
        let participant = Arc::new(AvailabilityParticipant::new(
            Arc::clone(&channel),
            availability.clone(),
            ParticipantConfig {
                command_subject: config.command_subject.clone(),
                reply_subject: config.reply_subject.clone(),
                queue_group: config.participant_group.clone(),
                ..ParticipantConfig::default()
            },
        ));
        tasks.push(participant.listen(stop.clone()).await?);

        let accommodations = Arc::new(InMemoryAccommodations::new());
        let handler = Arc::new(AccommodationHandler::new(
            Arc::clone(&channel),
            accommodations.clone(),
            AccommodationHandlerConfig {
                command_subject: config.command_subject.clone(),
                queue_group: config.service_group.clone(),
            },
        ));
        tasks.push(handler.listen(stop.clone()).await?);

        let orchestrator = Orchestrator::new(
            channel,
            OrchestratorConfig {
                command_subject: config.command_subject.clone(),
                reply_subject: config.reply_subject.clone(),
                queue_group: config.service_group.clone(),
                reply_timeout: config.saga_reply_timeout,
                ..OrchestratorConfig::default()
            },
        );
        tasks.push(orchestrator.listen(stop).await?);

        let metrics = AccommodationProjector::new(AccommodationStore::new());
        let reconnect = RetryPolicy::builder()
            .initial_delay(config.reconnect_initial_delay)
            .max_delay(config.reconnect_max_delay)
            .build();
        let (consumer, consumer_shutdown) = EventStreamConsumer::new(
            Arc::clone(&subscription),
            metrics.clone(),
            ActivityEvent::registry(),
            ConsumerConfig::new(config.subscription_group.clone())
                .with_reconnect_policy(reconnect.clone()),
        );
        tasks.push(tokio::spawn(consumer.run()));

        let periods = PeriodProjector::new(PeriodStore::new());
        let (consumer, periods_shutdown) = EventStreamConsumer::new(
            subscription,
            periods.clone(),
            ActivityEvent::registry(),
            ConsumerConfig::new(format!("{}-periods", config.subscription_group))
                .with_reconnect_policy(reconnect),
        );
        tasks.push(tokio::spawn(consumer.run()));

        tracing::info!(
            command_subject = %config.command_subject,
            reply_subject = %config.reply_subject,
            subscription_group = %config.subscription_group,
            "Stayflow started"
        );

        Ok(Self {
            orchestrator,
            commands: CommandWriter::new(Arc::clone(&event_store)),
            availability,
            accommodations,
            metrics,
            periods,
            event_store,
            shutdown,
            consumer_shutdown,
            periods_shutdown,
            tasks,
        })
    }

    /// Current metrics of one accommodation.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::NotFound`] if no event for the accommodation has been
    /// projected yet.
    pub async fn accommodation_metrics(
        &self,
        accommodation_id: &str,
    ) -> Result<AccommodationProjection, StoreError> {
        self.metrics.store().read(accommodation_id).await
    }

    /// Recompute one accommodation's metrics from its stream.
    ///
    /// # Errors
    ///
    /// Returns [`ProjectionError::Rebuild`] if the stream cannot be read.
    pub async fn recompute(
        &self,
        accommodation_id: &str,
    ) -> Result<AccommodationProjection, ProjectionError> {
        self.metrics
            .rebuild_accommodation(self.event_store.as_ref(), accommodation_id)
            .await
    }

    /// Daily and monthly windows of one accommodation.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::NotFound`] if no event for the accommodation has been
    /// projected yet.
    pub async fn period_report(&self, accommodation_id: &str) -> Result<PeriodReport, StoreError> {
        self.periods.store().read(accommodation_id).await
    }

    /// Recompute one accommodation's daily and monthly windows from its stream.
    ///
    /// # Errors
    ///
    /// Returns [`ProjectionError::Rebuild`] if the stream cannot be read.
    pub async fn recompute_periods(
        &self,
        accommodation_id: &str,
    ) -> Result<PeriodReport, ProjectionError> {
        self.periods
            .rebuild_accommodation(self.event_store.as_ref(), accommodation_id)
            .await
    }

    /// Stop every component.
    ///
    /// Listeners stop taking messages, in-flight saga effects get up to `timeout` to
    /// finish, then the projection consumers stop.
    pub async fn shutdown(self, timeout: Duration) {
        tracing::info!("Shutting down");
        let _ = self.shutdown.send(true);
        if let Err(error) = self.orchestrator.shutdown(timeout).await {
            tracing::warn!(error = %error, "Saga instances still running at shutdown");
        }
        let _ = self.consumer_shutdown.send(true);
        let _ = self.periods_shutdown.send(true);

        for task in self.tasks {
            if let Err(error) = task.await {
                tracing::error!(error = %error, "Task ended abnormally");
            }
        }
        tracing::info!("Shutdown complete");
    }
}
