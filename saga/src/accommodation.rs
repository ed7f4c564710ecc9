//! Terminal side of the saga: applies the orchestrator's verdict to the accommodation.
//!
//! Listens on the command subject in its own queue group. `UpdateAccommodation`
//! approves the accommodation; `DenyAccommodation` and `RollbackAccommodation` deny
//! it. Other commands belong to other participants and are ignored.

use crate::dispatch::{self, DispatchTable};
use crate::error::Result;
use crate::messages::{Command, CommandType};
use stayflow_core::channel::MessageChannel;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Storage for accommodation status.
pub trait AccommodationRepository: Send + Sync {
    /// Mark the accommodation as approved.
    ///
    /// # Errors
    ///
    /// Returns [`SagaError::Repository`](crate::error::SagaError::Repository) on failure.
    fn approve(&self, accommodation_id: String)
    -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>>;

    /// Mark the accommodation as denied.
    ///
    /// # Errors
    ///
    /// Returns [`SagaError::Repository`](crate::error::SagaError::Repository) on failure.
    fn deny(&self, accommodation_id: String)
    -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>>;
}

/// Accommodation handler settings.
#[derive(Clone, Debug)]
pub struct AccommodationHandlerConfig {
    /// Subject commands arrive on
    pub command_subject: String,
    /// Queue group of the command subscription
    pub queue_group: String,
}

impl Default for AccommodationHandlerConfig {
    fn default() -> Self {
        Self {
            command_subject: "create-accommodation.command".to_string(),
            queue_group: "accommodations-service".to_string(),
        }
    }
}

/// Approves or denies accommodations as the saga decides.
pub struct AccommodationHandler {
    channel: Arc<dyn MessageChannel>,
    repository: Arc<dyn AccommodationRepository>,
    config: AccommodationHandlerConfig,
}

impl AccommodationHandler {
    /// Handler writing to `repository`.
    #[must_use]
    pub fn new(
        channel: Arc<dyn MessageChannel>,
        repository: Arc<dyn AccommodationRepository>,
        config: AccommodationHandlerConfig,
    ) -> Self {
        Self {
            channel,
            repository,
            config,
        }
    }

    /// Apply one command.
    ///
    /// Repository failures are logged and swallowed.
    pub async fn handle(&self, command: Command) {
        let accommodation_id = command.payload.accommodation_id.clone();
        let (action, result) = match command.kind {
            CommandType::UpdateAccommodation => {
                ("approve", self.repository.approve(accommodation_id.clone()).await)
            },
            CommandType::DenyAccommodation | CommandType::RollbackAccommodation => {
                ("deny", self.repository.deny(accommodation_id.clone()).await)
            },
            other => {
                tracing::debug!(kind = %other, "Command is not for the accommodation handler");
                return;
            },
        };

        match result {
            Ok(()) => {
                tracing::info!(
                    %accommodation_id,
                    correlation_id = %command.correlation_id,
                    kind = %command.kind,
                    action,
                    "Accommodation updated"
                );
                metrics::counter!("saga.accommodations", "action" => action).increment(1);
            },
            Err(error) => {
                tracing::error!(
                    %accommodation_id,
                    correlation_id = %command.correlation_id,
                    kind = %command.kind,
                    action,
                    error = %error,
                    "Failed to update accommodation"
                );
                metrics::counter!("saga.accommodations.failed", "action" => action).increment(1);
            },
        }
    }

    /// Subscribe to the command subject and handle commands until shutdown.
    ///
    /// # Errors
    ///
    /// Returns [`SagaError::Channel`](crate::error::SagaError::Channel) if the
    /// subscription cannot be registered.
    pub async fn listen(self: &Arc<Self>, shutdown: watch::Receiver<bool>) -> Result<JoinHandle<()>> {
        let mut builder = DispatchTable::builder();
        for kind in [
            CommandType::UpdateAccommodation,
            CommandType::DenyAccommodation,
            CommandType::RollbackAccommodation,
        ] {
            let handler = Arc::clone(self);
            builder = builder.on(kind, move |command: Command| {
                let handler = Arc::clone(&handler);
                async move {
                    handler.handle(command).await;
                    Ok(())
                }
            });
        }
        let table = builder
            .fallback(|command: Command| async move {
                tracing::debug!(kind = %command.kind, "Ignoring command");
                Ok(())
            })
            .build(&[
                CommandType::UpdateAccommodation,
                CommandType::DenyAccommodation,
                CommandType::RollbackAccommodation,
            ])?;

        let commands = self
            .channel
            .subscribe(&self.config.command_subject, &self.config.queue_group)
            .await?;

        tracing::info!(
            subject = %self.config.command_subject,
            group = %self.config.queue_group,
            "Accommodation handler listening for commands"
        );
        Ok(tokio::spawn(dispatch::serve(commands, Arc::new(table), shutdown)))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::error::SagaError;
    use crate::messages::{AccommodationAvailability, CorrelationId};
    use stayflow_testing::InMemoryChannel;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingRepository {
        calls: Mutex<Vec<(String, String)>>,
        failing: bool,
    }

    impl RecordingRepository {
        fn record(&self, action: &str, id: String) -> Result<()> {
            if self.failing {
                return Err(SagaError::Repository("offline".to_string()));
            }
            self.calls.lock().unwrap().push((action.to_string(), id));
            Ok(())
        }
    }

    impl AccommodationRepository for RecordingRepository {
        fn approve(
            &self,
            accommodation_id: String,
        ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
            Box::pin(async move { self.record("approve", accommodation_id) })
        }

        fn deny(
            &self,
            accommodation_id: String,
        ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
            Box::pin(async move { self.record("deny", accommodation_id) })
        }
    }

    fn command(kind: CommandType) -> Command {
        Command::new(
            kind,
            AccommodationAvailability {
                accommodation_id: "A1".to_string(),
                ..AccommodationAvailability::default()
            },
            CorrelationId::new(),
        )
    }

    fn handler(repository: Arc<RecordingRepository>) -> AccommodationHandler {
        AccommodationHandler::new(
            Arc::new(InMemoryChannel::new()),
            repository,
            AccommodationHandlerConfig::default(),
        )
    }

    #[tokio::test]
    async fn verdicts_map_to_repository_calls() {
        let repository = Arc::new(RecordingRepository::default());
        let handler = handler(Arc::clone(&repository));

        handler.handle(command(CommandType::UpdateAccommodation)).await;
        handler.handle(command(CommandType::RollbackAccommodation)).await;
        handler.handle(command(CommandType::DenyAccommodation)).await;
        handler.handle(command(CommandType::CreateAvailability)).await;

        let calls = repository.calls.lock().unwrap().clone();
        assert_eq!(
            calls,
            vec![
                ("approve".to_string(), "A1".to_string()),
                ("deny".to_string(), "A1".to_string()),
                ("deny".to_string(), "A1".to_string()),
            ]
        );
    }

    #[tokio::test]
    async fn repository_failure_is_swallowed() {
        let repository = Arc::new(RecordingRepository {
            failing: true,
            ..RecordingRepository::default()
        });

        handler(Arc::clone(&repository))
            .handle(command(CommandType::UpdateAccommodation))
            .await;

        assert!(repository.calls.lock().unwrap().is_empty());
    }
}
