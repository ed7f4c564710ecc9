//! Appends validated activity to the event store.

use crate::command::Command;
use crate::error::{Result, WriteError};
use stayflow_core::event_store::EventStore;
use stayflow_core::stream::Sequence;
use std::sync::Arc;

/// Turns commands into appended events.
///
/// One event per command, appended to the accommodation's stream. The originating user
/// id travels in the event metadata.
///
/// # Example
///
/// ```ignore
/// let writer = CommandWriter::new(Arc::new(InMemoryEventStore::new()));
/// let sequence = writer.handle(request.into()).await?;
/// ```
#[derive(Clone)]
pub struct CommandWriter {
    store: Arc<dyn EventStore>,
}

impl CommandWriter {
    /// Writer appending to `store`.
    #[must_use]
    pub fn new(store: Arc<dyn EventStore>) -> Self {
        Self { store }
    }

    /// Validate `command` and append its event.
    ///
    /// Returns the sequence the event was stored at. With a hint of zero or more the
    /// append only succeeds if the stream's last sequence equals the hint.
    ///
    /// # Errors
    ///
    /// - [`WriteError::Validation`]: malformed request; nothing was written
    /// - [`WriteError::Serialization`]: the event could not be encoded
    /// - [`WriteError::ConcurrencyConflict`]: the stream moved past the hint
    /// - [`WriteError::Transport`]: the store could not be reached
    #[tracing::instrument(skip(self, command), fields(command = %command))]
    pub async fn handle(&self, command: Command) -> Result<Sequence> {
        let name = command.name();
        let (stream_id, event, expected) = command.into_append().inspect_err(|error| {
            tracing::warn!(error = %error, "Rejected command");
            metrics::counter!("commands.rejected", "command" => name).increment(1);
        })?;

        let metadata = serde_json::json!({ "user_id": event.user_id() });
        let serialized = event
            .to_serialized(Some(metadata))
            .map_err(|error| WriteError::Serialization(error.to_string()))?;

        match self
            .store
            .append(stream_id.clone(), expected, vec![serialized])
            .await
        {
            Ok(sequence) => {
                tracing::debug!(%stream_id, %sequence, %expected, "Event appended");
                metrics::counter!("commands.appended", "command" => name).increment(1);
                Ok(sequence)
            },
            Err(error) => {
                let error = WriteError::from(error);
                match &error {
                    WriteError::ConcurrencyConflict { .. } => {
                        tracing::warn!(%stream_id, error = %error, "Append lost a race");
                    },
                    _ => tracing::error!(%stream_id, error = %error, "Append failed"),
                }
                metrics::counter!("commands.failed", "command" => name).increment(1);
                Err(error)
            },
        }
    }
}
