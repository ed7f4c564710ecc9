//! Command-side error types.

use stayflow_core::event_store::EventStoreError;
use stayflow_core::stream::{ExpectedSequence, Sequence, StreamId};
use thiserror::Error;

/// Errors returned by [`CommandWriter::handle`](crate::writer::CommandWriter::handle).
#[derive(Error, Debug, Clone, PartialEq)]
pub enum WriteError {
    /// The request was malformed
    #[error("Invalid {field}: {reason}")]
    Validation {
        /// Offending request field, as named on the wire
        field: &'static str,
        /// What is wrong with it
        reason: String,
    },

    /// The event could not be encoded
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// The stream moved past the caller's expected sequence
    #[error("Concurrency conflict on stream {stream_id}: expected {expected}, found {actual:?}")]
    ConcurrencyConflict {
        /// Stream the append targeted
        stream_id: StreamId,
        /// What the caller expected
        expected: ExpectedSequence,
        /// Last sequence actually in the stream
        actual: Option<Sequence>,
    },

    /// The event store could not be reached
    #[error("Event store unavailable: {0}")]
    Transport(String),
}

impl WriteError {
    pub(crate) fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        Self::Validation {
            field,
            reason: reason.into(),
        }
    }

    /// Whether repeating the same call may succeed.
    ///
    /// A conflict is not retryable as-is: the caller has to re-read the stream and
    /// decide again.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::Transport(_))
    }

    /// HTTP status the boundary should answer with.
    #[must_use]
    pub const fn status_code(&self) -> u16 {
        match self {
            Self::Validation { .. } | Self::Serialization(_) => 400,
            Self::ConcurrencyConflict { .. } => 409,
            Self::Transport(_) => 503,
        }
    }
}

impl From<EventStoreError> for WriteError {
    fn from(error: EventStoreError) -> Self {
        match error {
            EventStoreError::ConcurrencyConflict {
                stream_id,
                expected,
                actual,
            } => Self::ConcurrencyConflict {
                stream_id,
                expected,
                actual,
            },
            EventStoreError::Serialization(message) => Self::Serialization(message),
            EventStoreError::StreamNotFound(stream_id) => {
                Self::Transport(format!("stream {stream_id} not found"))
            },
            EventStoreError::Transport(message) => Self::Transport(message),
        }
    }
}

/// Result alias for command handling.
pub type Result<T> = std::result::Result<T, WriteError>;
