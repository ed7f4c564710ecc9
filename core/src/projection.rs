//! Projection system for building and maintaining read models from events.
//!
//! # Overview
//!
//! Projections are the **query side of CQRS**. The command side appends events to the
//! event store; a persistent subscription delivers them to a projection, which folds
//! them into a read model optimised for queries.
//!
//! ```text
//! Write Side:                  Read Side:
//! ┌─────────────────┐         ┌──────────────────────┐
//! │  Event Store    │         │  Projection Store    │
//! │  accommodation-*│         │  per accommodation   │
//! └────────┬────────┘         └──────────────────────┘
//!          │ persistent                 ▲
//!          │ subscription               │ apply_event
//!          ▼                            │
//! ┌──────────────────────────────────────┐
//! │        Event Stream Consumer         │
//! └──────────────────────────────────────┘
//! ```
//!
//! ## Delivery guarantees a projection must cope with
//!
//! - **At-least-once**: the same event may arrive twice; applying it again must not
//!   change the result
//! - **Per-stream order only**: events of different streams may interleave arbitrarily

use crate::stream::Sequence;
use std::future::Future;

/// Error type for projection operations.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ProjectionError {
    /// Storage backend error
    #[error("Storage error: {0}")]
    Storage(String),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Event processing error
    #[error("Event processing error: {0}")]
    EventProcessing(String),

    /// Replaying the source stream failed
    #[error("Rebuild error: {0}")]
    Rebuild(String),
}

/// Result type for projection operations.
pub type Result<T> = std::result::Result<T, ProjectionError>;

/// What applying one event did to the read model.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// The read model changed
    Applied,
    /// The event was already reflected (redelivery); nothing changed
    Duplicate,
    /// The event could not be matched to existing state; nothing changed
    Inconsistent,
}

/// A projection builds and maintains a read model from events.
///
/// # Idempotency
///
/// `apply_event` receives the event's sequence in its stream so that implementations
/// can recognise redeliveries and answer [`ApplyOutcome::Duplicate`].
pub trait Projection: Send + Sync {
    /// The decoded event type this projection consumes.
    type Event: Send + Sync;

    /// Projection name, used in logs and metrics.
    fn name(&self) -> &str;

    /// Apply one event.
    ///
    /// # Errors
    ///
    /// Returns [`ProjectionError`] if the read model cannot be updated. The consumer
    /// hands the event back to the broker for redelivery.
    fn apply_event(
        &self,
        sequence: Sequence,
        event: &Self::Event,
    ) -> impl Future<Output = Result<ApplyOutcome>> + Send;

    /// Drop all state so the projection can be replayed from scratch.
    ///
    /// Default implementation is a no-op.
    ///
    /// # Errors
    ///
    /// Returns [`ProjectionError`] if rebuild fails.
    fn rebuild(&self) -> impl Future<Output = Result<()>> + Send {
        async { Ok(()) }
    }
}
