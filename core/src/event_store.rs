//! Event store trait and related types for event sourcing.
//!
//! An event store is an append-only log of streams with optimistic concurrency control.
//! Writers append; the store assigns sequence numbers; readers page through streams or
//! follow them through a persistent subscription (see [`crate::subscription`]).
//!
//! # Implementations
//!
//! - `PostgresEventStore` (in `stayflow-postgres`): Production implementation
//! - `InMemoryEventStore` (in `stayflow-testing`): Fast, deterministic testing
//!
//! # Example
//!
//! ```no_run
//! use stayflow_core::event_store::{EventStore, EventStoreError};
//! use stayflow_core::stream::{ExpectedSequence, Sequence, StreamId};
//!
//! async fn example(store: &dyn EventStore) -> Result<(), EventStoreError> {
//!     let stream_id = StreamId::for_accommodation("A1");
//!
//!     // Only append if nobody else wrote since we read sequence 3
//!     let events = vec![/* ... */];
//!     let last = store
//!         .append(stream_id.clone(), ExpectedSequence::Exact(Sequence::new(3)), events)
//!         .await?;
//!
//!     let page = store.read_stream(stream_id, Sequence::FIRST, 100).await?;
//!     Ok(())
//! }
//! ```

use crate::event::SerializedEvent;
use crate::stream::{ExpectedSequence, Sequence, StreamId};
use chrono::{DateTime, Utc};
use std::future::Future;
use std::pin::Pin;
use thiserror::Error;

/// Errors that can occur during event store operations.
#[derive(Error, Debug, Clone)]
pub enum EventStoreError {
    /// Optimistic concurrency conflict: the expectation does not match the stream.
    ///
    /// The stream was not modified. The caller must re-read and retry with a fresh
    /// expectation, never with the same one.
    #[error("Concurrency conflict on {stream_id}: expected {expected}, found {}", display_actual(*.actual))]
    ConcurrencyConflict {
        /// The stream ID where the conflict occurred.
        stream_id: StreamId,
        /// What the writer expected.
        expected: ExpectedSequence,
        /// The stream's actual last sequence (`None` for an empty stream).
        actual: Option<Sequence>,
    },

    /// Stream not found in the event store.
    #[error("Stream not found: {0}")]
    StreamNotFound(StreamId),

    /// The store could not be reached or the query failed.
    #[error("Transport error: {0}")]
    Transport(String),

    /// Serialization/deserialization error.
    #[error("Serialization error: {0}")]
    Serialization(String),
}

fn display_actual(actual: Option<Sequence>) -> String {
    actual.map_or_else(|| "empty stream".to_string(), |sequence| sequence.to_string())
}

impl EventStoreError {
    /// Whether the same call may succeed if simply retried later.
    ///
    /// Only transport failures qualify. A concurrency conflict needs a re-read first.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::Transport(_))
    }
}

/// An event as stored: its stream, assigned sequence, and payload.
#[derive(Clone, Debug, PartialEq)]
pub struct RecordedEvent {
    /// Stream the event belongs to
    pub stream_id: StreamId,
    /// Position inside the stream
    pub sequence: Sequence,
    /// Tag, payload and metadata
    pub event: SerializedEvent,
    /// When the store accepted the event
    pub recorded_at: DateTime<Utc>,
}

impl RecordedEvent {
    /// The event's type tag.
    #[must_use]
    pub fn event_type(&self) -> &str {
        &self.event.event_type
    }
}

/// Event store abstraction for storing and retrieving event streams.
///
/// # Thread Safety
///
/// Implementations must be `Send + Sync` to be safely used in async contexts
/// and shared across threads.
///
/// # Dyn Compatibility
///
/// This trait uses explicit `Pin<Box<dyn Future>>` returns instead of `async fn`
/// to enable trait object usage (`Arc<dyn EventStore>`).
pub trait EventStore: Send + Sync {
    /// Append events to a stream.
    ///
    /// Sequence numbers are assigned here: the first event of a new stream gets
    /// [`Sequence::FIRST`], each following event the next number.
    ///
    /// # Returns
    ///
    /// The sequence of the last appended event. For example, if the stream's last
    /// event was at 5 and you append 3 events, returns `Sequence(8)`.
    ///
    /// # Errors
    ///
    /// - `ConcurrencyConflict`: `expected` does not match; nothing was written
    /// - `Transport`: Database connection or query failed
    /// - `Serialization`: `events` is empty or could not be encoded
    fn append(
        &self,
        stream_id: StreamId,
        expected: ExpectedSequence,
        events: Vec<SerializedEvent>,
    ) -> Pin<Box<dyn Future<Output = Result<Sequence, EventStoreError>> + Send + '_>>;

    /// Read up to `max_count` events of a stream, starting at `from` (inclusive).
    ///
    /// Events come back ordered by sequence. A stream that does not exist reads as
    /// empty, not as an error.
    ///
    /// # Errors
    ///
    /// - `Transport`: Database connection or query failed
    fn read_stream(
        &self,
        stream_id: StreamId,
        from: Sequence,
        max_count: usize,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<RecordedEvent>, EventStoreError>> + Send + '_>>;

    /// The last sequence of a stream, or `None` if the stream is empty.
    ///
    /// # Errors
    ///
    /// - `Transport`: Database connection or query failed
    fn last_sequence(
        &self,
        stream_id: StreamId,
    ) -> Pin<Box<dyn Future<Output = Result<Option<Sequence>, EventStoreError>> + Send + '_>>;
}
