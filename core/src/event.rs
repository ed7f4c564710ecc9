//! Event trait, serialized wire form, and tag-keyed decoding.
//!
//! Events are facts about something that already happened; they are immutable once
//! appended to a stream. On the wire and in storage an event is a type tag plus an
//! opaque payload ([`SerializedEvent`]). Turning that back into a typed value goes
//! through a [`DecoderRegistry`]: an explicit table from tag to decoder function, so the
//! set of accepted tags is a value you can inspect rather than a string `match` hidden
//! in a consumer loop.
//!
//! # Design
//!
//! Payloads are encoded with `bincode`. Readers that need to inspect the log by hand
//! can decode through the registry.
//!
//! # Example
//!
//! ```
//! use stayflow_core::event::{DecoderRegistry, Event, SerializedEvent};
//! use serde::{Serialize, Deserialize};
//!
//! #[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
//! struct Pinged { id: u32 }
//!
//! impl Event for Pinged {
//!     fn event_type(&self) -> &'static str { "Pinged" }
//! }
//!
//! let registry = DecoderRegistry::new()
//!     .register("Pinged", |bytes| Pinged::from_bytes(bytes));
//!
//! let serialized = SerializedEvent::from_event(&Pinged { id: 1 }, None).unwrap();
//! let decoded = registry.decode(&serialized.event_type, &serialized.data).unwrap();
//! assert_eq!(decoded, Pinged { id: 1 });
//! ```

use serde::{Serialize, de::DeserializeOwned};
use std::collections::HashMap;
use std::fmt;
use thiserror::Error;

/// Error types for event operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EventError {
    /// Failed to serialize event to bytes.
    #[error("Failed to serialize event: {0}")]
    Serialization(String),

    /// Failed to deserialize event from bytes.
    #[error("Failed to deserialize event: {0}")]
    Deserialization(String),

    /// No decoder is registered for the tag.
    #[error("Unknown event type: {0}")]
    UnknownType(String),
}

/// An event that can be stored in an event store and replayed to rebuild state.
///
/// The `event_type()` string is stored next to the payload and selects the decoder
/// on the read side, so it must stay stable once events with it exist.
pub trait Event: Send + Sync + 'static {
    /// Returns the stable type tag for this event.
    fn event_type(&self) -> &'static str;

    /// Serialize this event to bincode bytes.
    ///
    /// # Errors
    ///
    /// Returns `EventError::Serialization` if the event cannot be serialized.
    fn to_bytes(&self) -> Result<Vec<u8>, EventError>
    where
        Self: Serialize,
    {
        bincode::serialize(self).map_err(|e| EventError::Serialization(e.to_string()))
    }

    /// Deserialize an event from bincode bytes.
    ///
    /// # Errors
    ///
    /// Returns `EventError::Deserialization` if the bytes are corrupted or belong to a
    /// different event type.
    fn from_bytes(bytes: &[u8]) -> Result<Self, EventError>
    where
        Self: DeserializeOwned + Sized,
    {
        bincode::deserialize(bytes).map_err(|e| EventError::Deserialization(e.to_string()))
    }
}

/// A serialized event ready for storage.
///
/// This struct contains the event type name and the serialized bytes,
/// along with optional metadata. It's used as the wire format between
/// the application and the event store.
#[derive(Clone, Debug, PartialEq)]
pub struct SerializedEvent {
    /// The event type tag (e.g., `"UserJoined"`).
    pub event_type: String,

    /// The bincode-serialized event data.
    pub data: Vec<u8>,

    /// Optional metadata in JSON format.
    ///
    /// The command-side writer records the originating user id here.
    pub metadata: Option<serde_json::Value>,
}

impl SerializedEvent {
    /// Create a new serialized event.
    #[must_use]
    pub const fn new(
        event_type: String,
        data: Vec<u8>,
        metadata: Option<serde_json::Value>,
    ) -> Self {
        Self {
            event_type,
            data,
            metadata,
        }
    }

    /// Create a serialized event from a typed event.
    ///
    /// # Errors
    ///
    /// Returns `EventError::Serialization` if the event cannot be serialized.
    pub fn from_event<E: Event + Serialize>(
        event: &E,
        metadata: Option<serde_json::Value>,
    ) -> Result<Self, EventError> {
        Ok(Self {
            event_type: event.event_type().to_string(),
            data: event.to_bytes()?,
            metadata,
        })
    }
}

impl fmt::Display for SerializedEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "SerializedEvent {{ type: {}, size: {} bytes }}",
            self.event_type,
            self.data.len()
        )
    }
}

/// Decoder function for one event tag.
pub type Decoder<E> = fn(&[u8]) -> Result<E, EventError>;

/// Explicit table from event type tag to decoder.
///
/// Consumers decode every delivered event through a registry. A tag that was never
/// registered yields [`EventError::UnknownType`], which consumers log and skip.
pub struct DecoderRegistry<E> {
    decoders: HashMap<&'static str, Decoder<E>>,
}

impl<E> DecoderRegistry<E> {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self {
            decoders: HashMap::new(),
        }
    }

    /// Register the decoder for `tag`, replacing any previous one.
    #[must_use]
    pub fn register(mut self, tag: &'static str, decoder: Decoder<E>) -> Self {
        self.decoders.insert(tag, decoder);
        self
    }

    /// Decode a payload by its tag.
    ///
    /// # Errors
    ///
    /// - [`EventError::UnknownType`] if no decoder is registered for `tag`
    /// - [`EventError::Deserialization`] if the decoder rejects the bytes
    pub fn decode(&self, tag: &str, bytes: &[u8]) -> Result<E, EventError> {
        let decoder = self
            .decoders
            .get(tag)
            .ok_or_else(|| EventError::UnknownType(tag.to_string()))?;
        decoder(bytes)
    }

    /// Whether a decoder exists for `tag`.
    #[must_use]
    pub fn knows(&self, tag: &str) -> bool {
        self.decoders.contains_key(tag)
    }

    /// Registered tags, sorted.
    #[must_use]
    pub fn tags(&self) -> Vec<&'static str> {
        let mut tags: Vec<_> = self.decoders.keys().copied().collect();
        tags.sort_unstable();
        tags
    }
}

impl<E> Default for DecoderRegistry<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E> fmt::Debug for DecoderRegistry<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DecoderRegistry")
            .field("tags", &self.tags())
            .finish()
    }
}
