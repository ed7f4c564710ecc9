//! Event stream identification and sequencing types.
//!
//! A stream is the ordered, append-only log of one aggregate. This module defines the
//! stream name (`StreamId`), the position of an event inside its stream (`Sequence`),
//! and the optimistic-concurrency expectation a writer attaches to an append
//! (`ExpectedSequence`).

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Error type for `StreamId` parsing.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Invalid stream ID: {0}")]
pub struct ParseStreamIdError(String);

/// Unique identifier for an event stream (aggregate instance).
///
/// Each accommodation has its own stream, named `accommodation-{id}`
/// (see [`StreamId::for_accommodation`]).
///
/// # Validation
///
/// - `FromStr::from_str()`: Validates input (rejects empty strings)
/// - `From::from()` and `new()`: No validation (for internal use with trusted input)
///
/// # Examples
///
/// ```
/// use stayflow_core::stream::StreamId;
///
/// let stream_id = StreamId::for_accommodation("A1");
/// assert_eq!(stream_id.as_str(), "accommodation-A1");
///
/// let parsed: StreamId = "accommodation-B2".parse().unwrap();
/// assert_eq!(parsed.category(), "accommodation");
/// ```
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct StreamId(String);

impl StreamId {
    /// Stream category shared by all accommodation streams.
    pub const ACCOMMODATION_CATEGORY: &'static str = "accommodation";

    /// Create a new `StreamId` from a string.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// The stream holding every event of one accommodation.
    #[must_use]
    pub fn for_accommodation(accommodation_id: &str) -> Self {
        Self(format!("{}-{accommodation_id}", Self::ACCOMMODATION_CATEGORY))
    }

    /// Get the stream ID as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The category prefix (everything before the first `-`).
    ///
    /// Persistent subscriptions filter on the category so that one consumer group
    /// sees every accommodation stream.
    #[must_use]
    pub fn category(&self) -> &str {
        self.0.split_once('-').map_or(self.0.as_str(), |(category, _)| category)
    }

    /// Convert the `StreamId` into its inner `String`.
    #[must_use]
    pub fn into_inner(self) -> String {
        self.0
    }
}

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for StreamId {
    type Err = ParseStreamIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() {
            return Err(ParseStreamIdError("Stream ID cannot be empty".to_string()));
        }
        Ok(Self(s.to_string()))
    }
}

impl From<String> for StreamId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for StreamId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl AsRef<str> for StreamId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Position of an event inside its stream.
///
/// The first event of a stream has sequence 0 and every further event gets the next
/// number, with no gaps. Sequences are assigned by the event store, never by writers.
///
/// # Examples
///
/// ```
/// use stayflow_core::stream::Sequence;
///
/// let first = Sequence::FIRST;
/// assert_eq!(first.next(), Sequence::new(1));
/// assert_eq!(Sequence::new(5).value(), 5);
/// ```
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Sequence(u64);

impl Sequence {
    /// Sequence of the first event in a stream.
    pub const FIRST: Self = Self(0);

    /// Create a new `Sequence` with the given value.
    #[must_use]
    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    /// Get the sequence number.
    #[must_use]
    pub const fn value(self) -> u64 {
        self.0
    }

    /// The sequence that follows this one.
    #[must_use]
    pub const fn next(self) -> Self {
        Self(self.0 + 1)
    }

    /// Whether this is the first position of a stream.
    #[must_use]
    pub const fn is_first(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for Sequence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for Sequence {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

impl From<Sequence> for u64 {
    fn from(sequence: Sequence) -> Self {
        sequence.0
    }
}

impl std::ops::Add<u64> for Sequence {
    type Output = Self;

    fn add(self, rhs: u64) -> Self::Output {
        Self(self.0 + rhs)
    }
}

/// What the writer expects the stream to look like before its append.
///
/// | variant | append succeeds when |
/// |---|---|
/// | `Any` | always (no check) |
/// | `NoStream` | the stream has no events yet |
/// | `Exact(n)` | the stream's last sequence is exactly `n` |
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExpectedSequence {
    /// Unconditional append
    #[default]
    Any,
    /// The stream must be empty
    NoStream,
    /// The stream's last event must have this sequence
    Exact(Sequence),
}

impl ExpectedSequence {
    /// Interpret a signed hint as sent over the command boundary.
    ///
    /// Negative values (conventionally `-1`) mean "no check".
    ///
    /// ```
    /// use stayflow_core::stream::{ExpectedSequence, Sequence};
    ///
    /// assert_eq!(ExpectedSequence::from_hint(-1), ExpectedSequence::Any);
    /// assert_eq!(ExpectedSequence::from_hint(5), ExpectedSequence::Exact(Sequence::new(5)));
    /// ```
    #[must_use]
    pub fn from_hint(hint: i64) -> Self {
        u64::try_from(hint).map_or(Self::Any, |value| Self::Exact(Sequence::new(value)))
    }

    /// Whether this expectation requires a check at all.
    #[must_use]
    pub const fn is_conditional(self) -> bool {
        !matches!(self, Self::Any)
    }

    /// Check the expectation against the stream's current last sequence.
    #[must_use]
    pub fn matches(self, current: Option<Sequence>) -> bool {
        match self {
            Self::Any => true,
            Self::NoStream => current.is_none(),
            Self::Exact(expected) => current == Some(expected),
        }
    }
}

impl fmt::Display for ExpectedSequence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Any => write!(f, "any"),
            Self::NoStream => write!(f, "no stream"),
            Self::Exact(sequence) => write!(f, "{sequence}"),
        }
    }
}
