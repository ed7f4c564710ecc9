//! User activity events recorded against accommodations.
//!
//! These are the facts the metrics pipeline is built from: a user opened an
//! accommodation page, left it, reserved it, or rated it. [`ActivityEvent`] is the closed
//! set of variants; [`ActivityEvent::registry`] is the decoder table consumers use to
//! turn stored payloads back into variants.
//!
//! Every event is appended to its accommodation's stream
//! ([`StreamId::for_accommodation`]).

use crate::event::{DecoderRegistry, Event, EventError, SerializedEvent};
use crate::stream::StreamId;
use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Timestamp layout used at the command boundary, e.g. `2024-01-01 10:30`.
pub const TIME_LAYOUT: &str = "%Y-%m-%d %H:%M";

/// Parse a boundary timestamp.
///
/// # Errors
///
/// Returns the `chrono` parse error if `value` does not follow [`TIME_LAYOUT`].
///
/// ```
/// use stayflow_core::activity::parse_timestamp;
///
/// assert!(parse_timestamp("2024-01-01 10:30").is_ok());
/// assert!(parse_timestamp("01/01/2024").is_err());
/// ```
pub fn parse_timestamp(value: &str) -> Result<NaiveDateTime, chrono::ParseError> {
    NaiveDateTime::parse_from_str(value, TIME_LAYOUT)
}

/// Format a timestamp with [`TIME_LAYOUT`].
#[must_use]
pub fn format_timestamp(value: &NaiveDateTime) -> String {
    value.format(TIME_LAYOUT).to_string()
}

/// Kind of an activity event; also its stored type tag.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum EventKind {
    /// A user opened an accommodation
    UserJoined,
    /// A user closed an accommodation
    UserLeft,
    /// A user reserved an accommodation
    UserReserved,
    /// A user rated an accommodation
    UserRated,
}

impl EventKind {
    /// All kinds, in declaration order.
    pub const ALL: [Self; 4] = [
        Self::UserJoined,
        Self::UserLeft,
        Self::UserReserved,
        Self::UserRated,
    ];

    /// Stored type tag.
    #[must_use]
    pub const fn tag(self) -> &'static str {
        match self {
            Self::UserJoined => "UserJoined",
            Self::UserLeft => "UserLeft",
            Self::UserReserved => "UserReserved",
            Self::UserRated => "UserRated",
        }
    }

    /// Look a kind up by its tag.
    #[must_use]
    pub fn from_tag(tag: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.tag() == tag)
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tag())
    }
}

/// A user opened an accommodation page, starting a viewing session.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserJoined {
    /// Who
    pub user_id: String,
    /// Which accommodation
    pub accommodation_id: String,
    /// Session id pairing this event with its `UserLeft`
    pub correlation_id: String,
    /// When
    pub joined_at: NaiveDateTime,
}

/// A user left an accommodation page, closing a viewing session.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserLeft {
    /// Who
    pub user_id: String,
    /// Which accommodation
    pub accommodation_id: String,
    /// Session id of the matching `UserJoined`
    pub correlation_id: String,
    /// When
    pub left_at: NaiveDateTime,
}

/// A user reserved an accommodation.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserReserved {
    /// Who
    pub user_id: String,
    /// Which accommodation
    pub accommodation_id: String,
    /// When
    pub reserved_at: NaiveDateTime,
}

/// A user rated an accommodation.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserRated {
    /// Who
    pub user_id: String,
    /// Which accommodation
    pub accommodation_id: String,
    /// When
    pub rated_at: NaiveDateTime,
}

macro_rules! activity_event {
    ($($variant:ident),+ $(,)?) => {
        $(
            impl Event for $variant {
                fn event_type(&self) -> &'static str {
                    EventKind::$variant.tag()
                }
            }

            impl From<$variant> for ActivityEvent {
                fn from(event: $variant) -> Self {
                    Self::$variant(event)
                }
            }
        )+
    };
}

activity_event!(UserJoined, UserLeft, UserReserved, UserRated);

/// Closed set of activity events.
///
/// Adding a variant forces every `match` over it (the projector, the registry, the
/// command writer) to handle the new kind.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ActivityEvent {
    /// See [`UserJoined`]
    UserJoined(UserJoined),
    /// See [`UserLeft`]
    UserLeft(UserLeft),
    /// See [`UserReserved`]
    UserReserved(UserReserved),
    /// See [`UserRated`]
    UserRated(UserRated),
}

impl ActivityEvent {
    /// Kind of this event.
    #[must_use]
    pub const fn kind(&self) -> EventKind {
        match self {
            Self::UserJoined(_) => EventKind::UserJoined,
            Self::UserLeft(_) => EventKind::UserLeft,
            Self::UserReserved(_) => EventKind::UserReserved,
            Self::UserRated(_) => EventKind::UserRated,
        }
    }

    /// Accommodation the event concerns.
    #[must_use]
    pub fn accommodation_id(&self) -> &str {
        match self {
            Self::UserJoined(e) => &e.accommodation_id,
            Self::UserLeft(e) => &e.accommodation_id,
            Self::UserReserved(e) => &e.accommodation_id,
            Self::UserRated(e) => &e.accommodation_id,
        }
    }

    /// When the user acted.
    #[must_use]
    pub const fn occurred_at(&self) -> NaiveDateTime {
        match self {
            Self::UserJoined(e) => e.joined_at,
            Self::UserLeft(e) => e.left_at,
            Self::UserReserved(e) => e.reserved_at,
            Self::UserRated(e) => e.rated_at,
        }
    }

    /// User who caused the event.
    #[must_use]
    pub fn user_id(&self) -> &str {
        match self {
            Self::UserJoined(e) => &e.user_id,
            Self::UserLeft(e) => &e.user_id,
            Self::UserReserved(e) => &e.user_id,
            Self::UserRated(e) => &e.user_id,
        }
    }

    /// Stream the event is appended to.
    #[must_use]
    pub fn stream_id(&self) -> StreamId {
        StreamId::for_accommodation(self.accommodation_id())
    }

    /// Encode into the stored form.
    ///
    /// # Errors
    ///
    /// Returns `EventError::Serialization` if the payload cannot be encoded.
    pub fn to_serialized(
        &self,
        metadata: Option<serde_json::Value>,
    ) -> Result<SerializedEvent, EventError> {
        match self {
            Self::UserJoined(e) => SerializedEvent::from_event(e, metadata),
            Self::UserLeft(e) => SerializedEvent::from_event(e, metadata),
            Self::UserReserved(e) => SerializedEvent::from_event(e, metadata),
            Self::UserRated(e) => SerializedEvent::from_event(e, metadata),
        }
    }

    /// Decoder table for every activity event kind.
    #[must_use]
    pub fn registry() -> DecoderRegistry<Self> {
        DecoderRegistry::new()
            .register(EventKind::UserJoined.tag(), |bytes| {
                UserJoined::from_bytes(bytes).map(Self::UserJoined)
            })
            .register(EventKind::UserLeft.tag(), |bytes| {
                UserLeft::from_bytes(bytes).map(Self::UserLeft)
            })
            .register(EventKind::UserReserved.tag(), |bytes| {
                UserReserved::from_bytes(bytes).map(Self::UserReserved)
            })
            .register(EventKind::UserRated.tag(), |bytes| {
                UserRated::from_bytes(bytes).map(Self::UserRated)
            })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn at(value: &str) -> NaiveDateTime {
        parse_timestamp(value).unwrap()
    }

    #[test]
    fn registry_covers_every_kind() {
        let registry = ActivityEvent::registry();
        for kind in EventKind::ALL {
            assert!(registry.knows(kind.tag()), "missing decoder for {kind}");
        }
    }

    #[test]
    fn stored_event_decodes_to_same_variant() {
        let event = ActivityEvent::from(UserLeft {
            user_id: "u1".into(),
            accommodation_id: "A1".into(),
            correlation_id: "S1".into(),
            left_at: at("2024-01-01 10:30"),
        });

        let stored = event.to_serialized(None).unwrap();
        assert_eq!(stored.event_type, "UserLeft");

        let decoded = ActivityEvent::registry()
            .decode(&stored.event_type, &stored.data)
            .unwrap();
        assert_eq!(decoded, event);
        assert_eq!(decoded.stream_id(), StreamId::for_accommodation("A1"));
    }

    #[test]
    fn payload_under_wrong_tag_is_rejected() {
        let joined = UserReserved {
            user_id: "u1".into(),
            accommodation_id: "A1".into(),
            reserved_at: at("2024-01-01 10:00"),
        };
        let bytes = joined.to_bytes().unwrap();

        // A reserved payload is too short to be a joined one
        assert!(
            ActivityEvent::registry()
                .decode(EventKind::UserJoined.tag(), &bytes)
                .is_err()
        );
    }

    #[test]
    fn kinds_round_trip_through_tags() {
        for kind in EventKind::ALL {
            assert_eq!(EventKind::from_tag(kind.tag()), Some(kind));
        }
        assert_eq!(EventKind::from_tag("UserDeleted"), None);
    }

    #[test]
    fn timestamps_use_minute_layout() {
        let parsed = at("2024-01-01 10:00");
        assert_eq!(format_timestamp(&parsed), "2024-01-01 10:00");
        assert!(parse_timestamp("2024-01-01T10:00:00").is_err());
    }
}
