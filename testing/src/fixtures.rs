//! Builders for activity events used across test suites.

#![allow(clippy::unwrap_used)] // Fixtures parse hardcoded timestamps
#![allow(clippy::missing_panics_doc)]

use chrono::NaiveDateTime;
use stayflow_core::activity::{
    ActivityEvent, UserJoined, UserLeft, UserRated, UserReserved, parse_timestamp,
};

/// Parse a `%Y-%m-%d %H:%M` timestamp, panicking on typos.
#[must_use]
pub fn at(value: &str) -> NaiveDateTime {
    parse_timestamp(value).unwrap()
}

/// `UserJoined` for `accommodation` in viewing session `session`.
#[must_use]
pub fn joined(user: &str, accommodation: &str, session: &str, when: &str) -> ActivityEvent {
    ActivityEvent::UserJoined(UserJoined {
        user_id: user.to_string(),
        accommodation_id: accommodation.to_string(),
        correlation_id: session.to_string(),
        joined_at: at(when),
    })
}

/// `UserLeft` closing viewing session `session`.
#[must_use]
pub fn left(user: &str, accommodation: &str, session: &str, when: &str) -> ActivityEvent {
    ActivityEvent::UserLeft(UserLeft {
        user_id: user.to_string(),
        accommodation_id: accommodation.to_string(),
        correlation_id: session.to_string(),
        left_at: at(when),
    })
}

/// `UserReserved` for `accommodation`.
#[must_use]
pub fn reserved(user: &str, accommodation: &str, when: &str) -> ActivityEvent {
    ActivityEvent::UserReserved(UserReserved {
        user_id: user.to_string(),
        accommodation_id: accommodation.to_string(),
        reserved_at: at(when),
    })
}

/// `UserRated` for `accommodation`.
#[must_use]
pub fn rated(user: &str, accommodation: &str, when: &str) -> ActivityEvent {
    ActivityEvent::UserRated(UserRated {
        user_id: user.to_string(),
        accommodation_id: accommodation.to_string(),
        rated_at: at(when),
    })
}
