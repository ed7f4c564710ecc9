//! The closed set of commands the writer accepts.

use crate::error::Result;
use crate::request::{UserJoinedRequest, UserLeftRequest, UserRatedRequest, UserReservedRequest};
use stayflow_core::activity::ActivityEvent;
use stayflow_core::stream::{ExpectedSequence, StreamId};
use std::fmt;

/// A user-activity command.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Command {
    /// Record a page open
    UserJoined(UserJoinedRequest),
    /// Record a page close
    UserLeft(UserLeftRequest),
    /// Record a reservation
    UserReserved(UserReservedRequest),
    /// Record a rating
    UserRated(UserRatedRequest),
}

impl Command {
    /// Name used in logs and metrics.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::UserJoined(_) => "UserJoined",
            Self::UserLeft(_) => "UserLeft",
            Self::UserReserved(_) => "UserReserved",
            Self::UserRated(_) => "UserRated",
        }
    }

    /// Raw expected-sequence hint; negative means none.
    #[must_use]
    pub const fn expected_sequence(&self) -> i64 {
        match self {
            Self::UserJoined(r) => r.expected_sequence,
            Self::UserLeft(r) => r.expected_sequence,
            Self::UserReserved(r) => r.expected_sequence,
            Self::UserRated(r) => r.expected_sequence,
        }
    }

    /// Validate and turn the command into what gets appended: target stream, event, and
    /// the expectation the append is conditioned on.
    ///
    /// # Errors
    ///
    /// Returns [`WriteError::Validation`](crate::error::WriteError::Validation) if the
    /// request is malformed.
    pub fn into_append(self) -> Result<(StreamId, ActivityEvent, ExpectedSequence)> {
        let expected = ExpectedSequence::from_hint(self.expected_sequence());
        let event: ActivityEvent = match self {
            Self::UserJoined(request) => request.validate()?.into(),
            Self::UserLeft(request) => request.validate()?.into(),
            Self::UserReserved(request) => request.validate()?.into(),
            Self::UserRated(request) => request.validate()?.into(),
        };
        Ok((event.stream_id(), event, expected))
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

macro_rules! command_from {
    ($($variant:ident => $request:ty),+ $(,)?) => {
        $(
            impl From<$request> for Command {
                fn from(request: $request) -> Self {
                    Self::$variant(request)
                }
            }
        )+
    };
}

command_from!(
    UserJoined => UserJoinedRequest,
    UserLeft => UserLeftRequest,
    UserReserved => UserReservedRequest,
    UserRated => UserRatedRequest,
);

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::request::NO_EXPECTATION;
    use stayflow_core::activity::EventKind;
    use stayflow_core::stream::Sequence;

    fn reserved(hint: i64) -> Command {
        UserReservedRequest {
            user_id: "u1".to_string(),
            accommodation_id: "A1".to_string(),
            reserved_at: "2024-01-01 10:00".to_string(),
            expected_sequence: hint,
        }
        .into()
    }

    #[test]
    fn append_targets_the_accommodation_stream() {
        let (stream, event, expected) = reserved(NO_EXPECTATION).into_append().unwrap();

        assert_eq!(stream, StreamId::for_accommodation("A1"));
        assert_eq!(event.kind(), EventKind::UserReserved);
        assert_eq!(expected, ExpectedSequence::Any);
    }

    #[test]
    fn non_negative_hint_becomes_exact() {
        let (_, _, expected) = reserved(0).into_append().unwrap();
        assert_eq!(expected, ExpectedSequence::Exact(Sequence::FIRST));
    }

    #[test]
    fn name_matches_event_tag() {
        let command = reserved(NO_EXPECTATION);
        let name = command.name();
        let (_, event, _) = command.into_append().unwrap();
        assert_eq!(name, event.kind().tag());
    }
}
