//! Accommodation read model.

use serde::{Deserialize, Serialize};
use stayflow_core::activity::{ActivityEvent, EventKind};
use stayflow_core::projection::ApplyOutcome;
use stayflow_core::stream::Sequence;
use chrono::NaiveDateTime;
use std::collections::HashMap;

/// Engagement metrics of one accommodation, folded from its activity stream.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AccommodationProjection {
    /// Accommodation id
    pub id: String,
    /// Total viewing time of closed sessions, in minutes
    pub on_screen_time: f64,
    /// Number of `UserJoined` events
    pub number_of_visits: u64,
    /// Number of `UserReserved` events
    pub number_of_reservations: u64,
    /// Number of `UserRated` events
    pub number_of_ratings: u64,
    /// Viewing sessions without a `UserLeft` yet, by correlation id
    pub open_sessions: HashMap<String, NaiveDateTime>,
    /// Highest sequence applied per event kind
    pub last_applied: HashMap<EventKind, Sequence>,
}

impl AccommodationProjection {
    /// Empty metrics for `id`.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            on_screen_time: 0.0,
            number_of_visits: 0,
            number_of_reservations: 0,
            number_of_ratings: 0,
            open_sessions: HashMap::new(),
            last_applied: HashMap::new(),
        }
    }

    /// Whether an event of `kind` at `sequence` was already folded in.
    #[must_use]
    pub fn has_applied(&self, kind: EventKind, sequence: Sequence) -> bool {
        self.last_applied
            .get(&kind)
            .is_some_and(|last| sequence <= *last)
    }

    /// Fold one event into the metrics.
    ///
    /// Events at or below the last applied sequence of their kind are ignored, which
    /// makes redelivery harmless. A `UserLeft` without a matching open session leaves
    /// the counters alone but still records its sequence.
    pub fn apply(&mut self, sequence: Sequence, event: &ActivityEvent) -> ApplyOutcome {
        let kind = event.kind();
        if self.has_applied(kind, sequence) {
            return ApplyOutcome::Duplicate;
        }

        let outcome = match event {
            ActivityEvent::UserJoined(joined) => {
                self.open_sessions
                    .insert(joined.correlation_id.clone(), joined.joined_at);
                self.number_of_visits += 1;
                ApplyOutcome::Applied
            },
            ActivityEvent::UserLeft(left) => {
                match self.open_sessions.remove(&left.correlation_id) {
                    Some(joined_at) => {
                        self.on_screen_time += minutes_between(joined_at, left.left_at);
                        ApplyOutcome::Applied
                    },
                    None => {
                        tracing::warn!(
                            accommodation_id = %self.id,
                            correlation_id = %left.correlation_id,
                            "UserLeft without an open session"
                        );
                        ApplyOutcome::Inconsistent
                    },
                }
            },
            ActivityEvent::UserReserved(_) => {
                self.number_of_reservations += 1;
                ApplyOutcome::Applied
            },
            ActivityEvent::UserRated(_) => {
                self.number_of_ratings += 1;
                ApplyOutcome::Applied
            },
        };

        self.last_applied.insert(kind, sequence);
        outcome
    }
}

#[allow(clippy::cast_precision_loss)] // Session lengths are far below 2^52 seconds
pub(crate) fn minutes_between(from: NaiveDateTime, to: NaiveDateTime) -> f64 {
    (to - from).num_seconds() as f64 / 60.0
}
