//! Daily and monthly activity reports.
//!
//! Every event is counted in the day and the month of its own timestamp. A viewing
//! session adds a visit to the period it opened in and its minutes to the period it
//! closed in, so a session across midnight is never counted twice.
//!
//! Sequence guards and open sessions are kept once per accommodation, beside the
//! periods, so a redelivered event is recognized whichever period it fell in.
//!
//! ```text
//! PeriodReport "A1"
//!   Daily   2024-01-01 ─► visits 2, on screen 30.0
//!           2024-01-02 ─► reservations 1
//!   Monthly 2024-01-01 ─► visits 2, on screen 30.0, reservations 1
//! ```

use crate::model::minutes_between;
use crate::projector::replay_stream;
use crate::store::{PeriodStore, StoreError};
use chrono::{Datelike, NaiveDate, NaiveDateTime};
use serde::{Deserialize, Serialize};
use stayflow_core::activity::{ActivityEvent, EventKind};
use stayflow_core::event_store::EventStore;
use stayflow_core::projection::{ApplyOutcome, Projection, ProjectionError, Result};
use stayflow_core::stream::Sequence;
use std::collections::{BTreeMap, HashMap};
use std::fmt;

/// Length of a reporting window.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ReportingPeriod {
    /// One calendar day
    Daily,
    /// One calendar month
    Monthly,
}

impl ReportingPeriod {
    /// Every period, shortest first.
    pub const ALL: [Self; 2] = [Self::Daily, Self::Monthly];

    /// First day of the period containing `day`.
    #[must_use]
    pub fn start_of(self, day: NaiveDate) -> NaiveDate {
        match self {
            Self::Daily => day,
            Self::Monthly => day.with_day(1).unwrap_or(day),
        }
    }

    /// Lowercase name, used as a metrics label.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Daily => "daily",
            Self::Monthly => "monthly",
        }
    }
}

impl fmt::Display for ReportingPeriod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Counters of one accommodation in one reporting window.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PeriodMetrics {
    /// Window length
    pub period: ReportingPeriod,
    /// First day of the window
    pub period_start: NaiveDate,
    /// Minutes of sessions that closed in the window
    pub on_screen_time: f64,
    /// Sessions opened in the window
    pub number_of_visits: u64,
    /// Reservations made in the window
    pub number_of_reservations: u64,
    /// Ratings given in the window
    pub number_of_ratings: u64,
}

impl PeriodMetrics {
    /// Zeroed counters for the window starting at `period_start`.
    #[must_use]
    pub const fn new(period: ReportingPeriod, period_start: NaiveDate) -> Self {
        Self {
            period,
            period_start,
            on_screen_time: 0.0,
            number_of_visits: 0,
            number_of_reservations: 0,
            number_of_ratings: 0,
        }
    }
}

/// Every reporting window of one accommodation.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PeriodReport {
    /// Accommodation id
    pub id: String,
    /// Windows by length, then by first day
    pub periods: BTreeMap<ReportingPeriod, BTreeMap<NaiveDate, PeriodMetrics>>,
    /// Viewing sessions without a `UserLeft` yet, by correlation id
    pub open_sessions: HashMap<String, NaiveDateTime>,
    /// Highest sequence applied per event kind
    pub last_applied: HashMap<EventKind, Sequence>,
}

impl PeriodReport {
    /// Report without any window.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            periods: BTreeMap::new(),
            open_sessions: HashMap::new(),
            last_applied: HashMap::new(),
        }
    }

    /// Counters of the `period` window containing `day`.
    #[must_use]
    pub fn metrics(&self, period: ReportingPeriod, day: NaiveDate) -> Option<&PeriodMetrics> {
        self.periods
            .get(&period)
            .and_then(|windows| windows.get(&period.start_of(day)))
    }

    /// Every window of one length, oldest first.
    #[must_use]
    pub fn history(&self, period: ReportingPeriod) -> Vec<PeriodMetrics> {
        self.periods
            .get(&period)
            .map(|windows| windows.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Fold one event into the windows of its timestamp.
    ///
    /// Same guard as the lifetime metrics: an event at or below the last applied
    /// sequence of its kind is a duplicate.
    pub fn apply(&mut self, sequence: Sequence, event: &ActivityEvent) -> ApplyOutcome {
        let kind = event.kind();
        if self
            .last_applied
            .get(&kind)
            .is_some_and(|last| sequence <= *last)
        {
            return ApplyOutcome::Duplicate;
        }

        let day = event.occurred_at().date();
        let outcome = match event {
            ActivityEvent::UserJoined(joined) => {
                self.open_sessions
                    .insert(joined.correlation_id.clone(), joined.joined_at);
                self.for_each_window(day, |window| window.number_of_visits += 1);
                ApplyOutcome::Applied
            },
            ActivityEvent::UserLeft(left) => match self.open_sessions.remove(&left.correlation_id) {
                Some(joined_at) => {
                    let minutes = minutes_between(joined_at, left.left_at);
                    self.for_each_window(day, |window| window.on_screen_time += minutes);
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
            },
            ActivityEvent::UserReserved(_) => {
                self.for_each_window(day, |window| window.number_of_reservations += 1);
                ApplyOutcome::Applied
            },
            ActivityEvent::UserRated(_) => {
                self.for_each_window(day, |window| window.number_of_ratings += 1);
                ApplyOutcome::Applied
            },
        };

        self.last_applied.insert(kind, sequence);
        outcome
    }

    fn for_each_window(&mut self, day: NaiveDate, mut update: impl FnMut(&mut PeriodMetrics)) {
        for period in ReportingPeriod::ALL {
            let start = period.start_of(day);
            let window = self
                .periods
                .entry(period)
                .or_default()
                .entry(start)
                .or_insert_with(|| PeriodMetrics::new(period, start));
            update(window);
        }
    }
}

/// Folds activity events into [`PeriodStore`].
#[derive(Clone)]
pub struct PeriodProjector {
    store: PeriodStore,
}

impl PeriodProjector {
    /// Project into `store`.
    #[must_use]
    pub const fn new(store: PeriodStore) -> Self {
        Self { store }
    }

    /// The store this projector writes to.
    #[must_use]
    pub const fn store(&self) -> &PeriodStore {
        &self.store
    }

    /// Recompute every window of one accommodation from its stream.
    ///
    /// # Errors
    ///
    /// Returns [`ProjectionError::Rebuild`] if the stream cannot be read or an event
    /// cannot be decoded.
    #[tracing::instrument(skip(self, event_store))]
    pub async fn rebuild_accommodation(
        &self,
        event_store: &dyn EventStore,
        accommodation_id: &str,
    ) -> Result<PeriodReport> {
        let mut report = PeriodReport::new(accommodation_id);
        replay_stream(event_store, accommodation_id, |sequence, event| {
            report.apply(sequence, event);
        })
        .await?;

        self.store.upsert(report.clone()).await;
        tracing::info!(
            accommodation_id,
            days = report.history(ReportingPeriod::Daily).len(),
            "Period report rebuilt from event store"
        );
        Ok(report)
    }
}

impl Projection for PeriodProjector {
    type Event = ActivityEvent;

    fn name(&self) -> &'static str {
        "accommodation_periods"
    }

    async fn apply_event(&self, sequence: Sequence, event: &Self::Event) -> Result<ApplyOutcome> {
        let id = event.accommodation_id();
        let (mut report, exists) = match self.store.read(id).await {
            Ok(report) => (report, true),
            Err(StoreError::NotFound(_)) => (PeriodReport::new(id), false),
            Err(e) => return Err(ProjectionError::Storage(e.to_string())),
        };

        let outcome = report.apply(sequence, event);
        if outcome == ApplyOutcome::Duplicate {
            return Ok(outcome);
        }

        let saved = if exists {
            self.store.update(report).await
        } else {
            self.store.create(report).await
        };
        saved.map_err(|e| ProjectionError::Storage(e.to_string()))?;
        Ok(outcome)
    }

    async fn rebuild(&self) -> Result<()> {
        self.store.clear().await;
        Ok(())
    }
}
