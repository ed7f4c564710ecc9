//! Projection test harness
//!
//! [`ProjectionTestHarness`] drives a projection the way the consumer does (events with
//! their stream sequence, one at a time) and records what each application did, so a
//! test reads as *given these events, then these outcomes*.

#![allow(clippy::missing_panics_doc)] // Assertion helpers panic on mismatch

use stayflow_core::projection::{ApplyOutcome, Projection, Result};
use stayflow_core::stream::Sequence;

/// Fluent driver for projection tests.
///
/// # Example
///
/// ```ignore
/// let mut harness = ProjectionTestHarness::new(AccommodationProjector::new(store.clone()));
///
/// harness
///     .given_events(vec![(Sequence::new(0), joined), (Sequence::new(1), left)])
///     .await?
///     .then_outcomes(&[ApplyOutcome::Applied, ApplyOutcome::Applied]);
/// ```
pub struct ProjectionTestHarness<P: Projection> {
    projection: P,
    outcomes: Vec<ApplyOutcome>,
}

impl<P: Projection> ProjectionTestHarness<P> {
    /// Wrap a projection.
    #[must_use]
    pub const fn new(projection: P) -> Self {
        Self {
            projection,
            outcomes: Vec::new(),
        }
    }

    /// Apply events in order, recording each outcome.
    ///
    /// # Errors
    ///
    /// Returns the first [`ProjectionError`](stayflow_core::projection::ProjectionError)
    /// raised by the projection; later events are not applied.
    pub async fn given_events(&mut self, events: Vec<(Sequence, P::Event)>) -> Result<&mut Self> {
        for (sequence, event) in events {
            let outcome = self.projection.apply_event(sequence, &event).await?;
            self.outcomes.push(outcome);
        }
        Ok(self)
    }

    /// Apply one event, recording its outcome.
    ///
    /// # Errors
    ///
    /// Returns the projection's error.
    pub async fn given_event(&mut self, sequence: Sequence, event: P::Event) -> Result<&mut Self> {
        let outcome = self.projection.apply_event(sequence, &event).await?;
        self.outcomes.push(outcome);
        Ok(self)
    }

    /// Assert the outcomes recorded so far.
    pub fn then_outcomes(&self, expected: &[ApplyOutcome]) -> &Self {
        assert_eq!(
            self.outcomes, expected,
            "projection '{}' produced unexpected outcomes",
            self.projection.name()
        );
        self
    }

    /// Outcome of the most recent application.
    #[must_use]
    pub fn last_outcome(&self) -> Option<ApplyOutcome> {
        self.outcomes.last().copied()
    }

    /// The wrapped projection, for read-model assertions.
    #[must_use]
    pub const fn projection(&self) -> &P {
        &self.projection
    }

    /// Forget recorded outcomes and rebuild the projection from scratch.
    ///
    /// # Errors
    ///
    /// Returns the projection's rebuild error.
    pub async fn reset(&mut self) -> Result<()> {
        self.outcomes.clear();
        self.projection.rebuild().await
    }
}
