//! # Stayflow Testing
//!
//! Test doubles and helpers shared by the Stayflow crates.
//!
//! This crate provides:
//! - [`InMemoryChannel`]: message bus with queue groups, publish recording and failure injection
//! - [`InMemoryEventStore`]: event store plus persistent-subscription broker on one log
//! - [`ProjectionTestHarness`]: given-events/then-outcomes driver for projections
//! - [`ReducerTest`]: given-state/when-action/then driver for reducers
//! - [`fixtures`]: activity event builders
//! - [`FixedClock`]: deterministic time
//!
//! ## Example
//!
//! ```ignore
//! use stayflow_testing::{InMemoryChannel, test_clock};
//!
//! #[tokio::test]
//! async fn saga_commits() {
//!     let channel = InMemoryChannel::new();
//!     let orchestrator = Orchestrator::new(Arc::new(channel.clone()), settings);
//!
//!     orchestrator.start(sample_accommodation()).await?;
//!     assert_eq!(channel.published_on("create-accommodation.command").len(), 1);
//! }
//! ```

use chrono::{DateTime, Utc};
use stayflow_core::environment::Clock;

pub mod channel;
pub mod event_store;
pub mod fixtures;
pub mod projection_harness;

/// Mock implementations of Environment traits
pub mod mocks {
    use super::{Clock, DateTime, Utc};

    /// Fixed clock for deterministic tests
    ///
    /// Always returns the same time, making tests reproducible.
    ///
    /// # Example
    ///
    /// ```
    /// use stayflow_testing::mocks::FixedClock;
    /// use stayflow_core::environment::Clock;
    /// use chrono::Utc;
    ///
    /// let clock = FixedClock::new(Utc::now());
    /// let time1 = clock.now();
    /// let time2 = clock.now();
    /// assert_eq!(time1, time2); // Always the same!
    /// ```
    #[derive(Debug, Clone)]
    pub struct FixedClock {
        time: DateTime<Utc>,
    }

    impl FixedClock {
        /// Create a new fixed clock with the given time
        #[must_use]
        pub const fn new(time: DateTime<Utc>) -> Self {
            Self { time }
        }
    }

    impl Clock for FixedClock {
        fn now(&self) -> DateTime<Utc> {
            self.time
        }
    }

    /// Create a default fixed clock for tests (2024-01-01 00:00:00 UTC)
    ///
    /// # Panics
    ///
    /// This function will panic if the hardcoded timestamp fails to parse,
    /// which should never happen in practice.
    #[must_use]
    #[allow(clippy::expect_used)]
    pub fn test_clock() -> FixedClock {
        FixedClock::new(
            DateTime::parse_from_rfc3339("2024-01-01T00:00:00Z")
                .expect("hardcoded timestamp should always parse")
                .with_timezone(&Utc),
        )
    }
}

/// Test helpers and utilities.
pub mod helpers {
    /// Route `tracing` output through the test harness's captured stdout.
    ///
    /// Safe to call from every test; only the first call installs the subscriber.
    /// Honours `RUST_LOG`, defaulting to `debug`.
    pub fn init_test_tracing() {
        let filter = tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("debug"));
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_test_writer()
            .try_init();
    }
}

// Re-export commonly used items
pub use channel::InMemoryChannel;
pub use event_store::{InMemoryEventStore, ParkedEvent};
pub use mocks::{FixedClock, test_clock};
pub use projection_harness::ProjectionTestHarness;
pub use reducer_test::{ReducerTest, assertions};
