//! Accommodation metrics projection for Stayflow.
//!
//! # Overview
//!
//! This crate is the query side of the activity pipeline:
//! - [`AccommodationProjection`]: per-accommodation engagement metrics
//! - [`AccommodationStore`]: in-process store, many readers, one writer
//! - [`AccommodationProjector`]: folds activity events into the store, idempotently
//! - [`PeriodProjector`]: the same events bucketed into daily and monthly [`PeriodReport`]s
//! - [`EventStreamConsumer`]: drives a projection from a persistent subscription
//!
//! # CQRS Separation
//!
//! ```text
//! Command writer → Event Store → persistent subscription → consumer → projector → store
//!                                                                             ▲
//!                                                        query handlers ──────┘
//! ```
//!
//! # Example
//!
//! ```ignore
//! use stayflow_projections::*;
//!
//! let store = AccommodationStore::new();
//! let (consumer, shutdown) = EventStreamConsumer::new(
//!     subscription,
//!     AccommodationProjector::new(store.clone()),
//!     ActivityEvent::registry(),
//!     ConsumerConfig::new("metrics-query"),
//! );
//! tokio::spawn(consumer.run());
//!
//! let metrics = store.read("A1").await?;
//! ```

pub mod consumer;
pub mod model;
pub mod period;
pub mod projector;
pub mod store;

pub use consumer::{ConsumerConfig, EventStreamConsumer};
pub use model::AccommodationProjection;
pub use projector::AccommodationProjector;
pub use period::{PeriodMetrics, PeriodProjector, PeriodReport, ReportingPeriod};
pub use store::{AccommodationStore, Keyed, PeriodStore, ProjectionStore, StoreError};
