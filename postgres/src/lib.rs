//! `PostgreSQL` storage for Stayflow.
//!
//! This crate provides the production implementations of the `EventStore` and
//! `PersistentSubscription` traits from `stayflow-core`, using sqlx:
//!
//! - Event persistence with optimistic concurrency ([`PostgresEventStore`])
//! - Durable consumer groups with leased, ordered-per-stream delivery
//!   ([`PostgresSubscription`])
//! - A parked-event queue for deliveries a group gave up on ([`ParkedEventQueue`])
//!
//! All three share one schema, created by [`migrate`].
//!
//! # Example
//!
//! ```no_run
//! use stayflow_postgres::{PostgresEventStore, PostgresSubscription};
//!
//! async fn example() -> Result<(), Box<dyn std::error::Error>> {
//!     let event_store = PostgresEventStore::new("postgres://localhost/stayflow").await?;
//!     event_store.migrate().await?;
//!     let subscriptions = PostgresSubscription::new(event_store.pool().clone());
//!     Ok(())
//! }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod event_store;
pub mod parked;
pub mod subscription;

pub use event_store::PostgresEventStore;
pub use parked::{ParkedEntry, ParkedEventQueue, ParkedStatus};
pub use subscription::{PostgresSubscription, SubscriptionConfig};

/// Schema shared by the event store, subscriptions and parked queue.
const SCHEMA: &str = include_str!("../migrations/0001_stayflow.sql");

/// Create every table this crate uses. Safe to run more than once.
///
/// # Errors
///
/// Returns the sqlx error of the first failing statement.
pub async fn migrate(pool: &sqlx::PgPool) -> Result<(), sqlx::Error> {
    sqlx::raw_sql(SCHEMA).execute(pool).await?;
    tracing::info!("Database schema is up to date");
    Ok(())
}
