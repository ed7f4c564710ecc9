//! `PostgreSQL` implementation of [`EventStore`].

use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::{Postgres, Row, Transaction};
use stayflow_core::event::SerializedEvent;
use stayflow_core::event_store::{EventStore, EventStoreError, RecordedEvent};
use stayflow_core::stream::{ExpectedSequence, Sequence, StreamId};
use std::future::Future;
use std::pin::Pin;

/// Advisory lock taken by every append.
///
/// Appends commit one at a time, so global positions become visible in increasing
/// order and a subscription cursor never skips a position that commits late.
const APPEND_LOCK_KEY: i64 = 0x5354_4159_464c_4f57;

/// `PostgreSQL`-backed event store.
///
/// Events live in the `events` table, keyed by `(stream_id, sequence)`. Every row also
/// gets a `global_position` that persistent subscriptions use as their cursor.
///
/// # Example
///
/// ```no_run
/// use stayflow_postgres::PostgresEventStore;
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let store = PostgresEventStore::new("postgres://localhost/stayflow").await?;
/// store.migrate().await?;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct PostgresEventStore {
    pool: PgPool,
}

impl PostgresEventStore {
    /// Connect to `database_url` with a default-sized pool.
    ///
    /// # Errors
    ///
    /// Returns [`EventStoreError::Transport`] if the connection cannot be established.
    pub async fn new(database_url: &str) -> Result<Self, EventStoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(database_url)
            .await
            .map_err(|e| EventStoreError::Transport(format!("Failed to connect: {e}")))?;

        tracing::info!("Connected to PostgreSQL event store");
        Ok(Self { pool })
    }

    /// Use an existing pool.
    #[must_use]
    pub const fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    /// The underlying connection pool.
    #[must_use]
    pub const fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Create the tables if they do not exist yet.
    ///
    /// # Errors
    ///
    /// Returns [`EventStoreError::Transport`] if a statement fails.
    pub async fn migrate(&self) -> Result<(), EventStoreError> {
        crate::migrate(&self.pool)
            .await
            .map_err(|e| EventStoreError::Transport(format!("Migration failed: {e}")))
    }

    async fn current_sequence(
        tx: &mut Transaction<'_, Postgres>,
        stream_id: &StreamId,
    ) -> Result<Option<Sequence>, EventStoreError> {
        let current: Option<i64> =
            sqlx::query_scalar("SELECT MAX(sequence) FROM events WHERE stream_id = $1")
                .bind(stream_id.as_str())
                .fetch_one(&mut **tx)
                .await
                .map_err(|e| EventStoreError::Transport(e.to_string()))?;

        Ok(current.map(sequence_from_db))
    }
}

pub(crate) fn sequence_to_db(sequence: Sequence) -> Result<i64, EventStoreError> {
    i64::try_from(sequence.value()).map_err(|_| {
        EventStoreError::Serialization(format!("Sequence {sequence} does not fit in BIGINT"))
    })
}

#[allow(clippy::cast_sign_loss)] // The column is constrained to be non-negative
pub(crate) const fn sequence_from_db(value: i64) -> Sequence {
    Sequence::new(value as u64)
}

pub(crate) fn row_to_recorded(row: &PgRow) -> RecordedEvent {
    let stream_id: String = row.get("stream_id");
    let recorded_at: DateTime<Utc> = row.get("recorded_at");

    RecordedEvent {
        stream_id: StreamId::new(stream_id),
        sequence: sequence_from_db(row.get("sequence")),
        event: SerializedEvent::new(
            row.get("event_type"),
            row.get("event_data"),
            row.get("metadata"),
        ),
        recorded_at,
    }
}

impl EventStore for PostgresEventStore {
    fn append(
        &self,
        stream_id: StreamId,
        expected: ExpectedSequence,
        events: Vec<SerializedEvent>,
    ) -> Pin<Box<dyn Future<Output = Result<Sequence, EventStoreError>> + Send + '_>> {
        Box::pin(async move {
            if events.is_empty() {
                return Err(EventStoreError::Serialization(
                    "Cannot append an empty batch".to_string(),
                ));
            }

            let mut tx = self
                .pool
                .begin()
                .await
                .map_err(|e| EventStoreError::Transport(e.to_string()))?;

            sqlx::query("SELECT pg_advisory_xact_lock($1)")
                .bind(APPEND_LOCK_KEY)
                .execute(&mut *tx)
                .await
                .map_err(|e| EventStoreError::Transport(e.to_string()))?;

            let current = Self::current_sequence(&mut tx, &stream_id).await?;
            if !expected.matches(current) {
                tracing::warn!(
                    stream_id = %stream_id,
                    expected = %expected,
                    actual = ?current,
                    "Concurrency conflict, nothing appended"
                );
                metrics::counter!("event_store.conflicts").increment(1);
                return Err(EventStoreError::ConcurrencyConflict {
                    stream_id,
                    expected,
                    actual: current,
                });
            }

            let count = events.len();
            let mut next = current.map_or(Sequence::FIRST, Sequence::next);
            let mut last = next;

            for event in events {
                sqlx::query(
                    r"
                    INSERT INTO events (stream_id, sequence, event_type, event_data, metadata)
                    VALUES ($1, $2, $3, $4, $5)
                    ",
                )
                .bind(stream_id.as_str())
                .bind(sequence_to_db(next)?)
                .bind(&event.event_type)
                .bind(&event.data)
                .bind(&event.metadata)
                .execute(&mut *tx)
                .await
                .map_err(|e| match e {
                    // The primary key catches writers that bypassed the advisory lock
                    sqlx::Error::Database(ref db) if db.is_unique_violation() => {
                        EventStoreError::ConcurrencyConflict {
                            stream_id: stream_id.clone(),
                            expected,
                            actual: current,
                        }
                    },
                    other => EventStoreError::Transport(other.to_string()),
                })?;

                last = next;
                next = next.next();
            }

            tx.commit()
                .await
                .map_err(|e| EventStoreError::Transport(e.to_string()))?;

            tracing::debug!(
                stream_id = %stream_id,
                count,
                last_sequence = %last,
                "Events appended"
            );
            metrics::counter!("event_store.appended").increment(count as u64);

            Ok(last)
        })
    }

    fn read_stream(
        &self,
        stream_id: StreamId,
        from: Sequence,
        max_count: usize,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<RecordedEvent>, EventStoreError>> + Send + '_>>
    {
        Box::pin(async move {
            let limit = i64::try_from(max_count).unwrap_or(i64::MAX);

            let rows = sqlx::query(
                r"
                SELECT stream_id, sequence, event_type, event_data, metadata, recorded_at
                FROM events
                WHERE stream_id = $1 AND sequence >= $2
                ORDER BY sequence ASC
                LIMIT $3
                ",
            )
            .bind(stream_id.as_str())
            .bind(sequence_to_db(from)?)
            .bind(limit)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| EventStoreError::Transport(e.to_string()))?;

            Ok(rows.iter().map(row_to_recorded).collect())
        })
    }

    fn last_sequence(
        &self,
        stream_id: StreamId,
    ) -> Pin<Box<dyn Future<Output = Result<Option<Sequence>, EventStoreError>> + Send + '_>>
    {
        Box::pin(async move {
            let current: Option<i64> =
                sqlx::query_scalar("SELECT MAX(sequence) FROM events WHERE stream_id = $1")
                    .bind(stream_id.as_str())
                    .fetch_one(&self.pool)
                    .await
                    .map_err(|e| EventStoreError::Transport(e.to_string()))?;

            Ok(current.map(sequence_from_db))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sequences_convert_to_bigint() {
        assert_eq!(sequence_to_db(Sequence::new(7)).ok(), Some(7));
        assert_eq!(sequence_from_db(7), Sequence::new(7));
    }

    #[test]
    fn oversized_sequence_is_rejected() {
        let result = sequence_to_db(Sequence::new(u64::MAX));
        assert!(matches!(result, Err(EventStoreError::Serialization(_))));
    }
}
