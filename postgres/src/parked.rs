//! Parked events: deliveries a consumer group gave up on.
//!
//! An event ends up here when its consumer nacks it with [`NackAction::Park`], or when
//! it was retried more often than the subscription's `max_retry_count`. Parked events
//! are no longer delivered; operators inspect them and either replay them into the
//! group or discard them.
//!
//! # Workflow
//!
//! 1. The subscription parks the event (status `parked`)
//! 2. An operator lists parked events of a group
//! 3. Fix the cause (deploy a fixed projector, repair data)
//! 4. [`ParkedEventQueue::replay`] hands it back to the group (status `replayed`),
//!    or [`ParkedEventQueue::mark_discarded`] closes it for good
//!
//! # Example
//!
//! ```no_run
//! use stayflow_postgres::ParkedEventQueue;
//! use sqlx::PgPool;
//!
//! # async fn example(pool: PgPool) -> Result<(), Box<dyn std::error::Error>> {
//! let parked = ParkedEventQueue::new(pool);
//!
//! for entry in parked.list_parked("metrics-query", 10).await? {
//!     println!("{} #{}: {}", entry.stream_id, entry.sequence, entry.reason);
//!     parked.replay(entry.id).await?;
//! }
//! # Ok(())
//! # }
//! ```
//!
//! [`NackAction::Park`]: stayflow_core::subscription::NackAction::Park

use crate::event_store::sequence_from_db;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Postgres, Row, Transaction};
use stayflow_core::stream::{Sequence, StreamId};
use stayflow_core::subscription::SubscriptionError;

/// Status of a parked entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParkedStatus {
    /// Waiting for an operator
    Parked,
    /// Handed back to its group
    Replayed,
    /// Closed without replay
    Discarded,
}

impl ParkedStatus {
    /// Convert to the string stored in the database.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Parked => "parked",
            Self::Replayed => "replayed",
            Self::Discarded => "discarded",
        }
    }

    /// Parse from the database string.
    ///
    /// # Errors
    ///
    /// Returns [`SubscriptionError::Transport`] for an unknown status.
    pub fn parse(s: &str) -> Result<Self, SubscriptionError> {
        match s {
            "parked" => Ok(Self::Parked),
            "replayed" => Ok(Self::Replayed),
            "discarded" => Ok(Self::Discarded),
            _ => Err(SubscriptionError::Transport(format!(
                "Invalid parked status: {s}"
            ))),
        }
    }
}

/// One parked delivery.
#[derive(Debug, Clone)]
pub struct ParkedEntry {
    /// Unique entry ID
    pub id: i64,
    /// Consumer group that parked the event
    pub group_name: String,
    /// Position of the event in the global log
    pub global_position: i64,
    /// Stream of the event
    pub stream_id: StreamId,
    /// Sequence of the event in its stream
    pub sequence: Sequence,
    /// Event type tag
    pub event_type: String,
    /// Why the event was parked
    pub reason: String,
    /// Deliveries before it was parked
    pub retry_count: i32,
    /// When it was parked
    pub parked_at: DateTime<Utc>,
    /// Current status
    pub status: ParkedStatus,
    /// When an operator replayed or discarded it
    pub resolved_at: Option<DateTime<Utc>>,
    /// Operator notes
    pub resolution_notes: Option<String>,
}

/// Move one in-flight delivery of `group` into `parked_events`.
///
/// Runs inside the caller's transaction so the in-flight row and the parked row
/// change together.
pub(crate) async fn park_in_tx(
    tx: &mut Transaction<'_, Postgres>,
    group: &str,
    global_position: i64,
    reason: &str,
) -> Result<(), SubscriptionError> {
    sqlx::query(
        r"
        INSERT INTO parked_events
            (group_name, global_position, stream_id, sequence, event_type, reason, retry_count)
        SELECT i.group_name, i.global_position, e.stream_id, e.sequence, e.event_type, $3, i.retry_count
        FROM subscription_inflight i
        JOIN events e ON e.global_position = i.global_position
        WHERE i.group_name = $1 AND i.global_position = $2
        ",
    )
    .bind(group)
    .bind(global_position)
    .bind(reason)
    .execute(&mut **tx)
    .await
    .map_err(|e| SubscriptionError::Acknowledgement(e.to_string()))?;

    sqlx::query("DELETE FROM subscription_inflight WHERE group_name = $1 AND global_position = $2")
        .bind(group)
        .bind(global_position)
        .execute(&mut **tx)
        .await
        .map_err(|e| SubscriptionError::Acknowledgement(e.to_string()))?;

    tracing::warn!(
        group = group,
        global_position,
        reason = reason,
        "Event parked"
    );
    metrics::counter!("subscription.parked", "group" => group.to_string()).increment(1);

    Ok(())
}

/// Operator view of the `parked_events` table.
#[derive(Clone)]
pub struct ParkedEventQueue {
    pool: PgPool,
}

impl ParkedEventQueue {
    /// Create a queue over `pool`.
    #[must_use]
    pub const fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// List parked entries of a group, oldest first.
    ///
    /// # Errors
    ///
    /// Returns [`SubscriptionError::Transport`] if the query fails.
    pub async fn list_parked(
        &self,
        group: &str,
        limit: usize,
    ) -> Result<Vec<ParkedEntry>, SubscriptionError> {
        self.list_by_status(group, ParkedStatus::Parked, limit).await
    }

    /// List entries of a group with the given status, oldest first.
    ///
    /// # Errors
    ///
    /// Returns [`SubscriptionError::Transport`] if the query fails.
    pub async fn list_by_status(
        &self,
        group: &str,
        status: ParkedStatus,
        limit: usize,
    ) -> Result<Vec<ParkedEntry>, SubscriptionError> {
        let rows = sqlx::query(
            r"
            SELECT
                id, group_name, global_position, stream_id, sequence, event_type,
                reason, retry_count, parked_at, status, resolved_at, resolution_notes
            FROM parked_events
            WHERE group_name = $1 AND status = $2
            ORDER BY parked_at ASC, id ASC
            LIMIT $3
            ",
        )
        .bind(group)
        .bind(status.as_str())
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await
        .map_err(|e| SubscriptionError::Transport(e.to_string()))?;

        rows.iter().map(Self::row_to_entry).collect()
    }

    /// Get one entry by ID.
    ///
    /// # Errors
    ///
    /// Returns [`SubscriptionError::Transport`] if the query fails or the entry does
    /// not exist.
    pub async fn get_by_id(&self, id: i64) -> Result<ParkedEntry, SubscriptionError> {
        let row = sqlx::query(
            r"
            SELECT
                id, group_name, global_position, stream_id, sequence, event_type,
                reason, retry_count, parked_at, status, resolved_at, resolution_notes
            FROM parked_events
            WHERE id = $1
            ",
        )
        .bind(id)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| SubscriptionError::Transport(e.to_string()))?;

        Self::row_to_entry(&row)
    }

    /// Hand a parked event back to its group with a fresh retry budget.
    ///
    /// # Errors
    ///
    /// Returns [`SubscriptionError::Transport`] if the entry is not parked or a
    /// statement fails.
    pub async fn replay(&self, id: i64) -> Result<(), SubscriptionError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| SubscriptionError::Transport(e.to_string()))?;

        let row = sqlx::query(
            r"
            UPDATE parked_events
            SET status = 'replayed', resolved_at = NOW()
            WHERE id = $1 AND status = 'parked'
            RETURNING group_name, global_position, stream_id
            ",
        )
        .bind(id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| SubscriptionError::Transport(e.to_string()))?
        .ok_or_else(|| SubscriptionError::Transport(format!("Parked entry {id} is not parked")))?;

        let group: String = row.get("group_name");
        let global_position: i64 = row.get("global_position");
        let stream_id: String = row.get("stream_id");

        sqlx::query(
            r"
            INSERT INTO subscription_inflight (group_name, global_position, stream_id, visible_at)
            VALUES ($1, $2, $3, NOW())
            ON CONFLICT (group_name, global_position) DO NOTHING
            ",
        )
        .bind(&group)
        .bind(global_position)
        .bind(&stream_id)
        .execute(&mut *tx)
        .await
        .map_err(|e| SubscriptionError::Transport(e.to_string()))?;

        tx.commit()
            .await
            .map_err(|e| SubscriptionError::Transport(e.to_string()))?;

        tracing::info!(parked_id = id, group = %group, global_position, "Parked event replayed");
        metrics::counter!("subscription.parked.replayed").increment(1);

        Ok(())
    }

    /// Close a parked entry without replaying it.
    ///
    /// # Errors
    ///
    /// Returns [`SubscriptionError::Transport`] if the update fails.
    pub async fn mark_discarded(&self, id: i64, notes: &str) -> Result<(), SubscriptionError> {
        sqlx::query(
            r"
            UPDATE parked_events
            SET status = 'discarded',
                resolved_at = NOW(),
                resolution_notes = $1
            WHERE id = $2
            ",
        )
        .bind(notes)
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(|e| SubscriptionError::Transport(e.to_string()))?;

        tracing::warn!(parked_id = id, notes = notes, "Parked event discarded");
        metrics::counter!("subscription.parked.discarded").increment(1);

        Ok(())
    }

    /// Number of entries of a group still waiting for an operator.
    ///
    /// # Errors
    ///
    /// Returns [`SubscriptionError::Transport`] if the query fails.
    pub async fn count_parked(&self, group: &str) -> Result<i64, SubscriptionError> {
        let (count,): (i64,) = sqlx::query_as(
            r"
            SELECT COUNT(*)
            FROM parked_events
            WHERE group_name = $1 AND status = 'parked'
            ",
        )
        .bind(group)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| SubscriptionError::Transport(e.to_string()))?;

        Ok(count)
    }

    fn row_to_entry(row: &sqlx::postgres::PgRow) -> Result<ParkedEntry, SubscriptionError> {
        let status_str: String = row.get("status");
        let stream_id: String = row.get("stream_id");

        Ok(ParkedEntry {
            id: row.get("id"),
            group_name: row.get("group_name"),
            global_position: row.get("global_position"),
            stream_id: StreamId::new(stream_id),
            sequence: sequence_from_db(row.get("sequence")),
            event_type: row.get("event_type"),
            reason: row.get("reason"),
            retry_count: row.get("retry_count"),
            parked_at: row.get("parked_at"),
            status: ParkedStatus::parse(&status_str)?,
            resolved_at: row.get("resolved_at"),
            resolution_notes: row.get("resolution_notes"),
        })
    }
}
