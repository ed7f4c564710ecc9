//! `PostgreSQL` persistent subscriptions.
//!
//! Each consumer group has a row in `subscription_groups` holding its stream filter and
//! the last global position it pulled from the log. Pulled events wait in
//! `subscription_inflight` until a consumer settles them:
//!
//! ```text
//!  events ──(cursor)──► subscription_inflight ──(lease)──► Delivery
//!                          ▲        │                         │
//!                          │        └── parked_events ◄─ park ┤
//!                          └───── nack(retry), backoff ◄──────┤
//!                                  (row deleted) ◄──── ack ───┘
//! ```
//!
//! A delivered row is leased: it stays invisible to other consumers of the group until
//! the lease runs out, so a consumer that dies mid-event gets its work redelivered.
//! Only the oldest unsettled event of a stream is ever leased, which keeps delivery
//! ordered inside a stream while different streams progress independently.
//!
//! Consumers poll. Every poll first moves new events past the cursor into the in-flight
//! table (one consumer per group at a time, the others skip the locked group row),
//! then leases whatever is visible.

use crate::event_store::row_to_recorded;
use crate::parked::{ParkedEventQueue, park_in_tx};
use sqlx::{PgPool, Row};
use stayflow_core::event_store::RecordedEvent;
use stayflow_core::subscription::{
    Acknowledger, Delivery, DeliveryStream, GroupStatus, NackAction, PersistentSubscription,
    StreamFilter, SubscriptionError,
};
use stayflow_runtime::retry::RetryPolicy;
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;
use tokio::time::MissedTickBehavior;

/// Tuning for [`PostgresSubscription`].
///
/// Retried events wait `retry_backoff.jittered_delay_for_attempt(retry_count)` before they
/// become visible again. The attempt limit is `max_retry_count`; the policy's own
/// `max_retries` is not consulted.
#[derive(Debug, Clone)]
pub struct SubscriptionConfig {
    /// Pause between polls when nothing was delivered
    pub poll_interval: Duration,
    /// Maximum events pulled or leased per poll
    pub batch_size: usize,
    /// How long a delivered event stays invisible before it is redelivered
    pub lease: Duration,
    /// Retries before an event is parked
    pub max_retry_count: u32,
    /// Delay before a retried event is delivered again
    pub retry_backoff: RetryPolicy,
}

impl Default for SubscriptionConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(200),
            batch_size: 100,
            lease: Duration::from_secs(30),
            max_retry_count: 10,
            retry_backoff: RetryPolicy::builder()
                .initial_delay(Duration::from_millis(500))
                .max_delay(Duration::from_secs(60))
                .build(),
        }
    }
}

/// [`PersistentSubscription`] over the `events` table.
#[derive(Clone)]
pub struct PostgresSubscription {
    pool: PgPool,
    config: SubscriptionConfig,
}

impl PostgresSubscription {
    /// Subscriptions with the default configuration.
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self::with_config(pool, SubscriptionConfig::default())
    }

    /// Subscriptions with a custom configuration.
    #[must_use]
    pub const fn with_config(pool: PgPool, config: SubscriptionConfig) -> Self {
        Self { pool, config }
    }

    /// The active configuration.
    #[must_use]
    pub const fn config(&self) -> &SubscriptionConfig {
        &self.config
    }

    /// Operator access to events parked by any group.
    #[must_use]
    pub fn parked(&self) -> ParkedEventQueue {
        ParkedEventQueue::new(self.pool.clone())
    }
}

impl PersistentSubscription for PostgresSubscription {
    fn ensure_group<'a>(
        &'a self,
        group: &'a str,
        filter: &'a StreamFilter,
    ) -> Pin<Box<dyn Future<Output = Result<GroupStatus, SubscriptionError>> + Send + 'a>> {
        Box::pin(async move {
            let result = sqlx::query(
                r"
                INSERT INTO subscription_groups (group_name, stream_pattern)
                VALUES ($1, $2)
                ON CONFLICT (group_name) DO NOTHING
                ",
            )
            .bind(group)
            .bind(filter.like_pattern())
            .execute(&self.pool)
            .await
            .map_err(|e| SubscriptionError::Transport(e.to_string()))?;

            if result.rows_affected() == 1 {
                tracing::info!(group, filter = %filter, "Consumer group created");
                Ok(GroupStatus::Created)
            } else {
                tracing::debug!(group, "Consumer group already exists");
                Ok(GroupStatus::AlreadyExists)
            }
        })
    }

    fn connect<'a>(
        &'a self,
        group: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<DeliveryStream, SubscriptionError>> + Send + 'a>> {
        Box::pin(async move {
            let pattern: Option<String> = sqlx::query_scalar(
                "SELECT stream_pattern FROM subscription_groups WHERE group_name = $1",
            )
            .bind(group)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| SubscriptionError::Transport(e.to_string()))?;

            let Some(pattern) = pattern else {
                return Err(SubscriptionError::GroupNotFound(group.to_string()));
            };

            tracing::info!(group, pattern = %pattern, "Connected to consumer group");

            let poller = Poller {
                pool: self.pool.clone(),
                group: group.to_string(),
                pattern,
                config: self.config.clone(),
            };

            let stream = async_stream::stream! {
                let mut interval = tokio::time::interval(poller.config.poll_interval);
                interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

                loop {
                    match poller.poll().await {
                        Ok(batch) if batch.is_empty() => {
                            interval.tick().await;
                        },
                        Ok(batch) => {
                            for delivery in batch {
                                yield Ok(delivery);
                            }
                        },
                        Err(error) => {
                            tracing::error!(group = %poller.group, error = %error, "Subscription poll failed");
                            yield Err(SubscriptionError::Dropped(error.to_string()));
                            break;
                        },
                    }
                }
            };

            Ok(Box::pin(stream) as DeliveryStream)
        })
    }
}

/// Poll loop state for one connection.
struct Poller {
    pool: PgPool,
    group: String,
    pattern: String,
    config: SubscriptionConfig,
}

impl Poller {
    async fn poll(&self) -> Result<Vec<Delivery>, SubscriptionError> {
        self.advance_cursor().await?;
        self.lease_visible().await
    }

    /// Move events past the group's cursor into the in-flight table.
    async fn advance_cursor(&self) -> Result<(), SubscriptionError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| SubscriptionError::Transport(e.to_string()))?;

        let cursor: Option<i64> = sqlx::query_scalar(
            r"
            SELECT last_position
            FROM subscription_groups
            WHERE group_name = $1
            FOR UPDATE SKIP LOCKED
            ",
        )
        .bind(&self.group)
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| SubscriptionError::Transport(e.to_string()))?;

        // Another member of the group is advancing right now
        let Some(cursor) = cursor else {
            return Ok(());
        };

        let newest: Option<i64> = sqlx::query_scalar(
            r"
            WITH batch AS (
                SELECT global_position, stream_id
                FROM events
                WHERE global_position > $2 AND stream_id LIKE $3
                ORDER BY global_position ASC
                LIMIT $4
            ),
            pulled AS (
                INSERT INTO subscription_inflight (group_name, global_position, stream_id, visible_at)
                SELECT $1, global_position, stream_id, NOW() FROM batch
                ON CONFLICT (group_name, global_position) DO NOTHING
            )
            SELECT MAX(global_position) FROM batch
            ",
        )
        .bind(&self.group)
        .bind(cursor)
        .bind(&self.pattern)
        .bind(i64::try_from(self.config.batch_size).unwrap_or(i64::MAX))
        .fetch_one(&mut *tx)
        .await
        .map_err(|e| SubscriptionError::Transport(e.to_string()))?;

        if let Some(newest) = newest {
            sqlx::query("UPDATE subscription_groups SET last_position = $2 WHERE group_name = $1")
                .bind(&self.group)
                .bind(newest)
                .execute(&mut *tx)
                .await
                .map_err(|e| SubscriptionError::Transport(e.to_string()))?;
        }

        tx.commit()
            .await
            .map_err(|e| SubscriptionError::Transport(e.to_string()))?;

        if let Some(newest) = newest {
            tracing::debug!(group = %self.group, from = cursor, to = newest, "Cursor advanced");
        }

        Ok(())
    }

    /// Lease the visible head event of each stream.
    async fn lease_visible(&self) -> Result<Vec<Delivery>, SubscriptionError> {
        let rows = sqlx::query(
            r"
            WITH due AS (
                SELECT i.global_position
                FROM subscription_inflight i
                WHERE i.group_name = $1
                  AND i.visible_at <= NOW()
                  AND NOT EXISTS (
                      SELECT 1 FROM subscription_inflight earlier
                      WHERE earlier.group_name = i.group_name
                        AND earlier.stream_id = i.stream_id
                        AND earlier.global_position < i.global_position
                  )
                ORDER BY i.global_position ASC
                LIMIT $2
                FOR UPDATE SKIP LOCKED
            ),
            leased AS (
                UPDATE subscription_inflight i
                SET visible_at = NOW() + make_interval(secs => $3)
                FROM due
                WHERE i.group_name = $1 AND i.global_position = due.global_position
                RETURNING i.global_position, i.retry_count
            )
            SELECT
                e.global_position, e.stream_id, e.sequence, e.event_type, e.event_data,
                e.metadata, e.recorded_at, leased.retry_count
            FROM leased
            JOIN events e ON e.global_position = leased.global_position
            ORDER BY e.global_position ASC
            ",
        )
        .bind(&self.group)
        .bind(i64::try_from(self.config.batch_size).unwrap_or(i64::MAX))
        .bind(self.config.lease.as_secs_f64())
        .fetch_all(&self.pool)
        .await
        .map_err(|e| SubscriptionError::Transport(e.to_string()))?;

        Ok(rows
            .iter()
            .map(|row| {
                let retry_count: i32 = row.get("retry_count");
                let retry_count = u32::try_from(retry_count).unwrap_or(0);
                let acker = PostgresAcker {
                    pool: self.pool.clone(),
                    group: self.group.clone(),
                    global_position: row.get("global_position"),
                    retry_count,
                    max_retry_count: self.config.max_retry_count,
                    retry_delay: self
                        .config
                        .retry_backoff
                        .jittered_delay_for_attempt(usize::try_from(retry_count).unwrap_or(usize::MAX)),
                };
                Delivery::new(
                    row_to_recorded(row),
                    acker.retry_count,
                    Box::new(acker),
                )
            })
            .collect())
    }
}

/// Settles one leased in-flight row.
struct PostgresAcker {
    pool: PgPool,
    group: String,
    global_position: i64,
    retry_count: u32,
    max_retry_count: u32,
    retry_delay: Duration,
}

impl PostgresAcker {
    async fn delete(&self) -> Result<(), SubscriptionError> {
        sqlx::query(
            "DELETE FROM subscription_inflight WHERE group_name = $1 AND global_position = $2",
        )
        .bind(&self.group)
        .bind(self.global_position)
        .execute(&self.pool)
        .await
        .map_err(|e| SubscriptionError::Acknowledgement(e.to_string()))?;
        Ok(())
    }

    async fn park(&self, reason: &str) -> Result<(), SubscriptionError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| SubscriptionError::Acknowledgement(e.to_string()))?;
        park_in_tx(&mut tx, &self.group, self.global_position, reason).await?;
        tx.commit()
            .await
            .map_err(|e| SubscriptionError::Acknowledgement(e.to_string()))
    }

    async fn retry(&self, reason: &str) -> Result<(), SubscriptionError> {
        sqlx::query(
            r"
            UPDATE subscription_inflight
            SET retry_count = retry_count + 1,
                visible_at = NOW() + make_interval(secs => $4),
                last_error = $3
            WHERE group_name = $1 AND global_position = $2
            ",
        )
        .bind(&self.group)
        .bind(self.global_position)
        .bind(reason)
        .bind(self.retry_delay.as_secs_f64())
        .execute(&self.pool)
        .await
        .map_err(|e| SubscriptionError::Acknowledgement(e.to_string()))?;
        Ok(())
    }
}

impl Acknowledger for PostgresAcker {
    fn ack<'a>(
        &'a self,
        event: &'a RecordedEvent,
    ) -> Pin<Box<dyn Future<Output = Result<(), SubscriptionError>> + Send + 'a>> {
        Box::pin(async move {
            self.delete().await?;
            tracing::trace!(
                group = %self.group,
                stream_id = %event.stream_id,
                sequence = %event.sequence,
                "Delivery acknowledged"
            );
            Ok(())
        })
    }

    fn nack<'a>(
        &'a self,
        event: &'a RecordedEvent,
        action: NackAction,
        reason: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<(), SubscriptionError>> + Send + 'a>> {
        Box::pin(async move {
            match action {
                NackAction::Skip => self.delete().await,
                NackAction::Park => self.park(reason).await,
                NackAction::Retry if self.retry_count >= self.max_retry_count => {
                    self.park(&format!("retry limit reached: {reason}")).await
                },
                NackAction::Retry => {
                    tracing::debug!(
                        group = %self.group,
                        stream_id = %event.stream_id,
                        sequence = %event.sequence,
                        retry_count = self.retry_count,
                        delay_ms = u64::try_from(self.retry_delay.as_millis()).unwrap_or(u64::MAX),
                        reason,
                        "Delivery will be retried"
                    );
                    self.retry(reason).await
                },
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config() {
        let config = SubscriptionConfig::default();
        assert_eq!(config.poll_interval, Duration::from_millis(200));
        assert_eq!(config.max_retry_count, 10);
        assert_eq!(config.batch_size, 100);
    }

    #[test]
    fn subscription_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<PostgresSubscription>();
    }
}
