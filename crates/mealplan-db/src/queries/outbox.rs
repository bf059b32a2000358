//! Database query functions for the `event_outbox` table.
//!
//! The outbox is the durable queue behind the event bus: publishing inserts
//! a row, the consumer claims undelivered rows and marks them delivered.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::PgExecutor;
use uuid::Uuid;

use crate::models::OutboxRecord;

/// A row to append to the outbox.
#[derive(Debug, Clone)]
pub struct NewOutboxRecord<'a> {
    pub event_id: Uuid,
    pub topic: &'a str,
    pub event_type: &'a str,
    pub idempotency_key: &'a str,
    pub meal_plan_id: Option<Uuid>,
    pub household_id: Option<Uuid>,
    pub user_id: Option<Uuid>,
    pub payload: &'a serde_json::Value,
    pub occurred_at: DateTime<Utc>,
}

/// Append an envelope. Returns `false` when `(topic, idempotency_key)` was
/// already published, in which case nothing is written.
pub async fn insert_outbox_record<'e, E: PgExecutor<'e>>(
    exec: E,
    record: &NewOutboxRecord<'_>,
) -> Result<bool> {
    let result = sqlx::query(
        "INSERT INTO event_outbox \
             (event_id, topic, event_type, idempotency_key, meal_plan_id, household_id, \
              user_id, payload, occurred_at) \
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9) \
         ON CONFLICT DO NOTHING",
    )
    .bind(record.event_id)
    .bind(record.topic)
    .bind(record.event_type)
    .bind(record.idempotency_key)
    .bind(record.meal_plan_id)
    .bind(record.household_id)
    .bind(record.user_id)
    .bind(record.payload)
    .bind(record.occurred_at)
    .execute(exec)
    .await
    .context("failed to insert outbox record")?;

    Ok(result.rows_affected() == 1)
}

/// Claim up to `limit` undelivered rows that are due at `now`.
///
/// Rows still backing off after a failure are skipped, and rows with fewer
/// attempts come first, so failing rows cannot starve newer ones. Within an
/// attempt count rows come in publication order.
///
/// Uses `FOR UPDATE SKIP LOCKED`, so concurrent consumers never claim the
/// same row. Must run inside a transaction that stays open while the rows
/// are processed.
pub async fn claim_undelivered<'e, E: PgExecutor<'e>>(
    exec: E,
    now: DateTime<Utc>,
    limit: i64,
) -> Result<Vec<OutboxRecord>> {
    let rows = sqlx::query_as::<_, OutboxRecord>(
        "SELECT * FROM event_outbox \
         WHERE delivered_at IS NULL \
           AND (next_attempt_at IS NULL OR next_attempt_at <= $1) \
         ORDER BY attempts ASC, id ASC \
         LIMIT $2 \
         FOR UPDATE SKIP LOCKED",
    )
    .bind(now)
    .bind(limit)
    .fetch_all(exec)
    .await
    .context("failed to claim outbox records")?;

    Ok(rows)
}

/// Mark a row delivered.
pub async fn mark_delivered<'e, E: PgExecutor<'e>>(
    exec: E,
    id: i64,
    now: DateTime<Utc>,
) -> Result<()> {
    sqlx::query(
        "UPDATE event_outbox \
         SET delivered_at = $2, attempts = attempts + 1, last_error = NULL \
         WHERE id = $1",
    )
    .bind(id)
    .bind(now)
    .execute(exec)
    .await
    .context("failed to mark outbox record delivered")?;

    Ok(())
}

/// Record a failed delivery attempt. The row stays undelivered and is not
/// claimed again before `retry_at`.
pub async fn record_failure<'e, E: PgExecutor<'e>>(
    exec: E,
    id: i64,
    error: &str,
    retry_at: DateTime<Utc>,
) -> Result<()> {
    sqlx::query(
        "UPDATE event_outbox \
         SET attempts = attempts + 1, last_error = $2, next_attempt_at = $3 \
         WHERE id = $1",
    )
    .bind(id)
    .bind(error)
    .bind(retry_at)
    .execute(exec)
    .await
    .context("failed to record outbox delivery failure")?;

    Ok(())
}

/// Every outbox row for a plan, in publication order.
pub async fn list_for_plan<'e, E: PgExecutor<'e>>(
    exec: E,
    meal_plan_id: Uuid,
) -> Result<Vec<OutboxRecord>> {
    let rows = sqlx::query_as::<_, OutboxRecord>(
        "SELECT * FROM event_outbox WHERE meal_plan_id = $1 ORDER BY id ASC",
    )
    .bind(meal_plan_id)
    .fetch_all(exec)
    .await
    .context("failed to list outbox records for plan")?;

    Ok(rows)
}

/// Number of rows waiting for delivery.
pub async fn count_undelivered<'e, E: PgExecutor<'e>>(exec: E) -> Result<i64> {
    let count: i64 =
        sqlx::query_scalar("SELECT COUNT(*) FROM event_outbox WHERE delivered_at IS NULL")
            .fetch_one(exec)
            .await
            .context("failed to count undelivered outbox records")?;

    Ok(count)
}
