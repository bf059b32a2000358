use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use sqlx::PgPool;
use tracing::{debug, info, warn};

use mealplan_db::models::OutboxRecord;
use mealplan_db::queries::outbox::{self, NewOutboxRecord};

use super::{Envelope, EventHandler, Publisher};
use crate::error::CoreResult;

/// Publisher backend that appends envelopes to the `event_outbox` table.
///
/// `(topic, idempotency_key)` is unique, so republishing an envelope that
/// already landed is a silent no-op.
#[derive(Debug, Clone)]
pub struct PgOutboxPublisher {
    pool: PgPool,
}

impl PgOutboxPublisher {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl Publisher for PgOutboxPublisher {
    async fn publish(&self, envelope: Envelope) -> CoreResult<()> {
        let inserted = outbox::insert_outbox_record(
            &self.pool,
            &NewOutboxRecord {
                event_id: envelope.event_id,
                topic: &envelope.topic,
                event_type: &envelope.event_type,
                idempotency_key: &envelope.idempotency_key,
                meal_plan_id: envelope.meal_plan_id,
                household_id: envelope.household_id,
                user_id: envelope.user_id,
                payload: &envelope.payload,
                occurred_at: envelope.occurred_at,
            },
        )
        .await?;

        if !inserted {
            debug!(
                topic = %envelope.topic,
                key = %envelope.idempotency_key,
                "duplicate envelope skipped"
            );
        }
        Ok(())
    }
}

impl From<OutboxRecord> for Envelope {
    fn from(row: OutboxRecord) -> Self {
        Self {
            event_id: row.event_id,
            topic: row.topic,
            event_type: row.event_type,
            idempotency_key: row.idempotency_key,
            meal_plan_id: row.meal_plan_id,
            household_id: row.household_id,
            user_id: row.user_id,
            payload: row.payload,
            occurred_at: row.occurred_at,
        }
    }
}

/// Counts from one consumer poll.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConsumeReport {
    pub claimed: usize,
    pub delivered: usize,
    pub failed: usize,
}

/// Drains the outbox into registered handlers.
///
/// Rows are claimed with `FOR UPDATE SKIP LOCKED`, so several consumers may
/// poll concurrently. A row is marked delivered only when every handler for
/// its topic succeeded; otherwise the failure is recorded and the row backs
/// off exponentially before it is claimed again.
pub struct OutboxConsumer {
    pool: PgPool,
    handlers: Vec<Arc<dyn EventHandler>>,
    batch_size: i64,
    retry_backoff: Duration,
    max_retry_backoff: Duration,
}

impl OutboxConsumer {
    pub const DEFAULT_RETRY_BACKOFF: Duration = Duration::from_secs(5);
    pub const DEFAULT_MAX_RETRY_BACKOFF: Duration = Duration::from_secs(60 * 60);

    pub fn new(pool: PgPool, handlers: Vec<Arc<dyn EventHandler>>, batch_size: i64) -> Self {
        Self {
            pool,
            handlers,
            batch_size: batch_size.max(1),
            retry_backoff: Self::DEFAULT_RETRY_BACKOFF,
            max_retry_backoff: Self::DEFAULT_MAX_RETRY_BACKOFF,
        }
    }

    /// Backoff after the first failure, doubling per failure up to `max`.
    pub fn with_retry_backoff(mut self, base: Duration, max: Duration) -> Self {
        self.retry_backoff = base;
        self.max_retry_backoff = max.max(base);
        self
    }

    pub async fn poll_once(&self) -> CoreResult<ConsumeReport> {
        let now = Utc::now();
        let mut tx = self.pool.begin().await?;
        let rows = outbox::claim_undelivered(&mut *tx, now, self.batch_size).await?;

        let mut report = ConsumeReport {
            claimed: rows.len(),
            ..ConsumeReport::default()
        };

        for row in rows {
            let id = row.id;
            let failures = u32::try_from(row.attempts).unwrap_or(0).saturating_add(1);
            let envelope = Envelope::from(row);
            match self.dispatch(&envelope).await {
                Ok(()) => {
                    outbox::mark_delivered(&mut *tx, id, Utc::now()).await?;
                    report.delivered += 1;
                }
                Err(e) => {
                    let delay = retry_delay(self.retry_backoff, self.max_retry_backoff, failures);
                    warn!(
                        outbox_id = id,
                        topic = %envelope.topic,
                        key = %envelope.idempotency_key,
                        attempts = failures,
                        retry_in_secs = delay.as_secs(),
                        error = %e,
                        "event handler failed, will retry"
                    );
                    let retry_at = now
                        + chrono::Duration::from_std(delay).unwrap_or(chrono::Duration::hours(1));
                    outbox::record_failure(&mut *tx, id, &e.to_string(), retry_at).await?;
                    report.failed += 1;
                }
            }
        }

        tx.commit().await?;

        if report.claimed > 0 {
            info!(
                claimed = report.claimed,
                delivered = report.delivered,
                failed = report.failed,
                "outbox batch processed"
            );
        }
        Ok(report)
    }

    async fn dispatch(&self, envelope: &Envelope) -> CoreResult<()> {
        for handler in self.handlers.iter().filter(|h| h.handles(&envelope.topic)) {
            debug!(handler = handler.name(), topic = %envelope.topic, "dispatching");
            handler.handle(envelope).await?;
        }
        Ok(())
    }
}

/// Delay before retrying a row that has now failed `failures` times.
fn retry_delay(base: Duration, max: Duration, failures: u32) -> Duration {
    let factor = 1u32 << failures.saturating_sub(1).min(16);
    base.saturating_mul(factor).min(max)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retry_delay_doubles_up_to_cap() {
        let base = Duration::from_secs(5);
        let max = Duration::from_secs(60);
        assert_eq!(retry_delay(base, max, 1), Duration::from_secs(5));
        assert_eq!(retry_delay(base, max, 2), Duration::from_secs(10));
        assert_eq!(retry_delay(base, max, 4), Duration::from_secs(40));
        assert_eq!(retry_delay(base, max, 5), max);
        assert_eq!(retry_delay(base, max, 400), max);
    }
}
