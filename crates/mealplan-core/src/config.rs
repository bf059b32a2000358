//! Tunables for the core's in-process machinery.

use std::time::Duration;

/// Runtime configuration for [`crate::PlanningCore`] and its workers.
#[derive(Debug, Clone, PartialEq)]
pub struct CoreConfig {
    /// Capacity of the in-memory publish queue. A full queue blocks the
    /// publisher until a worker frees a slot.
    pub queue_capacity: usize,
    /// Number of workers draining the publish queue.
    pub publisher_workers: usize,
    /// Delivery attempts per envelope before the queue gives up on it.
    pub publish_max_attempts: u32,
    /// Backoff before the second attempt; doubles on each retry.
    pub publish_backoff: Duration,
    /// How long reference data may be served from cache.
    pub catalog_ttl: Duration,
    /// Consecutive finalize failures of one plan before a warning is logged.
    pub finalize_warn_threshold: u32,
    /// Outbox rows claimed per consumer poll.
    pub outbox_batch_size: i64,
    /// Prep tasks are (re)generated for events starting within this window.
    pub prep_horizon: Duration,
}

impl CoreConfig {
    pub const DEFAULT_QUEUE_CAPACITY: usize = 256;
    pub const DEFAULT_PUBLISHER_WORKERS: usize = 4;
    pub const DEFAULT_PUBLISH_MAX_ATTEMPTS: u32 = 5;
    pub const DEFAULT_PUBLISH_BACKOFF: Duration = Duration::from_millis(200);
    pub const DEFAULT_CATALOG_TTL: Duration = Duration::from_secs(300);
    pub const DEFAULT_FINALIZE_WARN_THRESHOLD: u32 = 3;
    pub const DEFAULT_OUTBOX_BATCH_SIZE: i64 = 50;
    pub const DEFAULT_PREP_HORIZON: Duration = Duration::from_secs(7 * 24 * 60 * 60);

    /// The prep horizon as a chrono duration for timestamp arithmetic.
    pub fn prep_horizon_chrono(&self) -> chrono::Duration {
        chrono::Duration::from_std(self.prep_horizon).unwrap_or(chrono::Duration::days(7))
    }

    /// Backoff before attempt `attempt` (1-based; attempt 1 has none).
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        if attempt <= 1 {
            return Duration::ZERO;
        }
        let factor = 1u32 << (attempt - 2).min(10);
        self.publish_backoff.saturating_mul(factor)
    }
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            queue_capacity: Self::DEFAULT_QUEUE_CAPACITY,
            publisher_workers: Self::DEFAULT_PUBLISHER_WORKERS,
            publish_max_attempts: Self::DEFAULT_PUBLISH_MAX_ATTEMPTS,
            publish_backoff: Self::DEFAULT_PUBLISH_BACKOFF,
            catalog_ttl: Self::DEFAULT_CATALOG_TTL,
            finalize_warn_threshold: Self::DEFAULT_FINALIZE_WARN_THRESHOLD,
            outbox_batch_size: Self::DEFAULT_OUTBOX_BATCH_SIZE,
            prep_horizon: Self::DEFAULT_PREP_HORIZON,
        }
    }
}
