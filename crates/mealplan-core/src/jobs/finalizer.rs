use std::collections::HashSet;
use std::sync::Arc;

use dashmap::DashMap;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::context::OpContext;
use crate::error::CoreError;
use crate::state::{Actor, Finalization};

/// Counts from one finalizer pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FinalizeReport {
    pub due: usize,
    pub finalized: usize,
    /// Lost to a concurrent finalizer or otherwise no longer finalizable.
    pub skipped: usize,
    pub failed: usize,
    pub cancelled: bool,
}

/// Finalizes every plan whose voting deadline has passed.
///
/// Safe to run from several processes: a plan lost to another finalizer
/// surfaces as a conflict and is skipped. Plans that keep failing are
/// reported with their consecutive failure count once it reaches the
/// warning threshold; there is no dead-letter queue.
pub struct FinalizerJob {
    finalization: Arc<Finalization>,
    warn_threshold: u32,
    failures: DashMap<Uuid, u32>,
}

impl FinalizerJob {
    pub fn new(finalization: Arc<Finalization>, warn_threshold: u32) -> Self {
        Self {
            finalization,
            warn_threshold: warn_threshold.max(1),
            failures: DashMap::new(),
        }
    }

    /// Consecutive failed attempts for a plan.
    pub fn failure_count(&self, plan_id: Uuid) -> u32 {
        self.failures.get(&plan_id).map(|c| *c).unwrap_or(0)
    }

    fn record_failure(&self, plan_id: Uuid) -> u32 {
        let mut count = self.failures.entry(plan_id).or_insert(0);
        *count += 1;
        *count
    }

    fn clear_failures(&self, plan_id: Uuid) {
        self.failures.remove(&plan_id);
    }

    pub async fn tick(&self, cancel: &CancellationToken) -> FinalizeReport {
        let mut report = FinalizeReport::default();

        let due = match self.finalization.due().await {
            Ok(plans) => plans,
            Err(e) => {
                warn!(error = %e, kind = e.code(), "failed to list plans past their voting deadline");
                return report;
            }
        };
        report.due = due.len();

        // Plans that left the due list (archived, finalized elsewhere) stop
        // being tracked.
        let due_ids: HashSet<Uuid> = due.iter().map(|p| p.id).collect();
        self.failures.retain(|id, _| due_ids.contains(id));

        for plan in due {
            if cancel.is_cancelled() {
                info!(remaining = report.due - report.finalized - report.skipped - report.failed, "finalizer cancelled");
                report.cancelled = true;
                break;
            }

            // Each plan runs to commit or rollback on its own.
            match self
                .finalization
                .finalize(&OpContext::background(), plan.id, Actor::System, false)
                .await
            {
                Ok(_) => {
                    self.clear_failures(plan.id);
                    report.finalized += 1;
                }
                Err(CoreError::Conflict(msg)) => {
                    debug!(plan_id = %plan.id, reason = %msg, "plan skipped");
                    self.clear_failures(plan.id);
                    report.skipped += 1;
                }
                Err(e) => {
                    report.failed += 1;
                    let count = self.record_failure(plan.id);
                    if count >= self.warn_threshold {
                        error!(
                            plan_id = %plan.id,
                            consecutive_failures = count,
                            kind = e.code(),
                            error = %e,
                            "plan keeps failing finalization; needs manual intervention"
                        );
                    } else {
                        warn!(
                            plan_id = %plan.id,
                            consecutive_failures = count,
                            kind = e.code(),
                            error = %e,
                            "plan finalization failed"
                        );
                    }
                }
            }
        }

        if report.due > 0 {
            info!(
                due = report.due,
                finalized = report.finalized,
                skipped = report.skipped,
                failed = report.failed,
                "finalizer pass complete"
            );
        }
        report
    }
}
