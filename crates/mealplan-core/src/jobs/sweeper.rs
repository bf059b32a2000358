use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::context::OpContext;
use crate::grocery::GroceryListGenerator;
use crate::prep::PrepTaskGenerator;

/// Counts from one sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub grocery_lists: usize,
    pub prep_plans: usize,
    pub failed: usize,
    pub cancelled: bool,
}

/// Re-drives the artifact generators from database state, healing plans
/// whose `plan.finalized` message was lost.
pub struct ReplaySweeper {
    grocery: Arc<GroceryListGenerator>,
    prep: Arc<PrepTaskGenerator>,
    horizon: chrono::Duration,
}

impl ReplaySweeper {
    pub fn new(
        grocery: Arc<GroceryListGenerator>,
        prep: Arc<PrepTaskGenerator>,
        horizon: chrono::Duration,
    ) -> Self {
        Self {
            grocery,
            prep,
            horizon,
        }
    }

    pub async fn tick(&self, cancel: &CancellationToken) -> SweepReport {
        let mut report = SweepReport::default();

        match self.grocery.pending().await {
            Ok(plans) => {
                for plan in plans {
                    if cancel.is_cancelled() {
                        report.cancelled = true;
                        return report;
                    }
                    match self.grocery.generate(&OpContext::background(), plan.id).await {
                        Ok(_) => report.grocery_lists += 1,
                        Err(e) => {
                            report.failed += 1;
                            warn!(plan_id = %plan.id, kind = e.code(), error = %e, "grocery list replay failed");
                        }
                    }
                }
            }
            Err(e) => warn!(kind = e.code(), error = %e, "failed to list plans missing a grocery list"),
        }

        match self.prep.pending(self.horizon).await {
            Ok(plans) => {
                for plan in plans {
                    if cancel.is_cancelled() {
                        report.cancelled = true;
                        return report;
                    }
                    match self.prep.generate(&OpContext::background(), plan.id).await {
                        Ok(_) => report.prep_plans += 1,
                        Err(e) => {
                            report.failed += 1;
                            warn!(plan_id = %plan.id, kind = e.code(), error = %e, "prep task replay failed");
                        }
                    }
                }
            }
            Err(e) => warn!(kind = e.code(), error = %e, "failed to list plans due for prep"),
        }

        if report.grocery_lists + report.prep_plans + report.failed > 0 {
            info!(
                grocery_lists = report.grocery_lists,
                prep_plans = report.prep_plans,
                failed = report.failed,
                "replay sweep complete"
            );
        }
        report
    }
}
