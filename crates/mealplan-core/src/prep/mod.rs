//! Prep task generation and tracking.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use tracing::{info, warn};
use uuid::Uuid;

use mealplan_db::models::{MealPlan, PrepTask, PrepTaskStatus, PrepTaskTemplate};
use mealplan_db::queries::options::WinningOption;
use mealplan_db::queries::prep_tasks::NewPrepTask;

use crate::bus::{Envelope, EventHandler, Publisher, topics};
use crate::catalog::{Catalog, HouseholdInfo};
use crate::clock::Clock;
use crate::context::OpContext;
use crate::error::{CoreError, CoreResult};
use crate::grocery::{publish, settle};
use crate::state::not_a_member;
use crate::store::{ArtifactSaved, PlanRepository, PrepTaskStore};

/// The `(cannot_complete_before, cannot_complete_after)` window of a task
/// whose template asks for it `offset_seconds` before the meal starts.
///
/// The window opens twice the offset before it closes, but never before
/// `now`; a window that would close before `now` collapses onto its end.
pub fn schedule(
    starts_at: DateTime<Utc>,
    offset_seconds: i64,
    now: DateTime<Utc>,
) -> (DateTime<Utc>, DateTime<Utc>) {
    let offset = Duration::seconds(offset_seconds.max(0));
    let after = starts_at - offset;
    let before = (after - offset * 2).max(now).min(after);
    (before, after)
}

/// The task a template yields for one winning option.
pub fn task_for(winner: &WinningOption, template: &PrepTaskTemplate, now: DateTime<Utc>) -> NewPrepTask {
    let (before, after) = schedule(winner.starts_at, template.offset_before_seconds, now);
    let mut explanation = format!(
        "{} for {} on {}",
        template.name,
        winner.meal_name,
        winner.starts_at.format("%Y-%m-%d %H:%M UTC")
    );
    if !template.storage_requirement.is_empty() {
        explanation.push_str(&format!("; store {}", template.storage_requirement));
    }

    NewPrepTask {
        meal_plan_option_id: winner.meal_plan_option_id,
        recipe_id: template.recipe_id,
        recipe_prep_task_template_id: template.id,
        assigned_to_user_id: winner.assigned_cook_user_id,
        cannot_complete_before: before,
        cannot_complete_after: after,
        creation_explanation: explanation,
    }
}

/// Derives dated prep tasks for a finalized plan.
pub struct PrepTaskGenerator {
    store: Arc<dyn PrepTaskStore>,
    catalog: Arc<dyn Catalog>,
    bus: Arc<dyn Publisher>,
    clock: Arc<dyn Clock>,
}

impl PrepTaskGenerator {
    pub fn new(
        store: Arc<dyn PrepTaskStore>,
        catalog: Arc<dyn Catalog>,
        bus: Arc<dyn Publisher>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            catalog,
            bus,
            clock,
        }
    }

    /// Finalized plans without prep tasks that have a meal starting within
    /// `horizon`.
    pub async fn pending(&self, horizon: Duration) -> CoreResult<Vec<MealPlan>> {
        let now = self.clock.now();
        self.store.plans_due_for_prep(now, now + horizon).await
    }

    pub async fn compute(
        &self,
        winners: &[WinningOption],
        now: DateTime<Utc>,
    ) -> CoreResult<Vec<NewPrepTask>> {
        let mut tasks = Vec::new();
        for winner in winners {
            for recipe_id in self.catalog.recipes_for_meal(winner.meal_id).await? {
                for template in self.catalog.prep_task_templates(recipe_id).await? {
                    tasks.push(task_for(winner, &template, now));
                }
            }
        }
        Ok(tasks)
    }

    /// Generate (or regenerate) the prep tasks of a finalized plan.
    ///
    /// Idempotent: tasks are unique per `(option, template)`.
    pub async fn generate(&self, ctx: &OpContext, plan_id: Uuid) -> CoreResult<ArtifactSaved> {
        let (saved, task_count) = ctx
            .run(async {
                let (_, winners) = self.store.finalized_winners(plan_id).await?;
                let now = self.clock.now();
                let tasks = self.compute(&winners, now).await?;
                let saved = self.store.save_prep_tasks(plan_id, &tasks, now).await?;
                Ok((saved, tasks.len()))
            })
            .await?;

        info!(
            plan_id = %plan_id,
            tasks = task_count,
            written = saved.written,
            status = %saved.plan.status,
            "prep tasks generated"
        );

        let now = self.clock.now();
        if saved.initialized {
            publish(
                self.bus.as_ref(),
                Envelope::prep_tasks_ready(&saved.plan, task_count, now),
            )
            .await;
        }
        if saved.completed {
            publish(self.bus.as_ref(), Envelope::plan_complete(&saved.plan, now)).await;
        }
        Ok(saved)
    }
}

#[async_trait]
impl EventHandler for PrepTaskGenerator {
    fn name(&self) -> &str {
        "prep-task-generator"
    }

    fn handles(&self, topic: &str) -> bool {
        topic == topics::PLAN_FINALIZED
    }

    async fn handle(&self, envelope: &Envelope) -> CoreResult<()> {
        let Some(plan_id) = envelope.plan_id() else {
            warn!(key = %envelope.idempotency_key, "plan.finalized without a plan id, dropped");
            return Ok(());
        };
        let result = self
            .generate(&OpContext::background(), plan_id)
            .await
            .map(|_| ());
        settle(self.name(), envelope, result)
    }
}

/// User-facing operations on existing prep tasks.
pub struct PrepTaskTracker {
    tasks: Arc<dyn PrepTaskStore>,
    plans: Arc<dyn PlanRepository>,
    catalog: Arc<dyn Catalog>,
    bus: Arc<dyn Publisher>,
    clock: Arc<dyn Clock>,
}

impl PrepTaskTracker {
    pub fn new(
        tasks: Arc<dyn PrepTaskStore>,
        plans: Arc<dyn PlanRepository>,
        catalog: Arc<dyn Catalog>,
        bus: Arc<dyn Publisher>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            tasks,
            plans,
            catalog,
            bus,
            clock,
        }
    }

    pub async fn list(&self, plan_id: Uuid) -> CoreResult<Vec<PrepTask>> {
        self.plans.plan(plan_id).await?;
        self.tasks.prep_tasks(plan_id).await
    }

    async fn household_for_task(&self, task: &PrepTask) -> CoreResult<HouseholdInfo> {
        let plan = self.plans.plan(task.meal_plan_id).await?;
        self.catalog
            .household(plan.household_id)
            .await?
            .ok_or_else(|| CoreError::not_found(format!("household {}", plan.household_id)))
    }

    /// Move a task along the prep-task state machine and announce it.
    pub async fn change_status(
        &self,
        ctx: &OpContext,
        task_id: Uuid,
        user_id: Uuid,
        to: PrepTaskStatus,
        explanation: Option<&str>,
    ) -> CoreResult<PrepTask> {
        let (plan, change) = ctx
            .run(async {
                let task = self.tasks.prep_task(task_id).await?;
                let household = self.household_for_task(&task).await?;
                if !household.is_member(user_id) {
                    return Err(not_a_member(user_id, household.id));
                }
                let change = self
                    .tasks
                    .change_prep_task_status(task_id, to, explanation.unwrap_or_default(), self.clock.now())
                    .await?;
                let plan = self.plans.plan(task.meal_plan_id).await?;
                Ok((plan, change))
            })
            .await?;

        info!(
            task_id = %task_id,
            from = %change.previous,
            to = %change.task.status,
            "prep task status changed"
        );

        let changed_at = change.task.last_updated_at.unwrap_or_else(|| self.clock.now());
        publish(
            self.bus.as_ref(),
            Envelope::task_status_changed(&plan, &change.task, change.previous, user_id, changed_at),
        )
        .await;
        Ok(change.task)
    }

    /// Assign a task to a household member, or unassign it.
    pub async fn assign(
        &self,
        ctx: &OpContext,
        task_id: Uuid,
        by_user_id: Uuid,
        assignee: Option<Uuid>,
    ) -> CoreResult<PrepTask> {
        ctx.run(async {
            let task = self.tasks.prep_task(task_id).await?;
            let household = self.household_for_task(&task).await?;
            if !household.is_member(by_user_id) {
                return Err(not_a_member(by_user_id, household.id));
            }
            if let Some(assignee) = assignee
                && !household.is_member(assignee)
            {
                return Err(not_a_member(assignee, household.id));
            }
            self.tasks
                .assign_prep_task(task_id, assignee, self.clock.now())
                .await
        })
        .await
    }
}
