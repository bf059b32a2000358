//! Domain event publication.
//!
//! Publishing is at-least-once: an [`Envelope`] may be delivered more than
//! once, so every consumer deduplicates on the envelope's idempotency key
//! (or is idempotent by construction, like the artifact generators).

mod memory;
mod outbox;
mod queue;

pub use memory::MemoryPublisher;
pub use outbox::{ConsumeReport, OutboxConsumer, PgOutboxPublisher};
pub use queue::QueuedPublisher;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use uuid::Uuid;

use mealplan_db::models::{MealPlan, PrepTask, PrepTaskStatus};

use crate::error::CoreResult;

/// Topic names. Payload fields are stable: add, never rename or remove.
pub mod topics {
    pub const PLAN_CREATED: &str = "plan.created";
    pub const PLAN_FINALIZED: &str = "plan.finalized";
    pub const GROCERY_LIST_READY: &str = "plan.grocery_list.ready";
    pub const PREP_TASKS_READY: &str = "plan.prep_tasks.ready";
    pub const PLAN_COMPLETE: &str = "plan.complete";
    pub const TASK_STATUS_CHANGED: &str = "plan.task.status_changed";
}

/// A published domain event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    pub event_id: Uuid,
    pub topic: String,
    pub event_type: String,
    pub idempotency_key: String,
    pub meal_plan_id: Option<Uuid>,
    pub household_id: Option<Uuid>,
    pub user_id: Option<Uuid>,
    pub payload: serde_json::Value,
    pub occurred_at: DateTime<Utc>,
}

impl Envelope {
    fn for_plan(
        topic: &str,
        key: String,
        plan: &MealPlan,
        user_id: Option<Uuid>,
        payload: serde_json::Value,
        at: DateTime<Utc>,
    ) -> Self {
        Self {
            event_id: Uuid::new_v4(),
            topic: topic.to_owned(),
            event_type: topic.to_owned(),
            idempotency_key: key,
            meal_plan_id: Some(plan.id),
            household_id: Some(plan.household_id),
            user_id,
            payload,
            occurred_at: at,
        }
    }

    pub fn plan_created(plan: &MealPlan, event_ids: &[Uuid], at: DateTime<Utc>) -> Self {
        Self::for_plan(
            topics::PLAN_CREATED,
            plan.id.to_string(),
            plan,
            Some(plan.created_by_user_id),
            json!({
                "planId": plan.id,
                "householdId": plan.household_id,
                "createdByUserId": plan.created_by_user_id,
                "votingDeadline": plan.voting_deadline,
                "eventIds": event_ids,
            }),
            at,
        )
    }

    pub fn plan_finalized(plan: &MealPlan, by_user: Option<Uuid>, at: DateTime<Utc>) -> Self {
        Self::for_plan(
            topics::PLAN_FINALIZED,
            plan.id.to_string(),
            plan,
            by_user,
            json!({
                "planId": plan.id,
                "householdId": plan.household_id,
                "finalizedAt": plan.finalized_at,
            }),
            at,
        )
    }

    pub fn grocery_list_ready(plan: &MealPlan, item_count: usize, at: DateTime<Utc>) -> Self {
        Self::for_plan(
            topics::GROCERY_LIST_READY,
            plan.id.to_string(),
            plan,
            None,
            json!({
                "planId": plan.id,
                "householdId": plan.household_id,
                "itemCount": item_count,
            }),
            at,
        )
    }

    pub fn prep_tasks_ready(plan: &MealPlan, task_count: usize, at: DateTime<Utc>) -> Self {
        Self::for_plan(
            topics::PREP_TASKS_READY,
            plan.id.to_string(),
            plan,
            None,
            json!({
                "planId": plan.id,
                "householdId": plan.household_id,
                "taskCount": task_count,
            }),
            at,
        )
    }

    pub fn plan_complete(plan: &MealPlan, at: DateTime<Utc>) -> Self {
        Self::for_plan(
            topics::PLAN_COMPLETE,
            plan.id.to_string(),
            plan,
            None,
            json!({
                "planId": plan.id,
                "householdId": plan.household_id,
            }),
            at,
        )
    }

    /// Keyed on `(taskId, newStatus, changedAt)`.
    pub fn task_status_changed(
        plan: &MealPlan,
        task: &PrepTask,
        previous: PrepTaskStatus,
        by_user: Uuid,
        changed_at: DateTime<Utc>,
    ) -> Self {
        let changed = changed_at.to_rfc3339_opts(SecondsFormat::Micros, true);
        Self::for_plan(
            topics::TASK_STATUS_CHANGED,
            format!("{}:{}:{}", task.id, task.status, changed),
            plan,
            Some(by_user),
            json!({
                "taskId": task.id,
                "planId": plan.id,
                "previousStatus": previous,
                "newStatus": task.status,
                "explanation": task.status_explanation,
                "changedAt": changed_at,
            }),
            changed_at,
        )
    }

    /// Plan ID carried by the envelope or its payload.
    pub fn plan_id(&self) -> Option<Uuid> {
        self.meal_plan_id.or_else(|| {
            self.payload
                .get("planId")
                .and_then(|v| v.as_str())
                .and_then(|s| s.parse().ok())
        })
    }
}

/// Publishes envelopes to the message queue.
#[async_trait]
pub trait Publisher: Send + Sync {
    async fn publish(&self, envelope: Envelope) -> CoreResult<()>;
}

/// Consumes envelopes delivered from the queue. Must be idempotent.
#[async_trait]
pub trait EventHandler: Send + Sync {
    fn name(&self) -> &str;

    fn handles(&self, topic: &str) -> bool;

    async fn handle(&self, envelope: &Envelope) -> CoreResult<()>;
}

const _: () = {
    fn _assert_object_safe(_: &dyn Publisher, _: &dyn EventHandler) {}
};
