//! Database query functions for the `meal_plan_tasks` table.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::PgExecutor;
use uuid::Uuid;

use crate::models::{PrepTask, PrepTaskStatus};

/// A generated prep task, unique per `(option, template)`.
#[derive(Debug, Clone, PartialEq)]
pub struct NewPrepTask {
    pub meal_plan_option_id: Uuid,
    pub recipe_id: Uuid,
    pub recipe_prep_task_template_id: Uuid,
    pub assigned_to_user_id: Option<Uuid>,
    pub cannot_complete_before: DateTime<Utc>,
    pub cannot_complete_after: DateTime<Utc>,
    pub creation_explanation: String,
}

/// Insert a generated task. Returns `None` if the `(option, template)` pair
/// already has a task, which makes regeneration a no-op.
pub async fn insert_prep_task<'e, E: PgExecutor<'e>>(
    exec: E,
    meal_plan_id: Uuid,
    task: &NewPrepTask,
    now: DateTime<Utc>,
) -> Result<Option<PrepTask>> {
    let row = sqlx::query_as::<_, PrepTask>(
        "INSERT INTO meal_plan_tasks \
             (meal_plan_id, meal_plan_option_id, recipe_id, recipe_prep_task_template_id, \
              assigned_to_user_id, cannot_complete_before, cannot_complete_after, \
              creation_explanation, created_at) \
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9) \
         ON CONFLICT (meal_plan_option_id, recipe_prep_task_template_id) DO NOTHING \
         RETURNING *",
    )
    .bind(meal_plan_id)
    .bind(task.meal_plan_option_id)
    .bind(task.recipe_id)
    .bind(task.recipe_prep_task_template_id)
    .bind(task.assigned_to_user_id)
    .bind(task.cannot_complete_before)
    .bind(task.cannot_complete_after)
    .bind(&task.creation_explanation)
    .bind(now)
    .fetch_optional(exec)
    .await
    .context("failed to insert prep task")?;

    Ok(row)
}

/// Fetch a task by its ID.
pub async fn get_prep_task<'e, E: PgExecutor<'e>>(exec: E, id: Uuid) -> Result<Option<PrepTask>> {
    let task = sqlx::query_as::<_, PrepTask>("SELECT * FROM meal_plan_tasks WHERE id = $1")
        .bind(id)
        .fetch_optional(exec)
        .await
        .context("failed to fetch prep task")?;

    Ok(task)
}

/// List a plan's tasks by deadline.
pub async fn list_prep_tasks_for_plan<'e, E: PgExecutor<'e>>(
    exec: E,
    meal_plan_id: Uuid,
) -> Result<Vec<PrepTask>> {
    let tasks = sqlx::query_as::<_, PrepTask>(
        "SELECT * FROM meal_plan_tasks \
         WHERE meal_plan_id = $1 \
         ORDER BY cannot_complete_after ASC, id",
    )
    .bind(meal_plan_id)
    .fetch_all(exec)
    .await
    .context("failed to list prep tasks")?;

    Ok(tasks)
}

/// Atomically move a task from one status to another.
///
/// Optimistic: only matches when the current status is `from`. Sets
/// `completed_at` when the target is `finished`. Returns the updated row,
/// or `None` if the status did not match or the task is missing.
pub async fn transition_prep_task_status<'e, E: PgExecutor<'e>>(
    exec: E,
    id: Uuid,
    from: PrepTaskStatus,
    to: PrepTaskStatus,
    explanation: &str,
    now: DateTime<Utc>,
) -> Result<Option<PrepTask>> {
    let task = sqlx::query_as::<_, PrepTask>(
        "UPDATE meal_plan_tasks \
         SET status = $3, \
             status_explanation = $4, \
             completed_at = CASE WHEN $3 = 'finished' THEN $5 ELSE completed_at END, \
             last_updated_at = $5 \
         WHERE id = $1 AND status = $2 \
         RETURNING *",
    )
    .bind(id)
    .bind(from)
    .bind(to)
    .bind(explanation)
    .bind(now)
    .fetch_optional(exec)
    .await
    .context("failed to transition prep task status")?;

    Ok(task)
}

/// Assign (or unassign) a task. Returns `None` if the task is missing.
pub async fn assign_prep_task<'e, E: PgExecutor<'e>>(
    exec: E,
    id: Uuid,
    user_id: Option<Uuid>,
    now: DateTime<Utc>,
) -> Result<Option<PrepTask>> {
    let task = sqlx::query_as::<_, PrepTask>(
        "UPDATE meal_plan_tasks \
         SET assigned_to_user_id = $2, last_updated_at = $3 \
         WHERE id = $1 \
         RETURNING *",
    )
    .bind(id)
    .bind(user_id)
    .bind(now)
    .fetch_optional(exec)
    .await
    .context("failed to assign prep task")?;

    Ok(task)
}
