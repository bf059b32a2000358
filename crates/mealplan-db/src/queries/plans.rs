//! Database query functions for the `meal_plans` table.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::PgExecutor;
use uuid::Uuid;

use crate::models::{MealPlan, PlanStatus};

/// Columns needed to insert a plan; everything else is server-generated.
#[derive(Debug, Clone)]
pub struct NewPlan<'a> {
    pub household_id: Uuid,
    pub created_by_user_id: Uuid,
    pub notes: &'a str,
    pub voting_deadline: DateTime<Utc>,
}

/// Filter for [`list_plans_for_household`].
#[derive(Debug, Clone)]
pub struct PlanFilter {
    pub status: Option<PlanStatus>,
    pub include_archived: bool,
    pub limit: i64,
    pub offset: i64,
}

impl Default for PlanFilter {
    fn default() -> Self {
        Self {
            status: None,
            include_archived: false,
            limit: 50,
            offset: 0,
        }
    }
}

/// Insert a new plan row in `awaiting_votes`.
///
/// Fails with a unique violation when the household already has a plan
/// collecting votes.
pub async fn insert_plan<'e, E: PgExecutor<'e>>(exec: E, new: &NewPlan<'_>) -> Result<MealPlan> {
    let plan = sqlx::query_as::<_, MealPlan>(
        "INSERT INTO meal_plans (household_id, created_by_user_id, notes, voting_deadline) \
         VALUES ($1, $2, $3, $4) \
         RETURNING *",
    )
    .bind(new.household_id)
    .bind(new.created_by_user_id)
    .bind(new.notes)
    .bind(new.voting_deadline)
    .fetch_one(exec)
    .await
    .context("failed to insert meal plan")?;

    Ok(plan)
}

/// Fetch a plan by its ID.
pub async fn get_plan<'e, E: PgExecutor<'e>>(exec: E, id: Uuid) -> Result<Option<MealPlan>> {
    let plan = sqlx::query_as::<_, MealPlan>("SELECT * FROM meal_plans WHERE id = $1")
        .bind(id)
        .fetch_optional(exec)
        .await
        .context("failed to fetch meal plan")?;

    Ok(plan)
}

/// Fetch a plan and take a row lock on it for the rest of the transaction.
///
/// Every state-changing operation on a plan (finalization, ballot
/// submission, artifact generation) takes this lock first, which
/// linearizes them per plan.
pub async fn get_plan_for_update<'e, E: PgExecutor<'e>>(
    exec: E,
    id: Uuid,
) -> Result<Option<MealPlan>> {
    let plan = sqlx::query_as::<_, MealPlan>("SELECT * FROM meal_plans WHERE id = $1 FOR UPDATE")
        .bind(id)
        .fetch_optional(exec)
        .await
        .context("failed to lock meal plan")?;

    Ok(plan)
}

/// Fetch a plan with a shared row lock.
///
/// Ballot submissions take this lock: they may run concurrently with each
/// other but not with a finalization holding the exclusive lock.
pub async fn get_plan_for_share<'e, E: PgExecutor<'e>>(
    exec: E,
    id: Uuid,
) -> Result<Option<MealPlan>> {
    let plan = sqlx::query_as::<_, MealPlan>("SELECT * FROM meal_plans WHERE id = $1 FOR SHARE")
        .bind(id)
        .fetch_optional(exec)
        .await
        .context("failed to share-lock meal plan")?;

    Ok(plan)
}

/// Check whether a plan exists.
pub async fn plan_exists<'e, E: PgExecutor<'e>>(exec: E, id: Uuid) -> Result<bool> {
    let exists: bool = sqlx::query_scalar("SELECT EXISTS(SELECT 1 FROM meal_plans WHERE id = $1)")
        .bind(id)
        .fetch_one(exec)
        .await
        .context("failed to check meal plan existence")?;

    Ok(exists)
}

/// The household's plan currently collecting votes, if any.
pub async fn find_open_plan_for_household<'e, E: PgExecutor<'e>>(
    exec: E,
    household_id: Uuid,
) -> Result<Option<MealPlan>> {
    let plan = sqlx::query_as::<_, MealPlan>(
        "SELECT * FROM meal_plans \
         WHERE household_id = $1 AND status = 'awaiting_votes'",
    )
    .bind(household_id)
    .fetch_optional(exec)
    .await
    .context("failed to find open meal plan")?;

    Ok(plan)
}

/// List a household's plans, newest first.
pub async fn list_plans_for_household<'e, E: PgExecutor<'e>>(
    exec: E,
    household_id: Uuid,
    filter: &PlanFilter,
) -> Result<Vec<MealPlan>> {
    let plans = sqlx::query_as::<_, MealPlan>(
        "SELECT * FROM meal_plans \
         WHERE household_id = $1 \
           AND ($2::text IS NULL OR status = $2) \
           AND ($3 OR archived_at IS NULL) \
         ORDER BY created_at DESC, id \
         LIMIT $4 OFFSET $5",
    )
    .bind(household_id)
    .bind(filter.status)
    .bind(filter.include_archived)
    .bind(filter.limit)
    .bind(filter.offset)
    .fetch_all(exec)
    .await
    .context("failed to list meal plans for household")?;

    Ok(plans)
}

/// Update notes and/or the voting deadline of a plan still collecting votes.
///
/// Returns `None` when the plan does not exist or is no longer
/// `awaiting_votes`.
pub async fn update_plan_details<'e, E: PgExecutor<'e>>(
    exec: E,
    id: Uuid,
    notes: Option<&str>,
    voting_deadline: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
) -> Result<Option<MealPlan>> {
    let plan = sqlx::query_as::<_, MealPlan>(
        "UPDATE meal_plans \
         SET notes = COALESCE($2, notes), \
             voting_deadline = COALESCE($3, voting_deadline), \
             last_updated_at = $4 \
         WHERE id = $1 AND status = 'awaiting_votes' \
         RETURNING *",
    )
    .bind(id)
    .bind(notes)
    .bind(voting_deadline)
    .bind(now)
    .fetch_optional(exec)
    .await
    .context("failed to update meal plan")?;

    Ok(plan)
}

/// Soft-archive a plan. Returns `None` if it is missing or already archived.
pub async fn archive_plan<'e, E: PgExecutor<'e>>(
    exec: E,
    id: Uuid,
    now: DateTime<Utc>,
) -> Result<Option<MealPlan>> {
    let plan = sqlx::query_as::<_, MealPlan>(
        "UPDATE meal_plans \
         SET status = 'archived', archived_at = $2, last_updated_at = $2 \
         WHERE id = $1 AND status <> 'archived' \
         RETURNING *",
    )
    .bind(id)
    .bind(now)
    .fetch_optional(exec)
    .await
    .context("failed to archive meal plan")?;

    Ok(plan)
}

/// Atomically move a plan from one status to another.
///
/// Optimistic: the WHERE clause includes `status = $from`, so the row only
/// changes if nobody else moved it first. Returns the number of rows
/// affected (0 means the status did not match). Sets `finalized_at` when the
/// target is `finalized`.
pub async fn transition_plan_status<'e, E: PgExecutor<'e>>(
    exec: E,
    id: Uuid,
    from: PlanStatus,
    to: PlanStatus,
    now: DateTime<Utc>,
) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE meal_plans \
         SET status = $3, \
             finalized_at = CASE WHEN $3 = 'finalized' THEN $4 ELSE finalized_at END, \
             last_updated_at = $4 \
         WHERE id = $1 AND status = $2",
    )
    .bind(id)
    .bind(from)
    .bind(to)
    .bind(now)
    .execute(exec)
    .await
    .context("failed to transition meal plan status")?;

    Ok(result.rows_affected())
}

/// Record that the grocery list exists, advancing the status.
///
/// The status becomes `complete` when prep tasks were already recorded,
/// otherwise `grocery_list_initialized`. Returns `None`, writing nothing,
/// if the plan is not in a finalized state or the list was already marked.
pub async fn mark_grocery_list_initialized<'e, E: PgExecutor<'e>>(
    exec: E,
    id: Uuid,
    now: DateTime<Utc>,
) -> Result<Option<MealPlan>> {
    let plan = sqlx::query_as::<_, MealPlan>(
        "UPDATE meal_plans \
         SET grocery_list_initialized_at = $2, \
             status = CASE \
                 WHEN tasks_created_at IS NOT NULL THEN 'complete' \
                 ELSE 'grocery_list_initialized' \
             END, \
             last_updated_at = $2 \
         WHERE id = $1 \
           AND grocery_list_initialized_at IS NULL \
           AND status IN ('finalized', 'prep_tasks_generated') \
         RETURNING *",
    )
    .bind(id)
    .bind(now)
    .fetch_optional(exec)
    .await
    .context("failed to mark grocery list initialized")?;

    Ok(plan)
}

/// Record that prep tasks exist, advancing the status.
///
/// Mirror image of [`mark_grocery_list_initialized`].
pub async fn mark_tasks_created<'e, E: PgExecutor<'e>>(
    exec: E,
    id: Uuid,
    now: DateTime<Utc>,
) -> Result<Option<MealPlan>> {
    let plan = sqlx::query_as::<_, MealPlan>(
        "UPDATE meal_plans \
         SET tasks_created_at = $2, \
             status = CASE \
                 WHEN grocery_list_initialized_at IS NOT NULL THEN 'complete' \
                 ELSE 'prep_tasks_generated' \
             END, \
             last_updated_at = $2 \
         WHERE id = $1 \
           AND tasks_created_at IS NULL \
           AND status IN ('finalized', 'grocery_list_initialized') \
         RETURNING *",
    )
    .bind(id)
    .bind(now)
    .fetch_optional(exec)
    .await
    .context("failed to mark prep tasks created")?;

    Ok(plan)
}

/// Plans still collecting votes whose deadline is before `now`.
pub async fn find_plans_past_voting_deadline<'e, E: PgExecutor<'e>>(
    exec: E,
    now: DateTime<Utc>,
) -> Result<Vec<MealPlan>> {
    let plans = sqlx::query_as::<_, MealPlan>(
        "SELECT * FROM meal_plans \
         WHERE status = 'awaiting_votes' AND voting_deadline < $1 \
         ORDER BY voting_deadline ASC, id",
    )
    .bind(now)
    .fetch_all(exec)
    .await
    .context("failed to find plans past their voting deadline")?;

    Ok(plans)
}

/// Finalized plans that have no grocery list yet.
///
/// Includes plans whose prep tasks were generated first.
pub async fn find_finalized_plans_without_grocery_list<'e, E: PgExecutor<'e>>(
    exec: E,
) -> Result<Vec<MealPlan>> {
    let plans = sqlx::query_as::<_, MealPlan>(
        "SELECT * FROM meal_plans \
         WHERE status IN ('finalized', 'prep_tasks_generated') \
           AND grocery_list_initialized_at IS NULL \
         ORDER BY finalized_at ASC NULLS LAST, id",
    )
    .fetch_all(exec)
    .await
    .context("failed to find finalized plans without grocery lists")?;

    Ok(plans)
}

/// Finalized plans without prep tasks that have a non-archived event
/// starting in `[now, until)`.
pub async fn find_finalized_plans_for_window<'e, E: PgExecutor<'e>>(
    exec: E,
    now: DateTime<Utc>,
    until: DateTime<Utc>,
) -> Result<Vec<MealPlan>> {
    let plans = sqlx::query_as::<_, MealPlan>(
        "SELECT p.* FROM meal_plans p \
         WHERE p.status IN ('finalized', 'grocery_list_initialized') \
           AND p.tasks_created_at IS NULL \
           AND EXISTS ( \
               SELECT 1 FROM meal_plan_events e \
               WHERE e.meal_plan_id = p.id \
                 AND e.archived_at IS NULL \
                 AND e.starts_at >= $1 AND e.starts_at < $2 \
           ) \
         ORDER BY p.finalized_at ASC NULLS LAST, p.id",
    )
    .bind(now)
    .bind(until)
    .fetch_all(exec)
    .await
    .context("failed to find finalized plans for the planning window")?;

    Ok(plans)
}
