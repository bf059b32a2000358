//! Database query functions for the `meal_plan_options` table.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::PgExecutor;
use uuid::Uuid;

use crate::models::{MealName, MealPlanOption};

/// Columns needed to insert an option.
#[derive(Debug, Clone)]
pub struct NewOption<'a> {
    pub meal_id: Uuid,
    pub assigned_cook_user_id: Option<Uuid>,
    pub notes: &'a str,
}

/// A winning option joined with the event it won, as needed by the
/// artifact generators.
#[derive(Debug, Clone, PartialEq, Serialize, sqlx::FromRow)]
pub struct WinningOption {
    pub meal_plan_option_id: Uuid,
    pub meal_plan_event_id: Uuid,
    pub meal_id: Uuid,
    pub assigned_cook_user_id: Option<Uuid>,
    pub meal_name: MealName,
    pub starts_at: DateTime<Utc>,
}

/// Insert an option into an event.
pub async fn insert_option<'e, E: PgExecutor<'e>>(
    exec: E,
    meal_plan_event_id: Uuid,
    new: &NewOption<'_>,
) -> Result<MealPlanOption> {
    let option = sqlx::query_as::<_, MealPlanOption>(
        "INSERT INTO meal_plan_options (meal_plan_event_id, meal_id, assigned_cook_user_id, notes) \
         VALUES ($1, $2, $3, $4) \
         RETURNING *",
    )
    .bind(meal_plan_event_id)
    .bind(new.meal_id)
    .bind(new.assigned_cook_user_id)
    .bind(new.notes)
    .fetch_one(exec)
    .await
    .context("failed to insert meal plan option")?;

    Ok(option)
}

/// Fetch an option by its ID.
pub async fn get_option<'e, E: PgExecutor<'e>>(
    exec: E,
    id: Uuid,
) -> Result<Option<MealPlanOption>> {
    let option =
        sqlx::query_as::<_, MealPlanOption>("SELECT * FROM meal_plan_options WHERE id = $1")
            .bind(id)
            .fetch_optional(exec)
            .await
            .context("failed to fetch meal plan option")?;

    Ok(option)
}

/// List the live options of an event in creation order.
pub async fn list_options_for_event<'e, E: PgExecutor<'e>>(
    exec: E,
    meal_plan_event_id: Uuid,
) -> Result<Vec<MealPlanOption>> {
    let options = sqlx::query_as::<_, MealPlanOption>(
        "SELECT * FROM meal_plan_options \
         WHERE meal_plan_event_id = $1 AND archived_at IS NULL \
         ORDER BY created_at ASC, id",
    )
    .bind(meal_plan_event_id)
    .fetch_all(exec)
    .await
    .context("failed to list meal plan options")?;

    Ok(options)
}

/// List the live options of every live event in a plan.
pub async fn list_options_for_plan<'e, E: PgExecutor<'e>>(
    exec: E,
    meal_plan_id: Uuid,
) -> Result<Vec<MealPlanOption>> {
    let options = sqlx::query_as::<_, MealPlanOption>(
        "SELECT o.* FROM meal_plan_options o \
         JOIN meal_plan_events e ON e.id = o.meal_plan_event_id \
         WHERE e.meal_plan_id = $1 AND e.archived_at IS NULL AND o.archived_at IS NULL \
         ORDER BY e.starts_at ASC, o.created_at ASC, o.id",
    )
    .bind(meal_plan_id)
    .fetch_all(exec)
    .await
    .context("failed to list meal plan options for plan")?;

    Ok(options)
}

/// Soft-archive an option. Returns rows affected.
pub async fn archive_option<'e, E: PgExecutor<'e>>(
    exec: E,
    id: Uuid,
    now: DateTime<Utc>,
) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE meal_plan_options SET archived_at = $2 \
         WHERE id = $1 AND archived_at IS NULL",
    )
    .bind(id)
    .bind(now)
    .execute(exec)
    .await
    .context("failed to archive meal plan option")?;

    Ok(result.rows_affected())
}

/// Record the outcome of an event's vote on all of its live options.
///
/// `winner` becomes `winner` (with the given tie-break flag); every other
/// option becomes `loser`. With `winner = None` all options lose.
pub async fn record_event_outcome<'e, E: PgExecutor<'e>>(
    exec: E,
    meal_plan_event_id: Uuid,
    winner: Option<Uuid>,
    tiebroken: bool,
) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE meal_plan_options \
         SET chosen = CASE WHEN id = $2 THEN 'winner' ELSE 'loser' END, \
             tiebroken = COALESCE(id = $2, false) AND $3 \
         WHERE meal_plan_event_id = $1 AND archived_at IS NULL",
    )
    .bind(meal_plan_event_id)
    .bind(winner)
    .bind(tiebroken)
    .execute(exec)
    .await
    .context("failed to record event outcome")?;

    Ok(result.rows_affected())
}

/// The winning option of every live, finalized event of a plan.
pub async fn list_winning_options_for_plan<'e, E: PgExecutor<'e>>(
    exec: E,
    meal_plan_id: Uuid,
) -> Result<Vec<WinningOption>> {
    let rows = sqlx::query_as::<_, WinningOption>(
        "SELECT o.id AS meal_plan_option_id, e.id AS meal_plan_event_id, o.meal_id, \
                o.assigned_cook_user_id, e.meal_name, e.starts_at \
         FROM meal_plan_options o \
         JOIN meal_plan_events e ON e.id = o.meal_plan_event_id \
         WHERE e.meal_plan_id = $1 \
           AND e.archived_at IS NULL AND o.archived_at IS NULL \
           AND e.status = 'finalized' AND o.chosen = 'winner' \
         ORDER BY e.starts_at ASC, o.id",
    )
    .bind(meal_plan_id)
    .fetch_all(exec)
    .await
    .context("failed to list winning options")?;

    Ok(rows)
}
