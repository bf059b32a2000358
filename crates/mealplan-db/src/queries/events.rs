//! Database query functions for the `meal_plan_events` table.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::PgExecutor;
use uuid::Uuid;

use crate::models::{MealName, MealPlanEvent};

/// Columns needed to insert an event.
#[derive(Debug, Clone)]
pub struct NewEvent<'a> {
    pub meal_name: MealName,
    pub notes: &'a str,
    pub starts_at: DateTime<Utc>,
    pub ends_at: DateTime<Utc>,
}

/// Insert an event into a plan.
///
/// The table's exclusion constraint rejects an event that overlaps another
/// live event of the same plan and meal name.
pub async fn insert_event<'e, E: PgExecutor<'e>>(
    exec: E,
    meal_plan_id: Uuid,
    new: &NewEvent<'_>,
) -> Result<MealPlanEvent> {
    let event = sqlx::query_as::<_, MealPlanEvent>(
        "INSERT INTO meal_plan_events (meal_plan_id, meal_name, notes, starts_at, ends_at) \
         VALUES ($1, $2, $3, $4, $5) \
         RETURNING *",
    )
    .bind(meal_plan_id)
    .bind(new.meal_name)
    .bind(new.notes)
    .bind(new.starts_at)
    .bind(new.ends_at)
    .fetch_one(exec)
    .await
    .context("failed to insert meal plan event")?;

    Ok(event)
}

/// Fetch an event by its ID.
pub async fn get_event<'e, E: PgExecutor<'e>>(exec: E, id: Uuid) -> Result<Option<MealPlanEvent>> {
    let event = sqlx::query_as::<_, MealPlanEvent>("SELECT * FROM meal_plan_events WHERE id = $1")
        .bind(id)
        .fetch_optional(exec)
        .await
        .context("failed to fetch meal plan event")?;

    Ok(event)
}

/// List the live events of a plan in start order.
pub async fn list_events_for_plan<'e, E: PgExecutor<'e>>(
    exec: E,
    meal_plan_id: Uuid,
) -> Result<Vec<MealPlanEvent>> {
    let events = sqlx::query_as::<_, MealPlanEvent>(
        "SELECT * FROM meal_plan_events \
         WHERE meal_plan_id = $1 AND archived_at IS NULL \
         ORDER BY starts_at ASC, id",
    )
    .bind(meal_plan_id)
    .fetch_all(exec)
    .await
    .context("failed to list meal plan events")?;

    Ok(events)
}

/// Return the ID of a live event of the same plan and meal whose time range
/// overlaps `[starts_at, ends_at)`, if one exists.
pub async fn find_overlapping_event<'e, E: PgExecutor<'e>>(
    exec: E,
    meal_plan_id: Uuid,
    meal_name: MealName,
    starts_at: DateTime<Utc>,
    ends_at: DateTime<Utc>,
) -> Result<Option<Uuid>> {
    let row: Option<(Uuid,)> = sqlx::query_as(
        "SELECT id FROM meal_plan_events \
         WHERE meal_plan_id = $1 AND meal_name = $2 AND archived_at IS NULL \
           AND starts_at < $4 AND $3 < ends_at \
         LIMIT 1",
    )
    .bind(meal_plan_id)
    .bind(meal_name)
    .bind(starts_at)
    .bind(ends_at)
    .fetch_optional(exec)
    .await
    .context("failed to check for overlapping events")?;

    Ok(row.map(|(id,)| id))
}

/// Mark every live event of a plan `finalized`. Returns rows affected.
pub async fn finalize_events_for_plan<'e, E: PgExecutor<'e>>(
    exec: E,
    meal_plan_id: Uuid,
) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE meal_plan_events \
         SET status = 'finalized' \
         WHERE meal_plan_id = $1 AND status = 'awaiting_votes' AND archived_at IS NULL",
    )
    .bind(meal_plan_id)
    .execute(exec)
    .await
    .context("failed to finalize meal plan events")?;

    Ok(result.rows_affected())
}
