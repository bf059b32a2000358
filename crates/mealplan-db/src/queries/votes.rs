//! Database query functions for the `meal_plan_option_votes` table.
//!
//! A user's ballot for an event is the set of their vote rows for that
//! event, one per option, ranks forming a permutation of `1..=K`.

use anyhow::{Context, Result};
use sqlx::{PgConnection, PgExecutor};
use uuid::Uuid;

use crate::models::MealPlanOptionVote;

/// Replace a user's ballot for an event with `ranking` (most preferred
/// first). Runs as two statements on the caller's connection, so call it
/// inside a transaction.
pub async fn replace_ballot(
    conn: &mut PgConnection,
    meal_plan_event_id: Uuid,
    by_user_id: Uuid,
    ranking: &[Uuid],
) -> Result<Vec<MealPlanOptionVote>> {
    sqlx::query(
        "DELETE FROM meal_plan_option_votes \
         WHERE meal_plan_event_id = $1 AND by_user_id = $2",
    )
    .bind(meal_plan_event_id)
    .bind(by_user_id)
    .execute(&mut *conn)
    .await
    .context("failed to clear previous ballot")?;

    let ranks: Vec<i32> = (1..=ranking.len() as i32).collect();
    let mut votes = sqlx::query_as::<_, MealPlanOptionVote>(
        "INSERT INTO meal_plan_option_votes \
             (meal_plan_event_id, meal_plan_option_id, by_user_id, rank) \
         SELECT $1, option_id, $2, rank \
         FROM UNNEST($3::uuid[], $4::int4[]) AS ballot (option_id, rank) \
         RETURNING *",
    )
    .bind(meal_plan_event_id)
    .bind(by_user_id)
    .bind(ranking)
    .bind(ranks)
    .fetch_all(&mut *conn)
    .await
    .context("failed to insert ballot")?;

    votes.sort_by_key(|v| v.rank);
    Ok(votes)
}

/// A user's ballot for an event, most preferred first.
pub async fn get_ballot<'e, E: PgExecutor<'e>>(
    exec: E,
    meal_plan_event_id: Uuid,
    by_user_id: Uuid,
) -> Result<Vec<MealPlanOptionVote>> {
    let votes = sqlx::query_as::<_, MealPlanOptionVote>(
        "SELECT * FROM meal_plan_option_votes \
         WHERE meal_plan_event_id = $1 AND by_user_id = $2 \
         ORDER BY rank ASC",
    )
    .bind(meal_plan_event_id)
    .bind(by_user_id)
    .fetch_all(exec)
    .await
    .context("failed to fetch ballot")?;

    Ok(votes)
}

/// Every vote row for an event, grouped by user then rank.
pub async fn list_votes_for_event<'e, E: PgExecutor<'e>>(
    exec: E,
    meal_plan_event_id: Uuid,
) -> Result<Vec<MealPlanOptionVote>> {
    let votes = sqlx::query_as::<_, MealPlanOptionVote>(
        "SELECT * FROM meal_plan_option_votes \
         WHERE meal_plan_event_id = $1 \
         ORDER BY by_user_id, rank ASC",
    )
    .bind(meal_plan_event_id)
    .fetch_all(exec)
    .await
    .context("failed to list votes for event")?;

    Ok(votes)
}

/// Every vote row for every live event of a plan, grouped by event, user,
/// then rank.
pub async fn list_votes_for_plan<'e, E: PgExecutor<'e>>(
    exec: E,
    meal_plan_id: Uuid,
) -> Result<Vec<MealPlanOptionVote>> {
    let votes = sqlx::query_as::<_, MealPlanOptionVote>(
        "SELECT v.* FROM meal_plan_option_votes v \
         JOIN meal_plan_events e ON e.id = v.meal_plan_event_id \
         WHERE e.meal_plan_id = $1 AND e.archived_at IS NULL \
         ORDER BY v.meal_plan_event_id, v.by_user_id, v.rank ASC",
    )
    .bind(meal_plan_id)
    .fetch_all(exec)
    .await
    .context("failed to list votes for plan")?;

    Ok(votes)
}

/// Number of distinct users with a ballot for an event.
pub async fn count_voters_for_event<'e, E: PgExecutor<'e>>(
    exec: E,
    meal_plan_event_id: Uuid,
) -> Result<i64> {
    let count: i64 = sqlx::query_scalar(
        "SELECT COUNT(DISTINCT by_user_id) FROM meal_plan_option_votes \
         WHERE meal_plan_event_id = $1",
    )
    .bind(meal_plan_event_id)
    .fetch_one(exec)
    .await
    .context("failed to count voters for event")?;

    Ok(count)
}
