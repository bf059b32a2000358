//! Database query functions for the `meal_plan_grocery_list_items` table.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::PgExecutor;
use uuid::Uuid;

use crate::models::{GroceryItemStatus, GroceryListItem};

/// A generated grocery line, keyed by `(plan, ingredient, unit)`.
#[derive(Debug, Clone, PartialEq)]
pub struct NewGroceryItem {
    pub ingredient_id: Uuid,
    pub measurement_unit_id: Uuid,
    pub min_quantity: Decimal,
    pub max_quantity: Option<Decimal>,
}

/// User-maintained fields of a grocery line. `None` leaves a field as is.
#[derive(Debug, Clone, Default)]
pub struct GroceryItemUpdate<'a> {
    pub status: Option<GroceryItemStatus>,
    pub status_explanation: Option<&'a str>,
    pub purchased_quantity: Option<Decimal>,
    pub purchased_measurement_unit_id: Option<Uuid>,
    pub purchase_price: Option<Decimal>,
    pub purchased_upc: Option<&'a str>,
}

/// Insert a generated line, or refresh its quantities if the key exists.
///
/// Returns `None` when an identical line was already present, so a replay
/// performs no write. User-maintained columns (status, purchase details)
/// are never touched by regeneration.
pub async fn upsert_generated_item<'e, E: PgExecutor<'e>>(
    exec: E,
    meal_plan_id: Uuid,
    item: &NewGroceryItem,
    now: DateTime<Utc>,
) -> Result<Option<GroceryListItem>> {
    let row = sqlx::query_as::<_, GroceryListItem>(
        "INSERT INTO meal_plan_grocery_list_items \
             (meal_plan_id, ingredient_id, measurement_unit_id, min_quantity, max_quantity, status, created_at) \
         VALUES ($1, $2, $3, $4, $5, 'needed', $6) \
         ON CONFLICT (meal_plan_id, ingredient_id, measurement_unit_id) WHERE archived_at IS NULL \
         DO UPDATE SET min_quantity = EXCLUDED.min_quantity, \
                       max_quantity = EXCLUDED.max_quantity, \
                       last_updated_at = $6 \
         WHERE meal_plan_grocery_list_items.min_quantity IS DISTINCT FROM EXCLUDED.min_quantity \
            OR meal_plan_grocery_list_items.max_quantity IS DISTINCT FROM EXCLUDED.max_quantity \
         RETURNING *",
    )
    .bind(meal_plan_id)
    .bind(item.ingredient_id)
    .bind(item.measurement_unit_id)
    .bind(item.min_quantity)
    .bind(item.max_quantity)
    .bind(now)
    .fetch_optional(exec)
    .await
    .context("failed to upsert grocery list item")?;

    Ok(row)
}

/// Fetch a grocery line by its ID.
pub async fn get_grocery_item<'e, E: PgExecutor<'e>>(
    exec: E,
    id: Uuid,
) -> Result<Option<GroceryListItem>> {
    let item = sqlx::query_as::<_, GroceryListItem>(
        "SELECT * FROM meal_plan_grocery_list_items WHERE id = $1",
    )
    .bind(id)
    .fetch_optional(exec)
    .await
    .context("failed to fetch grocery list item")?;

    Ok(item)
}

/// List the live grocery lines of a plan.
pub async fn list_grocery_items_for_plan<'e, E: PgExecutor<'e>>(
    exec: E,
    meal_plan_id: Uuid,
) -> Result<Vec<GroceryListItem>> {
    let items = sqlx::query_as::<_, GroceryListItem>(
        "SELECT * FROM meal_plan_grocery_list_items \
         WHERE meal_plan_id = $1 AND archived_at IS NULL \
         ORDER BY ingredient_id, measurement_unit_id",
    )
    .bind(meal_plan_id)
    .fetch_all(exec)
    .await
    .context("failed to list grocery list items")?;

    Ok(items)
}

/// Apply a user update to a live grocery line. Returns `None` if missing.
pub async fn update_grocery_item<'e, E: PgExecutor<'e>>(
    exec: E,
    id: Uuid,
    update: &GroceryItemUpdate<'_>,
    now: DateTime<Utc>,
) -> Result<Option<GroceryListItem>> {
    let item = sqlx::query_as::<_, GroceryListItem>(
        "UPDATE meal_plan_grocery_list_items \
         SET status = COALESCE($2, status), \
             status_explanation = COALESCE($3, status_explanation), \
             purchased_quantity = COALESCE($4, purchased_quantity), \
             purchased_measurement_unit_id = COALESCE($5, purchased_measurement_unit_id), \
             purchase_price = COALESCE($6, purchase_price), \
             purchased_upc = COALESCE($7, purchased_upc), \
             last_updated_at = $8 \
         WHERE id = $1 AND archived_at IS NULL \
         RETURNING *",
    )
    .bind(id)
    .bind(update.status)
    .bind(update.status_explanation)
    .bind(update.purchased_quantity)
    .bind(update.purchased_measurement_unit_id)
    .bind(update.purchase_price)
    .bind(update.purchased_upc)
    .bind(now)
    .fetch_optional(exec)
    .await
    .context("failed to update grocery list item")?;

    Ok(item)
}
