//! Read access to reference data owned by the household and recipe
//! catalogs, plus insert helpers used to seed it.

use anyhow::{Context, Result};
use rust_decimal::Decimal;
use sqlx::PgExecutor;
use uuid::Uuid;

use crate::models::{
    Household, MeasurementUnit, PrepTaskTemplate, RecipeIngredient, UnitConversion, UnitDimension,
};

// ---------------------------------------------------------------------------
// Households
// ---------------------------------------------------------------------------

pub async fn get_household<'e, E: PgExecutor<'e>>(exec: E, id: Uuid) -> Result<Option<Household>> {
    let household = sqlx::query_as::<_, Household>("SELECT * FROM households WHERE id = $1")
        .bind(id)
        .fetch_optional(exec)
        .await
        .context("failed to fetch household")?;

    Ok(household)
}

/// User IDs of every member of a household, owner included.
pub async fn list_household_member_ids<'e, E: PgExecutor<'e>>(
    exec: E,
    household_id: Uuid,
) -> Result<Vec<Uuid>> {
    let ids: Vec<Uuid> = sqlx::query_scalar(
        "SELECT user_id FROM household_members \
         WHERE household_id = $1 \
         UNION \
         SELECT owner_user_id FROM households WHERE id = $1 \
         ORDER BY 1",
    )
    .bind(household_id)
    .fetch_all(exec)
    .await
    .context("failed to list household members")?;

    Ok(ids)
}

// ---------------------------------------------------------------------------
// Recipes
// ---------------------------------------------------------------------------

/// Recipes making up a meal.
pub async fn list_recipe_ids_for_meal<'e, E: PgExecutor<'e>>(
    exec: E,
    meal_id: Uuid,
) -> Result<Vec<Uuid>> {
    let ids: Vec<Uuid> =
        sqlx::query_scalar("SELECT recipe_id FROM meal_recipes WHERE meal_id = $1 ORDER BY 1")
            .bind(meal_id)
            .fetch_all(exec)
            .await
            .context("failed to list recipes for meal")?;

    Ok(ids)
}

pub async fn list_recipe_ingredients<'e, E: PgExecutor<'e>>(
    exec: E,
    recipe_id: Uuid,
) -> Result<Vec<RecipeIngredient>> {
    let rows = sqlx::query_as::<_, RecipeIngredient>(
        "SELECT * FROM recipe_ingredients WHERE recipe_id = $1 ORDER BY id",
    )
    .bind(recipe_id)
    .fetch_all(exec)
    .await
    .context("failed to list recipe ingredients")?;

    Ok(rows)
}

pub async fn list_prep_task_templates<'e, E: PgExecutor<'e>>(
    exec: E,
    recipe_id: Uuid,
) -> Result<Vec<PrepTaskTemplate>> {
    let rows = sqlx::query_as::<_, PrepTaskTemplate>(
        "SELECT * FROM recipe_prep_task_templates WHERE recipe_id = $1 ORDER BY id",
    )
    .bind(recipe_id)
    .fetch_all(exec)
    .await
    .context("failed to list prep task templates")?;

    Ok(rows)
}

// ---------------------------------------------------------------------------
// Units
// ---------------------------------------------------------------------------

pub async fn get_measurement_unit<'e, E: PgExecutor<'e>>(
    exec: E,
    id: Uuid,
) -> Result<Option<MeasurementUnit>> {
    let unit = sqlx::query_as::<_, MeasurementUnit>("SELECT * FROM measurement_units WHERE id = $1")
        .bind(id)
        .fetch_optional(exec)
        .await
        .context("failed to fetch measurement unit")?;

    Ok(unit)
}

/// The conversion from `from_unit_id` into the base unit of its dimension.
///
/// A conversion registered for `ingredient_id` wins over a general one.
/// Returns `None` when the unit is already a base unit or no conversion is
/// registered.
pub async fn find_base_conversion<'e, E: PgExecutor<'e>>(
    exec: E,
    from_unit_id: Uuid,
    ingredient_id: Uuid,
) -> Result<Option<UnitConversion>> {
    let conversion = sqlx::query_as::<_, UnitConversion>(
        "SELECT c.from_unit_id, c.to_unit_id, c.only_for_ingredient, c.modifier \
         FROM measurement_unit_conversions c \
         JOIN measurement_units f ON f.id = c.from_unit_id \
         JOIN measurement_units t ON t.id = c.to_unit_id \
         WHERE c.from_unit_id = $1 \
           AND t.is_base AND t.dimension = f.dimension \
           AND (c.only_for_ingredient IS NULL OR c.only_for_ingredient = $2) \
         ORDER BY c.only_for_ingredient IS NULL ASC, c.id \
         LIMIT 1",
    )
    .bind(from_unit_id)
    .bind(ingredient_id)
    .fetch_optional(exec)
    .await
    .context("failed to find base unit conversion")?;

    Ok(conversion)
}

// ---------------------------------------------------------------------------
// Seeding
// ---------------------------------------------------------------------------

/// Insert a household and register its owner as a member.
pub async fn insert_household(
    conn: &mut sqlx::PgConnection,
    name: &str,
    owner_user_id: Uuid,
) -> Result<Household> {
    let household = sqlx::query_as::<_, Household>(
        "INSERT INTO households (name, owner_user_id) VALUES ($1, $2) RETURNING *",
    )
    .bind(name)
    .bind(owner_user_id)
    .fetch_one(&mut *conn)
    .await
    .context("failed to insert household")?;

    add_household_member(&mut *conn, household.id, owner_user_id).await?;
    Ok(household)
}

pub async fn add_household_member<'e, E: PgExecutor<'e>>(
    exec: E,
    household_id: Uuid,
    user_id: Uuid,
) -> Result<()> {
    sqlx::query(
        "INSERT INTO household_members (household_id, user_id) VALUES ($1, $2) \
         ON CONFLICT DO NOTHING",
    )
    .bind(household_id)
    .bind(user_id)
    .execute(exec)
    .await
    .context("failed to add household member")?;

    Ok(())
}

pub async fn insert_measurement_unit<'e, E: PgExecutor<'e>>(
    exec: E,
    name: &str,
    dimension: UnitDimension,
    is_base: bool,
) -> Result<MeasurementUnit> {
    let unit = sqlx::query_as::<_, MeasurementUnit>(
        "INSERT INTO measurement_units (name, dimension, is_base) VALUES ($1, $2, $3) RETURNING *",
    )
    .bind(name)
    .bind(dimension)
    .bind(is_base)
    .fetch_one(exec)
    .await
    .context("failed to insert measurement unit")?;

    Ok(unit)
}

pub async fn insert_unit_conversion<'e, E: PgExecutor<'e>>(
    exec: E,
    from_unit_id: Uuid,
    to_unit_id: Uuid,
    only_for_ingredient: Option<Uuid>,
    modifier: Decimal,
) -> Result<()> {
    sqlx::query(
        "INSERT INTO measurement_unit_conversions \
             (from_unit_id, to_unit_id, only_for_ingredient, modifier) \
         VALUES ($1, $2, $3, $4)",
    )
    .bind(from_unit_id)
    .bind(to_unit_id)
    .bind(only_for_ingredient)
    .bind(modifier)
    .execute(exec)
    .await
    .context("failed to insert unit conversion")?;

    Ok(())
}

pub async fn insert_ingredient<'e, E: PgExecutor<'e>>(exec: E, name: &str) -> Result<Uuid> {
    let id: Uuid = sqlx::query_scalar("INSERT INTO ingredients (name) VALUES ($1) RETURNING id")
        .bind(name)
        .fetch_one(exec)
        .await
        .context("failed to insert ingredient")?;

    Ok(id)
}

pub async fn insert_recipe<'e, E: PgExecutor<'e>>(exec: E, name: &str) -> Result<Uuid> {
    let id: Uuid = sqlx::query_scalar("INSERT INTO recipes (name) VALUES ($1) RETURNING id")
        .bind(name)
        .fetch_one(exec)
        .await
        .context("failed to insert recipe")?;

    Ok(id)
}

/// Insert a meal made of the given recipes.
pub async fn insert_meal(
    conn: &mut sqlx::PgConnection,
    name: &str,
    recipe_ids: &[Uuid],
) -> Result<Uuid> {
    let id: Uuid = sqlx::query_scalar("INSERT INTO meals (name) VALUES ($1) RETURNING id")
        .bind(name)
        .fetch_one(&mut *conn)
        .await
        .context("failed to insert meal")?;

    sqlx::query(
        "INSERT INTO meal_recipes (meal_id, recipe_id) \
         SELECT $1, recipe_id FROM UNNEST($2::uuid[]) AS r (recipe_id)",
    )
    .bind(id)
    .bind(recipe_ids)
    .execute(&mut *conn)
    .await
    .context("failed to link meal recipes")?;

    Ok(id)
}

pub async fn insert_recipe_ingredient<'e, E: PgExecutor<'e>>(
    exec: E,
    recipe_id: Uuid,
    ingredient_id: Uuid,
    measurement_unit_id: Uuid,
    min_quantity: Decimal,
    max_quantity: Option<Decimal>,
) -> Result<RecipeIngredient> {
    let row = sqlx::query_as::<_, RecipeIngredient>(
        "INSERT INTO recipe_ingredients \
             (recipe_id, ingredient_id, measurement_unit_id, min_quantity, max_quantity) \
         VALUES ($1, $2, $3, $4, $5) \
         RETURNING *",
    )
    .bind(recipe_id)
    .bind(ingredient_id)
    .bind(measurement_unit_id)
    .bind(min_quantity)
    .bind(max_quantity)
    .fetch_one(exec)
    .await
    .context("failed to insert recipe ingredient")?;

    Ok(row)
}

pub async fn insert_prep_task_template<'e, E: PgExecutor<'e>>(
    exec: E,
    recipe_id: Uuid,
    name: &str,
    offset_before_seconds: i64,
) -> Result<PrepTaskTemplate> {
    let row = sqlx::query_as::<_, PrepTaskTemplate>(
        "INSERT INTO recipe_prep_task_templates (recipe_id, name, offset_before_seconds) \
         VALUES ($1, $2, $3) \
         RETURNING *",
    )
    .bind(recipe_id)
    .bind(name)
    .bind(offset_before_seconds)
    .fetch_one(exec)
    .await
    .context("failed to insert prep task template")?;

    Ok(row)
}
