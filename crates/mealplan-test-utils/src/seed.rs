//! Reference-data fixtures: households, units, meals.

use anyhow::Result;
use rust_decimal::Decimal;
use sqlx::PgPool;
use uuid::Uuid;

use mealplan_db::models::UnitDimension;
use mealplan_db::queries::reference;

/// A seeded household. `members[0]` is the owner.
#[derive(Debug, Clone)]
pub struct SeededHousehold {
    pub id: Uuid,
    pub owner: Uuid,
    pub members: Vec<Uuid>,
}

/// Seed a household with its owner plus `extra_members` other members.
pub async fn household(pool: &PgPool, extra_members: usize) -> Result<SeededHousehold> {
    let owner = Uuid::new_v4();
    let mut conn = pool.acquire().await?;
    let row = reference::insert_household(&mut conn, "test household", owner).await?;

    let mut members = vec![owner];
    for _ in 0..extra_members {
        let user = Uuid::new_v4();
        reference::add_household_member(&mut *conn, row.id, user).await?;
        members.push(user);
    }

    Ok(SeededHousehold {
        id: row.id,
        owner,
        members,
    })
}

/// The standard unit set.
///
/// Base units: gram (mass), milliliter (volume), piece (count). Kilogram
/// converts to grams by 1000, cup to milliliters by 236.5882. `pinch` has
/// no conversion at all.
#[derive(Debug, Clone, Copy)]
pub struct Units {
    pub gram: Uuid,
    pub kilogram: Uuid,
    pub milliliter: Uuid,
    pub cup: Uuid,
    pub piece: Uuid,
    pub pinch: Uuid,
}

pub async fn units(pool: &PgPool) -> Result<Units> {
    let gram = reference::insert_measurement_unit(pool, "gram", UnitDimension::Mass, true).await?;
    let kilogram =
        reference::insert_measurement_unit(pool, "kilogram", UnitDimension::Mass, false).await?;
    let milliliter =
        reference::insert_measurement_unit(pool, "milliliter", UnitDimension::Volume, true).await?;
    let cup = reference::insert_measurement_unit(pool, "cup", UnitDimension::Volume, false).await?;
    let piece = reference::insert_measurement_unit(pool, "piece", UnitDimension::Count, true).await?;
    let pinch = reference::insert_measurement_unit(pool, "pinch", UnitDimension::Other, false).await?;

    reference::insert_unit_conversion(pool, kilogram.id, gram.id, None, Decimal::from(1000))
        .await?;
    reference::insert_unit_conversion(
        pool,
        cup.id,
        milliliter.id,
        None,
        Decimal::new(2365882, 4),
    )
    .await?;

    Ok(Units {
        gram: gram.id,
        kilogram: kilogram.id,
        milliliter: milliliter.id,
        cup: cup.id,
        piece: piece.id,
        pinch: pinch.id,
    })
}

pub async fn ingredient(pool: &PgPool, name: &str) -> Result<Uuid> {
    reference::insert_ingredient(pool, name).await
}

/// One ingredient line of a seeded recipe.
#[derive(Debug, Clone, Copy)]
pub struct Line {
    pub ingredient_id: Uuid,
    pub unit_id: Uuid,
    pub min: Decimal,
    pub max: Option<Decimal>,
}

impl Line {
    pub fn new(ingredient_id: Uuid, unit_id: Uuid, min: Decimal) -> Self {
        Self {
            ingredient_id,
            unit_id,
            min,
            max: None,
        }
    }

    pub fn with_max(mut self, max: Decimal) -> Self {
        self.max = Some(max);
        self
    }
}

#[derive(Debug, Clone)]
pub struct SeededMeal {
    pub meal_id: Uuid,
    pub recipe_id: Uuid,
    pub template_ids: Vec<Uuid>,
}

/// Seed a single-recipe meal with ingredient lines and prep templates
/// given as `(name, offset_before_seconds)`.
pub async fn meal(
    pool: &PgPool,
    name: &str,
    lines: &[Line],
    templates: &[(&str, i64)],
) -> Result<SeededMeal> {
    let recipe_id = reference::insert_recipe(pool, name).await?;
    for line in lines {
        reference::insert_recipe_ingredient(
            pool,
            recipe_id,
            line.ingredient_id,
            line.unit_id,
            line.min,
            line.max,
        )
        .await?;
    }

    let mut template_ids = Vec::with_capacity(templates.len());
    for (template_name, offset) in templates {
        let t = reference::insert_prep_task_template(pool, recipe_id, template_name, *offset).await?;
        template_ids.push(t.id);
    }

    let mut conn = pool.acquire().await?;
    let meal_id = reference::insert_meal(&mut conn, name, &[recipe_id]).await?;

    Ok(SeededMeal {
        meal_id,
        recipe_id,
        template_ids,
    })
}

/// Seed a meal with no recipes. Useful where only the meal ID matters.
pub async fn bare_meal(pool: &PgPool, name: &str) -> Result<Uuid> {
    let mut conn = pool.acquire().await?;
    reference::insert_meal(&mut conn, name, &[]).await
}
