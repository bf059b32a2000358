use async_trait::async_trait;
use sqlx::PgPool;
use uuid::Uuid;

use mealplan_db::models::{PrepTaskTemplate, RecipeIngredient, UnitConversion};
use mealplan_db::queries::reference;

use super::{Catalog, HouseholdInfo};
use crate::error::CoreResult;

/// Catalog backed by the reference tables mirrored into the planning
/// database.
#[derive(Debug, Clone)]
pub struct PgCatalog {
    pool: PgPool,
}

impl PgCatalog {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl Catalog for PgCatalog {
    async fn household(&self, household_id: Uuid) -> CoreResult<Option<HouseholdInfo>> {
        let Some(household) = reference::get_household(&self.pool, household_id).await? else {
            return Ok(None);
        };
        let mut member_ids = reference::list_household_member_ids(&self.pool, household_id).await?;
        member_ids.sort();
        member_ids.dedup();

        Ok(Some(HouseholdInfo {
            id: household.id,
            owner_user_id: household.owner_user_id,
            member_ids,
        }))
    }

    async fn recipes_for_meal(&self, meal_id: Uuid) -> CoreResult<Vec<Uuid>> {
        Ok(reference::list_recipe_ids_for_meal(&self.pool, meal_id).await?)
    }

    async fn recipe_ingredients(&self, recipe_id: Uuid) -> CoreResult<Vec<RecipeIngredient>> {
        Ok(reference::list_recipe_ingredients(&self.pool, recipe_id).await?)
    }

    async fn prep_task_templates(&self, recipe_id: Uuid) -> CoreResult<Vec<PrepTaskTemplate>> {
        Ok(reference::list_prep_task_templates(&self.pool, recipe_id).await?)
    }

    async fn base_conversion(
        &self,
        unit_id: Uuid,
        ingredient_id: Uuid,
    ) -> CoreResult<Option<UnitConversion>> {
        Ok(reference::find_base_conversion(&self.pool, unit_id, ingredient_id).await?)
    }
}
