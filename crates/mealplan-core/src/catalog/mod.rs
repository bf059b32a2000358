//! Read-only reference data owned by other services: households, recipes,
//! measurement units.

mod cached;
mod pg;

pub use cached::CachedCatalog;
pub use pg::PgCatalog;

use async_trait::async_trait;
use uuid::Uuid;

use mealplan_db::models::{PrepTaskTemplate, RecipeIngredient, UnitConversion};

use crate::error::CoreResult;

/// A household as the core needs it: who owns it and who belongs to it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HouseholdInfo {
    pub id: Uuid,
    pub owner_user_id: Uuid,
    /// Every member, owner included, sorted.
    pub member_ids: Vec<Uuid>,
}

impl HouseholdInfo {
    pub fn is_member(&self, user_id: Uuid) -> bool {
        self.member_ids.binary_search(&user_id).is_ok()
    }

    pub fn is_owner(&self, user_id: Uuid) -> bool {
        self.owner_user_id == user_id
    }
}

/// Lookups against the household and recipe catalogs.
#[async_trait]
pub trait Catalog: Send + Sync {
    async fn household(&self, household_id: Uuid) -> CoreResult<Option<HouseholdInfo>>;

    async fn recipes_for_meal(&self, meal_id: Uuid) -> CoreResult<Vec<Uuid>>;

    async fn recipe_ingredients(&self, recipe_id: Uuid) -> CoreResult<Vec<RecipeIngredient>>;

    async fn prep_task_templates(&self, recipe_id: Uuid) -> CoreResult<Vec<PrepTaskTemplate>>;

    /// Conversion from `unit_id` to the base unit of its dimension,
    /// preferring one registered for `ingredient_id`. `None` when the unit
    /// is a base unit or cannot be converted.
    async fn base_conversion(
        &self,
        unit_id: Uuid,
        ingredient_id: Uuid,
    ) -> CoreResult<Option<UnitConversion>>;
}

const _: () = {
    fn _assert_object_safe(_: &dyn Catalog) {}
};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn membership_checks() {
        let owner = Uuid::new_v4();
        let member = Uuid::new_v4();
        let mut member_ids = vec![owner, member];
        member_ids.sort();
        let h = HouseholdInfo {
            id: Uuid::new_v4(),
            owner_user_id: owner,
            member_ids,
        };

        assert!(h.is_member(owner));
        assert!(h.is_member(member));
        assert!(!h.is_member(Uuid::new_v4()));
        assert!(h.is_owner(owner));
        assert!(!h.is_owner(member));
    }
}
