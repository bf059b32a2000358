use std::hash::Hash;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::time::Instant;
use uuid::Uuid;

use mealplan_db::models::{PrepTaskTemplate, RecipeIngredient, UnitConversion};

use super::{Catalog, HouseholdInfo};
use crate::error::CoreResult;

struct TtlEntry<V> {
    value: V,
    expires_at: Instant,
}

/// Entries expire `ttl` after insertion; an expired entry is dropped on the
/// lookup that finds it.
struct TtlMap<K, V> {
    ttl: Duration,
    entries: DashMap<K, TtlEntry<V>>,
}

impl<K: Eq + Hash, V: Clone> TtlMap<K, V> {
    fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: DashMap::new(),
        }
    }

    fn get(&self, key: &K) -> Option<V> {
        if let Some(entry) = self.entries.get(key) {
            if Instant::now() < entry.expires_at {
                return Some(entry.value.clone());
            }
            drop(entry);
            self.entries
                .remove_if(key, |_, e| Instant::now() >= e.expires_at);
        }
        None
    }

    fn put(&self, key: K, value: V) {
        let expires_at = Instant::now() + self.ttl;
        self.entries.insert(key, TtlEntry { value, expires_at });
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.entries.len()
    }
}

/// Wraps a catalog with a TTL cache over recipe and unit lookups.
///
/// Household membership is always read through: it decides who may vote
/// and finalize.
pub struct CachedCatalog {
    inner: Arc<dyn Catalog>,
    recipes: TtlMap<Uuid, Vec<Uuid>>,
    ingredients: TtlMap<Uuid, Vec<RecipeIngredient>>,
    templates: TtlMap<Uuid, Vec<PrepTaskTemplate>>,
    conversions: TtlMap<(Uuid, Uuid), Option<UnitConversion>>,
}

impl CachedCatalog {
    pub fn new(inner: Arc<dyn Catalog>, ttl: Duration) -> Self {
        Self {
            inner,
            recipes: TtlMap::new(ttl),
            ingredients: TtlMap::new(ttl),
            templates: TtlMap::new(ttl),
            conversions: TtlMap::new(ttl),
        }
    }
}

#[async_trait]
impl Catalog for CachedCatalog {
    async fn household(&self, household_id: Uuid) -> CoreResult<Option<HouseholdInfo>> {
        self.inner.household(household_id).await
    }

    async fn recipes_for_meal(&self, meal_id: Uuid) -> CoreResult<Vec<Uuid>> {
        if let Some(hit) = self.recipes.get(&meal_id) {
            return Ok(hit);
        }
        let value = self.inner.recipes_for_meal(meal_id).await?;
        self.recipes.put(meal_id, value.clone());
        Ok(value)
    }

    async fn recipe_ingredients(&self, recipe_id: Uuid) -> CoreResult<Vec<RecipeIngredient>> {
        if let Some(hit) = self.ingredients.get(&recipe_id) {
            return Ok(hit);
        }
        let value = self.inner.recipe_ingredients(recipe_id).await?;
        self.ingredients.put(recipe_id, value.clone());
        Ok(value)
    }

    async fn prep_task_templates(&self, recipe_id: Uuid) -> CoreResult<Vec<PrepTaskTemplate>> {
        if let Some(hit) = self.templates.get(&recipe_id) {
            return Ok(hit);
        }
        let value = self.inner.prep_task_templates(recipe_id).await?;
        self.templates.put(recipe_id, value.clone());
        Ok(value)
    }

    async fn base_conversion(
        &self,
        unit_id: Uuid,
        ingredient_id: Uuid,
    ) -> CoreResult<Option<UnitConversion>> {
        let key = (unit_id, ingredient_id);
        if let Some(hit) = self.conversions.get(&key) {
            return Ok(hit);
        }
        let value = self.inner.base_conversion(unit_id, ingredient_id).await?;
        self.conversions.put(key, value.clone());
        Ok(value)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    /// Counts calls so tests can see cache hits.
    #[derive(Default)]
    struct CountingCatalog {
        household_calls: AtomicUsize,
        recipe_calls: AtomicUsize,
    }

    #[async_trait]
    impl Catalog for CountingCatalog {
        async fn household(&self, household_id: Uuid) -> CoreResult<Option<HouseholdInfo>> {
            self.household_calls.fetch_add(1, Ordering::SeqCst);
            Ok(Some(HouseholdInfo {
                id: household_id,
                owner_user_id: Uuid::nil(),
                member_ids: vec![Uuid::nil()],
            }))
        }

        async fn recipes_for_meal(&self, _meal_id: Uuid) -> CoreResult<Vec<Uuid>> {
            self.recipe_calls.fetch_add(1, Ordering::SeqCst);
            Ok(vec![Uuid::nil()])
        }

        async fn recipe_ingredients(&self, _: Uuid) -> CoreResult<Vec<RecipeIngredient>> {
            Ok(Vec::new())
        }

        async fn prep_task_templates(&self, _: Uuid) -> CoreResult<Vec<PrepTaskTemplate>> {
            Ok(Vec::new())
        }

        async fn base_conversion(&self, _: Uuid, _: Uuid) -> CoreResult<Option<UnitConversion>> {
            Ok(None)
        }
    }

    #[tokio::test(start_paused = true)]
    async fn recipe_lookups_are_cached_until_ttl() {
        let inner = Arc::new(CountingCatalog::default());
        let cached = CachedCatalog::new(inner.clone(), Duration::from_secs(60));
        let meal = Uuid::new_v4();

        cached.recipes_for_meal(meal).await.unwrap();
        cached.recipes_for_meal(meal).await.unwrap();
        assert_eq!(inner.recipe_calls.load(Ordering::SeqCst), 1);

        tokio::time::advance(Duration::from_secs(61)).await;
        cached.recipes_for_meal(meal).await.unwrap();
        assert_eq!(inner.recipe_calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn expired_entry_is_evicted_on_lookup() {
        let map: TtlMap<u32, &str> = TtlMap::new(Duration::from_secs(10));
        map.put(1, "one");
        map.put(2, "two");

        tokio::time::advance(Duration::from_secs(11)).await;
        assert_eq!(map.get(&1), None);
        assert_eq!(map.len(), 1);

        map.put(1, "uno");
        assert_eq!(map.get(&1), Some("uno"));
    }

    #[tokio::test]
    async fn household_is_never_cached() {
        let inner = Arc::new(CountingCatalog::default());
        let cached = CachedCatalog::new(inner.clone(), Duration::from_secs(60));
        let household = Uuid::new_v4();

        cached.household(household).await.unwrap();
        cached.household(household).await.unwrap();
        assert_eq!(inner.household_calls.load(Ordering::SeqCst), 2);
    }
}
