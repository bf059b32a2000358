//! Grocery list generation.
//!
//! Ingredient lines of every winning recipe are converted to the base unit
//! of their dimension where the catalog knows a conversion, then summed per
//! `(ingredient, unit)`. Lines without a conversion keep their unit and
//! become separate items; nothing is dropped or guessed.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use rust_decimal::{Decimal, RoundingStrategy};
use tracing::{debug, info, warn};
use uuid::Uuid;

use mealplan_db::models::{MealPlan, RecipeIngredient, UnitConversion};
use mealplan_db::queries::grocery_items::NewGroceryItem;
use mealplan_db::queries::options::WinningOption;

use crate::bus::{Envelope, EventHandler, Publisher, topics};
use crate::catalog::Catalog;
use crate::clock::Clock;
use crate::context::OpContext;
use crate::error::{CoreError, CoreResult};
use crate::store::{ArtifactSaved, GroceryStore};

/// Fractional digits kept on quantities.
pub const QUANTITY_SCALE: u32 = 4;

fn round_quantity(q: Decimal) -> Decimal {
    q.round_dp_with_strategy(QUANTITY_SCALE, RoundingStrategy::MidpointAwayFromZero)
}

/// One ingredient requirement after unit canonicalization.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Requirement {
    pub ingredient_id: Uuid,
    pub unit_id: Uuid,
    pub min: Decimal,
    pub max: Option<Decimal>,
}

/// Express `line` in the conversion's target unit, or keep it as is when
/// there is no conversion or converting would lose the quantity.
pub fn canonicalize(line: &RecipeIngredient, conversion: Option<&UnitConversion>) -> Requirement {
    let original = Requirement {
        ingredient_id: line.ingredient_id,
        unit_id: line.measurement_unit_id,
        min: line.min_quantity,
        max: line.max_quantity,
    };

    let Some(conv) = conversion else {
        return original;
    };
    let scale = |q: Decimal| q.checked_mul(conv.modifier).map(round_quantity);

    let Some(min) = scale(line.min_quantity).filter(|m| *m > Decimal::ZERO) else {
        return original;
    };
    let max = match line.max_quantity {
        Some(q) => match scale(q) {
            Some(m) => Some(m),
            None => return original,
        },
        None => None,
    };

    Requirement {
        ingredient_id: line.ingredient_id,
        unit_id: conv.to_unit_id,
        min,
        max,
    }
}

/// Sum requirements per `(ingredient, unit)`.
///
/// A group has a maximum only if every contributor has one. Output is
/// ordered by key, so the same input always yields the same list.
pub fn aggregate(
    requirements: impl IntoIterator<Item = Requirement>,
) -> CoreResult<Vec<NewGroceryItem>> {
    let mut groups: BTreeMap<(Uuid, Uuid), (Decimal, Option<Decimal>)> = BTreeMap::new();

    for req in requirements {
        let overflow = || {
            CoreError::invalid(format!(
                "quantity of ingredient {} overflows",
                req.ingredient_id
            ))
        };
        let (min, max) = groups
            .entry((req.ingredient_id, req.unit_id))
            .or_insert((Decimal::ZERO, Some(Decimal::ZERO)));
        *min = min.checked_add(req.min).ok_or_else(overflow)?;
        *max = match (*max, req.max) {
            (Some(total), Some(more)) => Some(total.checked_add(more).ok_or_else(overflow)?),
            _ => None,
        };
    }

    let items = groups
        .into_iter()
        .filter_map(|((ingredient_id, measurement_unit_id), (min, max))| {
            let min = round_quantity(min);
            if min <= Decimal::ZERO {
                return None;
            }
            let max = max.map(round_quantity).filter(|m| *m >= min);
            Some(NewGroceryItem {
                ingredient_id,
                measurement_unit_id,
                min_quantity: min.normalize(),
                max_quantity: max.map(|m| m.normalize()),
            })
        })
        .collect();
    Ok(items)
}

/// Builds a finalized plan's grocery list and records it.
pub struct GroceryListGenerator {
    store: Arc<dyn GroceryStore>,
    catalog: Arc<dyn Catalog>,
    bus: Arc<dyn Publisher>,
    clock: Arc<dyn Clock>,
}

impl GroceryListGenerator {
    pub fn new(
        store: Arc<dyn GroceryStore>,
        catalog: Arc<dyn Catalog>,
        bus: Arc<dyn Publisher>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            catalog,
            bus,
            clock,
        }
    }

    /// Finalized plans whose grocery list was never recorded.
    pub async fn pending(&self) -> CoreResult<Vec<MealPlan>> {
        self.store.plans_missing_grocery_list().await
    }

    /// The aggregated grocery lines for a set of winning options.
    pub async fn compute(&self, winners: &[WinningOption]) -> CoreResult<Vec<NewGroceryItem>> {
        let mut requirements = Vec::new();
        for winner in winners {
            for recipe_id in self.catalog.recipes_for_meal(winner.meal_id).await? {
                for line in self.catalog.recipe_ingredients(recipe_id).await? {
                    let conversion = self
                        .catalog
                        .base_conversion(line.measurement_unit_id, line.ingredient_id)
                        .await?;
                    requirements.push(canonicalize(&line, conversion.as_ref()));
                }
            }
        }
        aggregate(requirements)
    }

    /// Generate (or regenerate) the grocery list of a finalized plan.
    ///
    /// Idempotent: a second run writes nothing and publishes nothing.
    pub async fn generate(&self, ctx: &OpContext, plan_id: Uuid) -> CoreResult<ArtifactSaved> {
        let (saved, item_count) = ctx
            .run(async {
                let (_, winners) = self.store.finalized_winners(plan_id).await?;
                let items = self.compute(&winners).await?;
                let saved = self
                    .store
                    .save_grocery_list(plan_id, &items, self.clock.now())
                    .await?;
                Ok((saved, items.len()))
            })
            .await?;

        info!(
            plan_id = %plan_id,
            items = item_count,
            written = saved.written,
            status = %saved.plan.status,
            "grocery list generated"
        );

        let now = self.clock.now();
        if saved.initialized {
            publish(
                self.bus.as_ref(),
                Envelope::grocery_list_ready(&saved.plan, item_count, now),
            )
            .await;
        }
        if saved.completed {
            publish(self.bus.as_ref(), Envelope::plan_complete(&saved.plan, now)).await;
        }
        Ok(saved)
    }
}

/// Publish after commit: failures are logged and left to replay.
pub(crate) async fn publish(bus: &dyn Publisher, envelope: Envelope) {
    let topic = envelope.topic.clone();
    let plan_id = envelope.meal_plan_id;
    if let Err(e) = bus.publish(envelope).await {
        warn!(topic = %topic, plan_id = ?plan_id, error = %e, "failed to publish event");
    }
}

/// Shared handling of `plan.finalized` for the artifact generators.
///
/// A plan that is gone or no longer finalized (archived meanwhile) is
/// acknowledged so the message is not retried forever.
pub(crate) fn settle(name: &str, envelope: &Envelope, result: CoreResult<()>) -> CoreResult<()> {
    match result {
        Err(CoreError::Conflict(msg)) | Err(CoreError::NotFound(msg)) => {
            debug!(handler = name, key = %envelope.idempotency_key, reason = %msg, "event skipped");
            Ok(())
        }
        other => other,
    }
}

#[async_trait]
impl EventHandler for GroceryListGenerator {
    fn name(&self) -> &str {
        "grocery-list-generator"
    }

    fn handles(&self, topic: &str) -> bool {
        topic == topics::PLAN_FINALIZED
    }

    async fn handle(&self, envelope: &Envelope) -> CoreResult<()> {
        let Some(plan_id) = envelope.plan_id() else {
            warn!(key = %envelope.idempotency_key, "plan.finalized without a plan id, dropped");
            return Ok(());
        };
        let result = self
            .generate(&OpContext::background(), plan_id)
            .await
            .map(|_| ());
        settle(self.name(), envelope, result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn d(s: &str) -> Decimal {
        s.parse().unwrap()
    }

    fn line(ingredient: Uuid, unit: Uuid, min: &str, max: Option<&str>) -> RecipeIngredient {
        RecipeIngredient {
            id: Uuid::new_v4(),
            recipe_id: Uuid::new_v4(),
            ingredient_id: ingredient,
            measurement_unit_id: unit,
            min_quantity: d(min),
            max_quantity: max.map(d),
        }
    }

    fn req(ingredient: Uuid, unit: Uuid, min: &str, max: Option<&str>) -> Requirement {
        Requirement {
            ingredient_id: ingredient,
            unit_id: unit,
            min: d(min),
            max: max.map(d),
        }
    }

    #[test]
    fn same_ingredient_and_unit_are_summed() {
        let (flour, grams) = (Uuid::new_v4(), Uuid::new_v4());
        let items = aggregate([
            req(flour, grams, "200", None),
            req(flour, grams, "200", None),
        ])
        .unwrap();

        assert_eq!(items.len(), 1);
        assert_eq!(items[0].min_quantity, d("400"));
        assert_eq!(items[0].max_quantity, None);
    }

    #[test]
    fn max_survives_only_if_every_contributor_has_one() {
        let (salt, grams) = (Uuid::new_v4(), Uuid::new_v4());
        let both = aggregate([
            req(salt, grams, "1", Some("2")),
            req(salt, grams, "3", Some("4.5")),
        ])
        .unwrap();
        assert_eq!(both[0].min_quantity, d("4"));
        assert_eq!(both[0].max_quantity, Some(d("6.5")));

        let one = aggregate([
            req(salt, grams, "1", Some("2")),
            req(salt, grams, "3", None),
        ])
        .unwrap();
        assert_eq!(one[0].max_quantity, None);
    }

    #[test]
    fn different_units_stay_separate() {
        let (flour, grams, cups) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());
        let items = aggregate([req(flour, grams, "200", None), req(flour, cups, "2", None)]).unwrap();
        assert_eq!(items.len(), 2);
    }

    #[test]
    fn decimal_sums_do_not_drift() {
        let (milk, ml) = (Uuid::new_v4(), Uuid::new_v4());
        let items = aggregate((0..10).map(|_| req(milk, ml, "0.1", None))).unwrap();
        assert_eq!(items[0].min_quantity, d("1"));
    }

    #[test]
    fn canonicalize_converts_to_base_unit() {
        let (flour, kg, g) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());
        let conv = UnitConversion {
            from_unit_id: kg,
            to_unit_id: g,
            only_for_ingredient: None,
            modifier: d("1000"),
        };
        let r = canonicalize(&line(flour, kg, "0.25", Some("0.5")), Some(&conv));
        assert_eq!(r.unit_id, g);
        assert_eq!(r.min, d("250"));
        assert_eq!(r.max, Some(d("500")));
    }

    #[test]
    fn canonicalize_rounds_to_four_places() {
        let (milk, cup, ml) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());
        let conv = UnitConversion {
            from_unit_id: cup,
            to_unit_id: ml,
            only_for_ingredient: None,
            modifier: d("236.5882"),
        };
        let r = canonicalize(&line(milk, cup, "0.33333", None), Some(&conv));
        assert_eq!(r.min, d("78.8619"));
    }

    #[test]
    fn canonicalize_without_conversion_keeps_unit() {
        let (flour, cups) = (Uuid::new_v4(), Uuid::new_v4());
        let r = canonicalize(&line(flour, cups, "2", None), None);
        assert_eq!(r.unit_id, cups);
        assert_eq!(r.min, d("2"));
    }

    #[test]
    fn canonicalize_keeps_unit_when_conversion_rounds_to_zero() {
        let (spice, pinch, g) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());
        let conv = UnitConversion {
            from_unit_id: pinch,
            to_unit_id: g,
            only_for_ingredient: Some(spice),
            modifier: d("0.00001"),
        };
        let r = canonicalize(&line(spice, pinch, "1", None), Some(&conv));
        assert_eq!(r.unit_id, pinch);
    }

    #[test]
    fn output_is_ordered_and_positive() {
        let unit = Uuid::new_v4();
        let (a, b) = (Uuid::from_u128(1), Uuid::from_u128(2));
        let items = aggregate([req(b, unit, "1", None), req(a, unit, "1", None)]).unwrap();
        assert_eq!(items[0].ingredient_id, a);
        assert!(items.iter().all(|i| i.min_quantity > Decimal::ZERO));
    }
}
