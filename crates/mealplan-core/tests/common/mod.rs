//! Shared harness for the core integration tests.
//!
//! Each harness owns a fresh database seeded with one household and the
//! standard unit set, and a core wired to a [`FixedClock`] and an
//! in-memory publisher.

#![allow(dead_code)]

use std::sync::Arc;

use chrono::{DateTime, Duration, TimeZone, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use mealplan_core::bus::{MemoryPublisher, Publisher};
use mealplan_core::catalog::PgCatalog;
use mealplan_core::store::{EventDraft, OptionDraft, PgPlanStore, PlanDetail, PlanDraft};
use mealplan_core::{CoreConfig, FixedClock, OpContext, PlanningCore};
use mealplan_db::models::MealName;
use mealplan_test_utils::seed::{self, SeededHousehold, Units};
use mealplan_test_utils::{create_test_db, drop_test_db};

/// Harness start time. Deadlines and events are laid out relative to it.
pub fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2030, 1, 7, 9, 0, 0).unwrap()
}

/// Dinner at 18:00 on day `day` after [`t0`].
pub fn dinner(day: i64, meals: &[Uuid]) -> EventDraft {
    event(MealName::Dinner, day, 9, meals)
}

/// A one-hour event `hour` hours into day `day` after [`t0`].
pub fn event(meal_name: MealName, day: i64, hour: i64, meals: &[Uuid]) -> EventDraft {
    let starts_at = t0() + Duration::days(day) + Duration::hours(hour);
    EventDraft {
        meal_name,
        notes: String::new(),
        starts_at,
        ends_at: starts_at + Duration::hours(1),
        options: meals.iter().map(|m| option(*m)).collect(),
    }
}

pub fn option(meal_id: Uuid) -> OptionDraft {
    OptionDraft {
        meal_id,
        assigned_cook_user_id: None,
        notes: String::new(),
    }
}

pub struct Harness {
    pub pool: PgPool,
    pub db_name: String,
    pub core: PlanningCore,
    pub bus: Arc<MemoryPublisher>,
    pub clock: Arc<FixedClock>,
    pub household: SeededHousehold,
    pub units: Units,
}

impl Harness {
    /// A household of the owner plus `extra_members` others.
    pub async fn new(extra_members: usize) -> Self {
        let (pool, db_name) = create_test_db().await;
        let household = seed::household(&pool, extra_members)
            .await
            .expect("seed household");
        let units = seed::units(&pool).await.expect("seed units");
        let bus = Arc::new(MemoryPublisher::new());
        let clock = Arc::new(FixedClock::new(t0()));

        let core = build_core(&pool, bus.clone(), clock.clone());

        Self {
            pool,
            db_name,
            core,
            bus,
            clock,
            household,
            units,
        }
    }

    /// Another core over the same database and clock, publishing to `bus`.
    pub fn core_with_bus(&self, bus: Arc<dyn Publisher>) -> PlanningCore {
        build_core(&self.pool, bus, self.clock.clone())
    }

    pub fn owner(&self) -> Uuid {
        self.household.owner
    }

    pub fn member(&self, n: usize) -> Uuid {
        self.household.members[n]
    }

    pub fn draft(&self, events: Vec<EventDraft>) -> PlanDraft {
        PlanDraft {
            household_id: self.household.id,
            created_by_user_id: self.owner(),
            notes: "this week".into(),
            voting_deadline: t0() + Duration::days(1),
            events,
        }
    }

    pub async fn create_plan(&self, events: Vec<EventDraft>) -> PlanDetail {
        self.core
            .create_plan(&OpContext::background(), self.draft(events))
            .await
            .expect("create_plan should succeed")
    }

    /// `n` meals without recipes.
    pub async fn bare_meals(&self, n: usize) -> Vec<Uuid> {
        let mut meals = Vec::with_capacity(n);
        for i in 0..n {
            meals.push(
                seed::bare_meal(&self.pool, &format!("meal {i}"))
                    .await
                    .expect("seed meal"),
            );
        }
        meals
    }

    /// Move the clock past the default voting deadline.
    pub fn close_voting(&self) {
        self.clock.set(t0() + Duration::days(1) + Duration::minutes(1));
    }

    pub async fn teardown(self) {
        self.pool.close().await;
        drop_test_db(&self.db_name).await;
    }
}

fn build_core(pool: &PgPool, bus: Arc<dyn Publisher>, clock: Arc<FixedClock>) -> PlanningCore {
    PlanningCore::new(
        Arc::new(PgPlanStore::new(pool.clone())),
        bus,
        clock,
        Arc::new(PgCatalog::new(pool.clone())),
        CoreConfig::default(),
    )
}

/// Option IDs of an event, smallest first.
pub fn sorted_option_ids(detail: &PlanDetail, event: usize) -> Vec<Uuid> {
    let mut ids: Vec<Uuid> = detail.events[event].options.iter().map(|o| o.id).collect();
    ids.sort();
    ids
}
