//! Integration tests for grocery items, prep tasks, the outbox and the
//! reference catalog queries.

use chrono::{Duration, Utc};
use rust_decimal::Decimal;
use sqlx::PgPool;
use uuid::Uuid;

use mealplan_db::models::{GroceryItemStatus, MealPlan, PrepTaskStatus};
use mealplan_db::queries::grocery_items::{self, GroceryItemUpdate, NewGroceryItem};
use mealplan_db::queries::outbox::{self, NewOutboxRecord};
use mealplan_db::queries::plans::{self, NewPlan};
use mealplan_db::queries::prep_tasks::{self, NewPrepTask};
use mealplan_db::queries::{events, options, reference};
use mealplan_test_utils::{create_test_db, drop_test_db, seed};

async fn plan(pool: &PgPool) -> MealPlan {
    plans::insert_plan(
        pool,
        &NewPlan {
            household_id: Uuid::new_v4(),
            created_by_user_id: Uuid::new_v4(),
            notes: "",
            voting_deadline: Utc::now() + Duration::hours(1),
        },
    )
    .await
    .expect("insert plan")
}

#[tokio::test]
async fn grocery_upsert_is_idempotent_and_preserves_user_fields() {
    let (pool, db_name) = create_test_db().await;
    let plan = plan(&pool).await;
    let now = Utc::now();
    let item = NewGroceryItem {
        ingredient_id: Uuid::new_v4(),
        measurement_unit_id: Uuid::new_v4(),
        min_quantity: Decimal::new(15, 1),
        max_quantity: None,
    };

    let inserted = grocery_items::upsert_generated_item(&pool, plan.id, &item, now)
        .await
        .unwrap()
        .expect("first upsert inserts");
    assert_eq!(inserted.status, GroceryItemStatus::Needed);
    assert_eq!(inserted.min_quantity, Decimal::new(15, 1));

    // Replaying the same line writes nothing.
    let replay = grocery_items::upsert_generated_item(&pool, plan.id, &item, now)
        .await
        .unwrap();
    assert!(replay.is_none());

    grocery_items::update_grocery_item(
        &pool,
        inserted.id,
        &GroceryItemUpdate {
            status: Some(GroceryItemStatus::Acquired),
            purchase_price: Some(Decimal::new(499, 2)),
            ..GroceryItemUpdate::default()
        },
        now,
    )
    .await
    .unwrap()
    .expect("update applies");

    // A changed quantity refreshes the line but keeps the shopping state.
    let changed = NewGroceryItem {
        min_quantity: Decimal::new(25, 1),
        ..item.clone()
    };
    let refreshed = grocery_items::upsert_generated_item(&pool, plan.id, &changed, now)
        .await
        .unwrap()
        .expect("changed quantity updates");
    assert_eq!(refreshed.id, inserted.id);
    assert_eq!(refreshed.min_quantity, Decimal::new(25, 1));
    assert_eq!(refreshed.status, GroceryItemStatus::Acquired);
    assert_eq!(refreshed.purchase_price, Some(Decimal::new(499, 2)));

    let listed = grocery_items::list_grocery_items_for_plan(&pool, plan.id)
        .await
        .unwrap();
    assert_eq!(listed.len(), 1);

    pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn prep_task_insert_and_transitions() {
    let (pool, db_name) = create_test_db().await;
    let plan = plan(&pool).await;
    let start = Utc::now() + Duration::days(1);
    let event = events::insert_event(
        &pool,
        plan.id,
        &events::NewEvent {
            meal_name: mealplan_db::models::MealName::Dinner,
            notes: "",
            starts_at: start,
            ends_at: start + Duration::hours(1),
        },
    )
    .await
    .unwrap();
    let option = options::insert_option(
        &pool,
        event.id,
        &options::NewOption {
            meal_id: Uuid::new_v4(),
            assigned_cook_user_id: None,
            notes: "",
        },
    )
    .await
    .unwrap();

    let now = Utc::now();
    let new = NewPrepTask {
        meal_plan_option_id: option.id,
        recipe_id: Uuid::new_v4(),
        recipe_prep_task_template_id: Uuid::new_v4(),
        assigned_to_user_id: None,
        cannot_complete_before: now,
        cannot_complete_after: start - Duration::hours(4),
        creation_explanation: "marinate".into(),
    };

    let task = prep_tasks::insert_prep_task(&pool, plan.id, &new, now)
        .await
        .unwrap()
        .expect("first insert");
    assert_eq!(task.status, PrepTaskStatus::Unfinished);
    assert!(
        prep_tasks::insert_prep_task(&pool, plan.id, &new, now)
            .await
            .unwrap()
            .is_none(),
        "duplicate (option, template) is skipped"
    );

    // Wrong `from` status: no change.
    assert!(
        prep_tasks::transition_prep_task_status(
            &pool,
            task.id,
            PrepTaskStatus::InProgress,
            PrepTaskStatus::Finished,
            "",
            now,
        )
        .await
        .unwrap()
        .is_none()
    );

    prep_tasks::transition_prep_task_status(
        &pool,
        task.id,
        PrepTaskStatus::Unfinished,
        PrepTaskStatus::InProgress,
        "started",
        now,
    )
    .await
    .unwrap()
    .expect("unfinished -> in_progress");
    let done = prep_tasks::transition_prep_task_status(
        &pool,
        task.id,
        PrepTaskStatus::InProgress,
        PrepTaskStatus::Finished,
        "done",
        now,
    )
    .await
    .unwrap()
    .expect("in_progress -> finished");
    assert_eq!(done.status, PrepTaskStatus::Finished);
    assert!(done.completed_at.is_some());

    let user = Uuid::new_v4();
    let assigned = prep_tasks::assign_prep_task(&pool, task.id, Some(user), now)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(assigned.assigned_to_user_id, Some(user));

    pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn outbox_dedupes_and_claims_in_order() {
    let (pool, db_name) = create_test_db().await;
    let plan_id = Uuid::new_v4();
    let payload = serde_json::json!({ "planId": plan_id });

    let record = |key: &'static str| NewOutboxRecord {
        event_id: Uuid::new_v4(),
        topic: "plan.finalized",
        event_type: "plan.finalized",
        idempotency_key: key,
        meal_plan_id: Some(plan_id),
        household_id: None,
        user_id: None,
        payload: &payload,
        occurred_at: Utc::now(),
    };

    assert!(outbox::insert_outbox_record(&pool, &record("a")).await.unwrap());
    assert!(!outbox::insert_outbox_record(&pool, &record("a")).await.unwrap());
    assert!(outbox::insert_outbox_record(&pool, &record("b")).await.unwrap());
    assert_eq!(outbox::count_undelivered(&pool).await.unwrap(), 2);

    let mut tx = pool.begin().await.unwrap();
    let claimed = outbox::claim_undelivered(&mut *tx, Utc::now(), 10).await.unwrap();
    assert_eq!(claimed.len(), 2);
    assert_eq!(claimed[0].idempotency_key, "a");

    // A concurrent claimer skips the locked rows.
    let mut other = pool.begin().await.unwrap();
    let none = outbox::claim_undelivered(&mut *other, Utc::now(), 10).await.unwrap();
    assert!(none.is_empty());
    other.rollback().await.unwrap();

    outbox::mark_delivered(&mut *tx, claimed[0].id, Utc::now())
        .await
        .unwrap();
    let retry_at = Utc::now() + chrono::Duration::minutes(5);
    outbox::record_failure(&mut *tx, claimed[1].id, "handler exploded", retry_at)
        .await
        .unwrap();
    tx.commit().await.unwrap();

    assert_eq!(outbox::count_undelivered(&pool).await.unwrap(), 1);
    let rows = outbox::list_for_plan(&pool, plan_id).await.unwrap();
    assert_eq!(rows.len(), 2);
    assert!(rows[0].delivered_at.is_some());
    assert_eq!(rows[1].attempts, 1);
    assert_eq!(rows[1].last_error.as_deref(), Some("handler exploded"));

    // The failed row backs off until its retry time.
    let mut tx = pool.begin().await.unwrap();
    assert!(outbox::claim_undelivered(&mut *tx, Utc::now(), 10).await.unwrap().is_empty());
    let due = outbox::claim_undelivered(&mut *tx, retry_at, 10).await.unwrap();
    assert_eq!(due.len(), 1);
    tx.rollback().await.unwrap();

    pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn claims_prefer_rows_with_fewer_attempts() {
    let (pool, db_name) = create_test_db().await;
    let payload = serde_json::json!({});
    let now = Utc::now();

    for key in ["old", "new"] {
        outbox::insert_outbox_record(
            &pool,
            &NewOutboxRecord {
                event_id: Uuid::new_v4(),
                topic: "plan.finalized",
                event_type: "plan.finalized",
                idempotency_key: key,
                meal_plan_id: None,
                household_id: None,
                user_id: None,
                payload: &payload,
                occurred_at: now,
            },
        )
        .await
        .unwrap();
    }

    let mut tx = pool.begin().await.unwrap();
    let first = outbox::claim_undelivered(&mut *tx, now, 1).await.unwrap();
    assert_eq!(first[0].idempotency_key, "old");
    outbox::record_failure(&mut *tx, first[0].id, "boom", now)
        .await
        .unwrap();
    tx.commit().await.unwrap();

    // "old" is due again but has already failed once.
    let mut tx = pool.begin().await.unwrap();
    let next = outbox::claim_undelivered(&mut *tx, now, 1).await.unwrap();
    assert_eq!(next[0].idempotency_key, "new");
    tx.rollback().await.unwrap();

    pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn household_members_include_owner() {
    let (pool, db_name) = create_test_db().await;
    let household = seed::household(&pool, 2).await.unwrap();

    let members = reference::list_household_member_ids(&pool, household.id)
        .await
        .unwrap();
    assert_eq!(members.len(), 3);
    for m in &household.members {
        assert!(members.contains(m));
    }

    let row = reference::get_household(&pool, household.id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(row.owner_user_id, household.owner);

    pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn base_conversion_prefers_ingredient_specific() {
    let (pool, db_name) = create_test_db().await;
    let units = seed::units(&pool).await.unwrap();
    let flour = seed::ingredient(&pool, "flour").await.unwrap();
    let sugar = seed::ingredient(&pool, "sugar").await.unwrap();

    reference::insert_unit_conversion(&pool, units.cup, units.milliliter, Some(flour), Decimal::new(240, 0))
        .await
        .unwrap();

    let for_flour = reference::find_base_conversion(&pool, units.cup, flour)
        .await
        .unwrap()
        .expect("conversion exists");
    assert_eq!(for_flour.only_for_ingredient, Some(flour));
    assert_eq!(for_flour.modifier, Decimal::new(240, 0));

    let for_sugar = reference::find_base_conversion(&pool, units.cup, sugar)
        .await
        .unwrap()
        .expect("general conversion applies");
    assert_eq!(for_sugar.only_for_ingredient, None);
    assert_eq!(for_sugar.to_unit_id, units.milliliter);

    // Base units and unconvertible units have no conversion.
    assert!(
        reference::find_base_conversion(&pool, units.gram, flour)
            .await
            .unwrap()
            .is_none()
    );
    assert!(
        reference::find_base_conversion(&pool, units.pinch, flour)
            .await
            .unwrap()
            .is_none()
    );

    pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn meal_recipes_and_templates_are_readable() {
    let (pool, db_name) = create_test_db().await;
    let units = seed::units(&pool).await.unwrap();
    let rice = seed::ingredient(&pool, "rice").await.unwrap();
    let meal = seed::meal(
        &pool,
        "risotto",
        &[seed::Line::new(rice, units.gram, Decimal::new(300, 0)).with_max(Decimal::new(350, 0))],
        &[("soak", 3600)],
    )
    .await
    .unwrap();

    let recipes = reference::list_recipe_ids_for_meal(&pool, meal.meal_id)
        .await
        .unwrap();
    assert_eq!(recipes, vec![meal.recipe_id]);

    let lines = reference::list_recipe_ingredients(&pool, meal.recipe_id)
        .await
        .unwrap();
    assert_eq!(lines.len(), 1);
    assert_eq!(lines[0].max_quantity, Some(Decimal::new(350, 0)));

    let templates = reference::list_prep_task_templates(&pool, meal.recipe_id)
        .await
        .unwrap();
    assert_eq!(templates.len(), 1);
    assert_eq!(templates[0].offset_before_seconds, 3600);

    pool.close().await;
    drop_test_db(&db_name).await;
}
