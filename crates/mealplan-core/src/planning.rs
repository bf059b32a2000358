//! [`PlanningCore`]: the entry point the HTTP boundary, CLI and workers
//! call into.
//!
//! Every dependency is injected. Operations check membership against the
//! household catalog, then hand the state-changing part to the store,
//! where it runs in one transaction. Events are published after commit.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use tracing::{info, warn};
use uuid::Uuid;

use mealplan_db::models::{
    EventStatus, GroceryListItem, MealPlan, MealPlanOption, PlanStatus, PrepTask, PrepTaskStatus,
};
use mealplan_db::queries::grocery_items::GroceryItemUpdate;
use mealplan_db::queries::plans::PlanFilter;

use crate::bus::{Envelope, EventHandler, Publisher};
use crate::catalog::{Catalog, HouseholdInfo};
use crate::clock::Clock;
use crate::config::CoreConfig;
use crate::context::OpContext;
use crate::error::{CoreError, CoreResult};
use crate::grocery::{GroceryListGenerator, publish};
use crate::jobs::{FinalizerJob, ReplaySweeper};
use crate::prep::{PrepTaskGenerator, PrepTaskTracker};
use crate::state::{Actor, Finalization, PlanStateMachine, not_a_member};
use crate::store::{
    ArtifactSaved, Ballot, BallotStore, EventDetail, EventDraft, GroceryStore, OptionDraft,
    PlanDetail, PlanDraft, PlanRepository, PlanStore, PlanUpdate,
};

/// A household member who has not ranked an event's options yet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MissingVote {
    pub event_id: Uuid,
    pub user_id: Uuid,
}

/// Check an event draft on its own.
pub fn validate_event_draft(draft: &EventDraft) -> CoreResult<()> {
    if draft.starts_at >= draft.ends_at {
        return Err(CoreError::invalid(format!(
            "{} event must start before it ends",
            draft.meal_name
        )));
    }
    if draft.options.is_empty() {
        return Err(CoreError::invalid(format!(
            "{} event needs at least one option",
            draft.meal_name
        )));
    }
    let mut meals = HashSet::new();
    for option in &draft.options {
        if !meals.insert(option.meal_id) {
            return Err(CoreError::invalid(format!(
                "meal {} is offered twice for the same event",
                option.meal_id
            )));
        }
    }
    Ok(())
}

/// Check a plan draft: events are valid and do not overlap per meal, and
/// the deadline is in the future and not after the first event starts.
pub fn validate_plan_draft(draft: &PlanDraft, now: DateTime<Utc>) -> CoreResult<()> {
    if draft.events.is_empty() {
        return Err(CoreError::invalid("a meal plan needs at least one event"));
    }
    for event in &draft.events {
        validate_event_draft(event)?;
    }
    for (i, a) in draft.events.iter().enumerate() {
        for b in &draft.events[i + 1..] {
            if a.meal_name == b.meal_name && a.starts_at < b.ends_at && b.starts_at < a.ends_at {
                return Err(CoreError::invalid(format!(
                    "{} events starting {} and {} overlap",
                    a.meal_name, a.starts_at, b.starts_at
                )));
            }
        }
    }
    let first_start = draft.events.iter().map(|e| e.starts_at).min();
    PlanStateMachine::ensure_valid_deadline(draft.voting_deadline, first_start, now)
}

fn ensure_non_negative(field: &str, value: Option<Decimal>) -> CoreResult<()> {
    match value {
        Some(v) if v < Decimal::ZERO => Err(CoreError::invalid(format!("{field} must not be negative"))),
        _ => Ok(()),
    }
}

/// The collaborative meal-planning core.
pub struct PlanningCore {
    plans: Arc<dyn PlanRepository>,
    ballots: Arc<dyn BallotStore>,
    grocery_items: Arc<dyn GroceryStore>,
    catalog: Arc<dyn Catalog>,
    bus: Arc<dyn Publisher>,
    clock: Arc<dyn Clock>,
    config: CoreConfig,
    finalization: Arc<Finalization>,
    grocery: Arc<GroceryListGenerator>,
    prep: Arc<PrepTaskGenerator>,
    tasks: PrepTaskTracker,
}

impl PlanningCore {
    pub fn new<S: PlanStore + 'static>(
        store: Arc<S>,
        bus: Arc<dyn Publisher>,
        clock: Arc<dyn Clock>,
        catalog: Arc<dyn Catalog>,
        config: CoreConfig,
    ) -> Self {
        let finalization = Arc::new(Finalization::new(
            store.clone(),
            catalog.clone(),
            bus.clone(),
            clock.clone(),
        ));
        let grocery = Arc::new(GroceryListGenerator::new(
            store.clone(),
            catalog.clone(),
            bus.clone(),
            clock.clone(),
        ));
        let prep = Arc::new(PrepTaskGenerator::new(
            store.clone(),
            catalog.clone(),
            bus.clone(),
            clock.clone(),
        ));
        let tasks = PrepTaskTracker::new(
            store.clone(),
            store.clone(),
            catalog.clone(),
            bus.clone(),
            clock.clone(),
        );

        Self {
            plans: store.clone(),
            ballots: store.clone(),
            grocery_items: store,
            catalog,
            bus,
            clock,
            config,
            finalization,
            grocery,
            prep,
            tasks,
        }
    }

    pub fn config(&self) -> &CoreConfig {
        &self.config
    }

    /// Consumers of `plan.finalized`.
    pub fn handlers(&self) -> Vec<Arc<dyn EventHandler>> {
        let grocery: Arc<dyn EventHandler> = self.grocery.clone();
        let prep: Arc<dyn EventHandler> = self.prep.clone();
        vec![grocery, prep]
    }

    pub fn finalizer_job(&self) -> FinalizerJob {
        FinalizerJob::new(self.finalization.clone(), self.config.finalize_warn_threshold)
    }

    pub fn replay_sweeper(&self) -> ReplaySweeper {
        ReplaySweeper::new(
            self.grocery.clone(),
            self.prep.clone(),
            self.config.prep_horizon_chrono(),
        )
    }

    async fn household(&self, household_id: Uuid) -> CoreResult<HouseholdInfo> {
        self.catalog
            .household(household_id)
            .await?
            .ok_or_else(|| CoreError::not_found(format!("household {household_id}")))
    }

    /// The plan's household, after checking `user_id` belongs to it.
    async fn member_of_plan(&self, plan: &MealPlan, user_id: Uuid) -> CoreResult<HouseholdInfo> {
        let household = self.household(plan.household_id).await?;
        if !household.is_member(user_id) {
            return Err(not_a_member(user_id, household.id));
        }
        Ok(household)
    }

    fn ensure_cooks_are_members<'a>(
        household: &HouseholdInfo,
        options: impl IntoIterator<Item = &'a OptionDraft>,
    ) -> CoreResult<()> {
        for cook in options.into_iter().filter_map(|o| o.assigned_cook_user_id) {
            if !household.is_member(cook) {
                return Err(not_a_member(cook, household.id));
            }
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Plans
    // -----------------------------------------------------------------------

    /// Create a plan with its events and options and announce it.
    pub async fn create_plan(&self, ctx: &OpContext, draft: PlanDraft) -> CoreResult<PlanDetail> {
        let now = self.clock.now();
        validate_plan_draft(&draft, now)?;

        let detail = ctx
            .run(async {
                let household = self.household(draft.household_id).await?;
                if !household.is_member(draft.created_by_user_id) {
                    return Err(not_a_member(draft.created_by_user_id, household.id));
                }
                Self::ensure_cooks_are_members(
                    &household,
                    draft.events.iter().flat_map(|e| &e.options),
                )?;
                self.plans.create_plan(&draft, now).await
            })
            .await?;

        info!(
            plan_id = %detail.plan.id,
            household_id = %detail.plan.household_id,
            events = detail.events.len(),
            "meal plan created"
        );
        let event_ids: Vec<Uuid> = detail.events.iter().map(|e| e.event.id).collect();
        publish(
            self.bus.as_ref(),
            Envelope::plan_created(&detail.plan, &event_ids, now),
        )
        .await;
        Ok(detail)
    }

    pub async fn plan(&self, plan_id: Uuid) -> CoreResult<PlanDetail> {
        self.plans.plan_detail(plan_id).await
    }

    pub async fn list_plans(&self, household_id: Uuid, filter: &PlanFilter) -> CoreResult<Vec<MealPlan>> {
        self.plans.list_plans(household_id, filter).await
    }

    pub async fn update_plan(
        &self,
        ctx: &OpContext,
        plan_id: Uuid,
        user_id: Uuid,
        update: PlanUpdate,
    ) -> CoreResult<MealPlan> {
        ctx.run(async {
            let plan = self.plans.plan(plan_id).await?;
            self.member_of_plan(&plan, user_id).await?;
            self.plans.update_plan(plan_id, &update, self.clock.now()).await
        })
        .await
    }

    pub async fn add_event(
        &self,
        ctx: &OpContext,
        plan_id: Uuid,
        user_id: Uuid,
        draft: EventDraft,
    ) -> CoreResult<EventDetail> {
        validate_event_draft(&draft)?;
        ctx.run(async {
            let plan = self.plans.plan(plan_id).await?;
            let household = self.member_of_plan(&plan, user_id).await?;
            Self::ensure_cooks_are_members(&household, &draft.options)?;
            self.plans.add_event(plan_id, &draft, self.clock.now()).await
        })
        .await
    }

    pub async fn add_option(
        &self,
        ctx: &OpContext,
        event_id: Uuid,
        user_id: Uuid,
        draft: OptionDraft,
    ) -> CoreResult<MealPlanOption> {
        ctx.run(async {
            let event = self.plans.event(event_id).await?;
            let plan = self.plans.plan(event.meal_plan_id).await?;
            let household = self.member_of_plan(&plan, user_id).await?;
            Self::ensure_cooks_are_members(&household, [&draft])?;
            self.plans.add_option(event_id, &draft).await
        })
        .await
    }

    pub async fn archive_option(&self, ctx: &OpContext, option_id: Uuid, user_id: Uuid) -> CoreResult<()> {
        ctx.run(async {
            let option = self.plans.option(option_id).await?;
            let event = self.plans.event(option.meal_plan_event_id).await?;
            let plan = self.plans.plan(event.meal_plan_id).await?;
            self.member_of_plan(&plan, user_id).await?;
            self.plans.archive_option(option_id, self.clock.now()).await
        })
        .await
    }

    /// Archive a plan. Any member may while votes are open; afterwards
    /// only the household owner.
    pub async fn archive_plan(&self, ctx: &OpContext, plan_id: Uuid, user_id: Uuid) -> CoreResult<MealPlan> {
        let plan = ctx
            .run(async {
                let plan = self.plans.plan(plan_id).await?;
                let household = self.household(plan.household_id).await?;
                let authorize =
                    |locked: &MealPlan| PlanStateMachine::ensure_may_archive(locked, &household, user_id);
                self.plans
                    .archive_plan(plan_id, &authorize, self.clock.now())
                    .await
            })
            .await?;
        info!(plan_id = %plan_id, user_id = %user_id, "meal plan archived");
        Ok(plan)
    }

    // -----------------------------------------------------------------------
    // Voting
    // -----------------------------------------------------------------------

    /// Record (or replace) a user's ranking of an event's options.
    ///
    /// When this ballot was the last one missing, the plan is finalized on
    /// the voter's behalf before returning.
    pub async fn submit_vote(
        &self,
        ctx: &OpContext,
        event_id: Uuid,
        user_id: Uuid,
        ranking: Vec<Uuid>,
    ) -> CoreResult<Ballot> {
        let (plan_id, ballot) = ctx
            .run(async {
                let event = self.plans.event(event_id).await?;
                let plan = self.plans.plan(event.meal_plan_id).await?;
                self.member_of_plan(&plan, user_id).await?;
                let ballot = self.ballots.submit_ballot(event_id, user_id, &ranking).await?;
                Ok((plan.id, ballot))
            })
            .await?;

        // The last missing ballot closes voting. The vote stands regardless.
        match self
            .finalization
            .finalize_if_everyone_voted(ctx, plan_id, user_id)
            .await
        {
            Ok(_) | Err(CoreError::Conflict(_)) => {}
            Err(e) => {
                warn!(%plan_id, error = %e, "finalize after the last ballot failed");
            }
        }
        Ok(ballot)
    }

    pub async fn ballot(&self, event_id: Uuid, user_id: Uuid) -> CoreResult<Option<Ballot>> {
        self.ballots.ballot(event_id, user_id).await
    }

    pub async fn event_ballots(&self, event_id: Uuid) -> CoreResult<Vec<Ballot>> {
        self.ballots.ballots_for_event(event_id).await
    }

    /// Members without a ballot, per event still awaiting votes.
    pub async fn missing_votes(&self, plan_id: Uuid) -> CoreResult<Vec<MissingVote>> {
        let detail = self.plans.plan_detail(plan_id).await?;
        if detail.plan.status != PlanStatus::AwaitingVotes {
            return Ok(Vec::new());
        }
        let household = self.household(detail.plan.household_id).await?;
        let voters = self.ballots.voters_by_event(plan_id).await?;

        let mut missing = Vec::new();
        for e in detail
            .events
            .iter()
            .filter(|e| e.event.status == EventStatus::AwaitingVotes)
        {
            let voted = voters.get(&e.event.id);
            for member in &household.member_ids {
                if voted.is_none_or(|v| !v.contains(member)) {
                    missing.push(MissingVote {
                        event_id: e.event.id,
                        user_id: *member,
                    });
                }
            }
        }
        Ok(missing)
    }

    /// Finalize a plan; see [`Finalization::finalize`].
    pub async fn finalize(
        &self,
        ctx: &OpContext,
        plan_id: Uuid,
        actor: Actor,
        force: bool,
    ) -> CoreResult<MealPlan> {
        self.finalization.finalize(ctx, plan_id, actor, force).await
    }

    // -----------------------------------------------------------------------
    // Grocery list
    // -----------------------------------------------------------------------

    pub async fn generate_grocery_list(&self, ctx: &OpContext, plan_id: Uuid) -> CoreResult<ArtifactSaved> {
        self.grocery.generate(ctx, plan_id).await
    }

    pub async fn grocery_list(&self, plan_id: Uuid) -> CoreResult<Vec<GroceryListItem>> {
        self.plans.plan(plan_id).await?;
        self.grocery_items.grocery_items(plan_id).await
    }

    /// Apply a member's shopping update to a grocery line.
    pub async fn update_grocery_item(
        &self,
        ctx: &OpContext,
        item_id: Uuid,
        user_id: Uuid,
        update: &GroceryItemUpdate<'_>,
    ) -> CoreResult<GroceryListItem> {
        ensure_non_negative("purchased quantity", update.purchased_quantity)?;
        ensure_non_negative("purchase price", update.purchase_price)?;

        ctx.run(async {
            let item = self.grocery_items.grocery_item(item_id).await?;
            let plan = self.plans.plan(item.meal_plan_id).await?;
            self.member_of_plan(&plan, user_id).await?;
            self.grocery_items
                .update_grocery_item(item_id, update, self.clock.now())
                .await
        })
        .await
    }

    // -----------------------------------------------------------------------
    // Prep tasks
    // -----------------------------------------------------------------------

    pub async fn generate_prep_tasks(&self, ctx: &OpContext, plan_id: Uuid) -> CoreResult<ArtifactSaved> {
        self.prep.generate(ctx, plan_id).await
    }

    pub async fn prep_tasks(&self, plan_id: Uuid) -> CoreResult<Vec<PrepTask>> {
        self.tasks.list(plan_id).await
    }

    pub async fn change_task_status(
        &self,
        ctx: &OpContext,
        task_id: Uuid,
        user_id: Uuid,
        to: PrepTaskStatus,
        explanation: Option<&str>,
    ) -> CoreResult<PrepTask> {
        self.tasks
            .change_status(ctx, task_id, user_id, to, explanation)
            .await
    }

    pub async fn assign_task(
        &self,
        ctx: &OpContext,
        task_id: Uuid,
        by_user_id: Uuid,
        assignee: Option<Uuid>,
    ) -> CoreResult<PrepTask> {
        self.tasks.assign(ctx, task_id, by_user_id, assignee).await
    }
}
