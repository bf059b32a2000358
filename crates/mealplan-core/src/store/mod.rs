//! Persistence seams of the core.
//!
//! Each component depends on the one narrow trait it needs. [`PgPlanStore`]
//! implements all of them over the `mealplan-db` query layer; every
//! state-changing method runs in a single transaction with the plan row
//! locked.

mod pg;

pub use pg::PgPlanStore;

use std::collections::{BTreeMap, BTreeSet};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use mealplan_db::models::{
    GroceryListItem, MealName, MealPlan, MealPlanEvent, MealPlanOption, PrepTask, PrepTaskStatus,
};
use mealplan_db::queries::grocery_items::{GroceryItemUpdate, NewGroceryItem};
use mealplan_db::queries::options::WinningOption;
use mealplan_db::queries::plans::PlanFilter;
use mealplan_db::queries::prep_tasks::NewPrepTask;

use crate::context::OpContext;
use crate::error::CoreResult;

// ---------------------------------------------------------------------------
// Inputs
// ---------------------------------------------------------------------------

/// A plan to create, with its events and their options.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanDraft {
    pub household_id: Uuid,
    pub created_by_user_id: Uuid,
    #[serde(default)]
    pub notes: String,
    pub voting_deadline: DateTime<Utc>,
    pub events: Vec<EventDraft>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventDraft {
    pub meal_name: MealName,
    #[serde(default)]
    pub notes: String,
    pub starts_at: DateTime<Utc>,
    pub ends_at: DateTime<Utc>,
    pub options: Vec<OptionDraft>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OptionDraft {
    pub meal_id: Uuid,
    #[serde(default)]
    pub assigned_cook_user_id: Option<Uuid>,
    #[serde(default)]
    pub notes: String,
}

/// Changes to a plan still collecting votes. `None` leaves a field as is.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PlanUpdate {
    pub notes: Option<String>,
    pub voting_deadline: Option<DateTime<Utc>>,
}

// ---------------------------------------------------------------------------
// Outputs
// ---------------------------------------------------------------------------

/// A plan with its live events and their live options.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PlanDetail {
    #[serde(flatten)]
    pub plan: MealPlan,
    pub events: Vec<EventDetail>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EventDetail {
    #[serde(flatten)]
    pub event: MealPlanEvent,
    pub options: Vec<MealPlanOption>,
}

/// A user's ranking for one event, most preferred first.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Ballot {
    pub event_id: Uuid,
    pub user_id: Uuid,
    pub ranking: Vec<Uuid>,
    pub submitted_at: DateTime<Utc>,
}

/// Users with a ballot, per live event of a plan.
pub type VotersByEvent = BTreeMap<Uuid, BTreeSet<Uuid>>;

/// Everything finalization decides on, read under the plan lock.
#[derive(Debug, Clone, PartialEq)]
pub struct FinalizationSnapshot {
    pub plan: MealPlan,
    pub events: Vec<EventBallots>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct EventBallots {
    pub event: MealPlanEvent,
    pub options: Vec<MealPlanOption>,
    pub ballots: Vec<Ballot>,
}

/// The decided outcome of one event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventOutcome {
    pub event_id: Uuid,
    pub winner: Option<Uuid>,
    pub tiebroken: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub enum FinalizeOutcome {
    /// This call moved the plan to `finalized`.
    Finalized(MealPlan),
    /// Someone else got there first; nothing was written.
    AlreadyFinalized(MealPlan),
}

impl FinalizeOutcome {
    pub fn plan(&self) -> &MealPlan {
        match self {
            Self::Finalized(p) | Self::AlreadyFinalized(p) => p,
        }
    }

    pub fn into_plan(self) -> MealPlan {
        match self {
            Self::Finalized(p) | Self::AlreadyFinalized(p) => p,
        }
    }
}

/// Result of writing one derived artifact.
#[derive(Debug, Clone, PartialEq)]
pub struct ArtifactSaved {
    pub plan: MealPlan,
    /// Rows inserted or changed. Zero on a replay.
    pub written: usize,
    /// The artifact timestamp was set by this call.
    pub initialized: bool,
    /// The plan reached `complete` in this call.
    pub completed: bool,
}

/// A prep task before and after a status change.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskChange {
    pub previous: PrepTaskStatus,
    pub task: PrepTask,
}

/// Authorization check run against state read under the plan lock.
pub type Check<'a, T> = dyn Fn(&T) -> CoreResult<()> + Send + Sync + 'a;

/// Decides every event outcome of a finalization.
pub type Decide<'a> =
    dyn Fn(&FinalizationSnapshot) -> CoreResult<Vec<EventOutcome>> + Send + Sync + 'a;

// ---------------------------------------------------------------------------
// Traits
// ---------------------------------------------------------------------------

/// Plan, event and option authoring plus reads.
#[async_trait]
pub trait PlanRepository: Send + Sync {
    async fn create_plan(&self, draft: &PlanDraft, now: DateTime<Utc>) -> CoreResult<PlanDetail>;

    async fn plan(&self, plan_id: Uuid) -> CoreResult<MealPlan>;

    async fn plan_detail(&self, plan_id: Uuid) -> CoreResult<PlanDetail>;

    async fn list_plans(&self, household_id: Uuid, filter: &PlanFilter) -> CoreResult<Vec<MealPlan>>;

    async fn update_plan(
        &self,
        plan_id: Uuid,
        update: &PlanUpdate,
        now: DateTime<Utc>,
    ) -> CoreResult<MealPlan>;

    async fn add_event(
        &self,
        plan_id: Uuid,
        draft: &EventDraft,
        now: DateTime<Utc>,
    ) -> CoreResult<EventDetail>;

    async fn event(&self, event_id: Uuid) -> CoreResult<MealPlanEvent>;

    async fn add_option(&self, event_id: Uuid, draft: &OptionDraft) -> CoreResult<MealPlanOption>;

    async fn option(&self, option_id: Uuid) -> CoreResult<MealPlanOption>;

    async fn archive_option(&self, option_id: Uuid, now: DateTime<Utc>) -> CoreResult<()>;

    /// Archive a plan after `authorize` accepts its locked row.
    async fn archive_plan(
        &self,
        plan_id: Uuid,
        authorize: &Check<'_, MealPlan>,
        now: DateTime<Utc>,
    ) -> CoreResult<MealPlan>;
}

/// Ballot submission and reads.
#[async_trait]
pub trait BallotStore: Send + Sync {
    /// Replace the user's ballot for an event while the plan and event are
    /// still awaiting votes.
    async fn submit_ballot(&self, event_id: Uuid, user_id: Uuid, ranking: &[Uuid])
    -> CoreResult<Ballot>;

    async fn ballot(&self, event_id: Uuid, user_id: Uuid) -> CoreResult<Option<Ballot>>;

    async fn ballots_for_event(&self, event_id: Uuid) -> CoreResult<Vec<Ballot>>;

    async fn voters_by_event(&self, plan_id: Uuid) -> CoreResult<VotersByEvent>;
}

/// The finalize transition.
#[async_trait]
pub trait FinalizationStore: Send + Sync {
    async fn plans_past_deadline(&self, now: DateTime<Utc>) -> CoreResult<Vec<MealPlan>>;

    /// The household a plan belongs to.
    async fn household_of(&self, plan_id: Uuid) -> CoreResult<Uuid>;

    /// Finalize a plan in one transaction.
    ///
    /// An already finalized plan returns [`FinalizeOutcome::AlreadyFinalized`]
    /// without consulting `authorize` or `decide`. `ctx` bounds the work up
    /// to commit; once the commit is issued it is no longer consulted.
    async fn finalize(
        &self,
        ctx: &OpContext,
        plan_id: Uuid,
        now: DateTime<Utc>,
        authorize: &Check<'_, FinalizationSnapshot>,
        decide: &Decide<'_>,
    ) -> CoreResult<FinalizeOutcome>;
}

/// Inputs shared by the artifact generators.
#[async_trait]
pub trait WinnerSource: Send + Sync {
    /// A finalized plan and the winning option of each of its events.
    async fn finalized_winners(&self, plan_id: Uuid) -> CoreResult<(MealPlan, Vec<WinningOption>)>;
}

#[async_trait]
pub trait GroceryStore: WinnerSource {
    async fn save_grocery_list(
        &self,
        plan_id: Uuid,
        items: &[NewGroceryItem],
        now: DateTime<Utc>,
    ) -> CoreResult<ArtifactSaved>;

    async fn plans_missing_grocery_list(&self) -> CoreResult<Vec<MealPlan>>;

    async fn grocery_items(&self, plan_id: Uuid) -> CoreResult<Vec<GroceryListItem>>;

    async fn grocery_item(&self, item_id: Uuid) -> CoreResult<GroceryListItem>;

    async fn update_grocery_item(
        &self,
        item_id: Uuid,
        update: &GroceryItemUpdate<'_>,
        now: DateTime<Utc>,
    ) -> CoreResult<GroceryListItem>;
}

#[async_trait]
pub trait PrepTaskStore: WinnerSource {
    async fn save_prep_tasks(
        &self,
        plan_id: Uuid,
        tasks: &[NewPrepTask],
        now: DateTime<Utc>,
    ) -> CoreResult<ArtifactSaved>;

    /// Finalized plans without prep tasks with an event starting in
    /// `[now, until)`.
    async fn plans_due_for_prep(
        &self,
        now: DateTime<Utc>,
        until: DateTime<Utc>,
    ) -> CoreResult<Vec<MealPlan>>;

    async fn prep_tasks(&self, plan_id: Uuid) -> CoreResult<Vec<PrepTask>>;

    async fn prep_task(&self, task_id: Uuid) -> CoreResult<PrepTask>;

    /// Apply a status change allowed by the prep-task state machine.
    async fn change_prep_task_status(
        &self,
        task_id: Uuid,
        to: PrepTaskStatus,
        explanation: &str,
        now: DateTime<Utc>,
    ) -> CoreResult<TaskChange>;

    async fn assign_prep_task(
        &self,
        task_id: Uuid,
        user_id: Option<Uuid>,
        now: DateTime<Utc>,
    ) -> CoreResult<PrepTask>;
}

const _: () = {
    fn _assert_object_safe(
        _: &dyn PlanRepository,
        _: &dyn BallotStore,
        _: &dyn FinalizationStore,
        _: &dyn GroceryStore,
        _: &dyn PrepTaskStore,
    ) {
    }
};

/// Everything [`crate::PlanningCore`] needs from storage.
pub trait PlanStore:
    PlanRepository + BallotStore + FinalizationStore + GroceryStore + PrepTaskStore
{
}

impl<T> PlanStore for T where
    T: PlanRepository + BallotStore + FinalizationStore + GroceryStore + PrepTaskStore
{
}
