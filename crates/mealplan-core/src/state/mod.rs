//! Plan and prep-task state machines.
//!
//! The transition tables and guards here are pure; the operations that
//! apply them run inside a single database transaction in the store, with
//! the plan row locked, so transitions of one plan are linearized by the
//! database.

mod finalize;

pub use finalize::{Actor, Finalization, decide_outcomes, ensure_may_finalize};

use chrono::{DateTime, Utc};
use uuid::Uuid;

use mealplan_db::models::{EventStatus, MealPlan, MealPlanEvent, PlanStatus, PrepTaskStatus};

use crate::catalog::HouseholdInfo;
use crate::error::{CoreError, CoreResult};

/// The plan state machine.
///
/// ```text
/// awaiting_votes           -> finalized
/// finalized                -> grocery_list_initialized
/// finalized                -> prep_tasks_generated
/// grocery_list_initialized -> complete
/// prep_tasks_generated     -> complete
/// any but archived         -> archived
/// ```
pub struct PlanStateMachine;

impl PlanStateMachine {
    pub fn is_valid_transition(from: PlanStatus, to: PlanStatus) -> bool {
        use PlanStatus::*;
        matches!(
            (from, to),
            (AwaitingVotes, Finalized)
                | (Finalized, GroceryListInitialized)
                | (Finalized, PrepTasksGenerated)
                | (GroceryListInitialized, Complete)
                | (PrepTasksGenerated, Complete)
        ) || (to == Archived && from != Archived)
    }

    /// Plans, events and options may only be edited while votes are open.
    pub fn ensure_open(plan: &MealPlan) -> CoreResult<()> {
        match plan.status {
            PlanStatus::AwaitingVotes => Ok(()),
            other => Err(CoreError::conflict(format!(
                "plan {} is {other}, not awaiting votes",
                plan.id
            ))),
        }
    }

    /// Ballots are accepted only while both the plan and the event are open.
    pub fn ensure_accepting_votes(plan: &MealPlan, event: &MealPlanEvent) -> CoreResult<()> {
        Self::ensure_open(plan)?;
        if event.archived_at.is_some() {
            return Err(CoreError::conflict(format!("event {} is archived", event.id)));
        }
        if event.status != EventStatus::AwaitingVotes {
            return Err(CoreError::conflict(format!(
                "event {} is {}, not awaiting votes",
                event.id, event.status
            )));
        }
        Ok(())
    }

    /// Options of an event with ballots are frozen: changing them would
    /// break the permutation invariant of the existing ballots.
    pub fn ensure_options_editable(
        plan: &MealPlan,
        event: &MealPlanEvent,
        voters: i64,
    ) -> CoreResult<()> {
        Self::ensure_accepting_votes(plan, event)?;
        if voters > 0 {
            return Err(CoreError::conflict(format!(
                "event {} already has {voters} ballot(s); its options are frozen",
                event.id
            )));
        }
        Ok(())
    }

    /// While votes are open any member may archive; afterwards only the
    /// household owner.
    pub fn ensure_may_archive(
        plan: &MealPlan,
        household: &HouseholdInfo,
        user_id: Uuid,
    ) -> CoreResult<()> {
        if plan.status == PlanStatus::Archived {
            return Err(CoreError::conflict(format!("plan {} is already archived", plan.id)));
        }
        if !household.is_member(user_id) {
            return Err(not_a_member(user_id, household.id));
        }
        if plan.status != PlanStatus::AwaitingVotes && !household.is_owner(user_id) {
            return Err(CoreError::conflict(format!(
                "plan {} is {}; only the household owner may archive it",
                plan.id, plan.status
            )));
        }
        Ok(())
    }

    /// A new voting deadline must be in the future and not after the first
    /// event starts.
    pub fn ensure_valid_deadline(
        deadline: DateTime<Utc>,
        first_event_start: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> CoreResult<()> {
        if deadline <= now {
            return Err(CoreError::invalid("voting deadline must be in the future"));
        }
        if let Some(start) = first_event_start
            && deadline > start
        {
            return Err(CoreError::invalid(
                "voting deadline must not be after the first event starts",
            ));
        }
        Ok(())
    }
}

/// The prep-task state machine.
///
/// ```text
/// unfinished  -> in_progress
/// in_progress -> finished
/// unfinished  -> ignored
/// unfinished  -> postponed
/// postponed   -> unfinished
/// ```
pub struct PrepTaskStateMachine;

impl PrepTaskStateMachine {
    pub fn is_valid_transition(from: PrepTaskStatus, to: PrepTaskStatus) -> bool {
        use PrepTaskStatus::*;
        matches!(
            (from, to),
            (Unfinished, InProgress)
                | (InProgress, Finished)
                | (Unfinished, Ignored)
                | (Unfinished, Postponed)
                | (Postponed, Unfinished)
        )
    }

    pub fn ensure_transition(task_id: Uuid, from: PrepTaskStatus, to: PrepTaskStatus) -> CoreResult<()> {
        if Self::is_valid_transition(from, to) {
            Ok(())
        } else {
            Err(CoreError::conflict(format!(
                "invalid prep task transition {from} -> {to} for task {task_id}"
            )))
        }
    }
}

pub(crate) fn not_a_member(user_id: Uuid, household_id: Uuid) -> CoreError {
    CoreError::invalid(format!(
        "user {user_id} is not a member of household {household_id}"
    ))
}
