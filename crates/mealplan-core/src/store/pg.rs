use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgConnection, PgPool, Postgres, Transaction};
use tracing::debug;
use uuid::Uuid;

use mealplan_db::models::{
    GroceryListItem, MealPlan, MealPlanEvent, MealPlanOption, MealPlanOptionVote, PlanStatus,
    PrepTask, PrepTaskStatus,
};
use mealplan_db::queries::events::{self, NewEvent};
use mealplan_db::queries::grocery_items::{self, GroceryItemUpdate, NewGroceryItem};
use mealplan_db::queries::options::{self, NewOption, WinningOption};
use mealplan_db::queries::plans::{self, NewPlan, PlanFilter};
use mealplan_db::queries::prep_tasks::{self, NewPrepTask};
use mealplan_db::queries::votes;

use super::{
    ArtifactSaved, Ballot, BallotStore, Check, Decide, EventBallots, EventDetail, EventDraft,
    FinalizationSnapshot, FinalizationStore, FinalizeOutcome, GroceryStore, OptionDraft,
    PlanDetail, PlanDraft, PlanRepository, PlanUpdate, PrepTaskStore, TaskChange, VotersByEvent,
    WinnerSource,
};
use crate::context::OpContext;
use crate::error::{CoreError, CoreResult};
use crate::state::{PlanStateMachine, PrepTaskStateMachine};
use crate::voting::validate_ranking;

/// [`super::PlanStore`] over PostgreSQL.
#[derive(Debug, Clone)]
pub struct PgPlanStore {
    pool: PgPool,
}

impl PgPlanStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

fn plan_not_found(id: Uuid) -> CoreError {
    CoreError::not_found(format!("meal plan {id}"))
}

fn event_not_found(id: Uuid) -> CoreError {
    CoreError::not_found(format!("meal plan event {id}"))
}

async fn lock_plan(conn: &mut PgConnection, plan_id: Uuid) -> CoreResult<MealPlan> {
    plans::get_plan_for_update(conn, plan_id)
        .await?
        .ok_or_else(|| plan_not_found(plan_id))
}

/// Insert an event and its options. The exclusion constraint backs up the
/// overlap check against concurrent inserts.
async fn insert_event_graph(
    conn: &mut PgConnection,
    plan_id: Uuid,
    draft: &EventDraft,
) -> CoreResult<EventDetail> {
    if let Some(other) = events::find_overlapping_event(
        &mut *conn,
        plan_id,
        draft.meal_name,
        draft.starts_at,
        draft.ends_at,
    )
    .await?
    {
        return Err(CoreError::invalid(format!(
            "{} event overlaps event {other} of the same plan",
            draft.meal_name
        )));
    }

    let event = events::insert_event(
        &mut *conn,
        plan_id,
        &NewEvent {
            meal_name: draft.meal_name,
            notes: &draft.notes,
            starts_at: draft.starts_at,
            ends_at: draft.ends_at,
        },
    )
    .await?;

    let mut inserted = Vec::with_capacity(draft.options.len());
    for option in &draft.options {
        inserted.push(insert_option(&mut *conn, event.id, option).await?);
    }

    Ok(EventDetail {
        event,
        options: inserted,
    })
}

async fn insert_option(
    conn: &mut PgConnection,
    event_id: Uuid,
    draft: &OptionDraft,
) -> CoreResult<MealPlanOption> {
    let option = options::insert_option(
        conn,
        event_id,
        &NewOption {
            meal_id: draft.meal_id,
            assigned_cook_user_id: draft.assigned_cook_user_id,
            notes: &draft.notes,
        },
    )
    .await?;
    Ok(option)
}

/// Fold vote rows (ordered by user, then rank) into ballots.
fn group_ballots(rows: Vec<MealPlanOptionVote>) -> Vec<Ballot> {
    let mut ballots: Vec<Ballot> = Vec::new();
    for row in rows {
        match ballots.last_mut() {
            Some(b) if b.event_id == row.meal_plan_event_id && b.user_id == row.by_user_id => {
                b.ranking.push(row.meal_plan_option_id);
                b.submitted_at = b.submitted_at.max(row.created_at);
            }
            _ => ballots.push(Ballot {
                event_id: row.meal_plan_event_id,
                user_id: row.by_user_id,
                ranking: vec![row.meal_plan_option_id],
                submitted_at: row.created_at,
            }),
        }
    }
    ballots
}

async fn event_details(conn: &mut PgConnection, plan_id: Uuid) -> CoreResult<Vec<EventDetail>> {
    let evts = events::list_events_for_plan(&mut *conn, plan_id).await?;
    let mut opts = options::list_options_for_plan(&mut *conn, plan_id).await?;

    let details = evts
        .into_iter()
        .map(|event| {
            let (mine, rest): (Vec<_>, Vec<_>) = std::mem::take(&mut opts)
                .into_iter()
                .partition(|o| o.meal_plan_event_id == event.id);
            opts = rest;
            EventDetail {
                event,
                options: mine,
            }
        })
        .collect();
    Ok(details)
}

/// Lock the event's plan and check options may still change.
async fn lock_for_option_edit(
    conn: &mut PgConnection,
    event: &MealPlanEvent,
) -> CoreResult<MealPlan> {
    let plan = lock_plan(&mut *conn, event.meal_plan_id).await?;
    let voters = votes::count_voters_for_event(&mut *conn, event.id).await?;
    PlanStateMachine::ensure_options_editable(&plan, event, voters)?;
    Ok(plan)
}

#[async_trait]
impl PlanRepository for PgPlanStore {
    async fn create_plan(&self, draft: &PlanDraft, _now: DateTime<Utc>) -> CoreResult<PlanDetail> {
        let mut tx = self.pool.begin().await?;

        if let Some(open) = plans::find_open_plan_for_household(&mut *tx, draft.household_id).await? {
            return Err(CoreError::conflict(format!(
                "household {} already has plan {} awaiting votes",
                draft.household_id, open.id
            )));
        }

        let plan = plans::insert_plan(
            &mut *tx,
            &NewPlan {
                household_id: draft.household_id,
                created_by_user_id: draft.created_by_user_id,
                notes: &draft.notes,
                voting_deadline: draft.voting_deadline,
            },
        )
        .await?;

        let mut inserted = Vec::with_capacity(draft.events.len());
        for event in &draft.events {
            inserted.push(insert_event_graph(&mut tx, plan.id, event).await?);
        }
        inserted.sort_by(|a, b| {
            (a.event.starts_at, a.event.id).cmp(&(b.event.starts_at, b.event.id))
        });

        tx.commit().await?;

        debug!(plan_id = %plan.id, events = inserted.len(), "meal plan created");
        Ok(PlanDetail {
            plan,
            events: inserted,
        })
    }

    async fn plan(&self, plan_id: Uuid) -> CoreResult<MealPlan> {
        plans::get_plan(&self.pool, plan_id)
            .await?
            .ok_or_else(|| plan_not_found(plan_id))
    }

    async fn plan_detail(&self, plan_id: Uuid) -> CoreResult<PlanDetail> {
        let mut conn = self.pool.acquire().await?;
        let plan = plans::get_plan(&mut *conn, plan_id)
            .await?
            .ok_or_else(|| plan_not_found(plan_id))?;
        let events = event_details(&mut conn, plan_id).await?;
        Ok(PlanDetail { plan, events })
    }

    async fn list_plans(&self, household_id: Uuid, filter: &PlanFilter) -> CoreResult<Vec<MealPlan>> {
        Ok(plans::list_plans_for_household(&self.pool, household_id, filter).await?)
    }

    async fn update_plan(
        &self,
        plan_id: Uuid,
        update: &PlanUpdate,
        now: DateTime<Utc>,
    ) -> CoreResult<MealPlan> {
        let mut tx = self.pool.begin().await?;
        let plan = lock_plan(&mut tx, plan_id).await?;
        PlanStateMachine::ensure_open(&plan)?;

        if let Some(deadline) = update.voting_deadline {
            let first_start = events::list_events_for_plan(&mut *tx, plan_id)
                .await?
                .first()
                .map(|e| e.starts_at);
            PlanStateMachine::ensure_valid_deadline(deadline, first_start, now)?;
        }

        let updated = plans::update_plan_details(
            &mut *tx,
            plan_id,
            update.notes.as_deref(),
            update.voting_deadline,
            now,
        )
        .await?
        .ok_or_else(|| CoreError::conflict(format!("plan {plan_id} is no longer awaiting votes")))?;

        tx.commit().await?;
        Ok(updated)
    }

    async fn add_event(
        &self,
        plan_id: Uuid,
        draft: &EventDraft,
        _now: DateTime<Utc>,
    ) -> CoreResult<EventDetail> {
        let mut tx = self.pool.begin().await?;
        let plan = lock_plan(&mut tx, plan_id).await?;
        PlanStateMachine::ensure_open(&plan)?;

        if draft.starts_at < plan.voting_deadline {
            return Err(CoreError::invalid(format!(
                "event must not start before the plan's voting deadline {}",
                plan.voting_deadline
            )));
        }

        let detail = insert_event_graph(&mut tx, plan_id, draft).await?;
        tx.commit().await?;
        Ok(detail)
    }

    async fn event(&self, event_id: Uuid) -> CoreResult<MealPlanEvent> {
        events::get_event(&self.pool, event_id)
            .await?
            .ok_or_else(|| event_not_found(event_id))
    }

    async fn add_option(&self, event_id: Uuid, draft: &OptionDraft) -> CoreResult<MealPlanOption> {
        let mut tx = self.pool.begin().await?;
        let event = events::get_event(&mut *tx, event_id)
            .await?
            .ok_or_else(|| event_not_found(event_id))?;
        lock_for_option_edit(&mut tx, &event).await?;

        let option = insert_option(&mut tx, event_id, draft).await?;
        tx.commit().await?;
        Ok(option)
    }

    async fn option(&self, option_id: Uuid) -> CoreResult<MealPlanOption> {
        options::get_option(&self.pool, option_id)
            .await?
            .ok_or_else(|| CoreError::not_found(format!("meal plan option {option_id}")))
    }

    async fn archive_option(&self, option_id: Uuid, now: DateTime<Utc>) -> CoreResult<()> {
        let mut tx = self.pool.begin().await?;
        let option = options::get_option(&mut *tx, option_id)
            .await?
            .ok_or_else(|| CoreError::not_found(format!("meal plan option {option_id}")))?;
        if option.archived_at.is_some() {
            return Err(CoreError::conflict(format!("option {option_id} is already archived")));
        }
        let event = events::get_event(&mut *tx, option.meal_plan_event_id)
            .await?
            .ok_or_else(|| event_not_found(option.meal_plan_event_id))?;
        lock_for_option_edit(&mut tx, &event).await?;

        let live = options::list_options_for_event(&mut *tx, event.id).await?;
        if live.len() <= 1 {
            return Err(CoreError::invalid(format!(
                "event {} must keep at least one option",
                event.id
            )));
        }

        if options::archive_option(&mut *tx, option_id, now).await? == 0 {
            return Err(CoreError::conflict(format!("option {option_id} is already archived")));
        }
        tx.commit().await?;
        Ok(())
    }

    async fn archive_plan(
        &self,
        plan_id: Uuid,
        authorize: &Check<'_, MealPlan>,
        now: DateTime<Utc>,
    ) -> CoreResult<MealPlan> {
        let mut tx = self.pool.begin().await?;
        let plan = lock_plan(&mut tx, plan_id).await?;
        authorize(&plan)?;

        let archived = plans::archive_plan(&mut *tx, plan_id, now)
            .await?
            .ok_or_else(|| CoreError::conflict(format!("plan {plan_id} is already archived")))?;
        tx.commit().await?;
        Ok(archived)
    }
}

#[async_trait]
impl BallotStore for PgPlanStore {
    async fn submit_ballot(
        &self,
        event_id: Uuid,
        user_id: Uuid,
        ranking: &[Uuid],
    ) -> CoreResult<Ballot> {
        let mut tx = self.pool.begin().await?;
        let event = events::get_event(&mut *tx, event_id)
            .await?
            .ok_or_else(|| event_not_found(event_id))?;
        let plan = plans::get_plan_for_share(&mut *tx, event.meal_plan_id)
            .await?
            .ok_or_else(|| plan_not_found(event.meal_plan_id))?;
        PlanStateMachine::ensure_accepting_votes(&plan, &event)?;

        let live: Vec<Uuid> = options::list_options_for_event(&mut *tx, event_id)
            .await?
            .into_iter()
            .map(|o| o.id)
            .collect();
        validate_ranking(&live, ranking)?;

        let rows = votes::replace_ballot(&mut tx, event_id, user_id, ranking).await?;
        tx.commit().await?;

        group_ballots(rows)
            .pop()
            .ok_or_else(|| CoreError::internal("ballot insert returned no rows"))
    }

    async fn ballot(&self, event_id: Uuid, user_id: Uuid) -> CoreResult<Option<Ballot>> {
        let rows = votes::get_ballot(&self.pool, event_id, user_id).await?;
        Ok(group_ballots(rows).pop())
    }

    async fn ballots_for_event(&self, event_id: Uuid) -> CoreResult<Vec<Ballot>> {
        let mut conn = self.pool.acquire().await?;
        if events::get_event(&mut *conn, event_id).await?.is_none() {
            return Err(event_not_found(event_id));
        }
        let rows = votes::list_votes_for_event(&mut *conn, event_id).await?;
        Ok(group_ballots(rows))
    }

    async fn voters_by_event(&self, plan_id: Uuid) -> CoreResult<VotersByEvent> {
        let mut conn = self.pool.acquire().await?;
        let mut voters: VotersByEvent = events::list_events_for_plan(&mut *conn, plan_id)
            .await?
            .into_iter()
            .map(|e| (e.id, Default::default()))
            .collect();
        for row in votes::list_votes_for_plan(&mut *conn, plan_id).await? {
            if let Some(users) = voters.get_mut(&row.meal_plan_event_id) {
                users.insert(row.by_user_id);
            }
        }
        Ok(voters)
    }
}

/// A finalization with every write issued and only the commit left.
enum Prepared {
    Ready(Transaction<'static, Postgres>, MealPlan),
    AlreadyFinalized(MealPlan),
}

#[async_trait]
impl FinalizationStore for PgPlanStore {
    async fn plans_past_deadline(&self, now: DateTime<Utc>) -> CoreResult<Vec<MealPlan>> {
        Ok(plans::find_plans_past_voting_deadline(&self.pool, now).await?)
    }

    async fn household_of(&self, plan_id: Uuid) -> CoreResult<Uuid> {
        plans::get_plan(&self.pool, plan_id)
            .await?
            .map(|p| p.household_id)
            .ok_or_else(|| plan_not_found(plan_id))
    }

    async fn finalize(
        &self,
        ctx: &OpContext,
        plan_id: Uuid,
        now: DateTime<Utc>,
        authorize: &Check<'_, FinalizationSnapshot>,
        decide: &Decide<'_>,
    ) -> CoreResult<FinalizeOutcome> {
        let prepared = ctx
            .run(async {
                let mut tx = self.pool.begin().await?;
                let plan = lock_plan(&mut tx, plan_id).await?;
                if plan.status.is_finalized() {
                    return Ok(Prepared::AlreadyFinalized(plan));
                }
                PlanStateMachine::ensure_open(&plan)?;

                let mut snapshot = FinalizationSnapshot {
                    plan,
                    events: Vec::new(),
                };
                for event in events::list_events_for_plan(&mut *tx, plan_id).await? {
                    let opts = options::list_options_for_event(&mut *tx, event.id).await?;
                    let rows = votes::list_votes_for_event(&mut *tx, event.id).await?;
                    snapshot.events.push(EventBallots {
                        event,
                        options: opts,
                        ballots: group_ballots(rows),
                    });
                }

                authorize(&snapshot)?;
                let outcomes = decide(&snapshot)?;

                for outcome in &outcomes {
                    options::record_event_outcome(
                        &mut *tx,
                        outcome.event_id,
                        outcome.winner,
                        outcome.tiebroken,
                    )
                    .await?;
                }
                events::finalize_events_for_plan(&mut *tx, plan_id).await?;

                let changed = plans::transition_plan_status(
                    &mut *tx,
                    plan_id,
                    PlanStatus::AwaitingVotes,
                    PlanStatus::Finalized,
                    now,
                )
                .await?;
                if changed == 0 {
                    return Err(CoreError::conflict(format!("plan {plan_id} changed while finalizing")));
                }

                let finalized = plans::get_plan(&mut *tx, plan_id)
                    .await?
                    .ok_or_else(|| plan_not_found(plan_id))?;
                Ok(Prepared::Ready(tx, finalized))
            })
            .await?;

        match prepared {
            Prepared::Ready(tx, finalized) => {
                tx.commit().await?;
                Ok(FinalizeOutcome::Finalized(finalized))
            }
            Prepared::AlreadyFinalized(plan) => Ok(FinalizeOutcome::AlreadyFinalized(plan)),
        }
    }
}

#[async_trait]
impl WinnerSource for PgPlanStore {
    async fn finalized_winners(&self, plan_id: Uuid) -> CoreResult<(MealPlan, Vec<WinningOption>)> {
        let mut conn = self.pool.acquire().await?;
        let plan = plans::get_plan(&mut *conn, plan_id)
            .await?
            .ok_or_else(|| plan_not_found(plan_id))?;
        ensure_artifacts_allowed(&plan)?;
        let winners = options::list_winning_options_for_plan(&mut *conn, plan_id).await?;
        Ok((plan, winners))
    }
}

fn ensure_artifacts_allowed(plan: &MealPlan) -> CoreResult<()> {
    if plan.status.is_finalized() {
        Ok(())
    } else {
        Err(CoreError::conflict(format!(
            "plan {} is {}; artifacts need a finalized plan",
            plan.id, plan.status
        )))
    }
}

fn artifact_saved(before: &MealPlan, after: MealPlan, written: usize, initialized: bool) -> ArtifactSaved {
    ArtifactSaved {
        completed: before.status != PlanStatus::Complete && after.status == PlanStatus::Complete,
        plan: after,
        written,
        initialized,
    }
}

#[async_trait]
impl GroceryStore for PgPlanStore {
    async fn save_grocery_list(
        &self,
        plan_id: Uuid,
        items: &[NewGroceryItem],
        now: DateTime<Utc>,
    ) -> CoreResult<ArtifactSaved> {
        let mut tx = self.pool.begin().await?;
        let before = lock_plan(&mut tx, plan_id).await?;
        ensure_artifacts_allowed(&before)?;

        let mut written = 0;
        for item in items {
            if grocery_items::upsert_generated_item(&mut *tx, plan_id, item, now)
                .await?
                .is_some()
            {
                written += 1;
            }
        }

        let initialized = before.grocery_list_initialized_at.is_none();
        let after = if initialized {
            plans::mark_grocery_list_initialized(&mut *tx, plan_id, now)
                .await?
                .ok_or_else(|| CoreError::conflict(format!("plan {plan_id} left the finalized states")))?
        } else {
            before.clone()
        };
        tx.commit().await?;

        Ok(artifact_saved(&before, after, written, initialized))
    }

    async fn plans_missing_grocery_list(&self) -> CoreResult<Vec<MealPlan>> {
        Ok(plans::find_finalized_plans_without_grocery_list(&self.pool).await?)
    }

    async fn grocery_items(&self, plan_id: Uuid) -> CoreResult<Vec<GroceryListItem>> {
        Ok(grocery_items::list_grocery_items_for_plan(&self.pool, plan_id).await?)
    }

    async fn grocery_item(&self, item_id: Uuid) -> CoreResult<GroceryListItem> {
        grocery_items::get_grocery_item(&self.pool, item_id)
            .await?
            .ok_or_else(|| CoreError::not_found(format!("grocery list item {item_id}")))
    }

    async fn update_grocery_item(
        &self,
        item_id: Uuid,
        update: &GroceryItemUpdate<'_>,
        now: DateTime<Utc>,
    ) -> CoreResult<GroceryListItem> {
        grocery_items::update_grocery_item(&self.pool, item_id, update, now)
            .await?
            .ok_or_else(|| CoreError::not_found(format!("grocery list item {item_id}")))
    }
}

#[async_trait]
impl PrepTaskStore for PgPlanStore {
    async fn save_prep_tasks(
        &self,
        plan_id: Uuid,
        tasks: &[NewPrepTask],
        now: DateTime<Utc>,
    ) -> CoreResult<ArtifactSaved> {
        let mut tx = self.pool.begin().await?;
        let before = lock_plan(&mut tx, plan_id).await?;
        ensure_artifacts_allowed(&before)?;

        let mut written = 0;
        for task in tasks {
            if prep_tasks::insert_prep_task(&mut *tx, plan_id, task, now)
                .await?
                .is_some()
            {
                written += 1;
            }
        }

        let initialized = before.tasks_created_at.is_none();
        let after = if initialized {
            plans::mark_tasks_created(&mut *tx, plan_id, now)
                .await?
                .ok_or_else(|| CoreError::conflict(format!("plan {plan_id} left the finalized states")))?
        } else {
            before.clone()
        };
        tx.commit().await?;

        Ok(artifact_saved(&before, after, written, initialized))
    }

    async fn plans_due_for_prep(
        &self,
        now: DateTime<Utc>,
        until: DateTime<Utc>,
    ) -> CoreResult<Vec<MealPlan>> {
        Ok(plans::find_finalized_plans_for_window(&self.pool, now, until).await?)
    }

    async fn prep_tasks(&self, plan_id: Uuid) -> CoreResult<Vec<PrepTask>> {
        Ok(prep_tasks::list_prep_tasks_for_plan(&self.pool, plan_id).await?)
    }

    async fn prep_task(&self, task_id: Uuid) -> CoreResult<PrepTask> {
        prep_tasks::get_prep_task(&self.pool, task_id)
            .await?
            .ok_or_else(|| CoreError::not_found(format!("prep task {task_id}")))
    }

    async fn change_prep_task_status(
        &self,
        task_id: Uuid,
        to: PrepTaskStatus,
        explanation: &str,
        now: DateTime<Utc>,
    ) -> CoreResult<TaskChange> {
        let current = self.prep_task(task_id).await?;
        PrepTaskStateMachine::ensure_transition(task_id, current.status, to)?;

        let task = prep_tasks::transition_prep_task_status(
            &self.pool,
            task_id,
            current.status,
            to,
            explanation,
            now,
        )
        .await?
        .ok_or_else(|| {
            CoreError::conflict(format!(
                "prep task {task_id} is no longer {}",
                current.status
            ))
        })?;

        Ok(TaskChange {
            previous: current.status,
            task,
        })
    }

    async fn assign_prep_task(
        &self,
        task_id: Uuid,
        user_id: Option<Uuid>,
        now: DateTime<Utc>,
    ) -> CoreResult<PrepTask> {
        prep_tasks::assign_prep_task(&self.pool, task_id, user_id, now)
            .await?
            .ok_or_else(|| CoreError::not_found(format!("prep task {task_id}")))
    }
}

#[cfg(test)]
mod tests {
    use chrono::Duration;

    use super::*;

    fn vote(event: Uuid, user: Uuid, option: Uuid, rank: i32, at: DateTime<Utc>) -> MealPlanOptionVote {
        MealPlanOptionVote {
            id: Uuid::new_v4(),
            meal_plan_event_id: event,
            meal_plan_option_id: option,
            by_user_id: user,
            rank,
            created_at: at,
        }
    }

    #[test]
    fn groups_vote_rows_into_ballots() {
        let now = Utc::now();
        let (e1, e2) = (Uuid::new_v4(), Uuid::new_v4());
        let (u1, u2) = (Uuid::new_v4(), Uuid::new_v4());
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());

        let ballots = group_ballots(vec![
            vote(e1, u1, a, 1, now),
            vote(e1, u1, b, 2, now + Duration::seconds(1)),
            vote(e1, u2, b, 1, now),
            vote(e1, u2, a, 2, now),
            vote(e2, u1, a, 1, now),
        ]);

        assert_eq!(ballots.len(), 3);
        assert_eq!(ballots[0].ranking, vec![a, b]);
        assert_eq!(ballots[0].submitted_at, now + Duration::seconds(1));
        assert_eq!(ballots[1].user_id, u2);
        assert_eq!(ballots[1].ranking, vec![b, a]);
        assert_eq!(ballots[2].event_id, e2);
    }

    #[test]
    fn no_rows_no_ballots() {
        assert!(group_ballots(Vec::new()).is_empty());
    }
}
