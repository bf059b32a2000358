//! The `awaiting_votes -> finalized` transition.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

use mealplan_db::models::MealPlan;

use super::not_a_member;
use crate::bus::{Envelope, Publisher};
use crate::catalog::{Catalog, HouseholdInfo};
use crate::clock::Clock;
use crate::context::OpContext;
use crate::error::{CoreError, CoreResult};
use crate::store::{EventOutcome, FinalizationSnapshot, FinalizationStore, FinalizeOutcome};
use crate::voting::instant_runoff;

/// Who is asking for a transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind", content = "user_id")]
pub enum Actor {
    User(Uuid),
    /// A background worker.
    System,
}

impl Actor {
    pub fn user_id(&self) -> Option<Uuid> {
        match self {
            Self::User(id) => Some(*id),
            Self::System => None,
        }
    }
}

/// Whether `actor` may finalize the plan in `snapshot` at `now`.
///
/// Past the deadline anyone may. Before it, a member may once every member
/// has a ballot for every event, and the owner may by forcing.
/// `household` is required for user actors.
pub fn ensure_may_finalize(
    snapshot: &FinalizationSnapshot,
    household: Option<&HouseholdInfo>,
    actor: Actor,
    force: bool,
    now: DateTime<Utc>,
) -> CoreResult<()> {
    let plan = &snapshot.plan;
    let deadline_passed = plan.voting_deadline <= now;

    let user_id = match actor {
        Actor::System if deadline_passed => return Ok(()),
        Actor::System => {
            return Err(CoreError::conflict(format!(
                "plan {} is collecting votes until {}",
                plan.id, plan.voting_deadline
            )));
        }
        Actor::User(id) => id,
    };

    let household = household
        .ok_or_else(|| CoreError::internal("household is required to authorize a user"))?;
    if !household.is_member(user_id) {
        return Err(not_a_member(user_id, household.id));
    }
    if deadline_passed || everyone_voted(snapshot, household) {
        return Ok(());
    }
    if !force {
        return Err(CoreError::conflict(format!(
            "plan {} is collecting votes until {}; the owner may force early finalization",
            plan.id, plan.voting_deadline
        )));
    }
    if !household.is_owner(user_id) {
        return Err(CoreError::conflict(format!(
            "only the owner of household {} may force early finalization",
            household.id
        )));
    }
    Ok(())
}

fn everyone_voted(snapshot: &FinalizationSnapshot, household: &HouseholdInfo) -> bool {
    !snapshot.events.is_empty()
        && snapshot.events.iter().all(|e| {
            household
                .member_ids
                .iter()
                .all(|m| e.ballots.iter().any(|b| b.user_id == *m))
        })
}

/// Run the instant-runoff tally for every event of the snapshot.
pub fn decide_outcomes(snapshot: &FinalizationSnapshot) -> CoreResult<Vec<EventOutcome>> {
    let outcomes = snapshot
        .events
        .iter()
        .map(|e| {
            let option_ids: Vec<Uuid> = e.options.iter().map(|o| o.id).collect();
            let rankings: Vec<Vec<Uuid>> = e.ballots.iter().map(|b| b.ranking.clone()).collect();
            let tally = instant_runoff(&option_ids, &rankings);
            debug!(
                event_id = %e.event.id,
                ballots = rankings.len(),
                rounds = tally.rounds.len(),
                winner = ?tally.winner,
                tiebroken = tally.tiebroken,
                "event tallied"
            );
            EventOutcome {
                event_id: e.event.id,
                winner: tally.winner,
                tiebroken: tally.tiebroken,
            }
        })
        .collect();
    Ok(outcomes)
}

/// Finalizes plans: tally, persist, then announce.
pub struct Finalization {
    store: Arc<dyn FinalizationStore>,
    catalog: Arc<dyn Catalog>,
    bus: Arc<dyn Publisher>,
    clock: Arc<dyn Clock>,
}

impl Finalization {
    pub fn new(
        store: Arc<dyn FinalizationStore>,
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

    /// Plans whose voting deadline has passed.
    pub async fn due(&self) -> CoreResult<Vec<MealPlan>> {
        self.store.plans_past_deadline(self.clock.now()).await
    }

    /// Finalize a plan and return its state.
    ///
    /// Finalizing an already finalized plan succeeds without writing or
    /// publishing anything. `plan.finalized` is published after commit;
    /// a publish failure is logged, never returned.
    pub async fn finalize(
        &self,
        ctx: &OpContext,
        plan_id: Uuid,
        actor: Actor,
        force: bool,
    ) -> CoreResult<MealPlan> {
        self.finalize_with(ctx, plan_id, actor, force, |snapshot, household, now| {
            ensure_may_finalize(snapshot, household, actor, force, now)
        })
        .await
    }

    /// Finalize on behalf of `user_id` once every member has a ballot for
    /// every event, deadline or not. Fails with `Conflict` while votes are
    /// still missing.
    pub async fn finalize_if_everyone_voted(
        &self,
        ctx: &OpContext,
        plan_id: Uuid,
        user_id: Uuid,
    ) -> CoreResult<MealPlan> {
        self.finalize_with(ctx, plan_id, Actor::User(user_id), false, |snapshot, household, _| {
            let household = household
                .ok_or_else(|| CoreError::internal("household is required to authorize a user"))?;
            if everyone_voted(snapshot, household) {
                Ok(())
            } else {
                Err(CoreError::conflict(format!(
                    "plan {} is still missing votes",
                    snapshot.plan.id
                )))
            }
        })
        .await
    }

    async fn finalize_with<P>(
        &self,
        ctx: &OpContext,
        plan_id: Uuid,
        actor: Actor,
        force: bool,
        policy: P,
    ) -> CoreResult<MealPlan>
    where
        P: Fn(&FinalizationSnapshot, Option<&HouseholdInfo>, DateTime<Utc>) -> CoreResult<()>
            + Send
            + Sync,
    {
        let household = ctx
            .run(async {
                match actor {
                    Actor::User(user_id) => {
                        let household_id = self.store.household_of(plan_id).await?;
                        let info = self
                            .catalog
                            .household(household_id)
                            .await?
                            .ok_or_else(|| CoreError::not_found(format!("household {household_id}")))?;
                        if !info.is_member(user_id) {
                            return Err(not_a_member(user_id, household_id));
                        }
                        Ok(Some(info))
                    }
                    Actor::System => Ok(None),
                }
            })
            .await?;

        let now = self.clock.now();
        let authorize =
            |snapshot: &FinalizationSnapshot| policy(snapshot, household.as_ref(), now);
        let outcome = self
            .store
            .finalize(ctx, plan_id, now, &authorize, &decide_outcomes)
            .await?;

        match outcome {
            FinalizeOutcome::Finalized(plan) => {
                info!(plan_id = %plan.id, actor = ?actor, force, "meal plan finalized");
                let envelope = Envelope::plan_finalized(&plan, actor.user_id(), self.clock.now());
                if let Err(e) = self.bus.publish(envelope).await {
                    warn!(plan_id = %plan.id, error = %e, "failed to publish plan.finalized");
                }
                Ok(plan)
            }
            FinalizeOutcome::AlreadyFinalized(plan) => {
                debug!(plan_id = %plan.id, status = %plan.status, "meal plan already finalized");
                Ok(plan)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::Duration;

    use mealplan_db::models::{
        EventStatus, MealName, MealPlanEvent, MealPlanOption, OptionChoice, PlanStatus,
    };

    use async_trait::async_trait;
    use mealplan_db::models::{PrepTaskTemplate, RecipeIngredient, UnitConversion};

    use super::*;
    use crate::bus::MemoryPublisher;
    use crate::clock::FixedClock;
    use crate::store::{Ballot, Check, Decide, EventBallots};

    fn id(n: u128) -> Uuid {
        Uuid::from_u128(n)
    }

    fn snapshot(deadline: DateTime<Utc>, ballots: &[(Uuid, &[u128])]) -> FinalizationSnapshot {
        let now = Utc::now();
        let plan = MealPlan {
            id: id(100),
            household_id: id(200),
            created_by_user_id: id(1),
            notes: String::new(),
            voting_deadline: deadline,
            status: PlanStatus::AwaitingVotes,
            finalized_at: None,
            grocery_list_initialized_at: None,
            tasks_created_at: None,
            created_at: now,
            last_updated_at: None,
            archived_at: None,
        };
        let event = MealPlanEvent {
            id: id(300),
            meal_plan_id: plan.id,
            meal_name: MealName::Dinner,
            notes: String::new(),
            starts_at: now + Duration::days(3),
            ends_at: now + Duration::days(3) + Duration::hours(1),
            status: EventStatus::AwaitingVotes,
            created_at: now,
            archived_at: None,
        };
        let options = [0xa, 0xb, 0xc]
            .into_iter()
            .map(|n| MealPlanOption {
                id: id(n),
                meal_plan_event_id: event.id,
                meal_id: Uuid::new_v4(),
                assigned_cook_user_id: None,
                notes: String::new(),
                chosen: OptionChoice::Unknown,
                tiebroken: false,
                created_at: now,
                archived_at: None,
            })
            .collect();
        let ballots = ballots
            .iter()
            .map(|(user, ranking)| Ballot {
                event_id: event.id,
                user_id: *user,
                ranking: ranking.iter().map(|n| id(*n)).collect(),
                submitted_at: now,
            })
            .collect();
        FinalizationSnapshot {
            plan,
            events: vec![EventBallots {
                event,
                options,
                ballots,
            }],
        }
    }

    fn household() -> HouseholdInfo {
        HouseholdInfo {
            id: id(200),
            owner_user_id: id(1),
            member_ids: vec![id(1), id(2)],
        }
    }

    #[test]
    fn decides_two_voter_runoff_by_smallest_id() {
        let snap = snapshot(Utc::now(), &[(id(1), &[0xa, 0xb, 0xc]), (id(2), &[0xb, 0xc, 0xa])]);
        let outcomes = decide_outcomes(&snap).unwrap();
        assert_eq!(
            outcomes,
            vec![EventOutcome {
                event_id: id(300),
                winner: Some(id(0xa)),
                tiebroken: true,
            }]
        );
    }

    #[test]
    fn no_ballots_no_winner() {
        let snap = snapshot(Utc::now(), &[]);
        let outcomes = decide_outcomes(&snap).unwrap();
        assert_eq!(outcomes[0].winner, None);
        assert!(!outcomes[0].tiebroken);
    }

    #[test]
    fn system_needs_the_deadline_to_pass() {
        let now = Utc::now();
        let open = snapshot(now + Duration::hours(1), &[]);
        assert_eq!(
            ensure_may_finalize(&open, None, Actor::System, false, now)
                .unwrap_err()
                .code(),
            "conflict"
        );

        let due = snapshot(now, &[]);
        assert!(ensure_may_finalize(&due, None, Actor::System, false, now).is_ok());
    }

    #[test]
    fn early_finalize_is_reserved_to_the_owner() {
        let now = Utc::now();
        let h = household();
        let open = snapshot(now + Duration::hours(1), &[(id(1), &[0xa, 0xb, 0xc])]);

        let err = ensure_may_finalize(&open, Some(&h), Actor::User(id(1)), false, now).unwrap_err();
        assert_eq!(err.code(), "conflict");
        let err = ensure_may_finalize(&open, Some(&h), Actor::User(id(2)), true, now).unwrap_err();
        assert_eq!(err.code(), "conflict");
        assert!(ensure_may_finalize(&open, Some(&h), Actor::User(id(1)), true, now).is_ok());
    }

    #[test]
    fn any_member_may_finalize_once_everyone_voted() {
        let now = Utc::now();
        let h = household();
        let all_in = snapshot(
            now + Duration::hours(1),
            &[(id(1), &[0xa, 0xb, 0xc]), (id(2), &[0xc, 0xb, 0xa])],
        );
        assert!(ensure_may_finalize(&all_in, Some(&h), Actor::User(id(2)), false, now).is_ok());
    }

    #[test]
    fn outsiders_are_rejected() {
        let now = Utc::now();
        let due = snapshot(now, &[]);
        let err = ensure_may_finalize(&due, Some(&household()), Actor::User(id(9)), true, now)
            .unwrap_err();
        assert_eq!(err.code(), "invalid");
    }

    /// Serves one household of members 1 and 2.
    struct OneHousehold;

    #[async_trait]
    impl Catalog for OneHousehold {
        async fn household(&self, _: Uuid) -> CoreResult<Option<HouseholdInfo>> {
            Ok(Some(household()))
        }

        async fn recipes_for_meal(&self, _: Uuid) -> CoreResult<Vec<Uuid>> {
            Ok(Vec::new())
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

    /// Finalizes without a database. With `cancel_at_commit` the context is
    /// cancelled right as the commit lands, before the call returns.
    struct StubStore {
        already_finalized: bool,
        cancel_at_commit: bool,
    }

    #[async_trait]
    impl FinalizationStore for StubStore {
        async fn plans_past_deadline(&self, _: DateTime<Utc>) -> CoreResult<Vec<MealPlan>> {
            Ok(Vec::new())
        }

        async fn household_of(&self, _: Uuid) -> CoreResult<Uuid> {
            Ok(id(200))
        }

        async fn finalize(
            &self,
            ctx: &OpContext,
            _plan_id: Uuid,
            now: DateTime<Utc>,
            _authorize: &Check<'_, FinalizationSnapshot>,
            _decide: &Decide<'_>,
        ) -> CoreResult<FinalizeOutcome> {
            let mut plan = snapshot(now, &[]).plan;
            plan.status = PlanStatus::Finalized;
            if self.already_finalized {
                return Ok(FinalizeOutcome::AlreadyFinalized(plan));
            }
            if self.cancel_at_commit {
                ctx.token().cancel();
                tokio::task::yield_now().await;
            }
            Ok(FinalizeOutcome::Finalized(plan))
        }
    }

    fn finalization(store: StubStore, bus: Arc<MemoryPublisher>) -> Finalization {
        Finalization::new(
            Arc::new(store),
            Arc::new(OneHousehold),
            bus,
            Arc::new(FixedClock::new(Utc::now())),
        )
    }

    #[tokio::test]
    async fn cancellation_after_commit_still_announces() {
        let bus = Arc::new(MemoryPublisher::new());
        let f = finalization(
            StubStore {
                already_finalized: false,
                cancel_at_commit: true,
            },
            bus.clone(),
        );
        let ctx = OpContext::new(tokio_util::sync::CancellationToken::new());

        let plan = f.finalize(&ctx, id(100), Actor::System, false).await.unwrap();
        assert_eq!(plan.status, PlanStatus::Finalized);
        assert!(ctx.is_cancelled());
        assert_eq!(bus.count(crate::bus::topics::PLAN_FINALIZED), 1);
    }

    #[tokio::test]
    async fn outsiders_cannot_read_a_finalized_plan_through_finalize() {
        let bus = Arc::new(MemoryPublisher::new());
        let f = finalization(
            StubStore {
                already_finalized: true,
                cancel_at_commit: false,
            },
            bus.clone(),
        );
        let ctx = OpContext::background();

        let err = f
            .finalize(&ctx, id(100), Actor::User(id(9)), false)
            .await
            .unwrap_err();
        assert_eq!(err.code(), "invalid");

        let plan = f
            .finalize(&ctx, id(100), Actor::User(id(2)), false)
            .await
            .unwrap();
        assert_eq!(plan.status, PlanStatus::Finalized);
        assert_eq!(bus.count(crate::bus::topics::PLAN_FINALIZED), 0);
    }
}
