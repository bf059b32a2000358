//! Finalization end to end: runoff outcomes, guards, the finalizer job.

mod common;

use chrono::Duration;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use mealplan_core::bus::topics;
use mealplan_core::store::PlanDetail;
use mealplan_core::{Actor, Clock, CoreError, OpContext};
use mealplan_db::models::{EventStatus, OptionChoice, PlanStatus};

use common::{Harness, dinner, sorted_option_ids, t0};

fn choice(detail: &PlanDetail, option_id: Uuid) -> (OptionChoice, bool) {
    detail
        .events
        .iter()
        .flat_map(|e| &e.options)
        .find(|o| o.id == option_id)
        .map(|o| (o.chosen, o.tiebroken))
        .expect("option should exist")
}

#[tokio::test]
async fn two_voter_runoff_is_tiebroken_by_smallest_id() {
    // A third member abstains, so voting stays open until the deadline.
    let h = Harness::new(2).await;
    let meals = h.bare_meals(3).await;
    let ctx = OpContext::background();
    let detail = h.create_plan(vec![dinner(3, &meals)]).await;
    let event_id = detail.events[0].event.id;
    let ids = sorted_option_ids(&detail, 0);
    let [a, b, c] = ids[..] else {
        panic!("expected three options");
    };

    h.core
        .submit_vote(&ctx, event_id, h.member(0), vec![a, b, c])
        .await
        .unwrap();
    h.core
        .submit_vote(&ctx, event_id, h.member(1), vec![b, c, a])
        .await
        .unwrap();

    h.close_voting();
    let plan = h
        .core
        .finalize(&ctx, detail.plan.id, Actor::System, false)
        .await
        .unwrap();
    assert_eq!(plan.status, PlanStatus::Finalized);
    assert_eq!(plan.finalized_at, Some(h.clock.now()));

    let after = h.core.plan(detail.plan.id).await.unwrap();
    assert_eq!(after.events[0].event.status, EventStatus::Finalized);
    assert_eq!(choice(&after, a), (OptionChoice::Winner, true));
    assert_eq!(choice(&after, b), (OptionChoice::Loser, false));
    assert_eq!(choice(&after, c), (OptionChoice::Loser, false));

    h.teardown().await;
}

#[tokio::test]
async fn first_round_majority_wins_outright() {
    let h = Harness::new(2).await;
    let meals = h.bare_meals(3).await;
    let ctx = OpContext::background();
    let detail = h.create_plan(vec![dinner(3, &meals)]).await;
    let event_id = detail.events[0].event.id;
    let ids = sorted_option_ids(&detail, 0);
    let [x, y, z] = ids[..] else {
        panic!("expected three options");
    };

    for (user, ranking) in [
        (h.member(0), vec![x, y, z]),
        (h.member(1), vec![x, z, y]),
        (h.member(2), vec![y, x, z]),
    ] {
        h.core.submit_vote(&ctx, event_id, user, ranking).await.unwrap();
    }

    h.close_voting();
    h.core
        .finalize(&ctx, detail.plan.id, Actor::System, false)
        .await
        .unwrap();

    let after = h.core.plan(detail.plan.id).await.unwrap();
    assert_eq!(choice(&after, x), (OptionChoice::Winner, false));
    assert_eq!(choice(&after, y).0, OptionChoice::Loser);

    h.teardown().await;
}

#[tokio::test]
async fn events_without_ballots_finalize_without_a_winner() {
    let h = Harness::new(0).await;
    let meals = h.bare_meals(2).await;
    let detail = h.create_plan(vec![dinner(3, &meals)]).await;

    h.close_voting();
    h.core
        .finalize(&OpContext::background(), detail.plan.id, Actor::System, false)
        .await
        .unwrap();

    let after = h.core.plan(detail.plan.id).await.unwrap();
    assert_eq!(after.plan.status, PlanStatus::Finalized);
    assert_eq!(after.events[0].event.status, EventStatus::Finalized);
    assert!(
        after.events[0]
            .options
            .iter()
            .all(|o| o.chosen == OptionChoice::Loser && !o.tiebroken)
    );

    h.teardown().await;
}

#[tokio::test]
async fn late_votes_conflict_and_change_nothing() {
    let h = Harness::new(1).await;
    let meals = h.bare_meals(2).await;
    let ctx = OpContext::background();
    let detail = h.create_plan(vec![dinner(3, &meals)]).await;
    let event_id = detail.events[0].event.id;
    let ids = sorted_option_ids(&detail, 0);

    h.core
        .submit_vote(&ctx, event_id, h.owner(), ids.clone())
        .await
        .unwrap();
    h.close_voting();
    h.core
        .finalize(&ctx, detail.plan.id, Actor::System, false)
        .await
        .unwrap();

    h.clock.advance(Duration::milliseconds(1));
    let err = h
        .core
        .submit_vote(&ctx, event_id, h.member(1), vec![ids[1], ids[0]])
        .await
        .unwrap_err();
    assert!(matches!(err, CoreError::Conflict(_)), "got {err:?}");

    let ballots = h.core.event_ballots(event_id).await.unwrap();
    assert_eq!(ballots.len(), 1);
    assert_eq!(ballots[0].user_id, h.owner());

    h.teardown().await;
}

#[tokio::test]
async fn finalizing_twice_publishes_once() {
    let h = Harness::new(0).await;
    let meals = h.bare_meals(2).await;
    let ctx = OpContext::background();
    let detail = h.create_plan(vec![dinner(3, &meals)]).await;
    h.close_voting();

    let (first, second) = tokio::join!(
        h.core.finalize(&ctx, detail.plan.id, Actor::System, false),
        h.core.finalize(&ctx, detail.plan.id, Actor::System, false),
    );
    let first = first.unwrap();
    let second = second.unwrap();
    assert_eq!(first.status, PlanStatus::Finalized);
    assert_eq!(first.finalized_at, second.finalized_at);

    let again = h
        .core
        .finalize(&ctx, detail.plan.id, Actor::User(h.owner()), false)
        .await
        .unwrap();
    assert_eq!(again.finalized_at, first.finalized_at);

    assert_eq!(h.bus.count(topics::PLAN_FINALIZED), 1);

    h.teardown().await;
}

#[tokio::test]
async fn early_finalize_is_forced_by_the_owner_only() {
    let h = Harness::new(1).await;
    let meals = h.bare_meals(2).await;
    let ctx = OpContext::background();
    let detail = h.create_plan(vec![dinner(3, &meals)]).await;
    let plan_id = detail.plan.id;
    let member = h.member(1);

    // Before the deadline the system may not finalize.
    let err = h.core.finalize(&ctx, plan_id, Actor::System, false).await.unwrap_err();
    assert_eq!(err.code(), "conflict");
    // Nor a member, forced or not.
    let err = h
        .core
        .finalize(&ctx, plan_id, Actor::User(member), true)
        .await
        .unwrap_err();
    assert_eq!(err.code(), "conflict");
    // The owner must ask for it explicitly.
    let err = h
        .core
        .finalize(&ctx, plan_id, Actor::User(h.owner()), false)
        .await
        .unwrap_err();
    assert_eq!(err.code(), "conflict");
    // Outsiders are not members at all.
    let err = h
        .core
        .finalize(&ctx, plan_id, Actor::User(Uuid::new_v4()), true)
        .await
        .unwrap_err();
    assert_eq!(err.code(), "invalid");

    assert_eq!(
        h.core.plan(plan_id).await.unwrap().plan.status,
        PlanStatus::AwaitingVotes
    );

    h.teardown().await;
}

#[tokio::test]
async fn last_ballot_finalizes_the_plan() {
    let h = Harness::new(1).await;
    let meals = h.bare_meals(2).await;
    let ctx = OpContext::background();
    let detail = h
        .create_plan(vec![dinner(3, &meals), dinner(4, &meals)])
        .await;
    let plan_id = detail.plan.id;
    let member = h.member(1);

    h.core
        .submit_vote(&ctx, detail.events[0].event.id, h.owner(), sorted_option_ids(&detail, 0))
        .await
        .unwrap();
    h.core
        .submit_vote(&ctx, detail.events[1].event.id, h.owner(), sorted_option_ids(&detail, 1))
        .await
        .unwrap();
    h.core
        .submit_vote(&ctx, detail.events[0].event.id, member, sorted_option_ids(&detail, 0))
        .await
        .unwrap();
    assert_eq!(
        h.core.plan(plan_id).await.unwrap().plan.status,
        PlanStatus::AwaitingVotes
    );
    assert_eq!(h.bus.count(topics::PLAN_FINALIZED), 0);

    let ballot = h
        .core
        .submit_vote(&ctx, detail.events[1].event.id, member, sorted_option_ids(&detail, 1))
        .await
        .unwrap();
    assert_eq!(ballot.user_id, member);

    let after = h.core.plan(plan_id).await.unwrap();
    assert_eq!(after.plan.status, PlanStatus::Finalized);
    assert_eq!(after.plan.finalized_at, Some(t0()));
    assert!(after.events.iter().all(|e| e.event.status == EventStatus::Finalized));

    // A follow-up request finds the work done.
    let again = h
        .core
        .finalize(&ctx, plan_id, Actor::User(member), false)
        .await
        .unwrap();
    assert_eq!(again.finalized_at, after.plan.finalized_at);

    assert_eq!(h.bus.count(topics::PLAN_FINALIZED), 1);
    let finalized = h
        .bus
        .envelopes()
        .into_iter()
        .find(|e| e.topic == topics::PLAN_FINALIZED)
        .expect("plan.finalized published");
    assert_eq!(finalized.user_id, Some(member));

    h.teardown().await;
}

#[tokio::test]
async fn outsiders_get_nothing_from_a_finalized_plan() {
    let h = Harness::new(0).await;
    let meals = h.bare_meals(2).await;
    let ctx = OpContext::background();
    let detail = h.create_plan(vec![dinner(3, &meals)]).await;
    h.close_voting();
    h.core
        .finalize(&ctx, detail.plan.id, Actor::System, false)
        .await
        .unwrap();

    let err = h
        .core
        .finalize(&ctx, detail.plan.id, Actor::User(Uuid::new_v4()), false)
        .await
        .unwrap_err();
    assert_eq!(err.code(), "invalid");

    h.teardown().await;
}

#[tokio::test]
async fn owner_may_force_an_early_finalize() {
    let h = Harness::new(1).await;
    let meals = h.bare_meals(2).await;
    let detail = h.create_plan(vec![dinner(3, &meals)]).await;

    let plan = h
        .core
        .finalize(
            &OpContext::background(),
            detail.plan.id,
            Actor::User(h.owner()),
            true,
        )
        .await
        .unwrap();
    assert_eq!(plan.status, PlanStatus::Finalized);
    assert_eq!(plan.finalized_at, Some(t0()));

    h.teardown().await;
}

#[tokio::test]
async fn cancelled_finalize_leaves_the_plan_open() {
    let h = Harness::new(0).await;
    let meals = h.bare_meals(2).await;
    let detail = h.create_plan(vec![dinner(3, &meals)]).await;
    h.close_voting();

    let token = CancellationToken::new();
    token.cancel();
    let err = h
        .core
        .finalize(&OpContext::new(token), detail.plan.id, Actor::System, false)
        .await
        .unwrap_err();
    assert!(err.is_retryable(), "got {err:?}");

    let after = h.core.plan(detail.plan.id).await.unwrap();
    assert_eq!(after.plan.status, PlanStatus::AwaitingVotes);
    assert_eq!(after.events[0].event.status, EventStatus::AwaitingVotes);
    assert_eq!(h.bus.count(topics::PLAN_FINALIZED), 0);

    h.teardown().await;
}

#[tokio::test]
async fn finalizer_job_picks_up_expired_plans() {
    let h = Harness::new(0).await;
    let meals = h.bare_meals(2).await;
    let detail = h.create_plan(vec![dinner(3, &meals)]).await;
    let job = h.core.finalizer_job();
    let cancel = CancellationToken::new();

    let report = job.tick(&cancel).await;
    assert_eq!(report.due, 0);

    h.close_voting();
    let report = job.tick(&cancel).await;
    assert_eq!(report.due, 1);
    assert_eq!(report.finalized, 1);
    assert_eq!(report.failed, 0);
    assert_eq!(job.failure_count(detail.plan.id), 0);

    // Nothing left to do.
    let report = job.tick(&cancel).await;
    assert_eq!(report.due, 0);
    assert_eq!(h.bus.count(topics::PLAN_FINALIZED), 1);

    h.teardown().await;
}

#[tokio::test]
async fn finalizer_job_stops_between_plans_when_cancelled() {
    let h = Harness::new(0).await;
    let meals = h.bare_meals(2).await;
    let detail = h.create_plan(vec![dinner(3, &meals)]).await;
    h.close_voting();

    let cancel = CancellationToken::new();
    cancel.cancel();
    let report = h.core.finalizer_job().tick(&cancel).await;
    assert!(report.cancelled);
    assert_eq!(report.finalized, 0);

    let after = h.core.plan(detail.plan.id).await.unwrap();
    assert_eq!(after.plan.status, PlanStatus::AwaitingVotes);

    h.teardown().await;
}
