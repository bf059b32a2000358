//! Operator CLI handlers for `mealplan plan` subcommands.
//!
//! Implements:
//! - `mealplan plan list --household <id>`      -- list a household's plans
//! - `mealplan plan show <plan-id>`             -- show events, options and winners
//! - `mealplan plan finalize <plan-id>`         -- finalize now
//! - `mealplan plan missing-votes <plan-id>`    -- who still has to vote
//! - `mealplan plan archive <plan-id> --user`   -- archive on behalf of a member

use anyhow::{Context, Result};
use uuid::Uuid;

use mealplan_core::{Actor, OpContext, PlanningCore};
use mealplan_db::models::{OptionChoice, PlanStatus};
use mealplan_db::queries::plans::PlanFilter;

use crate::PlanCommands;

// -----------------------------------------------------------------------
// Public entry point
// -----------------------------------------------------------------------

/// Dispatch a `PlanCommands` variant to the appropriate handler.
pub async fn run_plan_command(command: PlanCommands, core: &PlanningCore) -> Result<()> {
    match command {
        PlanCommands::List {
            household,
            status,
            include_archived,
        } => cmd_list(core, &household, status.as_deref(), include_archived).await,
        PlanCommands::Show { plan_id } => cmd_show(core, &plan_id).await,
        PlanCommands::Finalize {
            plan_id,
            user,
            force,
        } => cmd_finalize(core, &plan_id, user.as_deref(), force).await,
        PlanCommands::MissingVotes { plan_id } => cmd_missing_votes(core, &plan_id).await,
        PlanCommands::Archive { plan_id, user } => cmd_archive(core, &plan_id, &user).await,
    }
}

fn parse_id(kind: &str, raw: &str) -> Result<Uuid> {
    raw.parse()
        .with_context(|| format!("invalid {kind} ID: {raw:?}"))
}

// -----------------------------------------------------------------------
// mealplan plan list
// -----------------------------------------------------------------------

async fn cmd_list(
    core: &PlanningCore,
    household: &str,
    status: Option<&str>,
    include_archived: bool,
) -> Result<()> {
    let household_id = parse_id("household", household)?;
    let status = status
        .map(|s| s.parse::<PlanStatus>())
        .transpose()
        .context("invalid --status")?;
    let filter = PlanFilter {
        status,
        include_archived,
        ..PlanFilter::default()
    };

    let plans = core.list_plans(household_id, &filter).await?;
    if plans.is_empty() {
        println!("No plans found for household {household_id}.");
        return Ok(());
    }

    // ID is always 36 chars (UUID). Status max is 24 (grocery_list_initialized).
    let id_w = 36;
    let status_w = 24;

    println!("{:<id_w$}  {:<status_w$}  {:<16}  CREATED", "ID", "STATUS", "DEADLINE");
    for plan in &plans {
        println!(
            "{:<id_w$}  {:<status_w$}  {:<16}  {}",
            plan.id,
            plan.status,
            plan.voting_deadline.format("%Y-%m-%d %H:%M"),
            plan.created_at.format("%Y-%m-%d %H:%M"),
        );
    }

    Ok(())
}

// -----------------------------------------------------------------------
// mealplan plan show <plan-id>
// -----------------------------------------------------------------------

async fn cmd_show(core: &PlanningCore, plan_id: &str) -> Result<()> {
    let plan_id = parse_id("plan", plan_id)?;
    let detail = core.plan(plan_id).await?;
    let plan = &detail.plan;

    println!("Plan: {}", plan.id);
    println!("  Household:    {}", plan.household_id);
    println!("  Status:       {}", plan.status);
    println!(
        "  Deadline:     {}",
        plan.voting_deadline.format("%Y-%m-%d %H:%M:%S UTC")
    );
    if !plan.notes.is_empty() {
        println!("  Notes:        {}", plan.notes);
    }
    if let Some(at) = plan.finalized_at {
        println!("  Finalized:    {}", at.format("%Y-%m-%d %H:%M:%S UTC"));
    }
    if let Some(at) = plan.grocery_list_initialized_at {
        println!("  Groceries:    {}", at.format("%Y-%m-%d %H:%M:%S UTC"));
    }
    if let Some(at) = plan.tasks_created_at {
        println!("  Prep tasks:   {}", at.format("%Y-%m-%d %H:%M:%S UTC"));
    }

    println!();
    println!("Events:");
    for event in &detail.events {
        println!();
        println!(
            "  [{}] {} {}",
            event.event.status,
            event.event.meal_name,
            event.event.starts_at.format("%a %Y-%m-%d %H:%M"),
        );
        println!("    ID:  {}", event.event.id);
        for option in &event.options {
            let marker = match option.chosen {
                OptionChoice::Winner if option.tiebroken => "* (tiebreak)",
                OptionChoice::Winner => "*",
                _ => "",
            };
            println!("    - {} meal {} {marker}", option.id, option.meal_id);
        }
    }

    Ok(())
}

// -----------------------------------------------------------------------
// mealplan plan finalize <plan-id>
// -----------------------------------------------------------------------

async fn cmd_finalize(
    core: &PlanningCore,
    plan_id: &str,
    user: Option<&str>,
    force: bool,
) -> Result<()> {
    let plan_id = parse_id("plan", plan_id)?;
    let actor = match user {
        Some(raw) => Actor::User(parse_id("user", raw)?),
        None => Actor::System,
    };

    let plan = core
        .finalize(&OpContext::background(), plan_id, actor, force)
        .await
        .with_context(|| format!("failed to finalize plan {plan_id}"))?;

    println!("Plan {} is {}.", plan.id, plan.status);
    Ok(())
}

// -----------------------------------------------------------------------
// mealplan plan missing-votes <plan-id>
// -----------------------------------------------------------------------

async fn cmd_missing_votes(core: &PlanningCore, plan_id: &str) -> Result<()> {
    let plan_id = parse_id("plan", plan_id)?;
    let missing = core.missing_votes(plan_id).await?;

    if missing.is_empty() {
        println!("Every member has voted on every event.");
        return Ok(());
    }

    println!("{:<36}  USER", "EVENT");
    for m in &missing {
        println!("{:<36}  {}", m.event_id, m.user_id);
    }
    Ok(())
}

// -----------------------------------------------------------------------
// mealplan plan archive <plan-id> --user <user-id>
// -----------------------------------------------------------------------

async fn cmd_archive(core: &PlanningCore, plan_id: &str, user: &str) -> Result<()> {
    let plan_id = parse_id("plan", plan_id)?;
    let user_id = parse_id("user", user)?;

    let plan = core
        .archive_plan(&OpContext::background(), plan_id, user_id)
        .await
        .with_context(|| format!("failed to archive plan {plan_id}"))?;

    println!("Plan {} archived.", plan.id);
    Ok(())
}
