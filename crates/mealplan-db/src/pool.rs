use std::time::Duration;

use anyhow::{Context, Result};
use sqlx::postgres::PgPoolOptions;
use sqlx::{Executor, PgPool};
use tracing::info;

use crate::config::DbConfig;

/// Migrations embedded at compile time from `crates/mealplan-db/migrations/`.
pub static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!();

/// Extensions the migrations install. The overlap exclusion on
/// `meal_plan_events` needs `btree_gist`.
pub const REQUIRED_EXTENSIONS: &[&str] = &["btree_gist"];

/// Every table the migrations create, in dependency order.
pub const TABLES: &[&str] = &[
    "households",
    "household_members",
    "measurement_units",
    "ingredients",
    "measurement_unit_conversions",
    "recipes",
    "meals",
    "meal_recipes",
    "recipe_ingredients",
    "recipe_prep_task_templates",
    "meal_plans",
    "meal_plan_events",
    "meal_plan_options",
    "meal_plan_option_votes",
    "meal_plan_grocery_list_items",
    "meal_plan_tasks",
    "event_outbox",
];

const ACQUIRE_TIMEOUT: Duration = Duration::from_secs(10);

/// Pool options shared by the service pool, maintenance connections and
/// test databases.
pub fn pool_options(max_connections: u32) -> PgPoolOptions {
    PgPoolOptions::new()
        .max_connections(max_connections.max(1))
        .acquire_timeout(ACQUIRE_TIMEOUT)
}

/// Create a connection pool sized from the config.
pub async fn create_pool(config: &DbConfig) -> Result<PgPool> {
    pool_options(config.max_connections)
        .connect(&config.database_url)
        .await
        .with_context(|| format!("failed to connect to database at {}", config.database_url))
}

/// Run all pending embedded migrations against the pool.
pub async fn run_migrations(pool: &PgPool) -> Result<()> {
    ensure_extensions_available(pool).await?;
    MIGRATOR
        .run(pool)
        .await
        .context("failed to run database migrations")?;

    info!(migrations = MIGRATOR.iter().count(), "migrations applied");
    Ok(())
}

/// Fail with a readable error when the server cannot provide an extension
/// the migrations depend on, instead of failing halfway through them.
pub async fn ensure_extensions_available(pool: &PgPool) -> Result<()> {
    let available: Vec<String> = sqlx::query_scalar(
        "SELECT name::text FROM pg_available_extensions WHERE name::text = ANY($1)",
    )
    .bind(REQUIRED_EXTENSIONS)
    .fetch_all(pool)
    .await
    .context("failed to query pg_available_extensions")?;

    let missing: Vec<&str> = REQUIRED_EXTENSIONS
        .iter()
        .copied()
        .filter(|ext| !available.iter().any(|a| a.as_str() == *ext))
        .collect();
    if !missing.is_empty() {
        anyhow::bail!(
            "PostgreSQL server is missing required extensions: {} (install postgresql-contrib)",
            missing.join(", ")
        );
    }
    Ok(())
}

/// Database names are interpolated into DDL, which cannot take binds.
fn checked_identifier(name: &str) -> Result<&str> {
    let valid = !name.is_empty()
        && name.len() <= 63
        && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
        && !name.starts_with(|c: char| c.is_ascii_digit());
    if !valid {
        anyhow::bail!("database name {name:?} is not a plain identifier");
    }
    Ok(name)
}

/// A single-connection pool on the server's `postgres` database.
pub async fn connect_maintenance(maintenance_url: &str) -> Result<PgPool> {
    pool_options(1)
        .connect(maintenance_url)
        .await
        .with_context(|| format!("failed to connect to maintenance database at {maintenance_url}"))
}

pub async fn database_exists(maint: &PgPool, name: &str) -> Result<bool> {
    sqlx::query_scalar("SELECT EXISTS(SELECT 1 FROM pg_database WHERE datname = $1)")
        .bind(name)
        .fetch_one(maint)
        .await
        .context("failed to query pg_database")
}

pub async fn create_database(maint: &PgPool, name: &str) -> Result<()> {
    let name = checked_identifier(name)?;
    maint
        .execute(format!("CREATE DATABASE {name}").as_str())
        .await
        .with_context(|| format!("failed to create database {name}"))?;
    info!(db = name, "database created");
    Ok(())
}

/// Drop a database, disconnecting its remaining sessions first.
pub async fn drop_database(maint: &PgPool, name: &str) -> Result<()> {
    let name = checked_identifier(name)?;
    sqlx::query(
        "SELECT pg_terminate_backend(pid) FROM pg_stat_activity \
         WHERE datname = $1 AND pid <> pg_backend_pid()",
    )
    .bind(name)
    .execute(maint)
    .await
    .context("failed to disconnect sessions")?;
    maint
        .execute(format!("DROP DATABASE IF EXISTS {name}").as_str())
        .await
        .with_context(|| format!("failed to drop database {name}"))?;
    Ok(())
}

/// Create the configured database when it is absent. Returns whether it
/// was created.
pub async fn ensure_database_exists(config: &DbConfig) -> Result<bool> {
    let db_name = config
        .database_name()
        .context("could not determine database name from URL")?;

    let maint = connect_maintenance(&config.maintenance_url()).await?;
    let created = if database_exists(&maint, db_name).await? {
        info!(db = db_name, "database already exists");
        false
    } else {
        create_database(&maint, db_name).await?;
        true
    };
    maint.close().await;
    Ok(created)
}

/// Row counts of the meal planning tables that exist, in [`TABLES`] order.
///
/// Printed by `mealplan db-init` on success.
pub async fn table_counts(pool: &PgPool) -> Result<Vec<(String, i64)>> {
    let present: Vec<String> = sqlx::query_scalar(
        "SELECT tablename::text FROM pg_tables \
         WHERE schemaname = 'public' AND tablename::text = ANY($1)",
    )
    .bind(TABLES)
    .fetch_all(pool)
    .await
    .context("failed to list tables")?;

    let mut counts = Vec::with_capacity(present.len());
    for table in TABLES.iter().filter(|t| present.iter().any(|p| p.as_str() == **t)) {
        let count: i64 = sqlx::query_scalar(&format!("SELECT COUNT(*) FROM {table}"))
            .fetch_one(pool)
            .await
            .with_context(|| format!("failed to count rows in {table}"))?;
        counts.push(((*table).to_owned(), count));
    }
    Ok(counts)
}
