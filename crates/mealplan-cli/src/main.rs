mod config;
mod plan_cmds;
mod runtime;
mod serve_cmd;
mod work_cmd;

use std::time::Duration;

use clap::{Parser, Subcommand};

use mealplan_db::config::DbConfig;
use mealplan_db::pool;

use config::MealplanConfig;
use runtime::Runtime;

#[derive(Parser)]
#[command(name = "mealplan", about = "Collaborative household meal planning")]
struct Cli {
    /// Database URL (overrides MEALPLAN_DATABASE_URL env var)
    #[arg(long, global = true)]
    database_url: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Write a mealplan config file (no database required)
    Init {
        /// PostgreSQL connection URL
        #[arg(long, default_value = DbConfig::DEFAULT_URL)]
        db_url: String,
        /// Overwrite existing config file
        #[arg(long)]
        force: bool,
    },
    /// Create the database if needed and apply migrations
    DbInit,
    /// Serve the HTTP API
    Serve {
        /// Address to bind (defaults to the config file's server.bind)
        #[arg(long)]
        bind: Option<String>,
        /// Port to listen on (defaults to the config file's server.port)
        #[arg(long)]
        port: Option<u16>,
    },
    /// Run the finalizer, outbox consumer and replay sweeper until Ctrl+C
    Work,
    /// Plan management
    Plan {
        #[command(subcommand)]
        command: PlanCommands,
    },
}

#[derive(Subcommand)]
pub enum PlanCommands {
    /// List a household's plans
    List {
        /// Household ID
        #[arg(long)]
        household: String,
        /// Only plans in this status (e.g. awaiting_votes)
        #[arg(long)]
        status: Option<String>,
        /// Include archived plans
        #[arg(long)]
        include_archived: bool,
    },
    /// Show a plan with its events and options
    Show {
        /// Plan ID to show
        plan_id: String,
    },
    /// Finalize a plan now
    Finalize {
        /// Plan ID to finalize
        plan_id: String,
        /// Acting member (omit to finalize as the system, after the deadline)
        #[arg(long)]
        user: Option<String>,
        /// Finalize before the deadline even if votes are missing (owner only)
        #[arg(long)]
        force: bool,
    },
    /// List members who have not voted on each open event
    MissingVotes {
        /// Plan ID to inspect
        plan_id: String,
    },
    /// Archive a plan
    Archive {
        /// Plan ID to archive
        plan_id: String,
        /// Acting member
        #[arg(long)]
        user: String,
    },
}

/// Execute the `mealplan init` command: write config file.
fn cmd_init(db_url: &str, force: bool) -> anyhow::Result<()> {
    let path = config::config_path();

    if path.exists() && !force {
        anyhow::bail!(
            "config file already exists at {}\nUse --force to overwrite.",
            path.display()
        );
    }

    let cfg = config::ConfigFile::new(db_url);
    config::save_config_to(&path, &cfg)?;

    println!("Config written to {}", path.display());
    println!("  database.url = {db_url}");
    println!();
    println!("Next: run `mealplan db-init` to create and migrate the database.");

    Ok(())
}

/// Execute the `mealplan db-init` command: create database and run migrations.
async fn cmd_db_init(cli_db_url: Option<&str>) -> anyhow::Result<()> {
    let resolved = MealplanConfig::resolve(cli_db_url)?;

    println!("Initializing mealplan database...");

    if pool::ensure_database_exists(&resolved.db_config).await? {
        println!("Created database.");
    }
    let db_pool = pool::create_pool(&resolved.db_config).await?;
    pool::run_migrations(&db_pool).await?;

    let counts = pool::table_counts(&db_pool).await?;
    println!("Database ready. Tables:");
    for (table, count) in &counts {
        println!("  {table}: {count} rows");
    }

    db_pool.close().await;

    println!("mealplan db-init complete.");
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Init { db_url, force } => {
            cmd_init(&db_url, force)?;
        }
        Commands::DbInit => {
            cmd_db_init(cli.database_url.as_deref()).await?;
        }
        Commands::Serve { bind, port } => {
            let resolved = MealplanConfig::resolve(cli.database_url.as_deref())?;
            let runtime = Runtime::start(&resolved).await?;
            let bind = bind.unwrap_or_else(|| resolved.server.bind.clone());
            let port = port.unwrap_or(resolved.server.port);
            let timeout = Duration::from_secs(resolved.server.request_timeout_secs);
            serve_cmd::run_serve(runtime, &bind, port, timeout).await?;
        }
        Commands::Work => {
            let resolved = MealplanConfig::resolve(cli.database_url.as_deref())?;
            let runtime = Runtime::start(&resolved).await?;
            work_cmd::run_work(runtime, &resolved.worker).await?;
        }
        Commands::Plan { command } => {
            let resolved = MealplanConfig::resolve(cli.database_url.as_deref())?;
            let runtime = Runtime::start(&resolved).await?;
            let result = plan_cmds::run_plan_command(command, &runtime.core).await;
            runtime.shutdown().await;
            result?;
        }
    }

    Ok(())
}


#[cfg(test)]
mod tests {
    use clap::Parser;

    use super::{Cli, Commands, PlanCommands};

    #[test]
    fn parses_plan_finalize_with_force() {
        let cli = Cli::try_parse_from([
            "mealplan",
            "plan",
            "finalize",
            "7f1c6c1e-98a4-4f55-9d5c-6f1f1d2d6b3a",
            "--user",
            "0b7a5f86-2c0e-4d8e-8c5b-1c3f1f0f9a11",
            "--force",
        ])
        .unwrap();

        match cli.command {
            Commands::Plan {
                command: PlanCommands::Finalize { plan_id, user, force },
            } => {
                assert_eq!(plan_id, "7f1c6c1e-98a4-4f55-9d5c-6f1f1d2d6b3a");
                assert_eq!(user.as_deref(), Some("0b7a5f86-2c0e-4d8e-8c5b-1c3f1f0f9a11"));
                assert!(force);
            }
            _ => panic!("expected plan finalize"),
        }
    }

    #[test]
    fn serve_flags_are_optional() {
        let cli = Cli::try_parse_from(["mealplan", "serve", "--port", "9090"]).unwrap();
        match cli.command {
            Commands::Serve { bind, port } => {
                assert_eq!(bind, None);
                assert_eq!(port, Some(9090));
            }
            _ => panic!("expected serve"),
        }
    }

    #[test]
    fn global_database_url_after_subcommand() {
        let cli = Cli::try_parse_from([
            "mealplan",
            "plan",
            "missing-votes",
            "7f1c6c1e-98a4-4f55-9d5c-6f1f1d2d6b3a",
            "--database-url",
            "postgresql://elsewhere/meals",
        ])
        .unwrap();
        assert_eq!(cli.database_url.as_deref(), Some("postgresql://elsewhere/meals"));
    }

    #[test]
    fn archive_requires_user() {
        assert!(
            Cli::try_parse_from(["mealplan", "plan", "archive", "7f1c6c1e-98a4-4f55-9d5c-6f1f1d2d6b3a"])
                .is_err()
        );
    }
}
