//! Configuration file management for mealplan.
//!
//! Provides a TOML-based config file at `~/.config/mealplan/config.toml` and
//! a resolution chain: CLI flag > env var > config file > default.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use mealplan_core::CoreConfig;
use mealplan_db::config::DbConfig;

// -----------------------------------------------------------------------
// Config file types
// -----------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfigFile {
    pub database: DatabaseSection,
    #[serde(default)]
    pub worker: WorkerSection,
    #[serde(default)]
    pub bus: BusSection,
    #[serde(default)]
    pub server: ServerSection,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatabaseSection {
    pub url: String,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

fn default_max_connections() -> u32 {
    DbConfig::DEFAULT_MAX_CONNECTIONS
}

/// Background worker cadence and tuning.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerSection {
    pub finalize_interval_secs: u64,
    pub consumer_interval_secs: u64,
    pub sweep_interval_secs: u64,
    pub finalize_warn_threshold: u32,
    pub prep_horizon_days: u32,
    pub catalog_ttl_secs: u64,
}

impl Default for WorkerSection {
    fn default() -> Self {
        Self {
            finalize_interval_secs: 60,
            consumer_interval_secs: 5,
            sweep_interval_secs: 900,
            finalize_warn_threshold: CoreConfig::DEFAULT_FINALIZE_WARN_THRESHOLD,
            prep_horizon_days: 7,
            catalog_ttl_secs: CoreConfig::DEFAULT_CATALOG_TTL.as_secs(),
        }
    }
}

/// Event publication.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BusSection {
    pub queue_capacity: usize,
    pub publisher_workers: usize,
    pub publish_max_attempts: u32,
    pub publish_backoff_ms: u64,
    pub outbox_batch_size: i64,
}

impl Default for BusSection {
    fn default() -> Self {
        Self {
            queue_capacity: CoreConfig::DEFAULT_QUEUE_CAPACITY,
            publisher_workers: CoreConfig::DEFAULT_PUBLISHER_WORKERS,
            publish_max_attempts: CoreConfig::DEFAULT_PUBLISH_MAX_ATTEMPTS,
            publish_backoff_ms: CoreConfig::DEFAULT_PUBLISH_BACKOFF.as_millis() as u64,
            outbox_batch_size: CoreConfig::DEFAULT_OUTBOX_BATCH_SIZE,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSection {
    pub bind: String,
    pub port: u16,
    pub request_timeout_secs: u64,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1".to_string(),
            port: 8080,
            request_timeout_secs: 30,
        }
    }
}

impl ConfigFile {
    pub fn new(db_url: &str) -> Self {
        Self {
            database: DatabaseSection {
                url: db_url.to_string(),
                max_connections: default_max_connections(),
            },
            worker: WorkerSection::default(),
            bus: BusSection::default(),
            server: ServerSection::default(),
        }
    }
}

// -----------------------------------------------------------------------
// Paths
// -----------------------------------------------------------------------

/// Return the mealplan config directory.
///
/// Always uses XDG layout: `$XDG_CONFIG_HOME/mealplan` or
/// `~/.config/mealplan`, also on macOS.
pub fn config_dir() -> PathBuf {
    if let Ok(xdg) = std::env::var("XDG_CONFIG_HOME") {
        return PathBuf::from(xdg).join("mealplan");
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".config")
        .join("mealplan")
}

/// Return the path to the mealplan config file.
pub fn config_path() -> PathBuf {
    config_dir().join("config.toml")
}

// -----------------------------------------------------------------------
// Read / write
// -----------------------------------------------------------------------

/// Load and parse a config file. Returns an error if it does not exist.
pub fn load_config_from(path: &Path) -> Result<ConfigFile> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config file at {}", path.display()))?;
    toml::from_str(&contents)
        .with_context(|| format!("failed to parse config file at {}", path.display()))
}

/// Serialize and write a config file, creating parent dirs as needed.
/// Sets file permissions to 0600 on Unix.
pub fn save_config_to(path: &Path, config: &ConfigFile) -> Result<()> {
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("failed to create config directory {}", dir.display()))?;
    }

    let contents = toml::to_string_pretty(config).context("failed to serialize config")?;
    std::fs::write(path, &contents)
        .with_context(|| format!("failed to write config file at {}", path.display()))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let perms = std::fs::Permissions::from_mode(0o600);
        std::fs::set_permissions(path, perms)
            .with_context(|| format!("failed to set permissions on {}", path.display()))?;
    }

    Ok(())
}

// -----------------------------------------------------------------------
// Resolved config
// -----------------------------------------------------------------------

/// Fully resolved configuration, ready for use.
#[derive(Debug, Clone)]
pub struct MealplanConfig {
    pub db_config: DbConfig,
    pub core_config: CoreConfig,
    pub worker: WorkerSection,
    pub server: ServerSection,
}

impl MealplanConfig {
    /// Resolve against the default config file location.
    pub fn resolve(cli_db_url: Option<&str>) -> Result<Self> {
        let path = config_path();
        let file = if path.exists() {
            Some(load_config_from(&path)?)
        } else {
            None
        };
        Ok(Self::resolve_with(cli_db_url, file))
    }

    /// Resolve using the chain: CLI flag > env var > config file > default.
    ///
    /// Only the database URL has a flag and an env var
    /// (`MEALPLAN_DATABASE_URL`); everything else comes from the file or
    /// the defaults.
    pub fn resolve_with(cli_db_url: Option<&str>, file: Option<ConfigFile>) -> Self {
        let db_url = if let Some(url) = cli_db_url {
            url.to_string()
        } else if let Ok(url) = std::env::var("MEALPLAN_DATABASE_URL") {
            url
        } else if let Some(ref cfg) = file {
            cfg.database.url.clone()
        } else {
            DbConfig::DEFAULT_URL.to_string()
        };

        let file = file.unwrap_or_else(|| ConfigFile::new(&db_url));
        let db_config = DbConfig::new(db_url).with_max_connections(file.database.max_connections);

        let core_config = CoreConfig {
            queue_capacity: file.bus.queue_capacity,
            publisher_workers: file.bus.publisher_workers,
            publish_max_attempts: file.bus.publish_max_attempts,
            publish_backoff: Duration::from_millis(file.bus.publish_backoff_ms),
            catalog_ttl: Duration::from_secs(file.worker.catalog_ttl_secs),
            finalize_warn_threshold: file.worker.finalize_warn_threshold,
            outbox_batch_size: file.bus.outbox_batch_size,
            prep_horizon: Duration::from_secs(u64::from(file.worker.prep_horizon_days) * 24 * 60 * 60),
        };

        Self {
            db_config,
            core_config,
            worker: file.worker,
            server: file.server,
        }
    }
}

// -----------------------------------------------------------------------
// Tests
// -----------------------------------------------------------------------
