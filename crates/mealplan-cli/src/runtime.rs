//! Wires the planning core to PostgreSQL for the long-running commands.

use std::sync::Arc;

use anyhow::Result;
use sqlx::PgPool;

use mealplan_core::bus::{OutboxConsumer, PgOutboxPublisher, QueuedPublisher};
use mealplan_core::catalog::{CachedCatalog, PgCatalog};
use mealplan_core::store::PgPlanStore;
use mealplan_core::{PlanningCore, SystemClock};
use mealplan_db::pool;

use crate::config::MealplanConfig;

/// A connected core plus the pieces that need an orderly shutdown.
pub struct Runtime {
    pub pool: PgPool,
    pub core: Arc<PlanningCore>,
    queue: Arc<QueuedPublisher>,
}

impl Runtime {
    /// Connect, then build the core over the outbox publisher and the
    /// cached reference-data catalog.
    pub async fn start(config: &MealplanConfig) -> Result<Self> {
        let pool = pool::create_pool(&config.db_config).await?;
        Ok(Self::with_pool(pool, config))
    }

    pub fn with_pool(pool: PgPool, config: &MealplanConfig) -> Self {
        let core_config = config.core_config.clone();
        let outbox = Arc::new(PgOutboxPublisher::new(pool.clone()));
        let queue = Arc::new(QueuedPublisher::spawn(outbox, &core_config));
        let catalog = Arc::new(CachedCatalog::new(
            Arc::new(PgCatalog::new(pool.clone())),
            core_config.catalog_ttl,
        ));

        let core = Arc::new(PlanningCore::new(
            Arc::new(PgPlanStore::new(pool.clone())),
            queue.clone(),
            Arc::new(SystemClock),
            catalog,
            core_config,
        ));

        Self { pool, core, queue }
    }

    /// An outbox consumer feeding the core's artifact generators.
    pub fn outbox_consumer(&self) -> OutboxConsumer {
        OutboxConsumer::new(
            self.pool.clone(),
            self.core.handlers(),
            self.core.config().outbox_batch_size,
        )
    }

    /// Drain queued events, then close the pool.
    pub async fn shutdown(self) {
        self.queue.shutdown().await;
        self.pool.close().await;
    }
}
