//! Test databases for the mealplan integration tests.
//!
//! One PostgreSQL server is shared per test binary and every test gets a
//! fresh, fully migrated database on it. The server is `MEALPLAN_TEST_PG_URL`
//! when set (a CI service or a local install, without a database path),
//! otherwise a `postgres:17` container started on first use.

pub mod seed;

use sqlx::PgPool;
use testcontainers::runners::AsyncRunner;
use testcontainers::{ContainerAsync, ImageExt};
use testcontainers_modules::postgres::Postgres;
use tokio::sync::OnceCell;
use uuid::Uuid;

use mealplan_db::config::DbConfig;
use mealplan_db::pool;

/// Pool size for one test database. Finalize races and worker tests need a
/// few concurrent connections, nothing close to the service default.
const TEST_MAX_CONNECTIONS: u32 = 8;

struct TestServer {
    base_url: String,
    /// Keeps the container running; `None` for an external server.
    _container: Option<ContainerAsync<Postgres>>,
}

impl TestServer {
    async fn start() -> Self {
        if let Ok(url) = std::env::var("MEALPLAN_TEST_PG_URL") {
            return Self {
                base_url: url.trim_end_matches('/').to_owned(),
                _container: None,
            };
        }

        let container = Postgres::default()
            .with_tag("17")
            .start()
            .await
            .expect("failed to start PostgreSQL container");
        let host = container.get_host().await.expect("container host");
        let port = container
            .get_host_port_ipv4(5432)
            .await
            .expect("container port");

        Self {
            base_url: format!("postgresql://postgres:postgres@{host}:{port}"),
            _container: Some(container),
        }
    }

    fn config(&self, db_name: &str) -> DbConfig {
        DbConfig::new(format!("{}/{db_name}", self.base_url))
            .with_max_connections(TEST_MAX_CONNECTIONS)
    }

    async fn maintenance(&self) -> PgPool {
        pool::connect_maintenance(&self.config("postgres").database_url)
            .await
            .expect("maintenance connection")
    }
}

static SERVER: OnceCell<TestServer> = OnceCell::const_new();

async fn server() -> &'static TestServer {
    SERVER.get_or_init(TestServer::start).await
}

/// Create a migrated database with a unique name.
///
/// Returns `(pool, db_name)`; pass `db_name` to [`drop_test_db`] after
/// closing the pool.
pub async fn create_test_db() -> (PgPool, String) {
    let server = server().await;
    let db_name = format!("mealplan_test_{}", Uuid::new_v4().simple());

    let maint = server.maintenance().await;
    pool::create_database(&maint, &db_name)
        .await
        .unwrap_or_else(|e| panic!("{e:#}"));
    maint.close().await;

    let db = pool::create_pool(&server.config(&db_name))
        .await
        .unwrap_or_else(|e| panic!("{e:#}"));
    pool::run_migrations(&db)
        .await
        .unwrap_or_else(|e| panic!("{e:#}"));

    (db, db_name)
}

/// Drop a database made by [`create_test_db`]. Cleanup failures are
/// ignored so they never mask the test's own result.
pub async fn drop_test_db(db_name: &str) {
    let maint = server().await.maintenance().await;
    let _ = pool::drop_database(&maint, db_name).await;
    maint.close().await;
}
