//! Integration-test backing store.
//!
//! All tests in a binary share one PostgreSQL server; each test creates a
//! private, fully migrated database inside it through [`TestDb`]. The
//! server is either an external one named by `CORRAL_TEST_PG_URL` (CI
//! starts a single container up front) or a testcontainers instance
//! owned by this process.

use std::sync::atomic::{AtomicU32, Ordering};

use sqlx::{Connection, PgConnection, PgPool};
use testcontainers::ContainerAsync;
use testcontainers::ImageExt;
use testcontainers::runners::AsyncRunner;
use testcontainers_modules::postgres::Postgres;
use tokio::sync::OnceCell;

use corral_db::config::DbConfig;
use corral_db::pool;

/// How test databases are backed.
enum Backing {
    /// Server URL supplied by the environment.
    External(String),
    /// Container owned by this process; held so it stays alive for the
    /// rest of the binary.
    Container {
        base_url: String,
        _container: ContainerAsync<Postgres>,
    },
}

impl Backing {
    fn base_url(&self) -> &str {
        match self {
            Self::External(url) => url,
            Self::Container { base_url, .. } => base_url,
        }
    }
}

static BACKING: OnceCell<Backing> = OnceCell::const_new();

/// Monotonic suffix for database names within this process.
static NEXT_DB: AtomicU32 = AtomicU32::new(0);

async fn backing() -> &'static Backing {
    BACKING
        .get_or_init(|| async {
            if let Ok(url) = std::env::var("CORRAL_TEST_PG_URL") {
                return Backing::External(url);
            }

            let container = Postgres::default()
                .with_tag("18")
                .start()
                .await
                .expect("failed to start PostgreSQL container");
            let host = container.get_host().await.expect("container host");
            let port = container
                .get_host_port_ipv4(5432)
                .await
                .expect("container port mapping");

            Backing::Container {
                base_url: format!("postgresql://postgres:postgres@{host}:{port}"),
                _container: container,
            }
        })
        .await
}

async fn maintenance_conn(base_url: &str) -> PgConnection {
    PgConnection::connect(&format!("{base_url}/postgres"))
        .await
        .expect("failed to reach maintenance database")
}

/// A private, migrated database for one test.
///
/// Create with [`TestDb::create`], run queries through `pool`, and call
/// [`TestDb::teardown`] at the end of the test to drop the database
/// again.
pub struct TestDb {
    pub pool: PgPool,
    name: String,
}

impl TestDb {
    pub async fn create() -> Self {
        let base_url = backing().await.base_url();
        // Process id + counter keeps names unique across parallel test
        // binaries sharing an external server.
        let name = format!(
            "corral_it_{}_{}",
            std::process::id(),
            NEXT_DB.fetch_add(1, Ordering::Relaxed)
        );

        let mut maint = maintenance_conn(base_url).await;
        sqlx::raw_sql(&format!("CREATE DATABASE {name}"))
            .execute(&mut maint)
            .await
            .unwrap_or_else(|e| panic!("failed to create {name}: {e}"));
        maint.close().await.ok();

        let pool = pool::connect(&DbConfig::new(format!("{base_url}/{name}")))
            .await
            .expect("failed to connect to test database");
        pool::run_migrations(&pool, &pool::migrations_dir())
            .await
            .expect("migrations should apply cleanly");

        Self { pool, name }
    }

    /// Close the pool and drop the database.
    ///
    /// Skipping this is harmless when the container dies with the
    /// process, but it keeps long CI runs against an external server
    /// tidy.
    pub async fn teardown(self) {
        self.pool.close().await;

        let base_url = backing().await.base_url();
        let Ok(mut maint) = PgConnection::connect(&format!("{base_url}/postgres")).await else {
            return;
        };
        let kick = format!(
            "SELECT pg_terminate_backend(pid) FROM pg_stat_activity \
             WHERE datname = '{}' AND pid <> pg_backend_pid()",
            self.name
        );
        let _ = sqlx::raw_sql(&kick).execute(&mut maint).await;
        let _ = sqlx::raw_sql(&format!("DROP DATABASE IF EXISTS {}", self.name))
            .execute(&mut maint)
            .await;
        maint.close().await.ok();
    }
}
