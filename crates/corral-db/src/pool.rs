//! Connection management for the task/worker store.
//!
//! The pool connects lazily, so [`connect`] pings the store up front and
//! turns a bad URL or unreachable host into a loud startup failure
//! instead of a mid-cycle surprise. Setup helpers (database creation,
//! migrations) use short-lived single connections; the pool is for the
//! control loop.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use sqlx::postgres::PgPoolOptions;
use sqlx::{Connection, PgConnection, PgPool};

use crate::config::DbConfig;
use crate::retry::with_retries;

/// One control loop plus the log-sink flusher need very little
/// concurrency.
const MAX_CONNECTIONS: u32 = 5;

/// How long to wait for a free connection before treating the store as
/// down.
const ACQUIRE_TIMEOUT: Duration = Duration::from_secs(10);

/// Connect to the store and verify the connection actually works.
///
/// The ping goes through the adapter's usual transient-retry policy, so
/// a store that is briefly unreachable at boot gets a few seconds of
/// grace before the process gives up.
pub async fn connect(config: &DbConfig) -> Result<PgPool> {
    let pool = PgPoolOptions::new()
        .max_connections(MAX_CONNECTIONS)
        .acquire_timeout(ACQUIRE_TIMEOUT)
        .connect_lazy(&config.database_url)
        .context("invalid store connection URL")?;

    let ping = pool.clone();
    with_retries("startup_ping", move || {
        let ping = ping.clone();
        async move { sqlx::query_scalar::<_, i32>("SELECT 1").fetch_one(&ping).await }
    })
    .await
    .with_context(|| format!("store at {} is not reachable", config.database_url))?;

    Ok(pool)
}

/// Apply any pending migrations from `dir`.
///
/// The migration set is loaded at runtime, so compiling the binary never
/// needs a live database.
pub async fn run_migrations(pool: &PgPool, dir: &Path) -> Result<()> {
    let migrator = sqlx::migrate::Migrator::new(dir)
        .await
        .with_context(|| format!("failed to load migrations from {}", dir.display()))?;

    let total = migrator.iter().count();
    migrator.run(pool).await.context("migration run failed")?;

    tracing::info!(migrations = total, "store schema is up to date");
    Ok(())
}

/// The migrations shipped with this crate.
pub fn migrations_dir() -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("migrations")
}

/// Create the target database when it does not exist yet.
///
/// Managed deployments arrive with the database already provisioned and
/// never reach the CREATE; local setups go through the `postgres`
/// maintenance database on the same host.
pub async fn create_database_if_missing(config: &DbConfig) -> Result<()> {
    let Some(db_name) = config.database_name() else {
        bail!(
            "cannot determine database name from {}",
            config.database_url
        );
    };
    // CREATE DATABASE cannot take a bind parameter; refuse names that
    // would need quoting instead of trying to escape them.
    if !db_name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_')
    {
        bail!("refusing to create database with unsafe name {db_name:?}");
    }

    let mut conn = PgConnection::connect(&config.maintenance_url())
        .await
        .context("failed to reach the maintenance database")?;

    let exists: bool =
        sqlx::query_scalar("SELECT EXISTS (SELECT 1 FROM pg_database WHERE datname = $1)")
            .bind(db_name)
            .fetch_one(&mut conn)
            .await
            .context("failed to look up pg_database")?;

    if !exists {
        sqlx::raw_sql(&format!("CREATE DATABASE {db_name}"))
            .execute(&mut conn)
            .await
            .with_context(|| format!("CREATE DATABASE {db_name} failed"))?;
        tracing::info!(db = db_name, "created store database");
    }

    conn.close().await.ok();
    Ok(())
}

/// Row counts for the tables this system owns. Shown by `corral db-init`
/// so a fresh setup ends with something concrete on screen.
#[derive(Debug, Clone, Copy, Default)]
pub struct StoreSummary {
    pub tasks: i64,
    pub workers: i64,
    pub system_logs: i64,
}

pub async fn store_summary(pool: &PgPool) -> Result<StoreSummary> {
    async fn count(pool: &PgPool, table: &str) -> Result<i64> {
        // Table names come from the literals below, never from input.
        let n = sqlx::query_scalar::<_, i64>(&format!("SELECT COUNT(*) FROM {table}"))
            .fetch_one(pool)
            .await
            .with_context(|| format!("failed to count rows in {table}"))?;
        Ok(n)
    }

    Ok(StoreSummary {
        tasks: count(pool, "tasks").await?,
        workers: count(pool, "workers").await?,
        system_logs: count(pool, "system_logs").await?,
    })
}
