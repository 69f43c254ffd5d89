//! Adapter functions for the `workers` table.
//!
//! Worker rows are written exclusively by the orchestrator except for
//! `last_heartbeat` and the VRAM metadata fields, which the worker runtime
//! owns. Status changes use optimistic locking (the UPDATE's WHERE clause
//! pins the expected current status); 0 rows affected means the row moved
//! underneath us and the caller must re-read.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::PgPool;

use crate::models::{Worker, WorkerMetadata, WorkerStatus};
use crate::retry::with_retries;

/// Insert a new worker row with status `spawning`.
///
/// Registration happens **before** the cloud call, so the primary key on
/// `id` (which doubles as the requested pod name) prevents duplicate pods.
pub async fn register_worker(
    pool: &PgPool,
    id: &str,
    instance_type: Option<&str>,
    metadata: &WorkerMetadata,
) -> Result<Worker> {
    let meta = serde_json::to_value(metadata).context("failed to serialize worker metadata")?;

    let worker = sqlx::query_as::<_, Worker>(
        "INSERT INTO workers (id, instance_type, status, metadata) \
         VALUES ($1, $2, 'spawning', $3) \
         RETURNING *",
    )
    .bind(id)
    .bind(instance_type)
    .bind(meta)
    .fetch_one(pool)
    .await
    .with_context(|| format!("failed to register worker {id}"))?;

    Ok(worker)
}

/// Fetch a single worker by ID.
pub async fn get_worker(pool: &PgPool, id: &str) -> Result<Option<Worker>> {
    let worker = sqlx::query_as::<_, Worker>("SELECT * FROM workers WHERE id = $1")
        .bind(id)
        .fetch_optional(pool)
        .await
        .with_context(|| format!("failed to fetch worker {id}"))?;

    Ok(worker)
}

/// List workers in any of the given statuses, oldest first.
pub async fn list_workers(pool: &PgPool, statuses: &[WorkerStatus]) -> Result<Vec<Worker>> {
    let status_strings: Vec<String> = statuses.iter().map(|s| s.to_string()).collect();

    let p = pool.clone();
    let workers = with_retries("list_workers", move || {
        let p = p.clone();
        let statuses = status_strings.clone();
        async move {
            sqlx::query_as::<_, Worker>(
                "SELECT * FROM workers WHERE status = ANY($1) ORDER BY created_at ASC",
            )
            .bind(statuses)
            .fetch_all(&p)
            .await
        }
    })
    .await?;

    Ok(workers)
}

/// List the fleet: every worker in a non-terminal status.
pub async fn list_fleet(pool: &PgPool) -> Result<Vec<Worker>> {
    list_workers(
        pool,
        &[
            WorkerStatus::Spawning,
            WorkerStatus::Active,
            WorkerStatus::Terminating,
        ],
    )
    .await
}

/// List workers created at or after the given instant, regardless of
/// status. This is the failure-rate window projection.
pub async fn list_workers_created_since(
    pool: &PgPool,
    since: DateTime<Utc>,
) -> Result<Vec<Worker>> {
    let p = pool.clone();
    let workers = with_retries("list_workers_created_since", move || {
        let p = p.clone();
        async move {
            sqlx::query_as::<_, Worker>(
                "SELECT * FROM workers WHERE created_at >= $1 ORDER BY created_at ASC",
            )
            .bind(since)
            .fetch_all(&p)
            .await
        }
    })
    .await?;

    Ok(workers)
}

/// Atomically transition a worker's status, merging a metadata patch in the
/// same statement.
///
/// Optimistic locking: the row is only updated when its current status
/// matches `from`. Returns the number of rows affected (0 means the status
/// did not match or the worker does not exist).
pub async fn transition_worker_status(
    pool: &PgPool,
    id: &str,
    from: WorkerStatus,
    to: WorkerStatus,
    metadata_patch: Value,
) -> Result<u64> {
    let p = pool.clone();
    let id = id.to_owned();
    let result = with_retries("transition_worker_status", move || {
        let p = p.clone();
        let id = id.clone();
        let patch = metadata_patch.clone();
        async move {
            sqlx::query(
                "UPDATE workers \
                 SET status = $1, metadata = metadata || $2 \
                 WHERE id = $3 AND status = $4",
            )
            .bind(to)
            .bind(patch)
            .bind(id)
            .bind(from)
            .execute(&p)
            .await
        }
    })
    .await?;

    Ok(result.rows_affected())
}

/// Merge a metadata patch into a worker row without touching its status.
pub async fn merge_worker_metadata(pool: &PgPool, id: &str, patch: Value) -> Result<u64> {
    let p = pool.clone();
    let id = id.to_owned();
    let result = with_retries("merge_worker_metadata", move || {
        let p = p.clone();
        let id = id.clone();
        let patch = patch.clone();
        async move {
            sqlx::query("UPDATE workers SET metadata = metadata || $1 WHERE id = $2")
                .bind(patch)
                .bind(id)
                .execute(&p)
                .await
        }
    })
    .await?;

    Ok(result.rows_affected())
}

/// Worker counts by status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FleetCounts {
    pub spawning: i64,
    pub active: i64,
    pub terminating: i64,
    pub terminated: i64,
    pub error: i64,
    pub total: i64,
}

impl FleetCounts {
    /// Capacity as the planner sees it: workers that are or will be able to
    /// take work. Terminating workers are excluded.
    pub fn capacity(&self) -> i64 {
        self.active + self.spawning
    }
}

/// Get worker counts grouped by status.
pub async fn fleet_counts(pool: &PgPool) -> Result<FleetCounts> {
    let p = pool.clone();
    let rows: Vec<(String, i64)> = with_retries("fleet_counts", move || {
        let p = p.clone();
        async move {
            sqlx::query_as("SELECT status::text, COUNT(*) FROM workers GROUP BY status")
                .fetch_all(&p)
                .await
        }
    })
    .await?;

    let mut counts = FleetCounts::default();
    for (status, count) in &rows {
        match status.as_str() {
            "spawning" => counts.spawning = *count,
            "active" => counts.active = *count,
            "terminating" => counts.terminating = *count,
            "terminated" => counts.terminated = *count,
            "error" => counts.error = *count,
            _ => {}
        }
        counts.total += count;
    }
    Ok(counts)
}

/// Count of in-progress tasks per worker, for idle detection and the
/// stuck-task scan. Workers with no in-flight tasks are absent.
pub async fn in_progress_counts_by_worker(pool: &PgPool) -> Result<Vec<(String, i64)>> {
    let p = pool.clone();
    let rows: Vec<(String, i64)> = with_retries("in_progress_counts_by_worker", move || {
        let p = p.clone();
        async move {
            sqlx::query_as(
                "SELECT worker_id, COUNT(*) FROM tasks \
                 WHERE status = 'in_progress' AND worker_id IS NOT NULL \
                 GROUP BY worker_id",
            )
            .fetch_all(&p)
            .await
        }
    })
    .await?;

    Ok(rows)
}

/// Record a heartbeat for a worker, optionally with VRAM telemetry.
///
/// Invoked by the worker runtime, not by the orchestrator; specified here
/// for completeness of the boundary. Returns `false` for unknown workers.
pub async fn update_worker_heartbeat(
    pool: &PgPool,
    id: &str,
    vram_total_mb: Option<i64>,
    vram_used_mb: Option<i64>,
) -> Result<bool> {
    let found = sqlx::query_scalar::<_, bool>("SELECT update_worker_heartbeat($1, $2, $3)")
        .bind(id)
        .bind(vram_total_mb)
        .bind(vram_used_mb)
        .fetch_one(pool)
        .await
        .with_context(|| format!("failed to update heartbeat for worker {id}"))?;

    Ok(found)
}
