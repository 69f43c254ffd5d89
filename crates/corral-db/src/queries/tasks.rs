//! Adapter functions over the store's task RPC surface.
//!
//! Demand sampling, claims, completion/failure accounting, and orphan
//! recovery all go through SQL functions (see `migrations/0002_rpc.sql`)
//! so the locking story lives store-side. Transient errors retry here;
//! callers only ever see retry-exhausted failures.

use anyhow::{Context, Result};
use serde_json::Value;
use sqlx::PgPool;
use uuid::Uuid;

use crate::models::{Task, TaskCounts, TaskStatus};
use crate::retry::with_retries;

/// Sample current demand through the store's pre-filtered counter.
///
/// The counter honours per-user concurrency caps and excludes rows lacking
/// the tenancy column. `include_active_claims` controls whether `total`
/// counts work already claimed by workers.
pub async fn count_available_tasks(
    pool: &PgPool,
    include_active_claims: bool,
) -> Result<TaskCounts> {
    let p = pool.clone();
    let (queued_only, active_only): (i64, i64) = with_retries("task_counts", move || {
        let p = p.clone();
        async move {
            sqlx::query_as("SELECT queued_only, active_only FROM task_counts()")
                .fetch_one(&p)
                .await
        }
    })
    .await?;

    let total = if include_active_claims {
        queued_only + active_only
    } else {
        queued_only
    };

    Ok(TaskCounts {
        queued_only,
        active_only,
        total,
    })
}

/// Atomically claim the oldest eligible queued task for a worker.
///
/// Returns `None` when the queue is empty or the worker is not eligible to
/// claim (anything other than `active`, in particular `terminating`).
pub async fn claim_task(pool: &PgPool, worker_id: &str) -> Result<Option<Task>> {
    let p = pool.clone();
    let worker_id = worker_id.to_owned();
    let task = with_retries("claim_task", move || {
        let p = p.clone();
        let worker_id = worker_id.clone();
        async move {
            sqlx::query_as::<_, Task>("SELECT * FROM claim_task($1)")
                .bind(worker_id)
                .fetch_optional(&p)
                .await
        }
    })
    .await?;

    Ok(task)
}

/// Mark an in-progress task complete. Returns `false` if the task was not
/// in progress (already finished, or reset by orphan recovery).
pub async fn mark_task_complete(
    pool: &PgPool,
    task_id: Uuid,
    result: Option<Value>,
) -> Result<bool> {
    let p = pool.clone();
    let done = with_retries("mark_task_complete", move || {
        let p = p.clone();
        let result = result.clone();
        async move {
            sqlx::query_scalar::<_, bool>("SELECT mark_task_complete($1, $2)")
                .bind(task_id)
                .bind(result)
                .fetch_one(&p)
                .await
        }
    })
    .await?;

    Ok(done)
}

/// Mark an in-progress task failed: increments attempts and returns the
/// task to the queue, or parks it in `failed` once attempts reach 3.
pub async fn mark_task_failed(pool: &PgPool, task_id: Uuid, error: &str) -> Result<bool> {
    let p = pool.clone();
    let error = error.to_owned();
    let done = with_retries("mark_task_failed", move || {
        let p = p.clone();
        let error = error.clone();
        async move {
            sqlx::query_scalar::<_, bool>("SELECT mark_task_failed($1, $2)")
                .bind(task_id)
                .bind(error)
                .fetch_one(&p)
                .await
        }
    })
    .await?;

    Ok(done)
}

/// Return in-flight tasks of dead workers to the queue with attempt
/// accounting. Parent (orchestrator-typed) tasks and tasks at the attempt
/// cap are never touched. Returns the number of tasks reset.
pub async fn reset_orphaned_tasks(pool: &PgPool, worker_ids: &[String]) -> Result<i64> {
    if worker_ids.is_empty() {
        return Ok(0);
    }

    let p = pool.clone();
    let ids = worker_ids.to_vec();
    let count = with_retries("reset_orphaned_tasks", move || {
        let p = p.clone();
        let ids = ids.clone();
        async move {
            sqlx::query_scalar::<_, i64>("SELECT reset_orphaned_tasks($1)")
                .bind(ids)
                .fetch_one(&p)
                .await
        }
    })
    .await?;

    Ok(count)
}

/// Fetch a single task by ID.
pub async fn get_task(pool: &PgPool, id: Uuid) -> Result<Option<Task>> {
    let task = sqlx::query_as::<_, Task>("SELECT * FROM tasks WHERE id = $1")
        .bind(id)
        .fetch_optional(pool)
        .await
        .context("failed to fetch task")?;

    Ok(task)
}

/// List all tasks currently in a given status, oldest first.
pub async fn list_tasks_by_status(pool: &PgPool, status: TaskStatus) -> Result<Vec<Task>> {
    let p = pool.clone();
    let tasks = with_retries("list_tasks_by_status", move || {
        let p = p.clone();
        async move {
            sqlx::query_as::<_, Task>(
                "SELECT * FROM tasks WHERE status = $1 ORDER BY created_at ASC",
            )
            .bind(status)
            .fetch_all(&p)
            .await
        }
    })
    .await?;

    Ok(tasks)
}

/// Insert a task row directly. The task service normally owns creation;
/// this exists for seeding tools and tests.
pub async fn insert_task(
    pool: &PgPool,
    task_type: &str,
    params: Value,
    user_id: Option<Uuid>,
) -> Result<Task> {
    let task = sqlx::query_as::<_, Task>(
        "INSERT INTO tasks (task_type, params, user_id) \
         VALUES ($1, $2, $3) \
         RETURNING *",
    )
    .bind(task_type)
    .bind(params)
    .bind(user_id)
    .fetch_one(pool)
    .await
    .context("failed to insert task")?;

    Ok(task)
}
