//! Adapter functions for the shared log store.
//!
//! Batch submission is deliberately single-shot at this layer: the log
//! sink owns its own retry policy and drop accounting, so a second retry
//! loop here would multiply worst-case submission latency.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::PgPool;
use uuid::Uuid;

use crate::models::{LogLevel, LogSourceType, SystemLog};

/// A log record ready for batch insertion.
#[derive(Debug, Clone, Serialize)]
pub struct NewLogRecord {
    pub timestamp: DateTime<Utc>,
    pub source_type: LogSourceType,
    pub source_id: String,
    pub log_level: LogLevel,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub task_id: Option<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub worker_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cycle_number: Option<i64>,
    pub metadata: serde_json::Value,
}

/// Insert a batch of log records in one round trip. Returns the number of
/// rows inserted.
pub async fn insert_logs_batch(pool: &PgPool, records: &[NewLogRecord]) -> Result<i64> {
    if records.is_empty() {
        return Ok(0);
    }

    let payload = serde_json::to_value(records).context("failed to serialize log batch")?;

    let inserted = sqlx::query_scalar::<_, i64>("SELECT insert_logs_batch($1)")
        .bind(payload)
        .fetch_one(pool)
        .await
        .context("failed to insert log batch")?;

    Ok(inserted)
}

/// Heartbeat plus buffered log records in a single round trip.
///
/// This is the worker runtime's submission path; specified here for
/// completeness of the boundary.
pub async fn heartbeat_with_logs(
    pool: &PgPool,
    worker_id: &str,
    records: &[NewLogRecord],
    vram_total_mb: Option<i64>,
    vram_used_mb: Option<i64>,
) -> Result<i64> {
    let payload = serde_json::to_value(records).context("failed to serialize log batch")?;

    let inserted = sqlx::query_scalar::<_, i64>("SELECT heartbeat_with_logs($1, $2, $3, $4)")
        .bind(worker_id)
        .bind(payload)
        .bind(vram_total_mb)
        .bind(vram_used_mb)
        .fetch_one(pool)
        .await
        .with_context(|| format!("failed heartbeat_with_logs for worker {worker_id}"))?;

    Ok(inserted)
}

/// Delete log records older than the retention window. Returns the number
/// of rows deleted. Invoked out-of-band (CLI `cleanup-logs`).
pub async fn cleanup_old_logs(pool: &PgPool, retention_hours: i32) -> Result<i64> {
    let deleted = sqlx::query_scalar::<_, i64>("SELECT cleanup_old_logs($1)")
        .bind(retention_hours)
        .fetch_one(pool)
        .await
        .context("failed to clean up old logs")?;

    Ok(deleted)
}

/// Check that the batch-insert RPC exists on the connected store.
///
/// The log sink calls this at startup so a missing function fails loudly
/// rather than silently dropping every batch later.
pub async fn logs_rpc_available(pool: &PgPool) -> Result<bool> {
    let available = sqlx::query_scalar::<_, bool>(
        "SELECT to_regprocedure('insert_logs_batch(jsonb)') IS NOT NULL",
    )
    .fetch_one(pool)
    .await
    .context("failed to probe for insert_logs_batch")?;

    Ok(available)
}

/// Most recent log records, newest first. Used by tests and the status
/// command.
pub async fn recent_logs(pool: &PgPool, limit: i64) -> Result<Vec<SystemLog>> {
    let logs = sqlx::query_as::<_, SystemLog>(
        "SELECT * FROM system_logs ORDER BY timestamp DESC, id DESC LIMIT $1",
    )
    .bind(limit)
    .fetch_all(pool)
    .await
    .context("failed to list recent logs")?;

    Ok(logs)
}
