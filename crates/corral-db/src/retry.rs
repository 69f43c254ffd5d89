//! Capped-backoff retry for transient store errors.
//!
//! Transient failures (connection I/O, pool timeouts) are retried inside
//! the adapter so callers only see errors after retry exhaustion. The
//! overall budget stays well under one control-loop interval: 3 attempts
//! with 100 ms doubling to a 1 s cap is at most ~1.3 s of waiting.

use std::future::Future;
use std::time::Duration;

use anyhow::{Context, Result};

/// Maximum number of attempts (initial call + retries).
pub const MAX_ATTEMPTS: u32 = 3;

/// Initial backoff delay.
pub const INITIAL_BACKOFF: Duration = Duration::from_millis(100);

/// Backoff cap.
pub const MAX_BACKOFF: Duration = Duration::from_secs(1);

/// Whether a sqlx error is worth retrying.
///
/// Only infrastructure-level failures qualify; database errors (constraint
/// violations, bad SQL) are deterministic and surface immediately.
pub fn is_transient(err: &sqlx::Error) -> bool {
    matches!(
        err,
        sqlx::Error::Io(_) | sqlx::Error::PoolTimedOut | sqlx::Error::WorkerCrashed
    )
}

/// Run `op`, retrying transient sqlx errors with capped exponential backoff.
///
/// `op_name` labels log lines and the final error context.
pub async fn with_retries<T, F, Fut>(op_name: &str, op: F) -> Result<T>
where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<T, sqlx::Error>>,
{
    let mut backoff = INITIAL_BACKOFF;
    let mut attempt = 1u32;

    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) if is_transient(&err) && attempt < MAX_ATTEMPTS => {
                tracing::warn!(
                    op = op_name,
                    attempt = attempt,
                    error = %err,
                    "transient store error, retrying in {:?}",
                    backoff
                );
                tokio::time::sleep(backoff).await;
                backoff = (backoff * 2).min(MAX_BACKOFF);
                attempt += 1;
            }
            Err(err) => {
                return Err(err).with_context(|| {
                    format!("store operation {op_name} failed after {attempt} attempt(s)")
                });
            }
        }
    }
}
