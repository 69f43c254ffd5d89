//! The submission seam for the log sink.

use anyhow::{Result, bail};
use async_trait::async_trait;
use sqlx::PgPool;

use corral_db::queries::logs::{self, NewLogRecord};

/// Where flushed batches go. The production implementation writes to the
/// shared log store; tests install fakes.
#[async_trait]
pub trait LogWriter: Send + Sync {
    /// Startup check: confirm the transport is usable. Failures here must
    /// be loud (see [`super::LogSink::start`]).
    async fn verify(&self) -> Result<()>;

    /// Submit one batch. Retried by the sink; implementations should not
    /// retry internally.
    async fn write_batch(&self, records: &[NewLogRecord]) -> Result<()>;
}

/// Store-backed writer over the `insert_logs_batch` RPC.
pub struct StoreLogWriter {
    pool: PgPool,
}

impl StoreLogWriter {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl LogWriter for StoreLogWriter {
    async fn verify(&self) -> Result<()> {
        if !logs::logs_rpc_available(&self.pool).await? {
            bail!("store is reachable but the insert_logs_batch RPC is missing");
        }
        Ok(())
    }

    async fn write_batch(&self, records: &[NewLogRecord]) -> Result<()> {
        logs::insert_logs_batch(&self.pool, records).await?;
        Ok(())
    }
}
