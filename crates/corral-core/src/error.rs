//! The orchestrator error taxonomy.
//!
//! Per-worker errors are absorbed inside the lifecycle manager; per-cycle
//! errors are absorbed by the driver; only startup configuration and
//! required-logging failures propagate out of the process.

use corral_cloud::CloudError;

#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    /// A store operation failed after the adapter's own retries.
    #[error("store error: {0}")]
    Store(#[source] anyhow::Error),

    /// A cloud API call failed at cycle scope (per-worker cloud failures
    /// are absorbed in the lifecycle manager instead).
    #[error(transparent)]
    Cloud(#[from] CloudError),

    /// Bad or missing configuration. Fatal at startup.
    #[error("invalid configuration: {0}")]
    ConfigInvalid(String),

    /// The log sink could not be started or has failed. Fatal iff
    /// `DB_LOGGING_REQUIRED` is set.
    #[error("log sink failure: {0}")]
    Logging(String),
}

impl OrchestratorError {
    /// Whether this error must abort the process rather than the cycle.
    pub fn is_fatal_at_startup(&self) -> bool {
        matches!(self, Self::ConfigInvalid(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_carries_context() {
        let err = OrchestratorError::Store(anyhow::anyhow!("connection refused"));
        assert!(err.to_string().contains("store error"));

        let err = OrchestratorError::ConfigInvalid("MIN_ACTIVE_GPUS is not a number".into());
        assert!(err.is_fatal_at_startup());
        assert!(err.to_string().contains("MIN_ACTIVE_GPUS"));
    }

    #[test]
    fn cloud_errors_convert() {
        let err: OrchestratorError = CloudError::quota("no capacity").into();
        assert!(!err.is_fatal_at_startup());
        assert!(err.to_string().contains("no capacity"));
    }
}
