//! Failure-rate safety valve.
//!
//! Looks at workers created inside the rolling window and blocks new
//! spawns when recent terminations dominate. The valve reopens by itself
//! as failures age out; it never touches existing workers.

use chrono::{DateTime, Duration, Utc};

use corral_db::models::{Worker, WorkerStatus};

/// Valve thresholds, taken from settings.
#[derive(Debug, Clone, Copy)]
pub struct ValveConfig {
    pub window: Duration,
    pub min_samples: usize,
    pub threshold: f64,
}

/// Valve verdict for one cycle.
#[derive(Debug, Clone, PartialEq)]
pub enum ValveState {
    /// Spawns allowed.
    Open { recent: usize, failed: usize },
    /// Spawn intents are rejected this cycle.
    Closed {
        recent: usize,
        failed: usize,
        ratio: f64,
    },
}

impl ValveState {
    pub fn is_closed(&self) -> bool {
        matches!(self, Self::Closed { .. })
    }

    pub fn describe(&self) -> String {
        match self {
            Self::Open { recent, failed } => {
                format!("valve open ({failed}/{recent} recent failures)")
            }
            Self::Closed {
                recent,
                failed,
                ratio,
            } => format!(
                "valve closed: {failed}/{recent} recent workers failed ({ratio:.2})"
            ),
        }
    }
}

/// Whether a worker in the window counts as a failure.
///
/// `error` always does. `terminated` counts unless it was a graceful
/// scale-down -- recognised by the pre-termination `draining` marker and
/// the absence of an error reason. Workers without the marker count as
/// failures; that is conservative, and acceptable because the valve only
/// blocks new spawns.
fn is_failure(worker: &Worker) -> bool {
    match worker.status {
        WorkerStatus::Error => true,
        WorkerStatus::Terminated => {
            let graceful = worker.metadata.orchestrator_status.as_deref() == Some("draining")
                && worker.metadata.error_reason.is_none();
            !graceful
        }
        _ => false,
    }
}

/// Evaluate the valve over the failure-rate window.
///
/// `workers` is expected to be the `created_at >= now - window`
/// projection; rows outside the window are ignored defensively so callers
/// can pass a broader list.
pub fn evaluate(config: &ValveConfig, workers: &[Worker], now: DateTime<Utc>) -> ValveState {
    let cutoff = now - config.window;
    let recent: Vec<&Worker> = workers.iter().filter(|w| w.created_at >= cutoff).collect();
    let failed = recent.iter().filter(|w| is_failure(w)).count();

    if recent.len() < config.min_samples {
        return ValveState::Open {
            recent: recent.len(),
            failed,
        };
    }

    let ratio = failed as f64 / recent.len() as f64;
    if ratio >= config.threshold {
        ValveState::Closed {
            recent: recent.len(),
            failed,
            ratio,
        }
    } else {
        ValveState::Open {
            recent: recent.len(),
            failed,
        }
    }
}
