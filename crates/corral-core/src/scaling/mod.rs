//! Scaling planner: compute the desired worker count from demand and emit
//! spawn / terminate intents.
//!
//! The planner is a pure function of its inputs. The driver fetches the
//! snapshot, the planner decides, the lifecycle manager executes, and the
//! safety valve (`valve`) gates the spawn side.

pub mod valve;

use chrono::{DateTime, Utc};

/// An active worker eligible for scale-down: no in-flight task and past
/// its grace period. `idle_since` ranks candidates (oldest first).
#[derive(Debug, Clone)]
pub struct IdleWorker {
    pub worker_id: String,
    pub idle_since: DateTime<Utc>,
}

/// Everything the planner looks at for one cycle.
#[derive(Debug, Clone)]
pub struct PlanInputs {
    pub queued_only: i64,
    pub active_only: i64,
    pub spawning_count: u32,
    pub active_count: u32,
    pub idle_active: Vec<IdleWorker>,
    pub min_fleet: u32,
    pub max_fleet: u32,
    pub tasks_per_worker: u32,
    pub machines_to_keep_idle: u32,
}

/// What the planner decided.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScaleDecision {
    Maintain,
    ScaleUp { spawn: u32 },
    ScaleDown { drain: Vec<String> },
}

impl ScaleDecision {
    /// Short name for logs and the cycle summary.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Maintain => "maintain",
            Self::ScaleUp { .. } => "scale_up",
            Self::ScaleDown { .. } => "scale_down",
        }
    }
}

/// The plan for one cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScalePlan {
    pub workload: i64,
    pub desired: u32,
    pub capacity: u32,
    pub decision: ScaleDecision,
}

/// Desired worker count for a given workload.
pub fn compute_desired(
    workload: i64,
    min_fleet: u32,
    max_fleet: u32,
    tasks_per_worker: u32,
    machines_to_keep_idle: u32,
) -> u32 {
    let ideal = if workload > 0 {
        (workload as u64).div_ceil(tasks_per_worker as u64) as u32
    } else {
        0
    };
    (ideal + machines_to_keep_idle)
        .max(min_fleet)
        .min(max_fleet)
}

/// Compute the scaling plan for one cycle.
///
/// Capacity counts active and spawning workers; terminating workers are
/// already on their way out. Scale-down only ever touches idle workers,
/// oldest-idle first, and never takes the active count below the minimum
/// fleet size.
pub fn plan(inputs: &PlanInputs) -> ScalePlan {
    let workload = inputs.queued_only + inputs.active_only;
    let desired = compute_desired(
        workload,
        inputs.min_fleet,
        inputs.max_fleet,
        inputs.tasks_per_worker,
        inputs.machines_to_keep_idle,
    );
    let capacity = inputs.active_count + inputs.spawning_count;

    let decision = if desired > capacity {
        ScaleDecision::ScaleUp {
            spawn: desired - capacity,
        }
    } else if desired < capacity && inputs.active_count > inputs.min_fleet {
        let above_min = inputs.active_count - inputs.min_fleet;
        let surplus = (capacity - desired)
            .min(above_min)
            .min(inputs.idle_active.len() as u32);
        if surplus == 0 {
            ScaleDecision::Maintain
        } else {
            let mut candidates = inputs.idle_active.clone();
            candidates.sort_by_key(|w| w.idle_since);
            ScaleDecision::ScaleDown {
                drain: candidates
                    .into_iter()
                    .take(surplus as usize)
                    .map(|w| w.worker_id)
                    .collect(),
            }
        }
    } else {
        ScaleDecision::Maintain
    };

    ScalePlan {
        workload,
        desired,
        capacity,
        decision,
    }
}

// ---------------------------------------------------------------------------
// Anomaly detection
// ---------------------------------------------------------------------------

/// Observational anomalies emitted into the log sink; they never change
/// the plan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Anomaly {
    /// Three or more spawn intents in a single cycle.
    RapidScaleUp { spawned: u32 },
    /// Workload grew tenfold (or appeared from zero).
    WorkloadSpike { previous: i64, current: i64 },
    /// Queued work with zero active workers for several consecutive cycles.
    PersistentQueueZeroWorkers { cycles: u32 },
}

impl Anomaly {
    pub fn describe(&self) -> String {
        match self {
            Self::RapidScaleUp { spawned } => {
                format!("rapid scale-up: {spawned} spawn intents in one cycle")
            }
            Self::WorkloadSpike { previous, current } => {
                format!("workload spike: {previous} -> {current}")
            }
            Self::PersistentQueueZeroWorkers { cycles } => {
                format!("queued work with zero active workers for {cycles} cycles")
            }
        }
    }
}

/// Cross-cycle memory for anomaly detection. Losing it on restart is
/// harmless.
#[derive(Debug, Clone, Default)]
pub struct AnomalyState {
    pub previous_workload: Option<i64>,
    pub zero_worker_streak: u32,
}

/// Run the anomaly checks for one cycle and update the rolling state.
pub fn detect_anomalies(
    state: &mut AnomalyState,
    workload: i64,
    queued_only: i64,
    active_count: u32,
    spawn_intents: u32,
) -> Vec<Anomaly> {
    let mut anomalies = Vec::new();

    if spawn_intents >= 3 {
        anomalies.push(Anomaly::RapidScaleUp {
            spawned: spawn_intents,
        });
    }

    if let Some(previous) = state.previous_workload {
        let spiked = if previous == 0 {
            workload >= 10
        } else {
            workload >= previous * 10
        };
        if spiked {
            anomalies.push(Anomaly::WorkloadSpike {
                previous,
                current: workload,
            });
        }
    }
    state.previous_workload = Some(workload);

    if queued_only > 0 && active_count == 0 {
        state.zero_worker_streak += 1;
        if state.zero_worker_streak >= 3 {
            anomalies.push(Anomaly::PersistentQueueZeroWorkers {
                cycles: state.zero_worker_streak,
            });
        }
    } else {
        state.zero_worker_streak = 0;
    }

    anomalies
}
