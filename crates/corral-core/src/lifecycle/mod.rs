//! Worker lifecycle manager: spawn, promote, health-check, drain,
//! terminate.
//!
//! State machine:
//!
//! ```text
//! spawning -> active        (pod RUNNING, readiness probe passes)
//! spawning -> error         (provision failure / spawning timeout)
//! active   -> error         (health check failure)
//! active   -> terminating   (marked for drain)
//! terminating -> terminated (drained, or grace expired)
//! terminating -> error      (health check failure)
//! error    -> terminated    (cloud terminate completed)
//! ```
//!
//! Health decisions are pure functions of `(worker, tasks, clock)` so they
//! can be tested without a store. Heartbeat freshness is the sole liveness
//! signal after promotion; SSH is used for the initial readiness probe
//! only.

use anyhow::{Context, Result, bail};
use chrono::{DateTime, Utc};
use rand::Rng;
use serde_json::json;
use sqlx::PgPool;

use corral_cloud::{CloudClient, PodReadiness, PodSpec, PodState};
use corral_db::models::{Task, Worker, WorkerStatus};
use corral_db::queries::workers as worker_db;

use crate::clock::Clock;
use crate::settings::Settings;

/// The worker state machine: allowed edges plus optimistic-locking
/// execution against the store.
pub struct WorkerStateMachine;

impl WorkerStateMachine {
    /// Check whether a transition is a valid edge in the state graph.
    pub fn is_valid_transition(from: WorkerStatus, to: WorkerStatus) -> bool {
        matches!(
            (from, to),
            (WorkerStatus::Spawning, WorkerStatus::Active)
                | (WorkerStatus::Spawning, WorkerStatus::Error)
                | (WorkerStatus::Active, WorkerStatus::Error)
                | (WorkerStatus::Active, WorkerStatus::Terminating)
                | (WorkerStatus::Terminating, WorkerStatus::Terminated)
                | (WorkerStatus::Terminating, WorkerStatus::Error)
                | (WorkerStatus::Error, WorkerStatus::Terminated)
        )
    }

    /// Execute a transition with optimistic locking, merging `patch` into
    /// the metadata bag in the same statement.
    pub async fn transition(
        pool: &PgPool,
        worker_id: &str,
        from: WorkerStatus,
        to: WorkerStatus,
        patch: serde_json::Value,
    ) -> Result<()> {
        if !Self::is_valid_transition(from, to) {
            bail!(
                "invalid state transition: {} -> {} for worker {}",
                from,
                to,
                worker_id
            );
        }

        let rows = worker_db::transition_worker_status(pool, worker_id, from, to, patch).await?;
        if rows == 0 {
            let worker = worker_db::get_worker(pool, worker_id).await?;
            match worker {
                None => bail!("worker {} not found", worker_id),
                Some(w) => bail!(
                    "optimistic lock failed: worker {} has status {}, expected {}",
                    worker_id,
                    w.status,
                    from
                ),
            }
        }
        Ok(())
    }
}

/// Generate a globally unique worker id. The id doubles as the pod name,
/// so the primary key on registration prevents duplicate pods.
pub fn generate_worker_id(clock: &dyn Clock) -> String {
    let suffix: [u8; 3] = rand::rng().random();
    format!(
        "gpu-{}-{}",
        clock.now().format("%Y%m%d-%H%M%S"),
        hex::encode(suffix)
    )
}

/// A successfully spawned worker.
#[derive(Debug, Clone)]
pub struct SpawnedWorker {
    pub worker_id: String,
    pub cloud_id: String,
}

/// Spawn one worker: register the row first (optimistic registration),
/// then ask the cloud for a pod named after it.
///
/// If registration fails, no cloud call is made. If the cloud call fails,
/// the row goes through the error path and the failure is returned.
pub async fn spawn_worker(
    pool: &PgPool,
    cloud: &dyn CloudClient,
    clock: &dyn Clock,
    spec: &PodSpec,
) -> Result<SpawnedWorker> {
    let worker_id = generate_worker_id(clock);

    let mut metadata = corral_db::models::WorkerMetadata {
        orchestrator_status: Some("spawning".to_owned()),
        ..Default::default()
    };
    if let Some(ref volume) = spec.network_volume_name {
        metadata
            .extra
            .insert("storage_volume".to_owned(), json!(volume));
    }

    worker_db::register_worker(
        pool,
        &worker_id,
        Some(&spec.gpu_type_display_name),
        &metadata,
    )
    .await
    .with_context(|| format!("failed to register worker {worker_id}, aborting spawn"))?;

    let created = match cloud.create_pod(&worker_id, spec).await {
        Ok(created) => created,
        Err(e) => {
            let reason = format!("Pod creation failed: {e}");
            // No pod exists, so the error path has nothing to terminate.
            mark_error_then_terminated(pool, clock, &worker_id, WorkerStatus::Spawning, &reason)
                .await?;
            return Err(e).with_context(|| format!("failed to create pod for {worker_id}"));
        }
    };

    worker_db::merge_worker_metadata(
        pool,
        &worker_id,
        json!({
            "runpod_id": created.cloud_id,
            "pod_details": { "initial_state": created.initial_state.to_string() },
            "ready": false,
        }),
    )
    .await?;

    tracing::info!(
        worker_id = %worker_id,
        cloud_id = %created.cloud_id,
        "worker spawned"
    );

    Ok(SpawnedWorker {
        worker_id,
        cloud_id: created.cloud_id,
    })
}

/// Outcome of one promotion attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PromoteOutcome {
    /// The worker is now active (or already was: re-promotion is a no-op).
    Promoted,
    /// Still provisioning; try again next cycle.
    Pending,
    /// The worker went to the error path.
    Failed { reason: String },
}

/// Drive one spawning worker towards `active`.
pub async fn promote_spawning(
    pool: &PgPool,
    cloud: &dyn CloudClient,
    clock: &dyn Clock,
    settings: &Settings,
    worker: &Worker,
) -> Result<PromoteOutcome> {
    match worker.status {
        WorkerStatus::Spawning => {}
        // Re-promoting an already-active worker is a no-op.
        WorkerStatus::Active => return Ok(PromoteOutcome::Promoted),
        other => bail!("cannot promote worker {} in status {}", worker.id, other),
    }

    let now = clock.now();
    let timed_out = now - worker.created_at > settings.spawning_timeout;

    let Some(runpod_id) = worker.metadata.runpod_id.clone() else {
        // Registered but the pod create never landed (crash between the
        // two steps). Nothing to probe; time out eventually.
        if timed_out {
            let reason = "Spawning timeout".to_owned();
            fail_worker(pool, cloud, clock, worker, &reason).await?;
            return Ok(PromoteOutcome::Failed { reason });
        }
        return Ok(PromoteOutcome::Pending);
    };

    let state = match cloud.get_pod_state(&runpod_id).await {
        Ok(state) => state,
        Err(e) if e.is_not_found() => {
            let reason = "Pod failed to provision".to_owned();
            fail_worker(pool, cloud, clock, worker, &reason).await?;
            return Ok(PromoteOutcome::Failed { reason });
        }
        Err(e) => {
            tracing::warn!(worker_id = %worker.id, error = %e, "pod state query failed");
            if timed_out {
                let reason = "Spawning timeout".to_owned();
                fail_worker(pool, cloud, clock, worker, &reason).await?;
                return Ok(PromoteOutcome::Failed { reason });
            }
            return Ok(PromoteOutcome::Pending);
        }
    };

    if state.desired_status.is_dead() {
        let reason = "Pod failed to provision".to_owned();
        fail_worker(pool, cloud, clock, worker, &reason).await?;
        return Ok(PromoteOutcome::Failed { reason });
    }

    if timed_out {
        let reason = "Spawning timeout".to_owned();
        fail_worker(pool, cloud, clock, worker, &reason).await?;
        return Ok(PromoteOutcome::Failed { reason });
    }

    if !state.ssh_reachable() {
        return Ok(PromoteOutcome::Pending);
    }

    match cloud.initialize_pod(&runpod_id).await {
        Ok(PodReadiness::Ready) => {
            WorkerStateMachine::transition(
                pool,
                &worker.id,
                WorkerStatus::Spawning,
                WorkerStatus::Active,
                promotion_patch(&state, now),
            )
            .await?;
            tracing::info!(worker_id = %worker.id, "worker promoted to active");
            Ok(PromoteOutcome::Promoted)
        }
        Ok(PodReadiness::NotReady) => Ok(PromoteOutcome::Pending),
        Ok(PodReadiness::Failed(detail)) => {
            let reason = format!("Pod initialization failed: {detail}");
            fail_worker(pool, cloud, clock, worker, &reason).await?;
            Ok(PromoteOutcome::Failed { reason })
        }
        Err(e) => {
            tracing::warn!(worker_id = %worker.id, error = %e, "readiness probe errored");
            Ok(PromoteOutcome::Pending)
        }
    }
}

fn promotion_patch(state: &PodState, now: DateTime<Utc>) -> serde_json::Value {
    json!({
        "ready": true,
        "promoted_to_active_at": now,
        "orchestrator_status": "active",
        "ssh_details": {
            "host": state.ip,
            "port": state.ssh_port,
            "username": "root",
            "password": state.ssh_password,
        },
        "pod_details": {
            "actual_status": state.actual_status,
            "uptime_seconds": state.uptime_seconds,
            "hourly_cost": state.hourly_cost,
        },
    })
}

/// Health decision for one active worker. Pure: no I/O.
///
/// Heartbeat freshness is the sole liveness signal; SSH probes and network
/// reachability are deliberately not consulted.
pub fn health_verdict(
    clock: &dyn Clock,
    settings: &Settings,
    worker: &Worker,
    in_progress: &[Task],
    queued_only: i64,
) -> Option<String> {
    let now = clock.now();
    let promoted_at = worker
        .metadata
        .promoted_to_active_at
        .unwrap_or(worker.created_at);

    // Freshly promoted workers get a grace period before any verdict.
    if now - promoted_at < settings.worker_grace_period {
        return None;
    }

    // Stuck-task detector.
    for task in in_progress {
        if let Some(started) = task.generation_started_at {
            if now - started > settings.stuck_timeout {
                return Some(format!("Stuck task {}", task.id));
            }
        }
    }

    match worker.last_heartbeat {
        Some(heartbeat) => {
            let age = now - heartbeat;
            if age > settings.idle_timeout && queued_only > 0 {
                return Some(format!(
                    "Heartbeat stale for {}s with {} queued tasks",
                    age.num_seconds(),
                    queued_only
                ));
            }
        }
        None => {
            // Never heartbeated: only a problem once work is assigned.
            if !in_progress.is_empty() && now - promoted_at > settings.idle_timeout {
                return Some(format!(
                    "No heartbeat since promotion with {} assigned tasks",
                    in_progress.len()
                ));
            }
        }
    }

    None
}

/// Failsafe decision: a heartbeat older than the hard threshold condemns
/// the worker regardless of status. Pure: no I/O.
pub fn failsafe_verdict(clock: &dyn Clock, settings: &Settings, worker: &Worker) -> Option<String> {
    if worker.status.is_terminal() {
        return None;
    }
    let heartbeat = worker.last_heartbeat?;
    let age = clock.now() - heartbeat;
    if age > settings.failsafe_stale_threshold {
        Some(format!(
            "Failsafe: heartbeat stale for {}s",
            age.num_seconds()
        ))
    } else {
        None
    }
}

/// The error path: best-effort pod termination, then
/// `-> error -> terminated` with the reason preserved.
///
/// Every worker that enters `error` carries a non-empty
/// `metadata.error_reason`.
pub async fn fail_worker(
    pool: &PgPool,
    cloud: &dyn CloudClient,
    clock: &dyn Clock,
    worker: &Worker,
    reason: &str,
) -> Result<()> {
    debug_assert!(!reason.is_empty(), "error transitions require a reason");

    if let Some(ref runpod_id) = worker.metadata.runpod_id {
        // Best-effort: not-found means the pod is already gone.
        if let Err(e) = cloud.terminate_pod(runpod_id).await {
            tracing::warn!(
                worker_id = %worker.id,
                cloud_id = %runpod_id,
                error = %e,
                "pod termination failed on error path"
            );
        }
    }

    mark_error_then_terminated(pool, clock, &worker.id, worker.status, reason).await
}

async fn mark_error_then_terminated(
    pool: &PgPool,
    clock: &dyn Clock,
    worker_id: &str,
    from: WorkerStatus,
    reason: &str,
) -> Result<()> {
    WorkerStateMachine::transition(
        pool,
        worker_id,
        from,
        WorkerStatus::Error,
        json!({"error_reason": reason, "orchestrator_status": "error", "ready": false}),
    )
    .await?;
    WorkerStateMachine::transition(
        pool,
        worker_id,
        WorkerStatus::Error,
        WorkerStatus::Terminated,
        json!({"terminated_at": clock.now()}),
    )
    .await?;
    tracing::warn!(worker_id = %worker_id, reason = %reason, "worker failed");
    Ok(())
}

/// Mark an active worker for graceful drain. From this point the store
/// refuses it new claims.
pub async fn mark_for_drain(pool: &PgPool, clock: &dyn Clock, worker_id: &str) -> Result<()> {
    WorkerStateMachine::transition(
        pool,
        worker_id,
        WorkerStatus::Active,
        WorkerStatus::Terminating,
        json!({
            "orchestrator_status": "draining",
            "terminating_since": clock.now(),
        }),
    )
    .await?;
    tracing::info!(worker_id = %worker_id, "worker marked for drain");
    Ok(())
}

/// Outcome of one drain step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrainOutcome {
    /// The pod is gone and the row is terminal.
    Terminated,
    /// Still waiting for in-flight work (or for a retryable cloud call).
    Draining,
}

/// Drive one terminating worker towards `terminated`: wait for its
/// in-flight tasks to drain, or force termination once the grace period
/// expires.
pub async fn drain_terminating(
    pool: &PgPool,
    cloud: &dyn CloudClient,
    clock: &dyn Clock,
    settings: &Settings,
    worker: &Worker,
    in_progress_count: i64,
) -> Result<DrainOutcome> {
    let now = clock.now();
    let since = worker
        .metadata
        .terminating_since
        .unwrap_or(worker.created_at);
    let grace_expired = now - since > settings.graceful_shutdown_timeout;

    if in_progress_count > 0 && !grace_expired {
        return Ok(DrainOutcome::Draining);
    }

    if let Some(ref runpod_id) = worker.metadata.runpod_id {
        if let Err(e) = cloud.terminate_pod(runpod_id).await {
            // Leave the row terminating; the next cycle retries.
            tracing::warn!(
                worker_id = %worker.id,
                error = %e,
                "pod termination failed during drain, will retry"
            );
            return Ok(DrainOutcome::Draining);
        }
    }

    WorkerStateMachine::transition(
        pool,
        &worker.id,
        WorkerStatus::Terminating,
        WorkerStatus::Terminated,
        json!({"terminated_at": now, "ready": false}),
    )
    .await?;

    tracing::info!(
        worker_id = %worker.id,
        forced = grace_expired && in_progress_count > 0,
        "worker terminated"
    );
    Ok(DrainOutcome::Terminated)
}
