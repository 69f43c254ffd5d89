//! Control loop driver: the time-triggered outer loop.
//!
//! Each cycle runs a fixed sequence: sample demand, fetch the fleet,
//! promote, health-check, recover orphans, plan and execute scaling
//! (valve-gated), drain, summarise. Step order is load-bearing and must
//! not be rearranged. The store is the only source of truth across
//! cycles; the driver carries nothing in memory except the cycle counter
//! and the anomaly-detection state, both of which may be lost on restart
//! without harm.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde::Serialize;
use sqlx::PgPool;
use tokio_util::sync::CancellationToken;

use corral_cloud::{CloudClient, PodSpec};
use corral_db::models::{LogLevel, Task, TaskStatus, Worker, WorkerStatus};
use corral_db::queries::tasks as task_db;
use corral_db::queries::workers as worker_db;

use crate::clock::Clock;
use crate::context::CycleContext;
use crate::error::OrchestratorError;
use crate::lifecycle::{self, DrainOutcome, PromoteOutcome};
use crate::logsink::{LogEvent, LogSink};
use crate::orphan;
use crate::scaling::valve::{self, ValveConfig, ValveState};
use crate::scaling::{self, AnomalyState, IdleWorker, PlanInputs, ScaleDecision};
use crate::settings::Settings;

/// How often (in cycles) the sink health probe and orphan-pod
/// reconciliation run.
const MAINTENANCE_EVERY_CYCLES: u64 = 10;

/// Counts of actions taken during one cycle.
#[derive(Debug, Clone, Copy, Default, Serialize, PartialEq, Eq)]
pub struct CycleActions {
    pub promoted: u32,
    pub failed: u32,
    pub spawned: u32,
    pub terminated: u32,
    pub orphan_tasks_reset: i64,
}

/// Worker counts at planning time.
#[derive(Debug, Clone, Copy, Default, Serialize, PartialEq, Eq)]
pub struct FleetSnapshot {
    pub spawning: u32,
    pub active: u32,
    pub terminating: u32,
}

/// Everything one cycle did, produced at step 9 and written to the log
/// sink before being dropped.
#[derive(Debug, Clone, Serialize)]
pub struct CycleSummary {
    pub cycle_number: u64,
    pub started_at: DateTime<Utc>,
    pub queued_only: i64,
    pub active_only: i64,
    pub workload: i64,
    pub fleet: FleetSnapshot,
    pub desired: u32,
    pub capacity: u32,
    pub decision: String,
    pub actions: CycleActions,
    pub valve: Option<String>,
    pub anomalies: Vec<String>,
}

impl fmt::Display for CycleSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "cycle {}: queued={} active={} desired={} capacity={} decision={} \
             (+{} promoted, +{} spawned, -{} terminated, {} failed, {} orphans reset)",
            self.cycle_number,
            self.queued_only,
            self.active_only,
            self.desired,
            self.capacity,
            self.decision,
            self.actions.promoted,
            self.actions.spawned,
            self.actions.terminated,
            self.actions.failed,
            self.actions.orphan_tasks_reset,
        )
    }
}

/// The control loop driver. Owns nothing but the cycle counter and
/// anomaly state; adapters and the sink are injected by `main`.
pub struct Driver {
    pool: PgPool,
    cloud: Arc<dyn CloudClient>,
    clock: Arc<dyn Clock>,
    settings: Settings,
    pod_spec: PodSpec,
    sink: Option<Arc<LogSink>>,
    /// Store logging was requested but could not be started; the driver
    /// reports this periodically on the stderr channel.
    sink_degraded: bool,
    cycle_counter: u64,
    anomaly_state: AnomalyState,
    last_sink_sent: u64,
}

impl Driver {
    pub fn new(
        pool: PgPool,
        cloud: Arc<dyn CloudClient>,
        clock: Arc<dyn Clock>,
        settings: Settings,
        pod_spec: PodSpec,
        sink: Option<Arc<LogSink>>,
    ) -> Self {
        Self {
            pool,
            cloud,
            clock,
            settings,
            pod_spec,
            sink,
            sink_degraded: false,
            cycle_counter: 0,
            anomaly_state: AnomalyState::default(),
            last_sink_sent: 0,
        }
    }

    /// Mark the sink as requested-but-unavailable (degraded mode).
    pub fn set_sink_degraded(&mut self) {
        self.sink_degraded = true;
    }

    pub fn cycles_run(&self) -> u64 {
        self.cycle_counter
    }

    fn emit(&self, event: LogEvent) {
        if let Some(ref sink) = self.sink {
            sink.enqueue(event);
        }
    }

    /// Run one full cycle.
    pub async fn run_cycle(&mut self) -> Result<CycleSummary, OrchestratorError> {
        // Step 1: begin cycle.
        self.cycle_counter += 1;
        let ctx = CycleContext {
            cycle_number: self.cycle_counter,
            started_at: self.clock.now(),
        };
        let mut actions = CycleActions::default();
        tracing::debug!(cycle = ctx.cycle_number, "cycle started");

        // Step 2: sample demand.
        let counts = task_db::count_available_tasks(&self.pool, true)
            .await
            .map_err(OrchestratorError::Store)?;

        // Step 3: fetch the fleet and in-flight tasks.
        let fleet = worker_db::list_fleet(&self.pool)
            .await
            .map_err(OrchestratorError::Store)?;
        let in_progress = task_db::list_tasks_by_status(&self.pool, TaskStatus::InProgress)
            .await
            .map_err(OrchestratorError::Store)?;
        let mut tasks_by_worker: HashMap<String, Vec<Task>> = HashMap::new();
        for task in in_progress {
            if let Some(ref worker_id) = task.worker_id {
                tasks_by_worker
                    .entry(worker_id.clone())
                    .or_default()
                    .push(task);
            }
        }

        let mut newly_dead: Vec<String> = Vec::new();

        // Step 4: promote spawning workers (fan out, join before step 5).
        let spawning: Vec<&Worker> = fleet
            .iter()
            .filter(|w| w.status == WorkerStatus::Spawning)
            .collect();
        let promote_results = join_all(spawning.iter().map(|worker| {
            lifecycle::promote_spawning(
                &self.pool,
                self.cloud.as_ref(),
                self.clock.as_ref(),
                &self.settings,
                worker,
            )
        }))
        .await;

        for (worker, result) in spawning.iter().zip(promote_results) {
            match result {
                Ok(PromoteOutcome::Promoted) => {
                    actions.promoted += 1;
                    self.emit(
                        LogEvent::for_cycle(LogLevel::Info, "worker promoted to active", &ctx)
                            .with_worker(&worker.id),
                    );
                }
                Ok(PromoteOutcome::Pending) => {}
                Ok(PromoteOutcome::Failed { reason }) => {
                    actions.failed += 1;
                    newly_dead.push(worker.id.clone());
                    self.emit(
                        LogEvent::for_cycle(
                            LogLevel::Error,
                            format!("worker failed during spawn: {reason}"),
                            &ctx,
                        )
                        .with_worker(&worker.id),
                    );
                }
                Err(e) => {
                    // Absorbed: this worker is retried next cycle.
                    tracing::error!(worker_id = %worker.id, error = %e, "promotion errored");
                }
            }
        }

        // Step 5: health checks on active workers, then the failsafe over
        // the whole fleet.
        let no_tasks: Vec<Task> = Vec::new();
        let mut condemned: Vec<(&Worker, String)> = Vec::new();
        for worker in fleet.iter().filter(|w| w.status == WorkerStatus::Active) {
            let worker_tasks = tasks_by_worker.get(&worker.id).unwrap_or(&no_tasks);
            if let Some(reason) = lifecycle::health_verdict(
                self.clock.as_ref(),
                &self.settings,
                worker,
                worker_tasks,
                counts.queued_only,
            ) {
                condemned.push((worker, reason));
            }
        }
        for worker in &fleet {
            if condemned.iter().any(|(w, _)| w.id == worker.id) {
                continue;
            }
            if let Some(reason) =
                lifecycle::failsafe_verdict(self.clock.as_ref(), &self.settings, worker)
            {
                condemned.push((worker, reason));
            }
        }

        let fail_results = join_all(condemned.iter().map(|(worker, reason)| {
            lifecycle::fail_worker(
                &self.pool,
                self.cloud.as_ref(),
                self.clock.as_ref(),
                worker,
                reason,
            )
        }))
        .await;

        for ((worker, reason), result) in condemned.iter().zip(fail_results) {
            match result {
                Ok(()) => {
                    actions.failed += 1;
                    newly_dead.push(worker.id.clone());
                    self.emit(
                        LogEvent::for_cycle(
                            LogLevel::Error,
                            format!("worker failed health check: {reason}"),
                            &ctx,
                        )
                        .with_worker(&worker.id),
                    );
                }
                Err(e) => {
                    tracing::error!(worker_id = %worker.id, error = %e, "error path failed");
                }
            }
        }

        // Step 6: orphan recovery for workers that died in steps 4-5.
        actions.orphan_tasks_reset = orphan::recover_tasks(&self.pool, &newly_dead)
            .await
            .map_err(OrchestratorError::Store)?;
        if actions.orphan_tasks_reset > 0 {
            self.emit(LogEvent::for_cycle(
                LogLevel::Warning,
                format!("reset {} orphaned tasks", actions.orphan_tasks_reset),
                &ctx,
            ));
        }

        // Step 7: scaling plan, valve-gated spawn, drain marking.
        let now = self.clock.now();
        let fleet_counts = worker_db::fleet_counts(&self.pool)
            .await
            .map_err(OrchestratorError::Store)?;
        let active_workers = worker_db::list_workers(&self.pool, &[WorkerStatus::Active])
            .await
            .map_err(OrchestratorError::Store)?;
        let idle_active: Vec<IdleWorker> = active_workers
            .iter()
            .filter(|w| {
                tasks_by_worker
                    .get(&w.id)
                    .map_or(true, |tasks| tasks.is_empty())
            })
            .filter_map(|w| {
                let idle_since = w.metadata.promoted_to_active_at.unwrap_or(w.created_at);
                (now - idle_since >= self.settings.worker_grace_period).then(|| IdleWorker {
                    worker_id: w.id.clone(),
                    idle_since,
                })
            })
            .collect();

        let snapshot = FleetSnapshot {
            spawning: fleet_counts.spawning as u32,
            active: fleet_counts.active as u32,
            terminating: fleet_counts.terminating as u32,
        };
        let plan = scaling::plan(&PlanInputs {
            queued_only: counts.queued_only,
            active_only: counts.active_only,
            spawning_count: snapshot.spawning,
            active_count: snapshot.active,
            idle_active,
            min_fleet: self.settings.min_fleet,
            max_fleet: self.settings.max_fleet,
            tasks_per_worker: self.settings.tasks_per_worker,
            machines_to_keep_idle: self.settings.machines_to_keep_idle,
        });

        let mut valve_note = None;
        match plan.decision {
            ScaleDecision::ScaleUp { spawn } => {
                let recent = worker_db::list_workers_created_since(
                    &self.pool,
                    now - self.settings.failure_window,
                )
                .await
                .map_err(OrchestratorError::Store)?;
                let valve_state = valve::evaluate(
                    &ValveConfig {
                        window: self.settings.failure_window,
                        min_samples: self.settings.min_workers_for_rate_check,
                        threshold: self.settings.max_failure_rate,
                    },
                    &recent,
                    now,
                );

                if let ValveState::Closed { .. } = valve_state {
                    let note = valve_state.describe();
                    tracing::warn!(cycle = ctx.cycle_number, "{note}; rejecting {spawn} spawn intents");
                    self.emit(
                        LogEvent::for_cycle(
                            LogLevel::Warning,
                            format!("{note}; rejecting {spawn} spawn intents"),
                            &ctx,
                        ),
                    );
                    valve_note = Some(note);
                } else {
                    for _ in 0..spawn {
                        match lifecycle::spawn_worker(
                            &self.pool,
                            self.cloud.as_ref(),
                            self.clock.as_ref(),
                            &self.pod_spec,
                        )
                        .await
                        {
                            Ok(spawned) => {
                                actions.spawned += 1;
                                self.emit(
                                    LogEvent::for_cycle(LogLevel::Info, "worker spawned", &ctx)
                                        .with_worker(&spawned.worker_id),
                                );
                            }
                            Err(e) => {
                                actions.failed += 1;
                                tracing::error!(error = %e, "spawn failed");
                                self.emit(LogEvent::for_cycle(
                                    LogLevel::Error,
                                    format!("spawn failed: {e:#}"),
                                    &ctx,
                                ));
                            }
                        }
                    }
                }
            }
            ScaleDecision::ScaleDown { ref drain } => {
                for worker_id in drain {
                    match lifecycle::mark_for_drain(&self.pool, self.clock.as_ref(), worker_id)
                        .await
                    {
                        Ok(()) => {
                            self.emit(
                                LogEvent::for_cycle(
                                    LogLevel::Info,
                                    "worker marked for graceful drain",
                                    &ctx,
                                )
                                .with_worker(worker_id),
                            );
                        }
                        Err(e) => {
                            tracing::error!(worker_id = %worker_id, error = %e, "drain marking failed");
                        }
                    }
                }
            }
            ScaleDecision::Maintain => {}
        }

        // Step 8: drive terminating workers through drain. Only workers
        // that were already terminating at the start of the cycle: one
        // just marked in step 7 gets its first full drain window next
        // cycle.
        let terminating: Vec<&Worker> = fleet
            .iter()
            .filter(|w| w.status == WorkerStatus::Terminating)
            .collect();
        if !terminating.is_empty() {
            let in_flight: HashMap<String, i64> = worker_db::in_progress_counts_by_worker(&self.pool)
                .await
                .map_err(OrchestratorError::Store)?
                .into_iter()
                .collect();
            for worker in &terminating {
                let count = in_flight.get(&worker.id).copied().unwrap_or(0);
                match lifecycle::drain_terminating(
                    &self.pool,
                    self.cloud.as_ref(),
                    self.clock.as_ref(),
                    &self.settings,
                    worker,
                    count,
                )
                .await
                {
                    Ok(DrainOutcome::Terminated) => {
                        actions.terminated += 1;
                        self.emit(
                            LogEvent::for_cycle(LogLevel::Info, "worker terminated", &ctx)
                                .with_worker(&worker.id),
                        );
                    }
                    Ok(DrainOutcome::Draining) => {}
                    Err(e) => {
                        tracing::error!(worker_id = %worker.id, error = %e, "drain step failed");
                    }
                }
            }
        }

        // Step 9: cycle summary, the non-filterable scaling line, and
        // anomaly checks.
        let anomalies = scaling::detect_anomalies(
            &mut self.anomaly_state,
            plan.workload,
            counts.queued_only,
            snapshot.active,
            actions.spawned,
        );
        for anomaly in &anomalies {
            let text = anomaly.describe();
            tracing::warn!(cycle = ctx.cycle_number, "anomaly: {text}");
            self.emit(LogEvent::for_cycle(
                LogLevel::Warning,
                format!("anomaly: {text}"),
                &ctx,
            ));
        }

        let summary = CycleSummary {
            cycle_number: ctx.cycle_number,
            started_at: ctx.started_at,
            queued_only: counts.queued_only,
            active_only: counts.active_only,
            workload: plan.workload,
            fleet: snapshot,
            desired: plan.desired,
            capacity: plan.capacity,
            decision: plan.decision.name().to_owned(),
            actions,
            valve: valve_note,
            anomalies: anomalies.iter().map(|a| a.describe()).collect(),
        };

        // The scaling tuple stays visible even when the sink is degraded:
        // CRITICAL (unfilterable) in the store, mirrored on stderr.
        tracing::info!(
            cycle = summary.cycle_number,
            queued = summary.queued_only,
            active = summary.active_only,
            desired = summary.desired,
            capacity = summary.capacity,
            decision = %summary.decision,
            "scaling decision"
        );
        self.emit(
            LogEvent::for_cycle(
                LogLevel::Critical,
                format!(
                    "scaling decision: queued={} active={} desired={} capacity={} decision={}",
                    summary.queued_only,
                    summary.active_only,
                    summary.desired,
                    summary.capacity,
                    summary.decision
                ),
                &ctx,
            )
            .with_metadata(serde_json::to_value(&summary).unwrap_or_default()),
        );

        // Step 10: periodic maintenance off the hot path.
        if ctx.cycle_number % MAINTENANCE_EVERY_CYCLES == 0 {
            self.probe_sink_health(&ctx).await;
            match orphan::reconcile_pods(&self.pool, self.cloud.as_ref(), &self.settings).await {
                Ok(0) => {}
                Ok(n) => {
                    self.emit(LogEvent::for_cycle(
                        LogLevel::Warning,
                        format!("terminated {n} orphan pods"),
                        &ctx,
                    ));
                }
                Err(e) => {
                    tracing::warn!(error = %e, "orphan pod reconciliation failed");
                }
            }
        }

        // Step 11: the cycle context dies with this scope.
        Ok(summary)
    }

    /// Verify the sink is alive and making progress; attempt one restart,
    /// then fall back to the stderr channel (always available).
    async fn probe_sink_health(&mut self, ctx: &CycleContext) {
        let Some(sink) = self.sink.clone() else {
            if self.sink_degraded {
                crate::logsink::record_failure(
                    &crate::logsink::default_failure_log_path(),
                    "ERROR",
                    &format!(
                        "logging degraded: store log sink unavailable (cycle {})",
                        ctx.cycle_number
                    ),
                );
            }
            return;
        };

        let stats = sink.stats();
        let advanced = stats.sent > self.last_sink_sent;
        let healthy = stats.alive && (advanced || stats.queued == 0);
        self.last_sink_sent = stats.sent;
        if healthy {
            return;
        }

        tracing::warn!(
            alive = stats.alive,
            queued = stats.queued,
            sent = stats.sent,
            "log sink unhealthy, attempting restart"
        );
        if let Err(e) = sink.start().await {
            tracing::error!(error = %e, "log sink restart failed; store logging degraded");
        }
    }

    /// Run cycles forever, one per poll interval. A failed cycle is
    /// logged and abandoned; the next starts fresh after the interval.
    pub async fn run_continuous(&mut self, cancel: CancellationToken) {
        let mut interval = tokio::time::interval(self.settings.poll_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::info!("shutdown requested, stopping control loop");
                    return;
                }
                _ = interval.tick() => {}
            }

            match self.run_cycle().await {
                Ok(summary) => {
                    tracing::info!(cycle = summary.cycle_number, "{summary}");
                }
                Err(e) => {
                    // Exhaustive on purpose: new variants must decide their
                    // cycle-failure handling here.
                    match &e {
                        OrchestratorError::Store(source) => {
                            tracing::error!(error = %source, "cycle abandoned: store failure");
                        }
                        OrchestratorError::Cloud(source) => {
                            tracing::error!(error = %source, "cycle abandoned: cloud failure");
                        }
                        OrchestratorError::ConfigInvalid(detail) => {
                            tracing::error!(detail = %detail, "cycle abandoned: configuration");
                        }
                        OrchestratorError::Logging(detail) => {
                            tracing::error!(detail = %detail, "cycle abandoned: log sink");
                        }
                    }
                    self.emit(LogEvent::new(
                        LogLevel::Error,
                        format!("cycle failed: {e:#}"),
                    ));
                }
            }
        }
    }
}
