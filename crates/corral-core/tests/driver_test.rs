//! End-to-end control loop scenarios against a scripted fake cloud and a
//! real store.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde_json::json;
use sqlx::PgPool;
use uuid::Uuid;

use corral_cloud::{
    CloudClient, CloudError, CreatedPod, DesiredStatus, PodReadiness, PodSpec, PodState,
    PodSummary, TerminateOutcome,
};
use corral_core::clock::{Clock, ManualClock};
use corral_core::driver::Driver;
use corral_core::settings::Settings;
use corral_db::models::{TaskStatus, WorkerMetadata, WorkerStatus};
use corral_db::queries::tasks as task_db;
use corral_db::queries::workers as worker_db;
use corral_test_utils::TestDb;

// ===========================================================================
// Scripted fake cloud
// ===========================================================================

#[derive(Debug, Clone)]
struct FakePod {
    name: String,
    desired: DesiredStatus,
    ssh_up: bool,
    readiness: PodReadiness,
    uptime_seconds: u64,
}

#[derive(Default)]
struct FakeCloud {
    pods: Mutex<HashMap<String, FakePod>>,
}

impl FakeCloud {
    fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn make_all_ready(&self) {
        for pod in self.pods.lock().unwrap().values_mut() {
            pod.desired = DesiredStatus::Running;
            pod.ssh_up = true;
            pod.readiness = PodReadiness::Ready;
        }
    }

    fn pod_count(&self) -> usize {
        self.pods.lock().unwrap().len()
    }
}

#[async_trait]
impl CloudClient for FakeCloud {
    async fn create_pod(&self, worker_id: &str, _spec: &PodSpec) -> Result<CreatedPod, CloudError> {
        let cloud_id = format!("pod-{worker_id}");
        self.pods.lock().unwrap().insert(
            cloud_id.clone(),
            FakePod {
                name: worker_id.to_owned(),
                desired: DesiredStatus::Provisioning,
                ssh_up: false,
                readiness: PodReadiness::NotReady,
                uptime_seconds: 0,
            },
        );
        Ok(CreatedPod {
            cloud_id,
            initial_state: DesiredStatus::Provisioning,
        })
    }

    async fn terminate_pod(&self, cloud_id: &str) -> Result<TerminateOutcome, CloudError> {
        match self.pods.lock().unwrap().remove(cloud_id) {
            Some(_) => Ok(TerminateOutcome::Terminated),
            None => Ok(TerminateOutcome::NotFound),
        }
    }

    async fn get_pod_state(&self, cloud_id: &str) -> Result<PodState, CloudError> {
        let pods = self.pods.lock().unwrap();
        let pod = pods
            .get(cloud_id)
            .ok_or_else(|| CloudError::not_found(format!("pod {cloud_id} does not exist")))?;
        Ok(PodState {
            desired_status: pod.desired,
            actual_status: Some(pod.desired.to_string()),
            ip: pod.ssh_up.then(|| "203.0.113.20".to_owned()),
            ssh_port: pod.ssh_up.then_some(22022),
            ssh_password: None,
            uptime_seconds: pod.uptime_seconds,
            hourly_cost: Some(0.79),
        })
    }

    async fn list_pods(&self) -> Result<Vec<PodSummary>, CloudError> {
        Ok(self
            .pods
            .lock()
            .unwrap()
            .iter()
            .map(|(cloud_id, pod)| PodSummary {
                cloud_id: cloud_id.clone(),
                name: pod.name.clone(),
                desired_status: pod.desired,
                uptime_seconds: pod.uptime_seconds,
            })
            .collect())
    }

    async fn initialize_pod(&self, cloud_id: &str) -> Result<PodReadiness, CloudError> {
        let pods = self.pods.lock().unwrap();
        let pod = pods
            .get(cloud_id)
            .ok_or_else(|| CloudError::not_found(format!("pod {cloud_id} does not exist")))?;
        Ok(pod.readiness.clone())
    }

    async fn check_connectivity(&self) -> Result<(), CloudError> {
        Ok(())
    }
}

// ===========================================================================
// Harness
// ===========================================================================

struct TestHarness {
    db: TestDb,
    pool: PgPool,
    cloud: Arc<FakeCloud>,
    clock: ManualClock,
    driver: Driver,
}

impl TestHarness {
    async fn new() -> Self {
        Self::with_settings(|_| None).await
    }

    async fn with_settings(overrides: fn(&str) -> Option<String>) -> Self {
        let db = TestDb::create().await;
        let pool = db.pool.clone();
        let cloud = FakeCloud::new();
        let clock = ManualClock::new(Utc::now());
        let settings = Settings::from_lookup(overrides).unwrap();
        let driver = Driver::new(
            pool.clone(),
            cloud.clone(),
            Arc::new(clock.clone()),
            settings,
            pod_spec(),
            None,
        );
        Self {
            db,
            pool,
            cloud,
            clock,
            driver,
        }
    }

    /// Seed an already-promoted worker with a matching fake pod.
    async fn seed_active_worker(
        &self,
        id: &str,
        promoted_at: DateTime<Utc>,
        heartbeat: Option<DateTime<Utc>>,
    ) {
        worker_db::register_worker(&self.pool, id, Some("NVIDIA A40"), &WorkerMetadata::default())
            .await
            .unwrap();
        let cloud_id = format!("pod-{id}");
        worker_db::transition_worker_status(
            &self.pool,
            id,
            WorkerStatus::Spawning,
            WorkerStatus::Active,
            json!({
                "ready": true,
                "runpod_id": cloud_id,
                "promoted_to_active_at": promoted_at,
                "orchestrator_status": "active",
            }),
        )
        .await
        .unwrap();
        if let Some(hb) = heartbeat {
            sqlx::query("UPDATE workers SET last_heartbeat = $2 WHERE id = $1")
                .bind(id)
                .bind(hb)
                .execute(&self.pool)
                .await
                .unwrap();
        }
        self.cloud.pods.lock().unwrap().insert(
            cloud_id,
            FakePod {
                name: id.to_owned(),
                desired: DesiredStatus::Running,
                ssh_up: true,
                readiness: PodReadiness::Ready,
                uptime_seconds: 3_600,
            },
        );
    }

    async fn queue_tasks(&self, n: usize) -> Vec<Uuid> {
        let user = Uuid::new_v4();
        let mut ids = Vec::with_capacity(n);
        for _ in 0..n {
            let task = task_db::insert_task(&self.pool, "generation", json!({}), Some(user))
                .await
                .unwrap();
            ids.push(task.id);
        }
        ids
    }

    async fn claim_for(&self, task_id: Uuid, worker_id: &str, started_at: DateTime<Utc>) {
        sqlx::query(
            "UPDATE tasks SET status = 'in_progress', worker_id = $2, \
             generation_started_at = $3 WHERE id = $1",
        )
        .bind(task_id)
        .bind(worker_id)
        .bind(started_at)
        .execute(&self.pool)
        .await
        .unwrap();
    }

    async fn status_counts(&self) -> corral_db::queries::workers::FleetCounts {
        worker_db::fleet_counts(&self.pool).await.unwrap()
    }

    async fn teardown(self) {
        self.db.teardown().await;
    }
}

fn pod_spec() -> PodSpec {
    PodSpec {
        gpu_type_display_name: "NVIDIA A40".to_owned(),
        container_image: "registry.example.com/wan-worker:latest".to_owned(),
        container_disk_gb: 20,
        volume_mount_path: "/workspace".to_owned(),
        network_volume_name: Some("shared-models".to_owned()),
        env: HashMap::new(),
        ssh_public_key: "ssh-ed25519 AAAA test".to_owned(),
        ports: vec!["22/tcp".to_owned()],
    }
}

// ===========================================================================
// Scenarios
// ===========================================================================

#[tokio::test]
async fn cold_start_into_steady_load() {
    let mut h = TestHarness::new().await;
    h.queue_tasks(7).await;

    // Cycle 1: desired = ceil(7/3) = 3, capacity 0 -> spawn 3.
    let summary = h.driver.run_cycle().await.unwrap();
    assert_eq!(summary.desired, 3);
    assert_eq!(summary.capacity, 0);
    assert_eq!(summary.decision, "scale_up");
    assert_eq!(summary.actions.spawned, 3);
    assert_eq!(h.cloud.pod_count(), 3);

    // Cycle 2: the three are still provisioning; capacity 3 -> maintain.
    let summary = h.driver.run_cycle().await.unwrap();
    assert_eq!(summary.capacity, 3);
    assert_eq!(summary.decision, "maintain");
    assert_eq!(summary.actions.spawned, 0);
    assert_eq!(summary.actions.promoted, 0);

    // Cycle 3: pods are up and initialised -> promote all three.
    h.cloud.make_all_ready();
    let summary = h.driver.run_cycle().await.unwrap();
    assert_eq!(summary.actions.promoted, 3);
    let counts = h.status_counts().await;
    assert_eq!(counts.active, 3);
    assert_eq!(counts.spawning, 0);

    h.teardown().await;
}

#[tokio::test]
async fn scale_up_capped_by_max_fleet_with_anomaly() {
    let mut h = TestHarness::new().await;
    h.queue_tasks(60).await;

    let summary = h.driver.run_cycle().await.unwrap();
    assert_eq!(summary.desired, 10);
    assert_eq!(summary.actions.spawned, 10);
    assert!(
        summary
            .anomalies
            .iter()
            .any(|a| a.contains("rapid scale-up")),
        "anomalies: {:?}",
        summary.anomalies
    );

    // Invariant: spawning + active never exceeds the max fleet size.
    let counts = h.status_counts().await;
    assert!(counts.spawning + counts.active <= 10);

    // A second cycle must not over-provision.
    let summary = h.driver.run_cycle().await.unwrap();
    assert_eq!(summary.actions.spawned, 0);
    let counts = h.status_counts().await;
    assert!(counts.spawning + counts.active <= 10);

    h.teardown().await;
}

#[tokio::test]
async fn safety_valve_blocks_spawns() {
    let mut h = TestHarness::new().await;
    let now = h.clock.now();

    // Recent history: 6 workers, 5 dead with error reasons.
    for i in 0..5 {
        let id = format!("gpu-20260801-000000-dead{i:02}");
        worker_db::register_worker(&h.pool, &id, None, &WorkerMetadata::default())
            .await
            .unwrap();
        worker_db::transition_worker_status(
            &h.pool,
            &id,
            WorkerStatus::Spawning,
            WorkerStatus::Error,
            json!({"error_reason": "Spawning timeout"}),
        )
        .await
        .unwrap();
        worker_db::transition_worker_status(
            &h.pool,
            &id,
            WorkerStatus::Error,
            WorkerStatus::Terminated,
            json!({"terminated_at": now}),
        )
        .await
        .unwrap();
    }
    h.seed_active_worker("gpu-20260801-000000-alive0", now - Duration::seconds(600), Some(now))
        .await;

    h.queue_tasks(5).await;

    let summary = h.driver.run_cycle().await.unwrap();
    assert_eq!(summary.decision, "scale_up", "planner still wants workers");
    assert_eq!(summary.actions.spawned, 0, "valve rejects the intents");
    let note = summary.valve.expect("valve note recorded");
    assert!(note.contains("valve closed"), "got: {note}");

    // The orchestrator keeps running; the existing worker is untouched.
    let counts = h.status_counts().await;
    assert_eq!(counts.active, 1);

    h.teardown().await;
}

#[tokio::test]
async fn graceful_drain_of_surplus_idle_worker() {
    let mut h = TestHarness::new().await;
    let now = h.clock.now();
    let promoted = now - Duration::seconds(900);

    // Five active workers; four are busy, the oldest one is idle.
    for i in 0..5 {
        let id = format!("gpu-20260801-000001-act{i:03}");
        h.seed_active_worker(&id, promoted + Duration::seconds(i), Some(now)).await;
    }
    let task_ids = h.queue_tasks(4).await;
    for (i, task_id) in task_ids.iter().enumerate() {
        let id = format!("gpu-20260801-000001-act{:03}", i + 1);
        h.claim_for(*task_id, &id, now - Duration::seconds(30)).await;
    }

    // Cycle 1: surplus = 1, the idle (oldest) worker drains.
    let summary = h.driver.run_cycle().await.unwrap();
    assert_eq!(summary.decision, "scale_down");
    let idle = worker_db::get_worker(&h.pool, "gpu-20260801-000001-act000")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(idle.status, WorkerStatus::Terminating);

    // Cycle 2: no in-flight work on it -> terminated; no tasks reset.
    let summary = h.driver.run_cycle().await.unwrap();
    assert_eq!(summary.actions.terminated, 1);
    assert_eq!(summary.actions.orphan_tasks_reset, 0);
    let drained = worker_db::get_worker(&h.pool, "gpu-20260801-000001-act000")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(drained.status, WorkerStatus::Terminated);
    assert!(drained.metadata.error_reason.is_none());

    // Busy workers survive.
    let counts = h.status_counts().await;
    assert_eq!(counts.active, 4);

    h.teardown().await;
}

#[tokio::test]
async fn stuck_task_condemns_worker_and_requeues() {
    let mut h = TestHarness::with_settings(|key| match key {
        // Keep the fleet floor out of the way of this scenario.
        "MIN_ACTIVE_GPUS" => Some("0".to_owned()),
        "TASK_STUCK_TIMEOUT_SEC" => Some("600".to_owned()),
        _ => None,
    })
    .await;
    let now = h.clock.now();

    let worker_id = "gpu-20260801-000002-stuck0";
    h.seed_active_worker(worker_id, now - Duration::seconds(900), Some(now)).await;
    let task_ids = h.queue_tasks(1).await;
    h.claim_for(task_ids[0], worker_id, now - Duration::seconds(700)).await;

    let summary = h.driver.run_cycle().await.unwrap();
    assert_eq!(summary.actions.failed, 1);
    assert_eq!(summary.actions.orphan_tasks_reset, 1);

    let dead = worker_db::get_worker(&h.pool, worker_id).await.unwrap().unwrap();
    assert_eq!(dead.status, WorkerStatus::Terminated);
    let reason = dead.metadata.error_reason.clone().unwrap();
    assert!(reason.contains(&format!("Stuck task {}", task_ids[0])), "got: {reason}");

    let task = task_db::get_task(&h.pool, task_ids[0]).await.unwrap().unwrap();
    assert_eq!(task.status, TaskStatus::Queued);
    assert_eq!(task.attempts, 1);
    assert!(task.worker_id.is_none());

    // The pod is gone too.
    assert_eq!(h.cloud.pod_count(), 0);

    h.teardown().await;
}

#[tokio::test]
async fn stale_heartbeat_with_queue_condemns_worker() {
    let mut h = TestHarness::with_settings(|key| match key {
        "MIN_ACTIVE_GPUS" => Some("0".to_owned()),
        "MAX_ACTIVE_GPUS" => Some("1".to_owned()),
        _ => None,
    })
    .await;
    let now = h.clock.now();

    let worker_id = "gpu-20260801-000003-stale0";
    h.seed_active_worker(
        worker_id,
        now - Duration::seconds(3_600),
        Some(now - Duration::seconds(400)),
    )
    .await;
    h.queue_tasks(2).await;

    let summary = h.driver.run_cycle().await.unwrap();
    assert_eq!(summary.actions.failed, 1);
    let dead = worker_db::get_worker(&h.pool, worker_id).await.unwrap().unwrap();
    assert_eq!(dead.status, WorkerStatus::Terminated);
    assert!(
        dead.metadata
            .error_reason
            .as_deref()
            .unwrap()
            .contains("Heartbeat stale")
    );

    h.teardown().await;
}

#[tokio::test]
async fn idle_quiet_worker_is_left_alone() {
    let mut h = TestHarness::with_settings(|key| match key {
        "MIN_ACTIVE_GPUS" => Some("1".to_owned()),
        _ => None,
    })
    .await;
    let now = h.clock.now();

    // Stale heartbeat, but the queue is empty: no verdict.
    h.seed_active_worker(
        "gpu-20260801-000004-quiet0",
        now - Duration::seconds(3_600),
        Some(now - Duration::seconds(400)),
    )
    .await;

    let summary = h.driver.run_cycle().await.unwrap();
    assert_eq!(summary.actions.failed, 0);
    assert_eq!(
        worker_db::get_worker(&h.pool, "gpu-20260801-000004-quiet0")
            .await
            .unwrap()
            .unwrap()
            .status,
        WorkerStatus::Active
    );

    h.teardown().await;
}

#[tokio::test]
async fn back_to_back_cycles_are_idempotent() {
    let mut h = TestHarness::new().await;
    let now = h.clock.now();

    h.seed_active_worker("gpu-20260801-000005-idem00", now - Duration::seconds(600), Some(now))
        .await;
    h.seed_active_worker("gpu-20260801-000005-idem01", now - Duration::seconds(600), Some(now))
        .await;

    let first = h.driver.run_cycle().await.unwrap();
    let counts_after_first = h.status_counts().await;
    let second = h.driver.run_cycle().await.unwrap();
    let counts_after_second = h.status_counts().await;

    assert_eq!(first.decision, "maintain");
    assert_eq!(second.decision, "maintain");
    assert_eq!(counts_after_first, counts_after_second);
    assert_eq!(second.actions, corral_core::driver::CycleActions::default());

    h.teardown().await;
}
