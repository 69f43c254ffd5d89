//! Tests for the task query module and the store-side RPC functions.

use serde_json::json;
use sqlx::PgPool;
use uuid::Uuid;

use corral_db::models::{TaskStatus, WorkerMetadata, WorkerStatus};
use corral_db::queries::tasks as task_db;
use corral_db::queries::workers as worker_db;
use corral_test_utils::TestDb;

// ===========================================================================
// Helpers
// ===========================================================================

async fn register_active_worker(pool: &PgPool, id: &str) {
    worker_db::register_worker(pool, id, Some("NVIDIA A40"), &WorkerMetadata::default())
        .await
        .expect("register worker");
    let rows = worker_db::transition_worker_status(
        pool,
        id,
        WorkerStatus::Spawning,
        WorkerStatus::Active,
        json!({}),
    )
    .await
    .expect("promote worker");
    assert_eq!(rows, 1);
}

async fn queue_task(pool: &PgPool, user: Uuid) -> Uuid {
    task_db::insert_task(pool, "generation", json!({"prompt": "x"}), Some(user))
        .await
        .expect("insert task")
        .id
}

/// Force a task into `in_progress` for a worker, bypassing the claim path.
async fn force_in_progress(pool: &PgPool, task_id: Uuid, worker_id: &str) {
    sqlx::query(
        "UPDATE tasks SET status = 'in_progress', worker_id = $2, \
         generation_started_at = now() WHERE id = $1",
    )
    .bind(task_id)
    .bind(worker_id)
    .execute(pool)
    .await
    .expect("force in_progress");
}

// ===========================================================================
// task_counts
// ===========================================================================

#[tokio::test]
async fn task_counts_ignores_rows_without_tenancy() {
    let db = TestDb::create().await;
    let pool = db.pool.clone();
    let user = Uuid::new_v4();

    queue_task(&pool, user).await;
    queue_task(&pool, user).await;
    // Legacy row without a user_id must never be counted.
    task_db::insert_task(&pool, "generation", json!({}), None)
        .await
        .unwrap();

    let counts = task_db::count_available_tasks(&pool, true).await.unwrap();
    assert_eq!(counts.queued_only, 2);
    assert_eq!(counts.active_only, 0);
    assert_eq!(counts.total, 2);

    db.teardown().await;
}

#[tokio::test]
async fn task_counts_excludes_parent_tasks_and_honours_flag() {
    let db = TestDb::create().await;
    let pool = db.pool.clone();
    let user = Uuid::new_v4();

    queue_task(&pool, user).await;
    task_db::insert_task(&pool, "orchestrator_parent", json!({}), Some(user))
        .await
        .unwrap();

    let worker = "gpu-20260801-000000-aaaaaa";
    register_active_worker(&pool, worker).await;
    let claimed = queue_task(&pool, user).await;
    force_in_progress(&pool, claimed, worker).await;

    let with_active = task_db::count_available_tasks(&pool, true).await.unwrap();
    assert_eq!(with_active.queued_only, 1);
    assert_eq!(with_active.active_only, 1);
    assert_eq!(with_active.total, 2);

    let queued_only = task_db::count_available_tasks(&pool, false).await.unwrap();
    assert_eq!(queued_only.total, 1);

    db.teardown().await;
}

// ===========================================================================
// claim_task
// ===========================================================================

#[tokio::test]
async fn claim_is_fifo_and_sets_claim_columns() {
    let db = TestDb::create().await;
    let pool = db.pool.clone();
    let user = Uuid::new_v4();
    let worker = "gpu-20260801-000001-bbbbbb";
    register_active_worker(&pool, worker).await;

    let first = queue_task(&pool, user).await;
    let _second = queue_task(&pool, user).await;

    let claimed = task_db::claim_task(&pool, worker)
        .await
        .unwrap()
        .expect("should claim a task");
    assert_eq!(claimed.id, first);
    assert_eq!(claimed.status, TaskStatus::InProgress);
    assert_eq!(claimed.worker_id.as_deref(), Some(worker));
    assert!(claimed.generation_started_at.is_some());

    db.teardown().await;
}

#[tokio::test]
async fn terminating_worker_never_claims() {
    let db = TestDb::create().await;
    let pool = db.pool.clone();
    let user = Uuid::new_v4();
    let worker = "gpu-20260801-000002-cccccc";
    register_active_worker(&pool, worker).await;
    queue_task(&pool, user).await;

    let rows = worker_db::transition_worker_status(
        &pool,
        worker,
        WorkerStatus::Active,
        WorkerStatus::Terminating,
        json!({}),
    )
    .await
    .unwrap();
    assert_eq!(rows, 1);

    let claimed = task_db::claim_task(&pool, worker).await.unwrap();
    assert!(claimed.is_none(), "terminating workers must not claim");

    db.teardown().await;
}

#[tokio::test]
async fn claim_skips_parent_tasks_and_empty_queue_returns_none() {
    let db = TestDb::create().await;
    let pool = db.pool.clone();
    let user = Uuid::new_v4();
    let worker = "gpu-20260801-000003-dddddd";
    register_active_worker(&pool, worker).await;

    task_db::insert_task(&pool, "Orchestrator", json!({}), Some(user))
        .await
        .unwrap();

    let claimed = task_db::claim_task(&pool, worker).await.unwrap();
    assert!(claimed.is_none());

    db.teardown().await;
}

// ===========================================================================
// completion / failure accounting
// ===========================================================================

#[tokio::test]
async fn failed_task_requeues_until_attempt_cap() {
    let db = TestDb::create().await;
    let pool = db.pool.clone();
    let user = Uuid::new_v4();
    let worker = "gpu-20260801-000004-eeeeee";
    register_active_worker(&pool, worker).await;
    let task_id = queue_task(&pool, user).await;

    // Attempts 1 and 2: requeued.
    for expected_attempts in 1..=2 {
        let claimed = task_db::claim_task(&pool, worker).await.unwrap().unwrap();
        assert_eq!(claimed.id, task_id);
        let ok = task_db::mark_task_failed(&pool, task_id, "CUDA OOM").await.unwrap();
        assert!(ok);

        let task = task_db::get_task(&pool, task_id).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Queued);
        assert_eq!(task.attempts, expected_attempts);
        assert!(task.worker_id.is_none());
        assert!(task.generation_started_at.is_none());
    }

    // Attempt 3: parked in failed.
    task_db::claim_task(&pool, worker).await.unwrap().unwrap();
    task_db::mark_task_failed(&pool, task_id, "CUDA OOM").await.unwrap();

    let task = task_db::get_task(&pool, task_id).await.unwrap().unwrap();
    assert_eq!(task.status, TaskStatus::Failed);
    assert_eq!(task.attempts, 3);
    assert_eq!(task.error_message.as_deref(), Some("CUDA OOM"));

    db.teardown().await;
}

#[tokio::test]
async fn complete_only_applies_to_in_progress() {
    let db = TestDb::create().await;
    let pool = db.pool.clone();
    let user = Uuid::new_v4();
    let worker = "gpu-20260801-000005-ffffff";
    register_active_worker(&pool, worker).await;
    let task_id = queue_task(&pool, user).await;

    // Not yet claimed: completion is a no-op.
    let ok = task_db::mark_task_complete(&pool, task_id, None).await.unwrap();
    assert!(!ok);

    task_db::claim_task(&pool, worker).await.unwrap().unwrap();
    let ok = task_db::mark_task_complete(&pool, task_id, Some(json!({"frames": 120})))
        .await
        .unwrap();
    assert!(ok);

    let task = task_db::get_task(&pool, task_id).await.unwrap().unwrap();
    assert_eq!(task.status, TaskStatus::Complete);
    assert!(task.generation_processed_at.is_some());
    assert_eq!(task.result_data, Some(json!({"frames": 120})));

    db.teardown().await;
}

// ===========================================================================
// reset_orphaned_tasks
// ===========================================================================

#[tokio::test]
async fn orphan_reset_requeues_with_attempt_accounting() {
    let db = TestDb::create().await;
    let pool = db.pool.clone();
    let user = Uuid::new_v4();
    let dead = "gpu-20260801-000006-aaaa01";
    let alive = "gpu-20260801-000007-aaaa02";
    register_active_worker(&pool, dead).await;
    register_active_worker(&pool, alive).await;

    let orphaned = queue_task(&pool, user).await;
    force_in_progress(&pool, orphaned, dead).await;
    let healthy = queue_task(&pool, user).await;
    force_in_progress(&pool, healthy, alive).await;

    let count = task_db::reset_orphaned_tasks(&pool, &[dead.to_owned()])
        .await
        .unwrap();
    assert_eq!(count, 1);

    let task = task_db::get_task(&pool, orphaned).await.unwrap().unwrap();
    assert_eq!(task.status, TaskStatus::Queued);
    assert_eq!(task.attempts, 1);
    assert!(task.worker_id.is_none());

    // The other worker's task is untouched.
    let task = task_db::get_task(&pool, healthy).await.unwrap().unwrap();
    assert_eq!(task.status, TaskStatus::InProgress);

    db.teardown().await;
}

#[tokio::test]
async fn orphan_reset_never_touches_parent_or_capped_tasks() {
    let db = TestDb::create().await;
    let pool = db.pool.clone();
    let user = Uuid::new_v4();
    let dead = "gpu-20260801-000008-aaaa03";
    register_active_worker(&pool, dead).await;

    let parent = task_db::insert_task(&pool, "orchestrator_parent", json!({}), Some(user))
        .await
        .unwrap()
        .id;
    force_in_progress(&pool, parent, dead).await;

    let capped = queue_task(&pool, user).await;
    force_in_progress(&pool, capped, dead).await;
    sqlx::query("UPDATE tasks SET attempts = 3 WHERE id = $1")
        .bind(capped)
        .execute(&pool)
        .await
        .unwrap();

    let count = task_db::reset_orphaned_tasks(&pool, &[dead.to_owned()])
        .await
        .unwrap();
    assert_eq!(count, 0);

    let task = task_db::get_task(&pool, parent).await.unwrap().unwrap();
    assert_eq!(task.status, TaskStatus::InProgress);
    let task = task_db::get_task(&pool, capped).await.unwrap().unwrap();
    assert_eq!(task.status, TaskStatus::InProgress);

    db.teardown().await;
}

#[tokio::test]
async fn orphan_reset_at_final_attempt_parks_in_failed() {
    let db = TestDb::create().await;
    let pool = db.pool.clone();
    let user = Uuid::new_v4();
    let dead = "gpu-20260801-000009-aaaa04";
    register_active_worker(&pool, dead).await;

    let task_id = queue_task(&pool, user).await;
    force_in_progress(&pool, task_id, dead).await;
    sqlx::query("UPDATE tasks SET attempts = 2 WHERE id = $1")
        .bind(task_id)
        .execute(&pool)
        .await
        .unwrap();

    let count = task_db::reset_orphaned_tasks(&pool, &[dead.to_owned()])
        .await
        .unwrap();
    assert_eq!(count, 1);

    let task = task_db::get_task(&pool, task_id).await.unwrap().unwrap();
    assert_eq!(task.status, TaskStatus::Failed);
    assert_eq!(task.attempts, 3);
    assert!(task.worker_id.is_none());

    db.teardown().await;
}

#[tokio::test]
async fn orphan_reset_with_no_workers_is_a_noop() {
    let db = TestDb::create().await;
    let pool = db.pool.clone();

    let count = task_db::reset_orphaned_tasks(&pool, &[]).await.unwrap();
    assert_eq!(count, 0);

    db.teardown().await;
}
