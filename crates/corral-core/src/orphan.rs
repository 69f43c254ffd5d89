//! Orphan recovery: tasks stranded by dead workers, and pods the cloud is
//! running that the store has never heard of.

use anyhow::Result;
use sqlx::PgPool;

use corral_cloud::CloudClient;
use corral_db::queries::tasks as task_db;
use corral_db::queries::workers as worker_db;

use crate::settings::Settings;

/// Return tasks stranded on the given dead workers to the queue.
///
/// Called once per cycle with the workers that entered a terminal state
/// during that cycle. Parent (orchestrator-typed) tasks and tasks at the
/// attempt cap are excluded store-side.
pub async fn recover_tasks(pool: &PgPool, dead_worker_ids: &[String]) -> Result<i64> {
    if dead_worker_ids.is_empty() {
        return Ok(0);
    }
    let count = task_db::reset_orphaned_tasks(pool, dead_worker_ids).await?;
    if count > 0 {
        tracing::warn!(
            workers = dead_worker_ids.len(),
            tasks = count,
            "reset orphaned tasks to queued"
        );
    }
    Ok(count)
}

/// Terminate pods that exist in the cloud with no corresponding worker
/// row.
///
/// Off the hot path: the driver runs this every few cycles. Only pods
/// carrying our naming prefix are touched, and only after they have been
/// up longer than the spawning timeout (a pod mid-registration is left
/// alone). Returns the number of pods terminated.
pub async fn reconcile_pods(
    pool: &PgPool,
    cloud: &dyn CloudClient,
    settings: &Settings,
) -> Result<u32> {
    let pods = cloud.list_pods().await?;
    if pods.is_empty() {
        return Ok(0);
    }

    // Provider-reported uptime is authoritative for pod age here.
    let min_age_seconds = settings.spawning_timeout.num_seconds().max(0) as u64;
    let mut terminated = 0u32;

    for pod in &pods {
        if !pod.name.starts_with("gpu-") {
            continue;
        }
        if pod.desired_status.is_dead() {
            continue;
        }
        if pod.uptime_seconds < min_age_seconds {
            continue;
        }
        let known = worker_db::get_worker(pool, &pod.name).await?.is_some();
        if known {
            continue;
        }

        tracing::warn!(
            cloud_id = %pod.cloud_id,
            pod_name = %pod.name,
            uptime_seconds = pod.uptime_seconds,
            "terminating orphan pod with no worker row"
        );
        match cloud.terminate_pod(&pod.cloud_id).await {
            Ok(_) => terminated += 1,
            Err(e) => {
                tracing::warn!(
                    cloud_id = %pod.cloud_id,
                    error = %e,
                    "failed to terminate orphan pod"
                );
            }
        }
    }

    Ok(terminated)
}
