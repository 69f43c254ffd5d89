//! The `status` subcommand: a point-in-time fleet and queue snapshot.

use anyhow::Result;
use sqlx::PgPool;

use corral_db::queries::tasks as task_db;
use corral_db::queries::workers as worker_db;

pub async fn run_status(pool: &PgPool) -> Result<()> {
    let counts = task_db::count_available_tasks(pool, true).await?;
    let fleet = worker_db::fleet_counts(pool).await?;

    println!("Queue:");
    println!("  queued:      {}", counts.queued_only);
    println!("  in progress: {}", counts.active_only);
    println!();
    println!("Fleet:");
    println!("  spawning:    {}", fleet.spawning);
    println!("  active:      {}", fleet.active);
    println!("  terminating: {}", fleet.terminating);
    println!("  terminated:  {}", fleet.terminated);
    println!("  error:       {}", fleet.error);
    println!("  capacity:    {}", fleet.capacity());

    let workers = worker_db::list_fleet(pool).await?;
    if !workers.is_empty() {
        println!();
        println!(
            "{:<34} {:<12} {:<20} {}",
            "WORKER", "STATUS", "LAST HEARTBEAT", "READY"
        );
        for worker in &workers {
            let heartbeat = worker
                .last_heartbeat
                .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
                .unwrap_or_else(|| "never".to_owned());
            println!(
                "{:<34} {:<12} {:<20} {}",
                worker.id,
                worker.status.to_string(),
                heartbeat,
                worker.metadata.ready
            );
        }
    }

    Ok(())
}
