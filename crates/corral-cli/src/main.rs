mod config;
mod run_cmd;
mod status_cmd;

use clap::{Parser, Subcommand};

use corral_db::pool;

use config::CorralConfig;
use run_cmd::RunMode;

#[derive(Parser)]
#[command(name = "corral", about = "Auto-scaling control plane for GPU worker fleets")]
struct Cli {
    /// Database URL (overrides SUPABASE_DB_URL env var)
    #[arg(long, global = true)]
    database_url: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a corral config file (no database required)
    Init {
        /// PostgreSQL connection URL for the task/worker store
        #[arg(long, default_value = "postgresql://localhost:5432/corral")]
        db_url: String,
        /// Overwrite existing config file
        #[arg(long)]
        force: bool,
    },
    /// Initialize the store schema (create database, run migrations)
    DbInit,
    /// Run one control cycle, print a structured summary, exit
    Single,
    /// Run the control loop until SIGINT/SIGTERM.
    ///
    /// Run exactly one instance per fleet: concurrent replicas double-scale.
    Continuous,
    /// Show fleet and queue status
    Status,
    /// Delete log records past the retention window
    CleanupLogs {
        /// Retention window in hours
        #[arg(long, default_value_t = 48)]
        retention_hours: i32,
    },
}

/// Execute the `corral init` command: write the config file.
fn cmd_init(db_url: &str, force: bool) -> anyhow::Result<()> {
    let path = config::config_path();

    if path.exists() && !force {
        anyhow::bail!(
            "config file already exists at {}\nUse --force to overwrite.",
            path.display()
        );
    }

    let cfg = config::FileConfig {
        store: config::StoreSection {
            url: db_url.to_string(),
        },
    };

    config::write_file_config(&cfg)?;

    println!("Config written to {}", path.display());
    println!("  store.url = {db_url}");
    println!();
    println!("Next: run `corral db-init` to create and migrate the store.");

    Ok(())
}

/// Execute the `corral db-init` command: create database and run migrations.
async fn cmd_db_init(cli_db_url: Option<&str>) -> anyhow::Result<()> {
    let resolved = CorralConfig::resolve(cli_db_url)?;

    println!("Initializing corral store...");

    pool::create_database_if_missing(&resolved.db_config).await?;

    let db_pool = pool::connect(&resolved.db_config).await?;
    pool::run_migrations(&db_pool, &pool::migrations_dir()).await?;

    let summary = pool::store_summary(&db_pool).await?;
    println!("Store ready:");
    println!("  tasks:       {} rows", summary.tasks);
    println!("  workers:     {} rows", summary.workers);
    println!("  system_logs: {} rows", summary.system_logs);

    db_pool.close().await;
    println!("corral db-init complete.");
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Tracing goes to stderr: this is the channel that stays available
    // even when the store-backed log sink is degraded.
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Init { db_url, force } => {
            cmd_init(&db_url, force)?;
        }
        Commands::DbInit => {
            cmd_db_init(cli.database_url.as_deref()).await?;
        }
        Commands::Single => {
            let resolved = CorralConfig::resolve(cli.database_url.as_deref())?;
            let db_pool = pool::connect(&resolved.db_config).await?;
            let result = run_cmd::run(db_pool.clone(), RunMode::Single).await;
            db_pool.close().await;
            result?;
        }
        Commands::Continuous => {
            let resolved = CorralConfig::resolve(cli.database_url.as_deref())?;
            let db_pool = pool::connect(&resolved.db_config).await?;
            let result = run_cmd::run(db_pool.clone(), RunMode::Continuous).await;
            db_pool.close().await;
            result?;
        }
        Commands::Status => {
            let resolved = CorralConfig::resolve(cli.database_url.as_deref())?;
            let db_pool = pool::connect(&resolved.db_config).await?;
            let result = status_cmd::run_status(&db_pool).await;
            db_pool.close().await;
            result?;
        }
        Commands::CleanupLogs { retention_hours } => {
            let resolved = CorralConfig::resolve(cli.database_url.as_deref())?;
            let db_pool = pool::connect(&resolved.db_config).await?;
            let result =
                corral_db::queries::logs::cleanup_old_logs(&db_pool, retention_hours).await;
            db_pool.close().await;
            let deleted = result?;
            println!("Deleted {deleted} log records older than {retention_hours}h.");
        }
    }

    Ok(())
}
