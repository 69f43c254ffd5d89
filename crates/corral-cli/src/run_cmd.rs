//! The `single` and `continuous` subcommands: build the adapters, start
//! the log sink, run the driver.

use std::sync::Arc;

use anyhow::{Context, Result};
use sqlx::PgPool;
use tokio_util::sync::CancellationToken;

use corral_cloud::{CloudClient, CloudConfig, RunpodClient};
use corral_core::clock::SystemClock;
use corral_core::driver::Driver;
use corral_core::error::OrchestratorError;
use corral_core::logsink::{LogSink, LogSinkConfig, StoreLogWriter};
use corral_core::settings::Settings;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunMode {
    /// One cycle, print the summary, exit.
    Single,
    /// Loop until SIGINT/SIGTERM, then drain the sink.
    Continuous,
}

pub async fn run(pool: PgPool, mode: RunMode) -> Result<()> {
    // Configuration errors are fatal at startup: exit non-zero before the
    // first cycle.
    let settings = Settings::from_env()?;
    let cloud_config = CloudConfig::from_env()?;
    let pod_spec = cloud_config.pod_spec();

    let cloud = RunpodClient::new(cloud_config)?;
    cloud
        .check_connectivity()
        .await
        .context("cloud API connectivity check failed")?;

    // The log sink is owned here; the driver only borrows it.
    let mut sink: Option<Arc<LogSink>> = None;
    let mut sink_degraded = false;
    if settings.log_sink.enabled {
        let candidate = Arc::new(LogSink::new(
            Arc::new(StoreLogWriter::new(pool.clone())),
            LogSinkConfig::from_settings(&settings.log_sink, &settings.instance_id),
        ));
        match candidate.start().await {
            Ok(()) => sink = Some(candidate),
            Err(e) => {
                if settings.log_sink.required {
                    // The startup diagnostic already went to stderr and the
                    // local failure file.
                    return Err(anyhow::Error::new(e)
                        .context("DB_LOGGING_REQUIRED is set and the log sink failed to start"));
                }
                tracing::error!(error = %e, "continuing without store logging");
                sink_degraded = true;
            }
        }
    }

    let mut driver = Driver::new(
        pool,
        Arc::new(cloud),
        Arc::new(SystemClock),
        settings,
        pod_spec,
        sink.clone(),
    );
    if sink_degraded {
        driver.set_sink_degraded();
    }

    let result = match mode {
        RunMode::Single => match driver.run_cycle().await {
            Ok(summary) => {
                println!("{summary}");
                println!(
                    "{}",
                    serde_json::to_string_pretty(&summary)
                        .unwrap_or_else(|_| "<unserializable summary>".to_owned())
                );
                Ok(())
            }
            Err(e) => Err(classify_cycle_error(e)),
        },
        RunMode::Continuous => {
            let cancel = CancellationToken::new();
            let signal_cancel = cancel.clone();
            tokio::spawn(async move {
                shutdown_signal().await;
                signal_cancel.cancel();
            });

            driver.run_continuous(cancel).await;
            Ok(())
        }
    };

    // Clean drain before exit, whatever happened above.
    if let Some(sink) = sink {
        sink.stop().await;
        let stats = sink.stats();
        tracing::info!(
            sent = stats.sent,
            dropped = stats.dropped,
            errors = stats.errors,
            "log sink drained"
        );
    }

    result
}

fn classify_cycle_error(e: OrchestratorError) -> anyhow::Error {
    anyhow::Error::new(e).context("control cycle failed")
}

/// Resolve when SIGINT or SIGTERM arrives.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to install SIGINT handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
