//! Environment-driven orchestrator settings.
//!
//! All durations are given in seconds except the failure window (minutes).
//! Parsing is separated from `std::env` through a lookup function so tests
//! never mutate process-global state.

use std::time::Duration as StdDuration;

use chrono::Duration;

use corral_db::models::LogLevel;

use crate::error::OrchestratorError;

/// Log sink configuration subset.
#[derive(Debug, Clone)]
pub struct LogSinkSettings {
    /// `ENABLE_DB_LOGGING`: start the sink at all.
    pub enabled: bool,
    /// `DB_LOG_LEVEL`: minimum level accepted by the sink.
    pub min_level: LogLevel,
    /// `DB_LOG_BATCH_SIZE`: flush when this many records are pending.
    pub batch_size: usize,
    /// `DB_LOG_FLUSH_INTERVAL`: flush at least this often.
    pub flush_interval: StdDuration,
    /// `DB_LOGGING_REQUIRED`: treat sink startup failure as fatal.
    pub required: bool,
}

/// Fully parsed orchestrator settings.
#[derive(Debug, Clone)]
pub struct Settings {
    pub min_fleet: u32,
    pub max_fleet: u32,
    pub tasks_per_worker: u32,
    pub machines_to_keep_idle: u32,
    pub idle_timeout: Duration,
    pub stuck_timeout: Duration,
    pub spawning_timeout: Duration,
    pub graceful_shutdown_timeout: Duration,
    pub failsafe_stale_threshold: Duration,
    pub worker_grace_period: Duration,
    pub poll_interval: StdDuration,
    pub max_failure_rate: f64,
    pub failure_window: Duration,
    pub min_workers_for_rate_check: usize,
    /// `source_id` stamped on every log record this instance emits.
    pub instance_id: String,
    pub log_sink: LogSinkSettings,
}

impl Settings {
    /// Build from process environment.
    pub fn from_env() -> Result<Self, OrchestratorError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary lookup function.
    pub fn from_lookup(
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, OrchestratorError> {
        let settings = Self {
            min_fleet: parse_u32(&lookup, "MIN_ACTIVE_GPUS", 2)?,
            max_fleet: parse_u32(&lookup, "MAX_ACTIVE_GPUS", 10)?,
            tasks_per_worker: parse_u32(&lookup, "TASKS_PER_GPU_THRESHOLD", 3)?,
            machines_to_keep_idle: parse_u32(&lookup, "MACHINES_TO_KEEP_IDLE", 0)?,
            idle_timeout: parse_secs(&lookup, "GPU_IDLE_TIMEOUT_SEC", 300)?,
            stuck_timeout: parse_secs(&lookup, "TASK_STUCK_TIMEOUT_SEC", 300)?,
            spawning_timeout: parse_secs(&lookup, "SPAWNING_TIMEOUT_SEC", 300)?,
            graceful_shutdown_timeout: parse_secs(&lookup, "GRACEFUL_SHUTDOWN_TIMEOUT_SEC", 600)?,
            failsafe_stale_threshold: parse_secs(&lookup, "FAILSAFE_STALE_THRESHOLD_SEC", 900)?,
            worker_grace_period: parse_secs(&lookup, "WORKER_GRACE_PERIOD_SEC", 120)?,
            poll_interval: StdDuration::from_secs(
                parse_u32(&lookup, "ORCHESTRATOR_POLL_SEC", 30)? as u64,
            ),
            max_failure_rate: parse_f64(&lookup, "MAX_WORKER_FAILURE_RATE", 0.8)?,
            failure_window: Duration::minutes(
                parse_u32(&lookup, "FAILURE_WINDOW_MINUTES", 30)? as i64,
            ),
            min_workers_for_rate_check: parse_u32(&lookup, "MIN_WORKERS_FOR_RATE_CHECK", 5)?
                as usize,
            instance_id: lookup("ORCHESTRATOR_INSTANCE_ID")
                .unwrap_or_else(|| format!("orchestrator-{}", std::process::id())),
            log_sink: LogSinkSettings {
                enabled: parse_bool(&lookup, "ENABLE_DB_LOGGING", false)?,
                min_level: parse_level(&lookup, "DB_LOG_LEVEL", LogLevel::Info)?,
                batch_size: parse_u32(&lookup, "DB_LOG_BATCH_SIZE", 50)? as usize,
                flush_interval: StdDuration::from_secs(
                    parse_u32(&lookup, "DB_LOG_FLUSH_INTERVAL", 5)? as u64,
                ),
                required: parse_bool(&lookup, "DB_LOGGING_REQUIRED", false)?,
            },
        };

        settings.validate()?;
        Ok(settings)
    }

    fn validate(&self) -> Result<(), OrchestratorError> {
        if self.min_fleet > self.max_fleet {
            return Err(OrchestratorError::ConfigInvalid(format!(
                "MIN_ACTIVE_GPUS ({}) exceeds MAX_ACTIVE_GPUS ({})",
                self.min_fleet, self.max_fleet
            )));
        }
        if self.tasks_per_worker == 0 {
            return Err(OrchestratorError::ConfigInvalid(
                "TASKS_PER_GPU_THRESHOLD must be at least 1".to_owned(),
            ));
        }
        if !(0.0..=1.0).contains(&self.max_failure_rate) {
            return Err(OrchestratorError::ConfigInvalid(format!(
                "MAX_WORKER_FAILURE_RATE must be within [0, 1], got {}",
                self.max_failure_rate
            )));
        }
        if self.log_sink.batch_size == 0 {
            return Err(OrchestratorError::ConfigInvalid(
                "DB_LOG_BATCH_SIZE must be at least 1".to_owned(),
            ));
        }
        Ok(())
    }
}

fn parse_u32(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: u32,
) -> Result<u32, OrchestratorError> {
    match lookup(key) {
        None => Ok(default),
        Some(raw) => raw.trim().parse::<u32>().map_err(|_| {
            OrchestratorError::ConfigInvalid(format!("{key} is not a valid integer: {raw:?}"))
        }),
    }
}

fn parse_secs(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: u32,
) -> Result<Duration, OrchestratorError> {
    Ok(Duration::seconds(parse_u32(lookup, key, default)? as i64))
}

fn parse_f64(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: f64,
) -> Result<f64, OrchestratorError> {
    match lookup(key) {
        None => Ok(default),
        Some(raw) => raw.trim().parse::<f64>().map_err(|_| {
            OrchestratorError::ConfigInvalid(format!("{key} is not a valid number: {raw:?}"))
        }),
    }
}

fn parse_bool(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: bool,
) -> Result<bool, OrchestratorError> {
    match lookup(key) {
        None => Ok(default),
        Some(raw) => match raw.trim().to_ascii_lowercase().as_str() {
            "true" | "1" | "yes" => Ok(true),
            "false" | "0" | "no" => Ok(false),
            _ => Err(OrchestratorError::ConfigInvalid(format!(
                "{key} is not a valid boolean: {raw:?}"
            ))),
        },
    }
}

fn parse_level(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: LogLevel,
) -> Result<LogLevel, OrchestratorError> {
    match lookup(key) {
        None => Ok(default),
        Some(raw) => raw.trim().to_ascii_uppercase().parse::<LogLevel>().map_err(|_| {
            OrchestratorError::ConfigInvalid(format!("{key} is not a valid log level: {raw:?}"))
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let s = Settings::from_lookup(|_| None).unwrap();
        assert_eq!(s.min_fleet, 2);
        assert_eq!(s.max_fleet, 10);
        assert_eq!(s.tasks_per_worker, 3);
        assert_eq!(s.machines_to_keep_idle, 0);
        assert_eq!(s.idle_timeout, Duration::seconds(300));
        assert_eq!(s.graceful_shutdown_timeout, Duration::seconds(600));
        assert_eq!(s.failsafe_stale_threshold, Duration::seconds(900));
        assert_eq!(s.worker_grace_period, Duration::seconds(120));
        assert_eq!(s.poll_interval, StdDuration::from_secs(30));
        assert_eq!(s.max_failure_rate, 0.8);
        assert_eq!(s.failure_window, Duration::minutes(30));
        assert_eq!(s.min_workers_for_rate_check, 5);
        assert!(!s.log_sink.enabled);
        assert_eq!(s.log_sink.min_level, LogLevel::Info);
        assert_eq!(s.log_sink.batch_size, 50);
        assert!(!s.log_sink.required);
        assert!(s.instance_id.starts_with("orchestrator-"));
    }

    #[test]
    fn overrides_are_honoured() {
        let s = Settings::from_lookup(|key| {
            let v = match key {
                "MIN_ACTIVE_GPUS" => "0",
                "MAX_ACTIVE_GPUS" => "4",
                "ENABLE_DB_LOGGING" => "true",
                "DB_LOG_LEVEL" => "warning",
                "ORCHESTRATOR_INSTANCE_ID" => "orchestrator-gpu-prod-1",
                _ => return None,
            };
            Some(v.to_owned())
        })
        .unwrap();
        assert_eq!(s.min_fleet, 0);
        assert_eq!(s.max_fleet, 4);
        assert!(s.log_sink.enabled);
        assert_eq!(s.log_sink.min_level, LogLevel::Warning);
        assert_eq!(s.instance_id, "orchestrator-gpu-prod-1");
    }

    #[test]
    fn min_above_max_is_rejected() {
        let err = Settings::from_lookup(|key| match key {
            "MIN_ACTIVE_GPUS" => Some("8".to_owned()),
            "MAX_ACTIVE_GPUS" => Some("4".to_owned()),
            _ => None,
        })
        .unwrap_err();
        assert!(err.is_fatal_at_startup());
    }

    #[test]
    fn garbage_values_are_rejected() {
        for (key, value) in [
            ("MAX_ACTIVE_GPUS", "many"),
            ("MAX_WORKER_FAILURE_RATE", "most"),
            ("ENABLE_DB_LOGGING", "maybe"),
            ("DB_LOG_LEVEL", "LOUD"),
        ] {
            let result = Settings::from_lookup(|k| {
                if k == key {
                    Some(value.to_owned())
                } else {
                    None
                }
            });
            assert!(result.is_err(), "{key}={value} should be rejected");
        }
    }

    #[test]
    fn failure_rate_bounds() {
        let err = Settings::from_lookup(|k| {
            (k == "MAX_WORKER_FAILURE_RATE").then(|| "1.5".to_owned())
        })
        .unwrap_err();
        assert!(err.to_string().contains("MAX_WORKER_FAILURE_RATE"));
    }
}
