use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use sqlx::types::Json;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Enums
// ---------------------------------------------------------------------------

/// Status of a task. Tasks are owned by the external task service; the
/// orchestrator reads their counts and resets orphans.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Queued,
    InProgress,
    Complete,
    Failed,
    Cancelled,
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Queued => "queued",
            Self::InProgress => "in_progress",
            Self::Complete => "complete",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

impl FromStr for TaskStatus {
    type Err = TaskStatusParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(Self::Queued),
            "in_progress" => Ok(Self::InProgress),
            "complete" => Ok(Self::Complete),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            other => Err(TaskStatusParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`TaskStatus`] string.
#[derive(Debug, Clone)]
pub struct TaskStatusParseError(pub String);

impl fmt::Display for TaskStatusParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid task status: {:?}", self.0)
    }
}

impl std::error::Error for TaskStatusParseError {}

// ---------------------------------------------------------------------------

/// Status of a worker. Workers are owned by the orchestrator; the external
/// worker process writes only `last_heartbeat` and the VRAM metadata fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum WorkerStatus {
    Spawning,
    Active,
    Terminating,
    Terminated,
    Error,
}

impl WorkerStatus {
    /// Whether the status is terminal (the worker will never run work again).
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Terminated | Self::Error)
    }
}

impl fmt::Display for WorkerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Spawning => "spawning",
            Self::Active => "active",
            Self::Terminating => "terminating",
            Self::Terminated => "terminated",
            Self::Error => "error",
        };
        f.write_str(s)
    }
}

impl FromStr for WorkerStatus {
    type Err = WorkerStatusParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "spawning" => Ok(Self::Spawning),
            "active" => Ok(Self::Active),
            "terminating" => Ok(Self::Terminating),
            "terminated" => Ok(Self::Terminated),
            "error" => Ok(Self::Error),
            other => Err(WorkerStatusParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`WorkerStatus`] string.
#[derive(Debug, Clone)]
pub struct WorkerStatusParseError(pub String);

impl fmt::Display for WorkerStatusParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid worker status: {:?}", self.0)
    }
}

impl std::error::Error for WorkerStatusParseError {}

// ---------------------------------------------------------------------------

/// Severity of a log record in the shared log store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "UPPERCASE")]
#[serde(rename_all = "UPPERCASE")]
pub enum LogLevel {
    Debug,
    Info,
    Warning,
    Error,
    Critical,
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Debug => "DEBUG",
            Self::Info => "INFO",
            Self::Warning => "WARNING",
            Self::Error => "ERROR",
            Self::Critical => "CRITICAL",
        };
        f.write_str(s)
    }
}

impl FromStr for LogLevel {
    type Err = LogLevelParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "DEBUG" => Ok(Self::Debug),
            "INFO" => Ok(Self::Info),
            "WARNING" => Ok(Self::Warning),
            "ERROR" => Ok(Self::Error),
            "CRITICAL" => Ok(Self::Critical),
            other => Err(LogLevelParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`LogLevel`] string.
#[derive(Debug, Clone)]
pub struct LogLevelParseError(pub String);

impl fmt::Display for LogLevelParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid log level: {:?}", self.0)
    }
}

impl std::error::Error for LogLevelParseError {}

// ---------------------------------------------------------------------------

/// Originator of a log record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum LogSourceType {
    OrchestratorGpu,
    OrchestratorApi,
    Worker,
}

impl fmt::Display for LogSourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::OrchestratorGpu => "orchestrator_gpu",
            Self::OrchestratorApi => "orchestrator_api",
            Self::Worker => "worker",
        };
        f.write_str(s)
    }
}

impl FromStr for LogSourceType {
    type Err = LogSourceTypeParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "orchestrator_gpu" => Ok(Self::OrchestratorGpu),
            "orchestrator_api" => Ok(Self::OrchestratorApi),
            "worker" => Ok(Self::Worker),
            other => Err(LogSourceTypeParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`LogSourceType`] string.
#[derive(Debug, Clone)]
pub struct LogSourceTypeParseError(pub String);

impl fmt::Display for LogSourceTypeParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid log source type: {:?}", self.0)
    }
}

impl std::error::Error for LogSourceTypeParseError {}

// ---------------------------------------------------------------------------
// Worker metadata
// ---------------------------------------------------------------------------

/// SSH connection details for a provisioned pod.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SshDetails {
    pub host: String,
    pub port: u16,
    pub username: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
}

/// The well-known core of the worker metadata bag, plus an opaque extension
/// map for anything else other tooling has written into the column.
///
/// The orchestrator exclusively writes `orchestrator_status`,
/// `promoted_to_active_at`, `terminated_at`, and `error_reason`; the worker
/// process writes only the VRAM fields.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WorkerMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub runpod_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pod_details: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ssh_details: Option<SshDetails>,
    #[serde(default)]
    pub ready: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub orchestrator_status: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub promoted_to_active_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub terminating_since: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub terminated_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ram_tier: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vram_total_mb: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vram_used_mb: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vram_timestamp: Option<DateTime<Utc>>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

// ---------------------------------------------------------------------------
// Row structs
// ---------------------------------------------------------------------------

/// A task row as seen through the adapter.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Task {
    pub id: Uuid,
    pub status: TaskStatus,
    pub attempts: i32,
    pub worker_id: Option<String>,
    pub generation_started_at: Option<DateTime<Utc>>,
    pub generation_processed_at: Option<DateTime<Utc>>,
    pub task_type: String,
    pub params: serde_json::Value,
    pub result_data: Option<serde_json::Value>,
    pub error_message: Option<String>,
    pub output_location: Option<String>,
    pub user_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Task {
    /// Whether this is a parent (orchestrator-typed) task. Parent tasks are
    /// never reset by orphan recovery and never claimed by GPU workers.
    pub fn is_parent(&self) -> bool {
        self.task_type.to_ascii_lowercase().contains("orchestrator")
    }
}

/// A worker row. The `id` doubles as the pod name requested from the cloud
/// provider, so primary-key uniqueness prevents duplicate pods.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Worker {
    pub id: String,
    pub instance_type: Option<String>,
    pub status: WorkerStatus,
    pub last_heartbeat: Option<DateTime<Utc>>,
    pub metadata: Json<WorkerMetadata>,
    pub created_at: DateTime<Utc>,
}

/// A log record row in the shared log store.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct SystemLog {
    pub id: i64,
    pub timestamp: DateTime<Utc>,
    pub source_type: LogSourceType,
    pub source_id: String,
    pub log_level: LogLevel,
    pub message: String,
    pub task_id: Option<Uuid>,
    pub worker_id: Option<String>,
    pub cycle_number: Option<i64>,
    pub metadata: serde_json::Value,
}

/// The demand tuple returned by the store's pre-filtered counter.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TaskCounts {
    pub queued_only: i64,
    pub active_only: i64,
    pub total: i64,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn task_status_display_roundtrip() {
        let variants = [
            TaskStatus::Queued,
            TaskStatus::InProgress,
            TaskStatus::Complete,
            TaskStatus::Failed,
            TaskStatus::Cancelled,
        ];
        for v in &variants {
            let s = v.to_string();
            let parsed: TaskStatus = s.parse().expect("should parse");
            assert_eq!(*v, parsed);
        }
    }

    #[test]
    fn task_status_invalid() {
        let result = "bogus".parse::<TaskStatus>();
        assert!(result.is_err());
    }

    #[test]
    fn worker_status_display_roundtrip() {
        let variants = [
            WorkerStatus::Spawning,
            WorkerStatus::Active,
            WorkerStatus::Terminating,
            WorkerStatus::Terminated,
            WorkerStatus::Error,
        ];
        for v in &variants {
            let s = v.to_string();
            let parsed: WorkerStatus = s.parse().expect("should parse");
            assert_eq!(*v, parsed);
        }
    }

    #[test]
    fn worker_status_terminal() {
        assert!(WorkerStatus::Terminated.is_terminal());
        assert!(WorkerStatus::Error.is_terminal());
        assert!(!WorkerStatus::Active.is_terminal());
        assert!(!WorkerStatus::Terminating.is_terminal());
    }

    #[test]
    fn log_level_display_roundtrip() {
        let variants = [
            LogLevel::Debug,
            LogLevel::Info,
            LogLevel::Warning,
            LogLevel::Error,
            LogLevel::Critical,
        ];
        for v in &variants {
            let s = v.to_string();
            let parsed: LogLevel = s.parse().expect("should parse");
            assert_eq!(*v, parsed);
        }
    }

    #[test]
    fn log_level_ordering() {
        assert!(LogLevel::Debug < LogLevel::Info);
        assert!(LogLevel::Warning < LogLevel::Critical);
    }

    #[test]
    fn log_source_type_display_roundtrip() {
        let variants = [
            LogSourceType::OrchestratorGpu,
            LogSourceType::OrchestratorApi,
            LogSourceType::Worker,
        ];
        for v in &variants {
            let s = v.to_string();
            let parsed: LogSourceType = s.parse().expect("should parse");
            assert_eq!(*v, parsed);
        }
    }

    #[test]
    fn metadata_roundtrip_preserves_unknown_keys() {
        let raw = serde_json::json!({
            "runpod_id": "pod-abc123",
            "ready": true,
            "error_reason": "Spawning timeout",
            "some_legacy_key": {"nested": 1},
        });
        let meta: WorkerMetadata = serde_json::from_value(raw).expect("should deserialize");
        assert_eq!(meta.runpod_id.as_deref(), Some("pod-abc123"));
        assert!(meta.ready);
        assert_eq!(meta.error_reason.as_deref(), Some("Spawning timeout"));
        assert!(meta.extra.contains_key("some_legacy_key"));

        let back = serde_json::to_value(&meta).expect("should serialize");
        assert_eq!(back["some_legacy_key"]["nested"], 1);
    }

    #[test]
    fn metadata_defaults_are_empty() {
        let meta: WorkerMetadata = serde_json::from_value(serde_json::json!({})).unwrap();
        assert!(!meta.ready);
        assert!(meta.runpod_id.is_none());
        assert!(meta.extra.is_empty());
    }

    #[test]
    fn parent_task_detection_is_case_insensitive() {
        let mut task = sample_task();
        task.task_type = "Orchestrator_Parent".to_owned();
        assert!(task.is_parent());
        task.task_type = "generation".to_owned();
        assert!(!task.is_parent());
    }

    fn sample_task() -> Task {
        Task {
            id: Uuid::new_v4(),
            status: TaskStatus::Queued,
            attempts: 0,
            worker_id: None,
            generation_started_at: None,
            generation_processed_at: None,
            task_type: "generation".to_owned(),
            params: serde_json::json!({}),
            result_data: None,
            error_message: None,
            output_location: None,
            user_id: Some(Uuid::new_v4()),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }
}
