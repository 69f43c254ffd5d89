use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// What the orchestrator asks the cloud to run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PodSpec {
    pub gpu_type_display_name: String,
    pub container_image: String,
    pub container_disk_gb: u32,
    pub volume_mount_path: String,
    pub network_volume_name: Option<String>,
    /// Extra container environment. The adapter injects `WORKER_ID`, store
    /// credentials, and the task-completion endpoint on top of these.
    pub env: HashMap<String, String>,
    pub ssh_public_key: String,
    /// Port exposures in provider syntax, e.g. `"22/tcp"`.
    pub ports: Vec<String>,
}

/// Provider-side lifecycle state of a pod.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum DesiredStatus {
    Provisioning,
    Running,
    Failed,
    Terminated,
}

impl DesiredStatus {
    /// Whether the pod will never serve work again.
    pub fn is_dead(self) -> bool {
        matches!(self, Self::Failed | Self::Terminated)
    }
}

impl fmt::Display for DesiredStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Provisioning => "PROVISIONING",
            Self::Running => "RUNNING",
            Self::Failed => "FAILED",
            Self::Terminated => "TERMINATED",
        };
        f.write_str(s)
    }
}

impl FromStr for DesiredStatus {
    type Err = DesiredStatusParseError;

    /// Tolerant of provider synonyms: brand-new pods report `CREATED`,
    /// deleted ones `EXITED`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "PROVISIONING" | "CREATED" | "PENDING" => Ok(Self::Provisioning),
            "RUNNING" => Ok(Self::Running),
            "FAILED" | "DEAD" => Ok(Self::Failed),
            "TERMINATED" | "EXITED" => Ok(Self::Terminated),
            other => Err(DesiredStatusParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`DesiredStatus`] string.
#[derive(Debug, Clone)]
pub struct DesiredStatusParseError(pub String);

impl fmt::Display for DesiredStatusParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid pod status: {:?}", self.0)
    }
}

impl std::error::Error for DesiredStatusParseError {}

/// Result of a successful pod creation.
#[derive(Debug, Clone)]
pub struct CreatedPod {
    pub cloud_id: String,
    pub initial_state: DesiredStatus,
}

/// Structured pod state as returned by `get_pod_state`.
#[derive(Debug, Clone)]
pub struct PodState {
    pub desired_status: DesiredStatus,
    /// Raw provider status string, for diagnostics.
    pub actual_status: Option<String>,
    pub ip: Option<String>,
    pub ssh_port: Option<u16>,
    pub ssh_password: Option<String>,
    pub uptime_seconds: u64,
    pub hourly_cost: Option<f64>,
}

impl PodState {
    /// Whether the pod is reachable for an SSH readiness probe.
    pub fn ssh_reachable(&self) -> bool {
        self.desired_status == DesiredStatus::Running
            && self.ip.is_some()
            && self.ssh_port.is_some()
    }
}

/// One row of `list_pods`, used for orphan-pod detection.
#[derive(Debug, Clone)]
pub struct PodSummary {
    pub cloud_id: String,
    /// The pod name; for pods we created this is the worker id.
    pub name: String,
    pub desired_status: DesiredStatus,
    pub uptime_seconds: u64,
}

/// Outcome of a bounded readiness probe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PodReadiness {
    Ready,
    /// Transient: still provisioning, SSH not up yet. Probe again next cycle.
    NotReady,
    /// The pod is up but broken (mount missing, GPU absent).
    Failed(String),
}

/// Outcome of `terminate_pod`. A pod that is already gone counts as
/// terminated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminateOutcome {
    Terminated,
    NotFound,
}
