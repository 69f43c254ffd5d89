//! SSH readiness probe for freshly provisioned pods.
//!
//! Runs one bounded `ssh` invocation that checks the network volume is
//! mounted and the GPU is visible. The probe decides promotion only --
//! liveness after promotion is the heartbeat's job, never SSH.

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use tokio::process::Command;

use crate::types::PodReadiness;

/// Where and how to probe.
#[derive(Debug, Clone)]
pub struct ProbeTarget {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub key_path: Option<PathBuf>,
    /// The volume mount that must be visible inside the pod.
    pub mount_path: String,
}

/// SSH exit code for connection-level failures (refused, unreachable,
/// host key trouble). While a pod is still booting these are expected.
const SSH_CONNECTION_ERROR: i32 = 255;

/// Build the ssh argv for a probe. Split out for testability.
fn build_ssh_args(target: &ProbeTarget) -> Vec<String> {
    let mut args = vec![
        "-o".to_owned(),
        "BatchMode=yes".to_owned(),
        "-o".to_owned(),
        "StrictHostKeyChecking=no".to_owned(),
        "-o".to_owned(),
        "UserKnownHostsFile=/dev/null".to_owned(),
        "-o".to_owned(),
        "ConnectTimeout=10".to_owned(),
        "-p".to_owned(),
        target.port.to_string(),
    ];
    if let Some(ref key) = target.key_path {
        args.push("-i".to_owned());
        args.push(key.display().to_string());
    }
    args.push(format!("{}@{}", target.username, target.host));
    args.push(format!(
        "test -d '{}' && nvidia-smi -L",
        target.mount_path
    ));
    args
}

/// Probe a pod over SSH.
///
/// - exit 0: mount visible, GPU enumerated -> `Ready`
/// - exit 255: connection-level failure, pod likely still booting -> `NotReady`
/// - other exit: pod is up but broken -> `Failed(stderr)`
/// - deadline exceeded: `NotReady` (the next cycle probes again)
pub async fn probe_pod_ready(target: &ProbeTarget, deadline: Duration) -> PodReadiness {
    let args = build_ssh_args(target);

    let child = Command::new("ssh")
        .args(&args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .output();

    let output = match tokio::time::timeout(deadline, child).await {
        Err(_elapsed) => {
            tracing::debug!(host = %target.host, "readiness probe timed out");
            return PodReadiness::NotReady;
        }
        Ok(Err(e)) => {
            // ssh binary missing or unspawnable: configuration problem, not
            // a pod problem.
            return PodReadiness::Failed(format!("failed to run ssh: {e}"));
        }
        Ok(Ok(output)) => output,
    };

    match output.status.code() {
        Some(0) => PodReadiness::Ready,
        Some(SSH_CONNECTION_ERROR) => {
            tracing::debug!(host = %target.host, "ssh not accepting connections yet");
            PodReadiness::NotReady
        }
        code => {
            let stderr = String::from_utf8_lossy(&output.stderr);
            PodReadiness::Failed(format!(
                "probe exited with {:?}: {}",
                code,
                stderr.trim()
            ))
        }
    }
}
