//! RunPod REST API client.
//!
//! One `reqwest::Client` with a per-call timeout; transient failures (rate
//! limits, 5xx, connect errors) retry with capped backoff before surfacing
//! as [`CloudError`]. Everything the orchestrator does to a pod goes
//! through here.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Method, StatusCode};
use serde::Deserialize;
use serde::de::DeserializeOwned;

use crate::client::CloudClient;
use crate::config::CloudConfig;
use crate::error::{CloudError, CloudErrorKind};
use crate::probe::{ProbeTarget, probe_pod_ready};
use crate::types::{
    CreatedPod, DesiredStatus, PodReadiness, PodSpec, PodState, PodSummary, TerminateOutcome,
};

/// Per-call HTTP timeout.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Attempts per call for transient failures.
const MAX_ATTEMPTS: u32 = 3;

/// Initial retry backoff, doubled per attempt.
const INITIAL_BACKOFF: Duration = Duration::from_millis(500);

/// Bound on a single SSH readiness probe.
const PROBE_TIMEOUT: Duration = Duration::from_secs(30);

pub struct RunpodClient {
    http: reqwest::Client,
    config: CloudConfig,
}

impl RunpodClient {
    pub fn new(config: CloudConfig) -> Result<Self, CloudError> {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| CloudError::fatal(format!("failed to build HTTP client: {e}")))?;
        Ok(Self { http, config })
    }

    /// The container environment for a new worker: the spec's own entries
    /// plus the wiring every worker needs. `TASK_COMPLETE_URL` points at
    /// the endpoint that creates downstream generation records, never the
    /// status-only one.
    fn injected_env(&self, worker_id: &str, spec: &PodSpec) -> HashMap<String, String> {
        let mut env = spec.env.clone();
        env.insert("WORKER_ID".to_owned(), worker_id.to_owned());
        env.insert("SUPABASE_URL".to_owned(), self.config.supabase_url.clone());
        env.insert(
            "SUPABASE_SERVICE_ROLE_KEY".to_owned(),
            self.config.supabase_service_role_key.clone(),
        );
        env.insert("TASK_COMPLETE_URL".to_owned(), self.config.task_complete_url());
        env
    }

    async fn execute<T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        body: Option<serde_json::Value>,
    ) -> Result<T, CloudError> {
        let raw = self.execute_raw(method, path, body).await?;
        serde_json::from_str(&raw)
            .map_err(|e| CloudError::fatal(format!("malformed response from {path}: {e}")))
    }

    async fn execute_raw(
        &self,
        method: Method,
        path: &str,
        body: Option<serde_json::Value>,
    ) -> Result<String, CloudError> {
        let url = format!("{}{}", self.config.api_base.trim_end_matches('/'), path);
        let mut backoff = INITIAL_BACKOFF;

        for attempt in 1..=MAX_ATTEMPTS {
            let mut request = self
                .http
                .request(method.clone(), &url)
                .bearer_auth(&self.config.api_key);
            if let Some(ref body) = body {
                request = request.json(body);
            }

            let err = match request.send().await {
                Ok(response) => {
                    let status = response.status();
                    let text = response.text().await.unwrap_or_default();
                    if status.is_success() {
                        return Ok(text);
                    }
                    classify_status(status, &text)
                }
                Err(e) => classify_reqwest_error(&e),
            };

            if err.is_transient() && attempt < MAX_ATTEMPTS {
                tracing::warn!(
                    path = path,
                    attempt = attempt,
                    error = %err,
                    "transient cloud error, retrying in {:?}",
                    backoff
                );
                tokio::time::sleep(backoff).await;
                backoff *= 2;
            } else {
                return Err(err);
            }
        }

        unreachable!("loop either returns or exhausts attempts")
    }
}

#[async_trait]
impl CloudClient for RunpodClient {
    async fn create_pod(&self, worker_id: &str, spec: &PodSpec) -> Result<CreatedPod, CloudError> {
        let request = CreatePodRequest {
            name: worker_id.to_owned(),
            image_name: spec.container_image.clone(),
            gpu_type_ids: vec![spec.gpu_type_display_name.clone()],
            gpu_count: 1,
            container_disk_in_gb: spec.container_disk_gb,
            volume_in_gb: self.config.disk_size_gb,
            volume_mount_path: spec.volume_mount_path.clone(),
            network_volume_id: spec.network_volume_name.clone(),
            env: self.injected_env(worker_id, spec),
            ports: spec.ports.join(","),
            public_key: spec.ssh_public_key.clone(),
        };

        let body = serde_json::to_value(&request)
            .map_err(|e| CloudError::fatal(format!("failed to serialize pod spec: {e}")))?;

        let pod: PodResponse = self.execute(Method::POST, "/pods", Some(body)).await?;

        tracing::info!(
            worker_id = worker_id,
            cloud_id = %pod.id,
            "pod created"
        );

        Ok(CreatedPod {
            initial_state: pod.parsed_status().unwrap_or(DesiredStatus::Provisioning),
            cloud_id: pod.id,
        })
    }

    async fn terminate_pod(&self, cloud_id: &str) -> Result<TerminateOutcome, CloudError> {
        match self
            .execute_raw(Method::DELETE, &format!("/pods/{cloud_id}"), None)
            .await
        {
            Ok(_) => Ok(TerminateOutcome::Terminated),
            Err(err) if err.is_not_found() => Ok(TerminateOutcome::NotFound),
            Err(err) => Err(err),
        }
    }

    async fn get_pod_state(&self, cloud_id: &str) -> Result<PodState, CloudError> {
        let pod: PodResponse = self
            .execute(Method::GET, &format!("/pods/{cloud_id}"), None)
            .await?;
        Ok(pod.into_state())
    }

    async fn list_pods(&self) -> Result<Vec<PodSummary>, CloudError> {
        let pods: Vec<PodResponse> = self.execute(Method::GET, "/pods", None).await?;
        Ok(pods
            .into_iter()
            .map(|pod| PodSummary {
                desired_status: pod.parsed_status().unwrap_or(DesiredStatus::Provisioning),
                uptime_seconds: pod.uptime_seconds.unwrap_or(0),
                name: pod.name.clone().unwrap_or_default(),
                cloud_id: pod.id,
            })
            .collect())
    }

    async fn initialize_pod(&self, cloud_id: &str) -> Result<PodReadiness, CloudError> {
        let state = self.get_pod_state(cloud_id).await?;

        if state.desired_status.is_dead() {
            return Ok(PodReadiness::Failed(format!(
                "pod is {} before initialization",
                state.desired_status
            )));
        }
        if !state.ssh_reachable() {
            return Ok(PodReadiness::NotReady);
        }

        let target = ProbeTarget {
            host: state.ip.as_deref().unwrap_or_default().to_owned(),
            port: state.ssh_port.unwrap_or(22),
            username: "root".to_owned(),
            key_path: self.config.ssh_private_key_path.clone(),
            mount_path: self.config.volume_mount_path.clone(),
        };

        Ok(probe_pod_ready(&target, PROBE_TIMEOUT).await)
    }

    async fn check_connectivity(&self) -> Result<(), CloudError> {
        self.execute_raw(Method::GET, "/pods", None).await.map(|_| ())
    }
}

// ---------------------------------------------------------------------------
// Wire types
// ---------------------------------------------------------------------------

#[derive(Debug, serde::Serialize)]
#[serde(rename_all = "camelCase")]
struct CreatePodRequest {
    name: String,
    image_name: String,
    gpu_type_ids: Vec<String>,
    gpu_count: u32,
    container_disk_in_gb: u32,
    volume_in_gb: u32,
    volume_mount_path: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    network_volume_id: Option<String>,
    env: HashMap<String, String>,
    ports: String,
    public_key: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PodResponse {
    id: String,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    desired_status: Option<String>,
    #[serde(default)]
    public_ip: Option<String>,
    #[serde(default)]
    port_mappings: Option<HashMap<String, u16>>,
    #[serde(default)]
    ssh_password: Option<String>,
    #[serde(default)]
    uptime_seconds: Option<u64>,
    #[serde(default)]
    cost_per_hr: Option<f64>,
}

impl PodResponse {
    fn parsed_status(&self) -> Option<DesiredStatus> {
        self.desired_status.as_deref().and_then(|s| s.parse().ok())
    }

    fn into_state(self) -> PodState {
        PodState {
            desired_status: self.parsed_status().unwrap_or(DesiredStatus::Provisioning),
            ssh_port: self
                .port_mappings
                .as_ref()
                .and_then(|m| m.get("22").copied()),
            actual_status: self.desired_status,
            ip: self.public_ip,
            ssh_password: self.ssh_password,
            uptime_seconds: self.uptime_seconds.unwrap_or(0),
            hourly_cost: self.cost_per_hr,
        }
    }
}

// ---------------------------------------------------------------------------
// Error classification
// ---------------------------------------------------------------------------

fn classify_status(status: StatusCode, body: &str) -> CloudError {
    let detail = format!("HTTP {status}: {}", body.chars().take(300).collect::<String>());
    let kind = match status.as_u16() {
        401 | 403 => CloudErrorKind::Auth,
        404 => CloudErrorKind::NotFound,
        429 => CloudErrorKind::Transient,
        402 => CloudErrorKind::Quota,
        500..=599 => CloudErrorKind::Transient,
        _ if body.to_ascii_lowercase().contains("quota") => CloudErrorKind::Quota,
        _ => CloudErrorKind::Fatal,
    };
    CloudError::new(kind, detail)
}

fn classify_reqwest_error(err: &reqwest::Error) -> CloudError {
    if err.is_timeout() || err.is_connect() {
        CloudError::transient(format!("request failed: {err}"))
    } else {
        CloudError::fatal(format!("request failed: {err}"))
    }
}
