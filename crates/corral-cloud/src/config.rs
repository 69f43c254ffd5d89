use std::collections::HashMap;
use std::path::PathBuf;

use anyhow::{Context, Result, bail};

use crate::types::PodSpec;

/// The edge function workers must call to report completions. This is the
/// endpoint that creates downstream generation records; the status-only
/// endpoint must never be injected.
pub const COMPLETE_TASK_FN: &str = "complete-task-with-generation";

/// Default REST API base.
pub const DEFAULT_API_BASE: &str = "https://rest.runpod.io/v1";

/// Cloud adapter configuration, read from the environment at startup.
///
/// Missing required variables are a fatal configuration error: the process
/// exits non-zero before the first cycle.
#[derive(Debug, Clone)]
pub struct CloudConfig {
    pub api_key: String,
    pub api_base: String,
    pub gpu_type: String,
    pub worker_image: String,
    pub storage_name: Option<String>,
    pub volume_mount_path: String,
    pub disk_size_gb: u32,
    pub container_disk_gb: u32,
    pub ssh_public_key: String,
    pub ssh_private_key_path: Option<PathBuf>,
    /// Store endpoint + credentials injected into every worker.
    pub supabase_url: String,
    pub supabase_service_role_key: String,
}

impl CloudConfig {
    /// Build from process environment.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary lookup function (testable without touching
    /// the process environment).
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let required = |key: &str| -> Result<String> {
            lookup(key).with_context(|| format!("missing required environment variable {key}"))
        };

        let disk_size_gb = parse_u32(&lookup, "RUNPOD_DISK_SIZE_GB", 100)?;
        let container_disk_gb = parse_u32(&lookup, "RUNPOD_CONTAINER_DISK_GB", 20)?;

        Ok(Self {
            api_key: required("RUNPOD_API_KEY")?,
            api_base: lookup("RUNPOD_API_BASE").unwrap_or_else(|| DEFAULT_API_BASE.to_owned()),
            gpu_type: required("RUNPOD_GPU_TYPE")?,
            worker_image: required("RUNPOD_WORKER_IMAGE")?,
            storage_name: lookup("RUNPOD_STORAGE_NAME"),
            volume_mount_path: lookup("RUNPOD_VOLUME_MOUNT_PATH")
                .unwrap_or_else(|| "/workspace".to_owned()),
            disk_size_gb,
            container_disk_gb,
            ssh_public_key: required("RUNPOD_SSH_PUBLIC_KEY")?,
            ssh_private_key_path: lookup("RUNPOD_SSH_PRIVATE_KEY").map(PathBuf::from),
            supabase_url: required("SUPABASE_URL")?,
            supabase_service_role_key: required("SUPABASE_SERVICE_ROLE_KEY")?,
        })
    }

    /// The completion endpoint URL injected into worker environments.
    pub fn task_complete_url(&self) -> String {
        format!(
            "{}/functions/v1/{}",
            self.supabase_url.trim_end_matches('/'),
            COMPLETE_TASK_FN
        )
    }

    /// Build the pod spec for a new worker from this configuration.
    pub fn pod_spec(&self) -> PodSpec {
        PodSpec {
            gpu_type_display_name: self.gpu_type.clone(),
            container_image: self.worker_image.clone(),
            container_disk_gb: self.container_disk_gb,
            volume_mount_path: self.volume_mount_path.clone(),
            network_volume_name: self.storage_name.clone(),
            env: HashMap::new(),
            ssh_public_key: self.ssh_public_key.clone(),
            ports: vec!["22/tcp".to_owned()],
        }
    }
}

fn parse_u32(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: u32,
) -> Result<u32> {
    match lookup(key) {
        None => Ok(default),
        Some(raw) => match raw.parse::<u32>() {
            Ok(v) => Ok(v),
            Err(_) => bail!("environment variable {key} is not a valid integer: {raw:?}"),
        },
    }
}
