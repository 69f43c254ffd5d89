//! The `CloudClient` trait -- the adapter interface for GPU cloud providers.
//!
//! The trait is object-safe so the control loop can hold an
//! `Arc<dyn CloudClient>` and tests can install scripted fakes.

use async_trait::async_trait;

use crate::error::CloudError;
use crate::types::{CreatedPod, PodReadiness, PodSpec, PodState, PodSummary, TerminateOutcome};

/// Adapter interface for creating, querying, and terminating GPU pods.
#[async_trait]
pub trait CloudClient: Send + Sync {
    /// Create a pod named `worker_id`.
    ///
    /// Implementations must inject `WORKER_ID`, the task-store credentials,
    /// and the task-completion endpoint URL into the container environment
    /// before submitting the spec; this adapter is the single point of
    /// truth for that wiring.
    async fn create_pod(&self, worker_id: &str, spec: &PodSpec) -> Result<CreatedPod, CloudError>;

    /// Terminate a pod. A pod that no longer exists is reported as
    /// [`TerminateOutcome::NotFound`], which callers treat as success.
    async fn terminate_pod(&self, cloud_id: &str) -> Result<TerminateOutcome, CloudError>;

    /// Fetch the current provider-side state of a pod.
    async fn get_pod_state(&self, cloud_id: &str) -> Result<PodState, CloudError>;

    /// List all pods visible to this account. Used for orphan-pod
    /// reconciliation.
    async fn list_pods(&self) -> Result<Vec<PodSummary>, CloudError>;

    /// Run a bounded readiness probe against a pod. Idempotent; returns
    /// [`PodReadiness::NotReady`] for transient states.
    async fn initialize_pod(&self, cloud_id: &str) -> Result<PodReadiness, CloudError>;

    /// Cheap authenticated request to verify credentials and reachability
    /// at startup.
    async fn check_connectivity(&self) -> Result<(), CloudError>;
}

// Compile-time assertion: CloudClient must be object-safe.
const _: () = {
    fn _assert_object_safe(_: &dyn CloudClient) {}
};
