//! GPU cloud adapter.
//!
//! [`CloudClient`] is the seam the orchestrator core sees; [`RunpodClient`]
//! is the production implementation over the RunPod REST API. Pod readiness
//! probing runs over the pod's SSH channel (`probe`).

pub mod client;
pub mod config;
pub mod error;
pub mod probe;
pub mod runpod;
pub mod types;

pub use client::CloudClient;
pub use config::CloudConfig;
pub use error::{CloudError, CloudErrorKind};
pub use runpod::RunpodClient;
pub use types::{
    CreatedPod, DesiredStatus, PodReadiness, PodSpec, PodState, PodSummary, TerminateOutcome,
};
