//! GitOps controllers for trellis
//!
//! [`GitOpsBackend`] abstracts over Argo CD and Flux. [`DeploymentSequencer`]
//! submits deployments through a backend and blocks until each reports
//! Synced and Healthy.

#![deny(missing_docs)]

pub mod argocd;
pub mod backend;
pub mod flux;
pub mod sequencer;
pub mod source;
pub mod status;

pub use backend::{backend_for, ControllerCredential, GitOpsBackend, InstallPlan, RefreshRequest};
pub use sequencer::{DeploymentSequencer, RefreshOutcome, SequencerTimeouts};
pub use source::{BackendSettings, GitCredentials};
pub use status::{HealthState, ReconciliationStatus, SyncState};
