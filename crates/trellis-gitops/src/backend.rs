//! Capability interface over a GitOps controller
//!
//! The sequencer is written once against [`GitOpsBackend`]; Argo CD and Flux
//! differ only in the objects they generate and how they report status.
//! Backends are pure: they build manifests and interpret snapshots, and the
//! sequencer does all cluster I/O.

use std::path::PathBuf;

#[cfg(any(test, feature = "mock"))]
use mockall::automock;
use serde_json::Value;
use trellis_common::config::BackendKind;
use trellis_common::descriptor::DeploymentDescriptor;
use trellis_common::ObjectRef;
use trellis_secrets::SecretTarget;

use crate::argocd::ArgoCd;
use crate::flux::Flux;
use crate::source::BackendSettings;
use crate::status::ReconciliationStatus;

/// How to install the controller
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstallPlan {
    /// Multi-document YAML to apply
    pub manifest: PathBuf,
    /// Namespace the controller runs in
    pub namespace: String,
    /// Deployments that must be Available before the controller is usable
    pub deployments: Vec<String>,
}

/// A random credential the controller needs
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControllerCredential {
    /// Credential identity in the local store
    pub identity: String,
    /// Field name of the generated value
    pub field: String,
    /// Length of the generated value
    pub length: usize,
    /// Where it is published
    pub target: SecretTarget,
}

/// Merge patch that makes the controller re-read its source
#[derive(Debug, Clone, PartialEq)]
pub struct RefreshRequest {
    /// Patch for [`GitOpsBackend::refresh_ref`]
    pub patch: Value,
    /// Token [`GitOpsBackend::refresh_complete`] compares against
    pub token: String,
}

/// A GitOps controller flavour
#[cfg_attr(any(test, feature = "mock"), automock)]
pub trait GitOpsBackend: Send + Sync {
    /// Which controller this is
    fn kind(&self) -> BackendKind;

    /// Controller install manifest and readiness gates
    fn install_plan(&self) -> InstallPlan;

    /// Objects registering the config repository with the controller
    fn source_manifests(&self) -> Vec<Value>;

    /// Objects that make the controller deploy `descriptor`
    fn workload_manifests(&self, descriptor: &DeploymentDescriptor) -> Vec<Value>;

    /// Object whose status reports the reconciliation of `descriptor`
    fn status_ref(&self, descriptor: &DeploymentDescriptor) -> ObjectRef;

    /// Interpret a status object snapshot
    fn parse_status(&self, object: &Value) -> ReconciliationStatus;

    /// Generator object that fans out into one deployment per item
    fn generator_ref(&self, name: &str) -> ObjectRef;

    /// Whether the generator reports every derived object as up to date
    fn generator_up_to_date(&self, object: &Value) -> bool;

    /// Generator manifest for `items`, committed to the config repository
    fn generator_manifest(&self, name: &str, items: &[DeploymentDescriptor]) -> Value;

    /// Object a refresh is requested on
    fn refresh_ref(&self) -> ObjectRef;

    /// Patch requesting a refresh, stamped with a fresh token
    fn refresh_request(&self) -> RefreshRequest;

    /// Whether the controller has handled the refresh carrying `token`
    fn refresh_complete(&self, object: &Value, token: &str) -> bool;

    /// Random credentials the controller expects to find in the cluster
    fn controller_credentials(&self) -> Vec<ControllerCredential>;
}

/// Backend for the configured controller
pub fn backend_for(kind: BackendKind, settings: BackendSettings) -> Box<dyn GitOpsBackend> {
    match kind {
        BackendKind::Argocd => Box::new(ArgoCd::new(settings)),
        BackendKind::Flux => Box::new(Flux::new(settings)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::test_settings;

    #[test]
    fn backend_for_selects_controller() {
        let argo = backend_for(BackendKind::Argocd, test_settings("argocd"));
        assert_eq!(argo.kind(), BackendKind::Argocd);
        assert_eq!(argo.install_plan().namespace, "argocd");

        let flux = backend_for(BackendKind::Flux, test_settings("flux-system"));
        assert_eq!(flux.kind(), BackendKind::Flux);
        assert!(flux
            .install_plan()
            .deployments
            .contains(&"source-controller".to_string()));
    }
}
