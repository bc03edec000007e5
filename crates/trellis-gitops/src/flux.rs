//! Flux backend: GitRepository, Kustomization, HelmRelease and the Flux
//! operator's ResourceSet as generator
//!
//! Flux has no single sync/health pair, so status is derived: a deployment is
//! Synced once the controller observed the latest generation and applied the
//! revision it last attempted, and Healthy once `Ready` is true and no
//! `Healthy` condition says otherwise.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde_json::{json, Map, Value};
use trellis_common::config::BackendKind;
use trellis_common::descriptor::{DeploymentDescriptor, GitSource, HelmSource, ManifestSource};
use trellis_common::kube_utils::{
    condition, condition_status, field_at, field_str, CONDITION_READY, STATUS_TRUE,
};
use trellis_common::{ObjectRef, MANAGED_BY_LABEL};

use crate::backend::{ControllerCredential, GitOpsBackend, InstallPlan, RefreshRequest};
use crate::source::{BackendSettings, GitCredentials};
use crate::status::{HealthState, ReconciliationStatus, SyncState};

/// apiVersion of Flux sources
pub const SOURCE_API_VERSION: &str = "source.toolkit.fluxcd.io/v1";
/// apiVersion of Kustomizations
pub const KUSTOMIZE_API_VERSION: &str = "kustomize.toolkit.fluxcd.io/v1";
/// apiVersion of HelmReleases
pub const HELM_API_VERSION: &str = "helm.toolkit.fluxcd.io/v2";
/// apiVersion of the Flux operator's ResourceSet
pub const RESOURCESET_API_VERSION: &str = "fluxcd.controlplane.io/v1";

const RECONCILE_ANNOTATION: &str = "reconcile.fluxcd.io/requestedAt";
const INTERVAL: &str = "10m";

/// Flux controller
#[derive(Debug, Clone)]
pub struct Flux {
    settings: BackendSettings,
}

impl Flux {
    /// Backend for controllers installed in `settings.namespace`
    pub fn new(settings: BackendSettings) -> Self {
        Self { settings }
    }

    fn source_name(&self) -> String {
        self.settings.root_name()
    }

    fn auth_secret_name(&self) -> String {
        format!("{}-auth", self.settings.root_name())
    }

    fn metadata(&self, name: &str) -> Value {
        json!({
            "name": name,
            "namespace": self.settings.namespace,
            "labels": { MANAGED_BY_LABEL: "trellis" }
        })
    }

    fn helm_manifests(&self, descriptor: &DeploymentDescriptor, helm: &HelmSource) -> Vec<Value> {
        let mut repository = json!({
            "apiVersion": SOURCE_API_VERSION,
            "kind": "HelmRepository",
            "metadata": self.metadata(&descriptor.name),
            "spec": { "interval": INTERVAL, "url": helm.registry }
        });
        if helm.registry.starts_with("oci://") {
            repository["spec"]["type"] = json!("oci");
        }

        let mut release = json!({
            "apiVersion": HELM_API_VERSION,
            "kind": "HelmRelease",
            "metadata": self.metadata(&descriptor.name),
            "spec": {
                "interval": INTERVAL,
                "releaseName": descriptor.name,
                "targetNamespace": descriptor.namespace,
                "install": { "createNamespace": true },
                "chart": { "spec": {
                    "chart": helm.chart,
                    "version": helm.version,
                    "sourceRef": { "kind": "HelmRepository", "name": descriptor.name }
                }}
            }
        });
        if let Some(values) = &helm.values {
            release["spec"]["values"] = values.clone();
        }
        vec![repository, release]
    }

    fn git_manifests(&self, descriptor: &DeploymentDescriptor, git: &GitSource) -> Vec<Value> {
        // Kustomizations do not create their target namespace
        let mut manifests = vec![json!({
            "apiVersion": "v1",
            "kind": "Namespace",
            "metadata": { "name": descriptor.namespace, "labels": { MANAGED_BY_LABEL: "trellis" } }
        })];

        let source_name = match &git.repo {
            None => self.source_name(),
            Some(url) => {
                let (_, revision) = self.settings.resolve_git(git);
                manifests.push(json!({
                    "apiVersion": SOURCE_API_VERSION,
                    "kind": "GitRepository",
                    "metadata": self.metadata(&descriptor.name),
                    "spec": { "interval": INTERVAL, "url": url, "ref": git_ref(revision) }
                }));
                descriptor.name.clone()
            }
        };

        manifests.push(json!({
            "apiVersion": KUSTOMIZE_API_VERSION,
            "kind": "Kustomization",
            "metadata": self.metadata(&descriptor.name),
            "spec": {
                "interval": INTERVAL,
                "path": format!("./{}", git.path.trim_start_matches("./")),
                "prune": true,
                "wait": true,
                "targetNamespace": descriptor.namespace,
                "sourceRef": { "kind": "GitRepository", "name": source_name }
            }
        }));
        manifests
    }

    fn resources_template(&self) -> String {
        let ns = &self.settings.namespace;
        let root = self.source_name();
        format!(
            r#"<<- if eq inputs.kind "helm" >>
apiVersion: {SOURCE_API_VERSION}
kind: HelmRepository
metadata:
  name: << inputs.name >>
  namespace: {ns}
spec:
  interval: {INTERVAL}
  url: << inputs.registry >>
  << if hasPrefix "oci://" inputs.registry >>type: oci<< end >>
---
apiVersion: {HELM_API_VERSION}
kind: HelmRelease
metadata:
  name: << inputs.name >>
  namespace: {ns}
spec:
  interval: {INTERVAL}
  releaseName: << inputs.name >>
  targetNamespace: << inputs.namespace >>
  install:
    createNamespace: true
  chart:
    spec:
      chart: << inputs.chart >>
      version: << inputs.version | quote >>
      sourceRef:
        kind: HelmRepository
        name: << inputs.name >>
  values: << inputs.values | toJson >>
<<- else >>
apiVersion: v1
kind: Namespace
metadata:
  name: << inputs.namespace >>
<<- if ne inputs.repo "" >>
---
apiVersion: {SOURCE_API_VERSION}
kind: GitRepository
metadata:
  name: << inputs.name >>
  namespace: {ns}
spec:
  interval: {INTERVAL}
  url: << inputs.repo >>
  ref:
    name: << inputs.ref >>
<<- end >>
---
apiVersion: {KUSTOMIZE_API_VERSION}
kind: Kustomization
metadata:
  name: << inputs.name >>
  namespace: {ns}
spec:
  interval: {INTERVAL}
  path: << inputs.path >>
  prune: true
  wait: true
  targetNamespace: << inputs.namespace >>
  sourceRef:
    kind: GitRepository
    name: << if ne inputs.repo "" >><< inputs.name >><< else >>{root}<< end >>
<<- end >>
"#
        )
    }

    fn generator_input(&self, item: &DeploymentDescriptor) -> Value {
        match &item.source {
            ManifestSource::Helm(helm) => json!({
                "kind": "helm",
                "name": item.name,
                "namespace": item.namespace,
                "registry": helm.registry,
                "chart": helm.chart,
                "version": helm.version,
                "values": helm.values.clone().unwrap_or_else(|| json!({}))
            }),
            ManifestSource::Git(git) => {
                let (_, revision) = self.settings.resolve_git(git);
                json!({
                    "kind": "git",
                    "name": item.name,
                    "namespace": item.namespace,
                    "repo": git.repo.clone().unwrap_or_default(),
                    "ref": full_ref(revision),
                    "path": format!("./{}", git.path.trim_start_matches("./"))
                })
            }
        }
    }
}

/// Flux GitRepository `ref` for a revision: commit SHA, version tag or branch
fn git_ref(revision: &str) -> Value {
    if revision.len() == 40 && revision.chars().all(|c| c.is_ascii_hexdigit()) {
        json!({ "commit": revision })
    } else if is_version_tag(revision) {
        json!({ "tag": revision })
    } else {
        json!({ "branch": revision })
    }
}

fn full_ref(revision: &str) -> String {
    if revision.starts_with("refs/") {
        revision.to_string()
    } else if is_version_tag(revision) {
        format!("refs/tags/{}", revision)
    } else {
        format!("refs/heads/{}", revision)
    }
}

fn is_version_tag(revision: &str) -> bool {
    let rest = revision.strip_prefix('v').unwrap_or(revision);
    rest.starts_with(|c: char| c.is_ascii_digit()) && rest.contains('.')
}

fn flux_sync(object: &Value) -> SyncState {
    if object.get("status").is_none() {
        return SyncState::Unknown;
    }
    let generation = field_at(object, ".metadata.generation").and_then(Value::as_i64);
    let observed = field_at(object, ".status.observedGeneration").and_then(Value::as_i64);
    if let (Some(generation), Some(observed)) = (generation, observed) {
        if observed < generation {
            return SyncState::OutOfSync;
        }
    }

    let is_helm_release = object.get("kind").and_then(Value::as_str) == Some("HelmRelease");
    match field_str(object, ".status.lastAppliedRevision") {
        Some(applied) if !is_helm_release => {
            match field_str(object, ".status.lastAttemptedRevision") {
                Some(attempted) if attempted != applied => SyncState::OutOfSync,
                _ => SyncState::Synced,
            }
        }
        _ => helm_release_sync(object),
    }
}

/// HelmRelease v2 drops `lastAppliedRevision`; the `Released` condition and
/// the latest history entry say whether the attempted chart is installed
fn helm_release_sync(object: &Value) -> SyncState {
    match condition_status(object, "Released") {
        Some(STATUS_TRUE) => return SyncState::Synced,
        Some(_) => return SyncState::OutOfSync,
        None => {}
    }
    let attempted = field_str(object, ".status.lastAttemptedRevision");
    let installed = field_at(object, ".status.history")
        .and_then(Value::as_array)
        .and_then(|history| history.first())
        .and_then(|latest| latest.get("chartVersion"))
        .and_then(Value::as_str);
    match (attempted, installed) {
        (Some(attempted), Some(installed)) if attempted == installed => SyncState::Synced,
        (Some(_), _) => SyncState::OutOfSync,
        (None, _) => SyncState::Unknown,
    }
}

fn flux_health(object: &Value) -> HealthState {
    if condition_status(object, "Stalled") == Some(STATUS_TRUE) {
        return HealthState::Degraded;
    }
    let Some(ready) = condition(object, CONDITION_READY) else {
        return HealthState::Unknown;
    };
    match ready.get("status").and_then(Value::as_str) {
        Some(STATUS_TRUE) => match condition_status(object, "Healthy") {
            Some(status) if status != STATUS_TRUE => HealthState::Progressing,
            _ => HealthState::Healthy,
        },
        Some("False") => match ready.get("reason").and_then(Value::as_str) {
            Some("Progressing") | Some("DependencyNotReady") | Some("ProgressingWithRetry") => {
                HealthState::Progressing
            }
            Some("ArtifactFailed") | Some("SourceNotFound") => HealthState::Missing,
            _ => HealthState::Degraded,
        },
        _ => HealthState::Progressing,
    }
}

impl GitOpsBackend for Flux {
    fn kind(&self) -> BackendKind {
        BackendKind::Flux
    }

    fn install_plan(&self) -> InstallPlan {
        InstallPlan {
            manifest: self.settings.install_manifest.clone(),
            namespace: self.settings.namespace.clone(),
            deployments: [
                "source-controller",
                "kustomize-controller",
                "helm-controller",
                "flux-operator",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
        }
    }

    fn source_manifests(&self) -> Vec<Value> {
        let mut manifests = Vec::new();
        let mut spec = json!({
            "interval": "1m",
            "url": self.settings.repo_url,
            "ref": { "branch": self.settings.branch }
        });

        if let Some(credentials) = &self.settings.credentials {
            let mut data = Map::new();
            let mut put = |key: &str, value: &str| {
                data.insert(key.to_string(), Value::String(STANDARD.encode(value)));
            };
            match credentials {
                GitCredentials::Token { username, token } => {
                    put("username", username);
                    put("password", token);
                }
                GitCredentials::SshKey { private_key, .. } => put("identity", private_key),
            }
            manifests.push(json!({
                "apiVersion": "v1",
                "kind": "Secret",
                "metadata": self.metadata(&self.auth_secret_name()),
                "type": "Opaque",
                "data": data
            }));
            spec["secretRef"] = json!({ "name": self.auth_secret_name() });
        }

        manifests.push(json!({
            "apiVersion": SOURCE_API_VERSION,
            "kind": "GitRepository",
            "metadata": self.metadata(&self.source_name()),
            "spec": spec
        }));
        manifests
    }

    fn workload_manifests(&self, descriptor: &DeploymentDescriptor) -> Vec<Value> {
        match &descriptor.source {
            ManifestSource::Helm(helm) => self.helm_manifests(descriptor, helm),
            ManifestSource::Git(git) => self.git_manifests(descriptor, git),
        }
    }

    fn status_ref(&self, descriptor: &DeploymentDescriptor) -> ObjectRef {
        let (api_version, kind) = match descriptor.source {
            ManifestSource::Helm(_) => (HELM_API_VERSION, "HelmRelease"),
            ManifestSource::Git(_) => (KUSTOMIZE_API_VERSION, "Kustomization"),
        };
        ObjectRef::namespaced(api_version, kind, &self.settings.namespace, &descriptor.name)
    }

    fn parse_status(&self, object: &Value) -> ReconciliationStatus {
        ReconciliationStatus::new(flux_sync(object), flux_health(object))
    }

    fn generator_ref(&self, name: &str) -> ObjectRef {
        ObjectRef::namespaced(RESOURCESET_API_VERSION, "ResourceSet", &self.settings.namespace, name)
    }

    fn generator_up_to_date(&self, object: &Value) -> bool {
        let generation = field_at(object, ".metadata.generation").and_then(Value::as_i64);
        let observed = field_at(object, ".status.observedGeneration").and_then(Value::as_i64);
        let current = match (generation, observed) {
            (Some(generation), Some(observed)) => observed >= generation,
            _ => true,
        };
        current && condition_status(object, CONDITION_READY) == Some(STATUS_TRUE)
    }

    fn generator_manifest(&self, name: &str, items: &[DeploymentDescriptor]) -> Value {
        let inputs: Vec<Value> = items.iter().map(|i| self.generator_input(i)).collect();
        json!({
            "apiVersion": RESOURCESET_API_VERSION,
            "kind": "ResourceSet",
            "metadata": self.metadata(name),
            "spec": {
                "inputs": inputs,
                "resourcesTemplate": self.resources_template()
            }
        })
    }

    fn refresh_ref(&self) -> ObjectRef {
        ObjectRef::namespaced(
            SOURCE_API_VERSION,
            "GitRepository",
            &self.settings.namespace,
            self.source_name(),
        )
    }

    fn refresh_request(&self) -> RefreshRequest {
        let token = chrono::Utc::now().to_rfc3339();
        RefreshRequest {
            patch: json!({ "metadata": { "annotations": { RECONCILE_ANNOTATION: token } } }),
            token,
        }
    }

    fn refresh_complete(&self, object: &Value, token: &str) -> bool {
        field_str(object, ".status.lastHandledReconcileAt") == Some(token)
    }

    fn controller_credentials(&self) -> Vec<ControllerCredential> {
        Vec::new()
    }
}
