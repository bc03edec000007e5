//! Cluster API seam and the idempotent resource applier
//!
//! Stages talk to Kubernetes through [`ClusterApi`], which works on untyped
//! JSON objects so the same code path handles core resources and the custom
//! resources of whichever GitOps controller is in use. [`KubeClusterApi`] is
//! the kube-rs implementation: API discovery for scope and plural, server-side
//! apply for idempotency, and bounded retries for contention.

use std::collections::HashMap;
use std::fmt;
use std::path::Path;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use kube::api::{Api, DynamicObject, GroupVersionKind, ListParams, Patch, PatchParams};
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::discovery::{ApiCapabilities, ApiResource, Scope};
use kube::{Client, Config};
#[cfg(any(test, feature = "mock"))]
use mockall::automock;
use serde_json::Value;
use tracing::{debug, info};

use crate::kube_utils::{parse_api_version, parse_manifest};
use crate::retry::{retry_with_backoff, RetryConfig};
use crate::{Error, FIELD_MANAGER};

/// Default connection timeout for kube clients
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
/// Default read timeout for kube clients
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(30);

/// Reference to a single object in the cluster
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ObjectRef {
    /// apiVersion, e.g. `argoproj.io/v1alpha1`
    pub api_version: String,
    /// Kind, e.g. `Application`
    pub kind: String,
    /// Object name
    pub name: String,
    /// Namespace; `None` for cluster-scoped objects
    pub namespace: Option<String>,
}

impl ObjectRef {
    /// Reference a namespaced object
    pub fn namespaced(
        api_version: impl Into<String>,
        kind: impl Into<String>,
        namespace: impl Into<String>,
        name: impl Into<String>,
    ) -> Self {
        Self {
            api_version: api_version.into(),
            kind: kind.into(),
            name: name.into(),
            namespace: Some(namespace.into()),
        }
    }

    /// Reference a cluster-scoped object
    pub fn cluster(
        api_version: impl Into<String>,
        kind: impl Into<String>,
        name: impl Into<String>,
    ) -> Self {
        Self {
            api_version: api_version.into(),
            kind: kind.into(),
            name: name.into(),
            namespace: None,
        }
    }

    /// Build a reference from a manifest's apiVersion/kind/metadata
    pub fn from_manifest(manifest: &Value) -> Result<Self, Error> {
        let meta = parse_manifest(manifest)?;
        Ok(Self {
            api_version: meta.api_version,
            kind: meta.kind,
            name: meta.name,
            namespace: meta.namespace,
        })
    }
}

impl fmt::Display for ObjectRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{} {}/{}", self.kind, ns, self.name),
            None => write!(f, "{} {}", self.kind, self.name),
        }
    }
}

/// A resource type to list, optionally restricted to one namespace
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TypeRef {
    /// apiVersion of the listed kind
    pub api_version: String,
    /// Kind to list
    pub kind: String,
    /// Namespace; `None` lists across all namespaces
    pub namespace: Option<String>,
}

impl TypeRef {
    /// List a kind across the cluster
    pub fn all(api_version: impl Into<String>, kind: impl Into<String>) -> Self {
        Self {
            api_version: api_version.into(),
            kind: kind.into(),
            namespace: None,
        }
    }
}

/// Result of applying desired state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// Object did not exist before
    Created,
    /// Object existed and the apply changed it
    Updated,
    /// Object existed and the apply produced no change
    Unchanged,
}

impl ApplyOutcome {
    /// Classify an apply by the object's `resourceVersion` before and after.
    /// The API server bumps it only when the stored object changes.
    pub fn classify(before: Option<&str>, after: Option<&str>) -> Self {
        match before {
            None => Self::Created,
            Some(rv) if after == Some(rv) => Self::Unchanged,
            Some(_) => Self::Updated,
        }
    }
}

impl fmt::Display for ApplyOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Created => "created",
            Self::Updated => "updated",
            Self::Unchanged => "unchanged",
        };
        f.write_str(s)
    }
}

/// Cluster operations the bootstrap stages depend on.
#[cfg_attr(any(test, feature = "mock"), automock)]
#[async_trait]
pub trait ClusterApi: Send + Sync {
    /// Apply a desired-state object. Safe to repeat with identical input.
    async fn apply(&self, manifest: &Value) -> Result<ApplyOutcome, Error>;

    /// Get an object as a JSON snapshot; `Ok(None)` if it does not exist.
    async fn get(&self, object: &ObjectRef) -> Result<Option<Value>, Error>;

    /// Merge-patch an existing object.
    async fn patch_merge(&self, object: &ObjectRef, patch: &Value) -> Result<(), Error>;

    /// List objects of a kind.
    async fn list(&self, types: &TypeRef) -> Result<Vec<Value>, Error>;
}

/// Create a kube client from an optional kubeconfig path with default timeouts
pub async fn create_client(kubeconfig: Option<&Path>) -> Result<Client, Error> {
    let mut config = match kubeconfig {
        Some(path) => {
            let kubeconfig = Kubeconfig::read_from(path).map_err(|e| {
                Error::config(format!(
                    "failed to read kubeconfig {}: {}",
                    path.display(),
                    e
                ))
            })?;
            Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
                .await
                .map_err(|e| Error::config(format!("failed to load kubeconfig: {}", e)))?
        }
        None => Config::infer()
            .await
            .map_err(|e| Error::config(format!("failed to infer kube config: {}", e)))?,
    };
    config.connect_timeout = Some(DEFAULT_CONNECT_TIMEOUT);
    config.read_timeout = Some(DEFAULT_READ_TIMEOUT);
    Client::try_from(config)
        .map_err(|e| Error::fatal("create_client", format!("failed to create client: {}", e)))
}

/// kube-rs backed [`ClusterApi`]
pub struct KubeClusterApi {
    client: Client,
    retry: RetryConfig,
    discovered: Mutex<HashMap<String, (ApiResource, ApiCapabilities)>>,
}

impl KubeClusterApi {
    /// Wrap an existing client
    pub fn new(client: Client) -> Self {
        Self {
            client,
            retry: RetryConfig::default(),
            discovered: Mutex::new(HashMap::new()),
        }
    }

    /// Connect using a kubeconfig path, or the inferred config if `None`
    pub async fn connect(kubeconfig: Option<&Path>) -> Result<Self, Error> {
        Ok(Self::new(create_client(kubeconfig).await?))
    }

    /// Underlying client, for collaborators that need typed APIs (pod exec)
    pub fn client(&self) -> &Client {
        &self.client
    }

    async fn resolve(
        &self,
        api_version: &str,
        kind: &str,
    ) -> Result<(ApiResource, ApiCapabilities), Error> {
        let key = format!("{}/{}", api_version, kind);
        if let Some(found) = self.cached(&key) {
            return Ok(found);
        }

        let (group, version) = parse_api_version(api_version);
        let gvk = GroupVersionKind::gvk(&group, &version, kind);
        let resolved = kube::discovery::pinned_kind(&self.client, &gvk)
            .await
            .map_err(|e| Error::from_kube(format!("discover {}", key), e))?;

        debug!(kind = %key, plural = %resolved.0.plural, "Discovered API resource");
        if let Ok(mut cache) = self.discovered.lock() {
            cache.insert(key, resolved.clone());
        }
        Ok(resolved)
    }

    fn cached(&self, key: &str) -> Option<(ApiResource, ApiCapabilities)> {
        self.discovered
            .lock()
            .ok()
            .and_then(|cache| cache.get(key).cloned())
    }

    async fn api_for(
        &self,
        api_version: &str,
        kind: &str,
        namespace: Option<&str>,
    ) -> Result<Api<DynamicObject>, Error> {
        let (ar, caps) = self.resolve(api_version, kind).await?;
        Ok(match (caps.scope, namespace) {
            (Scope::Namespaced, Some(ns)) => Api::namespaced_with(self.client.clone(), ns, &ar),
            (Scope::Namespaced, None) => Api::default_namespaced_with(self.client.clone(), &ar),
            (Scope::Cluster, _) => Api::all_with(self.client.clone(), &ar),
        })
    }

    async fn apply_once(&self, manifest: &Value) -> Result<ApplyOutcome, Error> {
        let meta = parse_manifest(manifest)?;
        let target = format!("{}/{}", meta.kind, meta.name);
        let api = self
            .api_for(&meta.api_version, &meta.kind, meta.namespace.as_deref())
            .await?;

        let before = api
            .get_opt(&meta.name)
            .await
            .map_err(|e| Error::from_kube(format!("get {}", target), e))?
            .and_then(|obj| obj.metadata.resource_version);

        let params = PatchParams::apply(FIELD_MANAGER).force();
        let applied = api
            .patch(&meta.name, &params, &Patch::Apply(manifest))
            .await
            .map_err(|e| Error::from_kube(format!("apply {}", target), e))?;

        Ok(ApplyOutcome::classify(
            before.as_deref(),
            applied.metadata.resource_version.as_deref(),
        ))
    }
}

#[async_trait]
impl ClusterApi for KubeClusterApi {
    async fn apply(&self, manifest: &Value) -> Result<ApplyOutcome, Error> {
        let target = ObjectRef::from_manifest(manifest)?;
        let outcome = retry_with_backoff(&self.retry, &format!("apply {}", target), || {
            self.apply_once(manifest)
        })
        .await?;
        info!(object = %target, outcome = %outcome, "Applied");
        Ok(outcome)
    }

    async fn get(&self, object: &ObjectRef) -> Result<Option<Value>, Error> {
        let api = self
            .api_for(&object.api_version, &object.kind, object.namespace.as_deref())
            .await?;
        let found = api
            .get_opt(&object.name)
            .await
            .map_err(|e| Error::from_kube(format!("get {}", object), e))?;
        found.map(serde_json::to_value).transpose().map_err(Error::from)
    }

    async fn patch_merge(&self, object: &ObjectRef, patch: &Value) -> Result<(), Error> {
        let api = self
            .api_for(&object.api_version, &object.kind, object.namespace.as_deref())
            .await?;
        let api = &api;
        retry_with_backoff(&self.retry, &format!("patch {}", object), || async move {
            api.patch(&object.name, &PatchParams::default(), &Patch::Merge(patch))
                .await
                .map(|_| ())
                .map_err(|e| Error::from_kube(format!("patch {}", object), e))
        })
        .await
    }

    async fn list(&self, types: &TypeRef) -> Result<Vec<Value>, Error> {
        let (ar, caps) = self.resolve(&types.api_version, &types.kind).await?;
        let api: Api<DynamicObject> = match (caps.scope, types.namespace.as_deref()) {
            (Scope::Namespaced, Some(ns)) => Api::namespaced_with(self.client.clone(), ns, &ar),
            _ => Api::all_with(self.client.clone(), &ar),
        };
        let list = api
            .list(&ListParams::default())
            .await
            .map_err(|e| Error::from_kube(format!("list {}", types.kind), e))?;
        list.items
            .into_iter()
            .map(|obj| serde_json::to_value(obj).map_err(Error::from))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn object_ref_from_manifest() {
        let manifest = json!({
            "apiVersion": "argoproj.io/v1alpha1",
            "kind": "Application",
            "metadata": { "name": "ingress-nginx", "namespace": "argocd" }
        });
        let obj = ObjectRef::from_manifest(&manifest).unwrap();
        assert_eq!(
            obj,
            ObjectRef::namespaced("argoproj.io/v1alpha1", "Application", "argocd", "ingress-nginx")
        );
        assert_eq!(obj.to_string(), "Application argocd/ingress-nginx");
    }

    #[test]
    fn apply_outcome_from_resource_versions() {
        assert_eq!(ApplyOutcome::classify(None, Some("1")), ApplyOutcome::Created);
        assert_eq!(ApplyOutcome::classify(Some("41"), Some("42")), ApplyOutcome::Updated);
        assert_eq!(ApplyOutcome::classify(Some("42"), Some("42")), ApplyOutcome::Unchanged);
        assert_eq!(ApplyOutcome::classify(Some("42"), None), ApplyOutcome::Updated);
    }

    #[test]
    fn cluster_scoped_display() {
        let obj = ObjectRef::cluster("v1", "Namespace", "vault");
        assert_eq!(obj.to_string(), "Namespace vault");
    }

    #[test]
    fn object_ref_requires_name() {
        let manifest = json!({ "apiVersion": "v1", "kind": "Secret", "metadata": {} });
        assert!(matches!(
            ObjectRef::from_manifest(&manifest),
            Err(Error::Fatal { .. })
        ));
    }
}
