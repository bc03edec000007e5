//! Kubernetes helpers built on [`ClusterApi`]
//!
//! Manifest parsing, field lookups on JSON snapshots, and the standard waits
//! (nodes ready, deployments available, object condition) used by the
//! bootstrap stages.

use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, info};

use crate::cluster::{ApplyOutcome, ClusterApi, ObjectRef, TypeRef};
use crate::config::IngressAddressSource;
use crate::poll::{wait_until, PollResult, WaitSpec};
use crate::Error;

/// The "Ready" condition type
pub const CONDITION_READY: &str = "Ready";
/// The "Available" condition type for deployments
pub const CONDITION_AVAILABLE: &str = "Available";
/// The "True" status value for conditions
pub const STATUS_TRUE: &str = "True";

/// apiVersion/kind/name/namespace extracted from a manifest
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManifestMetadata {
    /// apiVersion
    pub api_version: String,
    /// Kind
    pub kind: String,
    /// metadata.name
    pub name: String,
    /// metadata.namespace
    pub namespace: Option<String>,
}

/// Extract identifying metadata from a manifest
pub fn parse_manifest(manifest: &Value) -> Result<ManifestMetadata, Error> {
    let field = |pointer: &str| manifest.pointer(pointer).and_then(|v| v.as_str());

    let api_version = field("/apiVersion")
        .ok_or_else(|| Error::fatal("parse_manifest", "manifest missing apiVersion"))?;
    let kind =
        field("/kind").ok_or_else(|| Error::fatal("parse_manifest", "manifest missing kind"))?;
    let name = field("/metadata/name")
        .ok_or_else(|| Error::fatal("parse_manifest", "manifest missing metadata.name"))?;

    Ok(ManifestMetadata {
        api_version: api_version.to_string(),
        kind: kind.to_string(),
        name: name.to_string(),
        namespace: field("/metadata/namespace").map(str::to_string),
    })
}

/// Parse apiVersion into (group, version)
///
/// # Examples
/// ```
/// use trellis_common::kube_utils::parse_api_version;
///
/// assert_eq!(parse_api_version("apps/v1"), ("apps".to_string(), "v1".to_string()));
/// assert_eq!(parse_api_version("v1"), (String::new(), "v1".to_string()));
/// ```
pub fn parse_api_version(api_version: &str) -> (String, String) {
    match api_version.split_once('/') {
        Some((group, version)) => (group.to_string(), version.to_string()),
        None => (String::new(), api_version.to_string()),
    }
}

/// Split a multi-document YAML stream into JSON objects, skipping empty documents
pub fn parse_documents(yaml: &str) -> Result<Vec<Value>, Error> {
    let mut docs = Vec::new();
    for doc in serde_yaml::Deserializer::from_str(yaml) {
        let value = Value::deserialize(doc)
            .map_err(|e| Error::fatal("parse_documents", format!("invalid YAML: {}", e)))?;
        if value.is_object() {
            docs.push(value);
        }
    }
    Ok(docs)
}

/// Look up a field by dot path (`.status.sync.status`).
///
/// A `name[key=value]` segment selects the entry of array `name` whose `key`
/// equals `value`, e.g. `.status.conditions[type=Ready].status`.
pub fn field_at<'a>(value: &'a Value, path: &str) -> Option<&'a Value> {
    path.trim_start_matches('.')
        .split('.')
        .filter(|segment| !segment.is_empty())
        .try_fold(value, |current, segment| match segment.split_once('[') {
            Some((name, selector)) => {
                let (key, expected) = selector.strip_suffix(']')?.split_once('=')?;
                current
                    .get(name)?
                    .as_array()?
                    .iter()
                    .find(|item| item.get(key).and_then(Value::as_str) == Some(expected))
            }
            None => current.get(segment),
        })
}

/// Look up a string field by dot path
pub fn field_str<'a>(value: &'a Value, path: &str) -> Option<&'a str> {
    field_at(value, path).and_then(|v| v.as_str())
}

/// Status of a `.status.conditions[]` entry of the given type
pub fn condition_status<'a>(object: &'a Value, condition_type: &str) -> Option<&'a str> {
    condition(object, condition_type).and_then(|c| c.get("status")?.as_str())
}

/// Full `.status.conditions[]` entry of the given type
pub fn condition<'a>(object: &'a Value, condition_type: &str) -> Option<&'a Value> {
    field_at(object, ".status.conditions")?
        .as_array()?
        .iter()
        .find(|c| c.get("type").and_then(|t| t.as_str()) == Some(condition_type))
}

/// Whether a condition of the given type has status "True"
pub fn has_condition(object: &Value, condition_type: &str) -> bool {
    condition_status(object, condition_type) == Some(STATUS_TRUE)
}

/// Render a snapshot for operators, without server-managed noise
pub fn describe(object: &Value) -> String {
    let mut trimmed = object.clone();
    if let Some(meta) = trimmed.get_mut("metadata").and_then(|m| m.as_object_mut()) {
        meta.remove("managedFields");
        meta.remove("uid");
        meta.remove("resourceVersion");
    }
    serde_yaml::to_string(&trimmed).unwrap_or_else(|_| trimmed.to_string())
}

/// Apply every document of a multi-document YAML stream, in order
pub async fn apply_documents(
    cluster: &dyn ClusterApi,
    yaml: &str,
) -> Result<Vec<ApplyOutcome>, Error> {
    let docs = parse_documents(yaml)?;
    let mut outcomes = Vec::with_capacity(docs.len());
    for doc in &docs {
        outcomes.push(cluster.apply(doc).await?);
    }
    Ok(outcomes)
}

/// Reference to a namespace
pub fn namespace_ref(name: &str) -> ObjectRef {
    ObjectRef::cluster("v1", "Namespace", name)
}

/// Ensure a namespace exists (idempotent)
pub async fn ensure_namespace(cluster: &dyn ClusterApi, name: &str) -> Result<ApplyOutcome, Error> {
    cluster
        .apply(&json!({
            "apiVersion": "v1",
            "kind": "Namespace",
            "metadata": { "name": name }
        }))
        .await
}

/// Reference to a core Service
pub fn service_ref(namespace: &str, name: &str) -> ObjectRef {
    ObjectRef::namespaced("v1", "Service", namespace, name)
}

/// Address of a service snapshot, read from the given source
pub fn service_address(service: &Value, source: IngressAddressSource) -> Option<String> {
    let address = match source {
        IngressAddressSource::ClusterIp => field_str(service, ".spec.clusterIP"),
        IngressAddressSource::LoadBalancer => field_at(service, ".status.loadBalancer.ingress")
            .and_then(|v| v.as_array())
            .and_then(|ingress| {
                ingress
                    .iter()
                    .find_map(|entry| entry.get("ip").and_then(|ip| ip.as_str()))
            }),
    };
    address
        .filter(|ip| !ip.is_empty() && *ip != "None")
        .map(str::to_string)
}

/// Wait until a service has an address and return it
pub async fn wait_for_service_address(
    cluster: &dyn ClusterApi,
    service: &ObjectRef,
    source: IngressAddressSource,
    spec: &WaitSpec,
) -> Result<String, Error> {
    wait_until(spec, || async move {
        match cluster.get(service).await {
            Ok(Some(value)) => Ok(match service_address(&value, source) {
                Some(address) => PollResult::Ready(address),
                None => PollResult::NotYetReady(format!("{} has no {:?} address", service, source)),
            }),
            Ok(None) => Ok(PollResult::NotYetReady(format!("{} not found", service))),
            Err(e) => PollResult::from_error(e),
        }
    })
    .await
}

/// Wait until an object exists and return its snapshot
pub async fn wait_for_object(
    cluster: &dyn ClusterApi,
    object: &ObjectRef,
    spec: &WaitSpec,
) -> Result<Value, Error> {
    wait_until(spec, || async move {
        match cluster.get(object).await {
            Ok(Some(value)) => Ok(PollResult::Ready(value)),
            Ok(None) => Ok(PollResult::NotYetReady(format!("{} not found", object))),
            Err(e) => PollResult::from_error(e),
        }
    })
    .await
}

/// Wait until the field at `path` of `object` equals `expected`
pub async fn wait_for_condition(
    cluster: &dyn ClusterApi,
    object: &ObjectRef,
    path: &str,
    expected: &str,
    spec: &WaitSpec,
) -> Result<Value, Error> {
    wait_until(spec, || async move {
        match cluster.get(object).await {
            Ok(Some(value)) => {
                let observed = field_str(&value, path);
                if observed == Some(expected) {
                    return Ok(PollResult::Ready(value));
                }
                let mut report = format!("{} {}={}", object, path, observed.unwrap_or("<unset>"));
                let message = path
                    .rsplit_once('.')
                    .and_then(|(parent, _)| field_str(&value, &format!("{}.message", parent)));
                if let Some(message) = message {
                    report.push_str(": ");
                    report.push_str(message);
                }
                Ok(PollResult::NotYetReady(report))
            }
            Ok(None) => Ok(PollResult::NotYetReady(format!("{} not found", object))),
            Err(e) => PollResult::from_error(e),
        }
    })
    .await
}

/// Wait for at least one node and every node to report Ready
pub async fn wait_for_nodes_ready(cluster: &dyn ClusterApi, spec: &WaitSpec) -> Result<(), Error> {
    let nodes = &TypeRef::all("v1", "Node");
    wait_until(spec, || async move {
        let items = match cluster.list(nodes).await {
            Ok(items) => items,
            Err(e) => return PollResult::from_error(e),
        };
        if items.is_empty() {
            return Ok(PollResult::NotYetReady("no nodes registered".to_string()));
        }
        let not_ready: Vec<&str> = items
            .iter()
            .filter(|node| !has_condition(node, CONDITION_READY))
            .filter_map(|node| field_str(node, ".metadata.name"))
            .collect();
        if not_ready.is_empty() {
            info!(count = items.len(), "All nodes ready");
            Ok(PollResult::Ready(()))
        } else {
            Ok(PollResult::NotYetReady(format!(
                "nodes not ready: {}",
                not_ready.join(", ")
            )))
        }
    })
    .await
}

/// Wait for the named deployments in a namespace to report Available
pub async fn wait_for_deployments_available(
    cluster: &dyn ClusterApi,
    namespace: &str,
    names: &[String],
    spec: &WaitSpec,
) -> Result<(), Error> {
    for name in names {
        let deployment = &ObjectRef::namespaced("apps/v1", "Deployment", namespace, name);
        wait_until(spec, || async move {
            match cluster.get(deployment).await {
                Ok(Some(value)) if has_condition(&value, CONDITION_AVAILABLE) => {
                    Ok(PollResult::Ready(()))
                }
                Ok(Some(_)) => Ok(PollResult::NotYetReady(format!(
                    "{} not available",
                    deployment
                ))),
                Ok(None) => Ok(PollResult::NotYetReady(format!("{} not found", deployment))),
                Err(e) => PollResult::from_error(e),
            }
        })
        .await?;
        debug!(deployment = %name, namespace = %namespace, "Deployment available");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::MockClusterApi;
    use std::time::Duration;

    fn spec() -> WaitSpec {
        WaitSpec::new("test", Duration::from_secs(2), Duration::from_secs(30))
    }

    #[test]
    fn parse_manifest_extracts_identity() {
        let manifest = json!({
            "apiVersion": "apps/v1",
            "kind": "Deployment",
            "metadata": { "name": "argocd-server", "namespace": "argocd" }
        });
        let meta = parse_manifest(&manifest).unwrap();
        assert_eq!(meta.api_version, "apps/v1");
        assert_eq!(meta.kind, "Deployment");
        assert_eq!(meta.name, "argocd-server");
        assert_eq!(meta.namespace.as_deref(), Some("argocd"));
    }

    #[test]
    fn parse_manifest_reports_missing_fields() {
        let err = parse_manifest(&json!({ "kind": "Secret" })).unwrap_err();
        assert!(err.to_string().contains("apiVersion"));
        let err = parse_manifest(&json!({ "apiVersion": "v1", "kind": "Secret" })).unwrap_err();
        assert!(err.to_string().contains("metadata.name"));
    }

    #[test]
    fn parse_api_version_crd() {
        assert_eq!(
            parse_api_version("argoproj.io/v1alpha1"),
            ("argoproj.io".to_string(), "v1alpha1".to_string())
        );
    }

    #[test]
    fn parse_documents_skips_empty_documents() {
        let yaml = r#"
---
apiVersion: v1
kind: Namespace
metadata:
  name: argocd
---
# comment only
---
apiVersion: v1
kind: ServiceAccount
metadata:
  name: argocd-server
  namespace: argocd
"#;
        let docs = parse_documents(yaml).unwrap();
        assert_eq!(docs.len(), 2);
        assert_eq!(docs[1]["kind"], "ServiceAccount");
    }

    #[test]
    fn parse_documents_rejects_invalid_yaml() {
        assert!(parse_documents("not: valid: yaml: {{").is_err());
    }

    #[test]
    fn field_lookup_by_dot_path() {
        let app = json!({ "status": { "sync": { "status": "Synced" } } });
        assert_eq!(field_str(&app, ".status.sync.status"), Some("Synced"));
        assert_eq!(field_str(&app, "status.sync.status"), Some("Synced"));
        assert_eq!(field_str(&app, ".status.health.status"), None);
    }

    #[test]
    fn field_path_selects_array_entry() {
        let obj = json!({
            "status": { "conditions": [
                { "type": "Healthy", "status": "False" },
                { "type": "Ready", "status": "True", "message": "store validated" }
            ]}
        });
        assert_eq!(field_str(&obj, ".status.conditions[type=Ready].status"), Some("True"));
        assert_eq!(
            field_str(&obj, ".status.conditions[type=Ready].message"),
            Some("store validated")
        );
        assert_eq!(field_str(&obj, ".status.conditions[type=Stalled].status"), None);
        assert_eq!(field_str(&obj, ".status.conditions[type].status"), None);
    }

    #[test]
    fn conditions_lookup() {
        let obj = json!({
            "status": { "conditions": [
                { "type": "Ready", "status": "False", "reason": "Progressing" },
                { "type": "Healthy", "status": "True" }
            ]}
        });
        assert_eq!(condition_status(&obj, "Ready"), Some("False"));
        assert!(has_condition(&obj, "Healthy"));
        assert!(!has_condition(&obj, "Ready"));
        assert!(!has_condition(&json!({}), "Ready"));
    }

    #[test]
    fn describe_strips_managed_fields() {
        let obj = json!({
            "kind": "Application",
            "metadata": { "name": "vault", "managedFields": [{ "manager": "argocd" }] }
        });
        let dump = describe(&obj);
        assert!(dump.contains("name: vault"));
        assert!(!dump.contains("managedFields"));
    }

    #[tokio::test(start_paused = true)]
    async fn wait_for_condition_polls_until_value_matches() {
        let mut cluster = MockClusterApi::new();
        let mut calls = 0;
        cluster.expect_get().times(3).returning(move |_| {
            calls += 1;
            Ok(match calls {
                1 => None,
                2 => Some(json!({ "status": { "phase": "Pending" } })),
                _ => Some(json!({ "status": { "phase": "Bound" } })),
            })
        });

        let pvc = ObjectRef::namespaced("v1", "PersistentVolumeClaim", "vault", "data-vault-0");
        let value = wait_for_condition(&cluster, &pvc, ".status.phase", "Bound", &spec())
            .await
            .unwrap();
        assert_eq!(value["status"]["phase"], "Bound");
    }

    #[tokio::test(start_paused = true)]
    async fn wait_for_nodes_requires_all_ready() {
        let mut cluster = MockClusterApi::new();
        let mut calls = 0;
        cluster.expect_list().times(2).returning(move |_| {
            calls += 1;
            let second = if calls == 1 { "False" } else { "True" };
            Ok(vec![
                json!({ "metadata": { "name": "cp" }, "status": { "conditions": [{ "type": "Ready", "status": "True" }] } }),
                json!({ "metadata": { "name": "worker" }, "status": { "conditions": [{ "type": "Ready", "status": second }] } }),
            ])
        });

        wait_for_nodes_ready(&cluster, &spec()).await.unwrap();
    }

    #[test]
    fn service_address_by_source() {
        let svc = json!({
            "spec": { "clusterIP": "10.96.12.4" },
            "status": { "loadBalancer": { "ingress": [{ "hostname": "lb.example" }, { "ip": "203.0.113.7" }] } }
        });
        assert_eq!(
            service_address(&svc, IngressAddressSource::ClusterIp).as_deref(),
            Some("10.96.12.4")
        );
        assert_eq!(
            service_address(&svc, IngressAddressSource::LoadBalancer).as_deref(),
            Some("203.0.113.7")
        );

        let headless = json!({ "spec": { "clusterIP": "None" } });
        assert_eq!(service_address(&headless, IngressAddressSource::ClusterIp), None);
    }

    #[tokio::test(start_paused = true)]
    async fn wait_for_load_balancer_address() {
        let mut cluster = MockClusterApi::new();
        let mut calls = 0;
        cluster.expect_get().times(2).returning(move |_| {
            calls += 1;
            Ok(Some(if calls == 1 {
                json!({ "status": { "loadBalancer": {} } })
            } else {
                json!({ "status": { "loadBalancer": { "ingress": [{ "ip": "203.0.113.7" }] } } })
            }))
        });

        let svc = service_ref("ingress-nginx", "ingress-nginx-controller");
        let ip = wait_for_service_address(&cluster, &svc, IngressAddressSource::LoadBalancer, &spec())
            .await
            .unwrap();
        assert_eq!(ip, "203.0.113.7");
    }

    #[tokio::test]
    async fn apply_documents_applies_in_order() {
        let mut cluster = MockClusterApi::new();
        let mut seq = mockall::Sequence::new();
        cluster
            .expect_apply()
            .withf(|m| m["kind"] == "Namespace")
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(ApplyOutcome::Created));
        cluster
            .expect_apply()
            .withf(|m| m["kind"] == "Deployment")
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(ApplyOutcome::Unchanged));

        let yaml = "apiVersion: v1\nkind: Namespace\nmetadata:\n  name: flux-system\n---\napiVersion: apps/v1\nkind: Deployment\nmetadata:\n  name: source-controller\n  namespace: flux-system\n";
        let outcomes = apply_documents(&cluster, yaml).await.unwrap();
        assert_eq!(outcomes, vec![ApplyOutcome::Created, ApplyOutcome::Unchanged]);
    }
}
