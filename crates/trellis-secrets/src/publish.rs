//! Publishing credentials as cluster secrets
//!
//! A secret is only written once its owner exists: the target namespace, or
//! for [`PublishMode::PatchExisting`] the secret a controller creates on
//! startup. Writing earlier races the controller, which then overwrites or
//! ignores our keys.

use std::collections::BTreeMap;

use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde_json::{json, Map, Value};
use tracing::{debug, info};
use trellis_common::kube_utils::{ensure_namespace, namespace_ref, wait_for_object};
use trellis_common::{ApplyOutcome, ClusterApi, ObjectRef, WaitSpec, MANAGED_BY_LABEL};

use crate::credentials::Credential;
use crate::error::Result;

/// How a secret reaches the cluster
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishMode {
    /// Wait for the namespace, then apply the whole secret
    Apply,
    /// Create the namespace if missing, then apply the whole secret
    ApplyCreatingNamespace,
    /// Wait for a controller-created secret, then merge only our keys
    PatchExisting,
}

/// Destination of a credential in the cluster
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SecretTarget {
    /// Secret name
    pub name: String,
    /// Secret namespace
    pub namespace: String,
    /// Secret type, `Opaque` when unset
    pub secret_type: Option<String>,
    /// Write strategy
    pub mode: PublishMode,
    /// Credential field to secret key renames
    pub key_map: BTreeMap<String, String>,
}

impl SecretTarget {
    /// Secret target with no key renames
    pub fn new(name: impl Into<String>, namespace: impl Into<String>, mode: PublishMode) -> Self {
        Self {
            name: name.into(),
            namespace: namespace.into(),
            secret_type: None,
            mode,
            key_map: BTreeMap::new(),
        }
    }

    /// Set the secret type
    pub fn with_type(mut self, secret_type: impl Into<String>) -> Self {
        self.secret_type = Some(secret_type.into());
        self
    }

    /// Publish credential field `field` under secret key `key`
    pub fn with_key(mut self, field: impl Into<String>, key: impl Into<String>) -> Self {
        self.key_map.insert(field.into(), key.into());
        self
    }

    /// Reference to the secret
    pub fn object_ref(&self) -> ObjectRef {
        ObjectRef::namespaced("v1", "Secret", &self.namespace, &self.name)
    }

    /// Base64-encoded secret data for a credential. With a key map, only mapped fields are published.
    pub fn encode(&self, credential: &Credential) -> Map<String, Value> {
        credential
            .data
            .iter()
            .filter_map(|(field, value)| {
                let key = if self.key_map.is_empty() {
                    field.clone()
                } else {
                    self.key_map.get(field)?.clone()
                };
                Some((key, Value::String(STANDARD.encode(value))))
            })
            .collect()
    }

    fn manifest(&self, credential: &Credential) -> Value {
        json!({
            "apiVersion": "v1",
            "kind": "Secret",
            "metadata": {
                "name": self.name,
                "namespace": self.namespace,
                "labels": { MANAGED_BY_LABEL: "trellis" }
            },
            "type": self.secret_type.as_deref().unwrap_or("Opaque"),
            "data": self.encode(credential)
        })
    }
}

/// Push a credential into the cluster as a secret, waiting for its owner first.
///
/// `spec` bounds the wait for the namespace or controller-created secret.
pub async fn publish_credential(
    cluster: &dyn ClusterApi,
    credential: &Credential,
    target: &SecretTarget,
    spec: &WaitSpec,
) -> Result<ApplyOutcome> {
    let outcome = match target.mode {
        PublishMode::Apply => {
            wait_for_object(cluster, &namespace_ref(&target.namespace), spec).await?;
            cluster.apply(&target.manifest(credential)).await?
        }
        PublishMode::ApplyCreatingNamespace => {
            ensure_namespace(cluster, &target.namespace).await?;
            cluster.apply(&target.manifest(credential)).await?
        }
        PublishMode::PatchExisting => {
            let secret = target.object_ref();
            let existing = wait_for_object(cluster, &secret, spec).await?;
            let data = target.encode(credential);
            let current = existing.get("data").and_then(Value::as_object);
            let up_to_date = data
                .iter()
                .all(|(k, v)| current.and_then(|c| c.get(k)) == Some(v));
            if up_to_date {
                debug!(secret = %secret, "Secret already holds credential");
                ApplyOutcome::Unchanged
            } else {
                cluster
                    .patch_merge(&secret, &json!({ "data": data }))
                    .await?;
                ApplyOutcome::Updated
            }
        }
    };
    info!(
        identity = %credential.identity,
        secret = %target.object_ref(),
        outcome = %outcome,
        "Published credential"
    );
    Ok(outcome)
}
