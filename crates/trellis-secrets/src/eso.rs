//! External Secrets Operator wiring
//!
//! Once vault is unsealed and its root token published, a cluster-wide
//! `ClusterSecretStore` points External Secrets at it. The store is applied
//! and waited on until ESO reports it `Ready`.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use trellis_common::config::VaultConfig;
use trellis_common::kube_utils::{wait_for_condition, STATUS_TRUE};
use trellis_common::{ApplyOutcome, ClusterApi, ObjectRef, WaitSpec, MANAGED_BY_LABEL};

use crate::error::Result;
use crate::vault::TOKEN_SECRET_KEY;

/// apiVersion of External Secrets resources
pub const ESO_API_VERSION: &str = "external-secrets.io/v1";

const STORE_READY: &str = ".status.conditions[type=Ready].status";

/// ESO ClusterSecretStore resource
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ClusterSecretStore {
    /// API version
    pub api_version: String,
    /// Resource kind
    pub kind: String,
    /// Resource metadata
    pub metadata: StoreMetadata,
    /// Store specification
    pub spec: ClusterSecretStoreSpec,
}

/// Metadata for a cluster-scoped store
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct StoreMetadata {
    /// Resource name
    pub name: String,
    /// Labels
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
}

/// ClusterSecretStore spec
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct ClusterSecretStoreSpec {
    /// Provider configuration
    pub provider: ProviderSpec,
}

/// Provider specification
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct ProviderSpec {
    /// Vault provider configuration
    pub vault: VaultProvider,
}

/// Vault provider configuration
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct VaultProvider {
    /// Vault server URL
    pub server: String,
    /// KV mount path
    pub path: String,
    /// KV version
    pub version: String,
    /// Authentication
    pub auth: VaultAuth,
}

/// Vault authentication
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct VaultAuth {
    /// Token authentication
    pub token_secret_ref: SecretKeyRef,
}

/// Reference to a secret key
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct SecretKeyRef {
    /// Secret name
    pub name: String,
    /// Secret namespace
    pub namespace: String,
    /// Key within the secret
    pub key: String,
}

impl ClusterSecretStore {
    /// Store backed by the configured vault with root token auth
    pub fn for_vault(config: &VaultConfig) -> Self {
        Self {
            api_version: ESO_API_VERSION.to_string(),
            kind: "ClusterSecretStore".to_string(),
            metadata: StoreMetadata {
                name: config.secret_store.clone(),
                labels: BTreeMap::from([(MANAGED_BY_LABEL.to_string(), "trellis".to_string())]),
            },
            spec: ClusterSecretStoreSpec {
                provider: ProviderSpec {
                    vault: VaultProvider {
                        server: config.address.clone(),
                        path: config.kv_path.clone(),
                        version: "v2".to_string(),
                        auth: VaultAuth {
                            token_secret_ref: SecretKeyRef {
                                name: config.token_secret.name.clone(),
                                namespace: config.token_secret.namespace.clone(),
                                key: TOKEN_SECRET_KEY.to_string(),
                            },
                        },
                    },
                },
            },
        }
    }

    /// Reference to the store
    pub fn object_ref(&self) -> ObjectRef {
        ObjectRef::cluster(&self.api_version, &self.kind, &self.metadata.name)
    }
}

/// Apply the vault-backed store and wait until ESO validates it
pub async fn ensure_secret_store(
    cluster: &dyn ClusterApi,
    config: &VaultConfig,
    spec: &WaitSpec,
) -> Result<ApplyOutcome> {
    let store = ClusterSecretStore::for_vault(config);
    let manifest = serde_json::to_value(&store).map_err(trellis_common::Error::from)?;
    let outcome = cluster.apply(&manifest).await?;

    wait_for_condition(cluster, &store.object_ref(), STORE_READY, STATUS_TRUE, spec).await?;
    Ok(outcome)
}
