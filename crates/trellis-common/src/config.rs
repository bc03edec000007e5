//! Bootstrap configuration
//!
//! One [`BootstrapConfig`] is loaded per run (YAML file plus CLI overrides)
//! and handed to every stage constructor. Stages never read the process
//! environment.
//!
//! Profiles capture the settings that legitimately differ between a local
//! throwaway cluster and a managed one (storage class, DNS suffix, how the
//! ingress address is discovered). Every profile default can be overridden.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::Error;

/// Cluster profile
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClusterProfile {
    /// kind / k3d style local cluster
    #[default]
    Local,
    /// Cloud-managed cluster with a real load balancer
    Managed,
}

impl std::str::FromStr for ClusterProfile {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "local" => Ok(Self::Local),
            "managed" => Ok(Self::Managed),
            _ => Err(format!(
                "invalid profile '{}', must be 'local' or 'managed'",
                s
            )),
        }
    }
}

/// GitOps controller flavour
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// Argo CD with Applications and ApplicationSets
    #[default]
    Argocd,
    /// Flux with Kustomizations, HelmReleases and ResourceSets
    Flux,
}

impl BackendKind {
    /// Namespace the controller is installed into by default
    pub fn default_namespace(&self) -> &'static str {
        match self {
            Self::Argocd => "argocd",
            Self::Flux => "flux-system",
        }
    }
}

impl std::str::FromStr for BackendKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "argocd" | "argo" => Ok(Self::Argocd),
            "flux" => Ok(Self::Flux),
            _ => Err(format!("invalid backend '{}', must be 'argocd' or 'flux'", s)),
        }
    }
}

impl std::fmt::Display for BackendKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Argocd => f.write_str("argocd"),
            Self::Flux => f.write_str("flux"),
        }
    }
}

/// Where the ingress address baked into config comes from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum IngressAddressSource {
    /// `spec.clusterIP` of the ingress controller service
    ClusterIp,
    /// First `status.loadBalancer.ingress[].ip`
    LoadBalancer,
}

/// Settings resolved from the profile plus overrides
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedProfile {
    /// StorageClass for persistent volumes
    pub storage_class: String,
    /// DNS suffix for ingress hostnames
    pub dns_suffix: String,
    /// Ingress address source
    pub ingress_address: IngressAddressSource,
}

/// Optional per-field overrides of the profile defaults
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ProfileOverrides {
    /// StorageClass override
    pub storage_class: Option<String>,
    /// DNS suffix override
    pub dns_suffix: Option<String>,
    /// Ingress address source override
    pub ingress_address: Option<IngressAddressSource>,
}

/// GitOps controller settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct GitOpsConfig {
    /// Controller flavour
    #[serde(default)]
    pub backend: BackendKind,
    /// Multi-document YAML installing the controller
    pub install_manifest: PathBuf,
    /// Controller namespace (defaults per backend)
    pub namespace: Option<String>,
}

impl GitOpsConfig {
    /// Controller namespace
    pub fn namespace(&self) -> &str {
        self.namespace
            .as_deref()
            .unwrap_or_else(|| self.backend.default_namespace())
    }
}

/// Config repository settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct GitConfig {
    /// Local working tree
    pub path: PathBuf,
    /// Repository URL as the GitOps controller fetches it
    pub url: String,
    /// Remote name in the working tree
    #[serde(default = "default_remote")]
    pub remote: String,
    /// Branch to commit to and reconcile from
    #[serde(default = "default_branch")]
    pub branch: String,
    /// Directory (relative to the working tree) for this cluster's rendered config
    pub cluster_dir: Option<PathBuf>,
    /// Directory (relative to the working tree) holding `*.j2` templates
    #[serde(default = "default_templates_dir")]
    pub templates_dir: PathBuf,
    /// SSH key or token file for fetch/push
    pub credentials: Option<PathBuf>,
    /// Commit author name
    #[serde(default = "default_author_name")]
    pub author_name: String,
    /// Commit author email
    #[serde(default = "default_author_email")]
    pub author_email: String,
}

fn default_remote() -> String {
    "origin".to_string()
}

fn default_branch() -> String {
    "main".to_string()
}

fn default_templates_dir() -> PathBuf {
    PathBuf::from("templates")
}

fn default_author_name() -> String {
    "trellis".to_string()
}

fn default_author_email() -> String {
    "trellis@localhost".to_string()
}

/// Reference to a Secret in the cluster
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SecretRef {
    /// Secret name
    pub name: String,
    /// Secret namespace
    pub namespace: String,
}

/// Vault settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct VaultConfig {
    /// Run the vault stage at all
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Vault namespace
    #[serde(default = "default_vault_namespace")]
    pub namespace: String,
    /// Pod to exec into
    #[serde(default = "default_vault_pod")]
    pub pod: String,
    /// Container running vault
    #[serde(default = "default_vault_container")]
    pub container: String,
    /// Number of unseal key shares generated at init
    #[serde(default = "default_key_shares")]
    pub key_shares: u8,
    /// Shares required to unseal
    #[serde(default = "default_key_threshold")]
    pub key_threshold: u8,
    /// Budget for the vault pod to start; `None` waits forever
    #[serde(default = "default_pod_start_timeout")]
    pub pod_start_timeout_secs: Option<u64>,
    /// Secret the root token is published to
    #[serde(default = "default_token_secret")]
    pub token_secret: SecretRef,
    /// In-cluster vault address used by External Secrets
    #[serde(default = "default_vault_address")]
    pub address: String,
    /// KV mount External Secrets reads from
    #[serde(default = "default_kv_path")]
    pub kv_path: String,
    /// Name of the ClusterSecretStore pointing at vault
    #[serde(default = "default_secret_store")]
    pub secret_store: String,
}

fn default_true() -> bool {
    true
}
fn default_vault_namespace() -> String {
    "vault".to_string()
}
fn default_vault_pod() -> String {
    "vault-0".to_string()
}
fn default_vault_container() -> String {
    "vault".to_string()
}
fn default_key_shares() -> u8 {
    5
}
fn default_key_threshold() -> u8 {
    3
}
fn default_pod_start_timeout() -> Option<u64> {
    Some(300)
}
fn default_token_secret() -> SecretRef {
    SecretRef {
        name: "vault-token".to_string(),
        namespace: "external-secrets".to_string(),
    }
}
fn default_vault_address() -> String {
    "http://vault.vault.svc:8200".to_string()
}
fn default_kv_path() -> String {
    "secret".to_string()
}
fn default_secret_store() -> String {
    "vault-backend".to_string()
}

impl Default for VaultConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            namespace: default_vault_namespace(),
            pod: default_vault_pod(),
            container: default_vault_container(),
            key_shares: default_key_shares(),
            key_threshold: default_key_threshold(),
            pod_start_timeout_secs: default_pod_start_timeout(),
            token_secret: default_token_secret(),
            address: default_vault_address(),
            kv_path: default_kv_path(),
            secret_store: default_secret_store(),
        }
    }
}

impl VaultConfig {
    /// Pod start budget
    pub fn pod_start_timeout(&self) -> Option<Duration> {
        self.pod_start_timeout_secs.map(Duration::from_secs)
    }
}

/// Ingress controller service settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct IngressConfig {
    /// Service whose address is published
    #[serde(default = "default_ingress_service")]
    pub service: String,
}

fn default_ingress_service() -> String {
    "ingress-nginx-controller".to_string()
}

impl Default for IngressConfig {
    fn default() -> Self {
        Self {
            service: default_ingress_service(),
        }
    }
}

/// Wait budgets, in seconds
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct Timeouts {
    /// Interval between polls
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,
    /// Budget for nodes to become ready
    #[serde(default = "default_long_timeout")]
    pub cluster_ready_secs: u64,
    /// Budget for the GitOps controller to become available
    #[serde(default = "default_long_timeout")]
    pub controller_install_secs: u64,
    /// Budget for one deployment to become Synced and Healthy
    #[serde(default = "default_long_timeout")]
    pub deploy_secs: u64,
    /// Budget for a forced source refresh
    #[serde(default = "default_short_timeout")]
    pub refresh_secs: u64,
    /// Budget for a secret's namespace or owning controller to appear
    #[serde(default = "default_short_timeout")]
    pub secret_target_secs: u64,
}

fn default_poll_interval() -> u64 {
    5
}
fn default_long_timeout() -> u64 {
    300
}
fn default_short_timeout() -> u64 {
    120
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            poll_interval_secs: default_poll_interval(),
            cluster_ready_secs: default_long_timeout(),
            controller_install_secs: default_long_timeout(),
            deploy_secs: default_long_timeout(),
            refresh_secs: default_short_timeout(),
            secret_target_secs: default_short_timeout(),
        }
    }
}

impl Timeouts {
    /// Poll interval
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    /// Deploy budget
    pub fn deploy(&self) -> Duration {
        Duration::from_secs(self.deploy_secs)
    }

    /// Refresh budget
    pub fn refresh(&self) -> Duration {
        Duration::from_secs(self.refresh_secs)
    }

    /// Cluster ready budget
    pub fn cluster_ready(&self) -> Duration {
        Duration::from_secs(self.cluster_ready_secs)
    }

    /// Controller install budget
    pub fn controller_install(&self) -> Duration {
        Duration::from_secs(self.controller_install_secs)
    }

    /// Secret target budget
    pub fn secret_target(&self) -> Duration {
        Duration::from_secs(self.secret_target_secs)
    }
}

/// Top-level bootstrap configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct BootstrapConfig {
    /// Cluster name, used for the rendered config directory
    pub cluster_name: String,
    /// Cluster profile
    #[serde(default)]
    pub profile: ClusterProfile,
    /// Profile overrides
    #[serde(default)]
    pub overrides: ProfileOverrides,
    /// GitOps controller
    pub gitops: GitOpsConfig,
    /// Config repository
    pub git: GitConfig,
    /// Local directory for generated credentials; must be outside the repository
    pub state_dir: PathBuf,
    /// Descriptor source listing the add-ons
    #[serde(default = "default_addons_file")]
    pub addons_file: PathBuf,
    /// Ingress controller service
    #[serde(default)]
    pub ingress: IngressConfig,
    /// Vault
    #[serde(default)]
    pub vault: VaultConfig,
    /// Wait budgets
    #[serde(default)]
    pub timeouts: Timeouts,
}

fn default_addons_file() -> PathBuf {
    PathBuf::from("addons.yaml")
}

impl BootstrapConfig {
    /// Load from a YAML file. Relative paths resolve against the file's directory.
    ///
    /// Not validated; callers apply their overrides first, then [`Self::validate`].
    pub fn load(path: &Path) -> Result<Self, Error> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::config(format!("failed to read {}: {}", path.display(), e))
        })?;
        let mut config = Self::from_yaml(&content)?;
        if let Some(base) = path.parent() {
            config.resolve_paths(base);
        }
        Ok(config)
    }

    /// Parse without validating or resolving paths
    pub fn from_yaml(content: &str) -> Result<Self, Error> {
        serde_yaml::from_str(content)
            .map_err(|e| Error::config(format!("invalid bootstrap config: {}", e)))
    }

    fn resolve_paths(&mut self, base: &Path) {
        let resolve = |p: &mut PathBuf| {
            if p.is_relative() {
                *p = base.join(&*p);
            }
        };
        resolve(&mut self.git.path);
        resolve(&mut self.state_dir);
        resolve(&mut self.addons_file);
        resolve(&mut self.gitops.install_manifest);
        if let Some(creds) = self.git.credentials.as_mut() {
            resolve(creds);
        }
    }

    /// Check invariants the stages rely on
    pub fn validate(&self) -> Result<(), Error> {
        if !is_dns_label(&self.cluster_name) {
            return Err(Error::config(format!(
                "clusterName '{}' must be a DNS-1123 label",
                self.cluster_name
            )));
        }
        if self.vault.key_threshold == 0 || self.vault.key_threshold > self.vault.key_shares {
            return Err(Error::config(format!(
                "vault keyThreshold {} must be between 1 and keyShares {}",
                self.vault.key_threshold, self.vault.key_shares
            )));
        }
        if self.timeouts.poll_interval_secs == 0 {
            return Err(Error::config("timeouts.pollIntervalSecs must be positive"));
        }
        if self.state_dir.starts_with(&self.git.path) {
            return Err(Error::config(format!(
                "stateDir {} is inside the config repository {}; credentials must never be committed",
                self.state_dir.display(),
                self.git.path.display()
            )));
        }
        self.resolved_profile()?;
        Ok(())
    }

    /// Profile defaults with overrides applied
    pub fn resolved_profile(&self) -> Result<ResolvedProfile, Error> {
        let (storage_class, dns_suffix, ingress_address) = match self.profile {
            ClusterProfile::Local => (
                Some("standard"),
                Some("localtest.me"),
                IngressAddressSource::ClusterIp,
            ),
            ClusterProfile::Managed => (None, None, IngressAddressSource::LoadBalancer),
        };

        let storage_class = self
            .overrides
            .storage_class
            .clone()
            .or_else(|| storage_class.map(str::to_string))
            .ok_or_else(|| Error::config("profile 'managed' requires overrides.storageClass"))?;
        let dns_suffix = self
            .overrides
            .dns_suffix
            .clone()
            .or_else(|| dns_suffix.map(str::to_string))
            .ok_or_else(|| Error::config("profile 'managed' requires overrides.dnsSuffix"))?;

        Ok(ResolvedProfile {
            storage_class,
            dns_suffix,
            ingress_address: self.overrides.ingress_address.unwrap_or(ingress_address),
        })
    }

    /// Rendered config directory, relative to the working tree
    pub fn cluster_dir(&self) -> PathBuf {
        self.git
            .cluster_dir
            .clone()
            .unwrap_or_else(|| PathBuf::from("clusters").join(&self.cluster_name))
    }
}

fn is_dns_label(s: &str) -> bool {
    !s.is_empty()
        && s.len() <= 63
        && s.chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
        && !s.starts_with('-')
        && !s.ends_with('-')
}
