//! Vault lifecycle: wait for the pod, initialize once, unseal every run,
//! publish the root token
//!
//! ```text
//! PodNotStarted -> PodStarted -> [Uninitialized -> Initialized] -> Sealed
//!   -> Unsealed -> TokenExtracted -> TokenPublished
//! ```
//!
//! Unseal keys and the root token exist exactly once, at initialization. They
//! are saved to the credential store before anything else happens, and every
//! later run unseals from that record.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Pod;
use kube::api::{Api, AttachParams};
use kube::Client;
#[cfg(any(test, feature = "mock"))]
use mockall::automock;
use serde::Deserialize;
use tokio::io::AsyncReadExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use trellis_common::config::VaultConfig;
use trellis_common::{wait_until, ApplyOutcome, ClusterApi, PollResult, WaitSpec};

use crate::credentials::{Credential, CredentialStore};
use crate::error::{Error, Result};
use crate::publish::{publish_credential, PublishMode, SecretTarget};

/// Credential identity holding unseal keys and the root token
pub const UNSEAL_IDENTITY: &str = "vault-unseal";
/// Field with newline-separated unseal keys
pub const UNSEAL_KEYS_FIELD: &str = "unseal-keys";
/// Field with the root token
pub const ROOT_TOKEN_FIELD: &str = "root-token";
/// Secret key the root token is published under
pub const TOKEN_SECRET_KEY: &str = "token";

/// Seal status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct VaultStatus {
    /// Whether `operator init` has run
    pub initialized: bool,
    /// Whether the vault is sealed
    pub sealed: bool,
}

/// Output of `vault operator init`
#[derive(Clone, Deserialize)]
pub struct InitResult {
    /// Base64 unseal key shares
    pub unseal_keys_b64: Vec<String>,
    /// Initial root token
    pub root_token: String,
}

/// Vault operations
#[cfg_attr(any(test, feature = "mock"), automock)]
#[async_trait]
pub trait VaultApi: Send + Sync {
    /// Whether the vault container reports `started`
    async fn container_started(&self) -> Result<bool>;

    /// Current seal status
    async fn status(&self) -> Result<VaultStatus>;

    /// Initialize; only valid on an uninitialized vault
    async fn init(&self, key_shares: u8, key_threshold: u8) -> Result<InitResult>;

    /// Submit one unseal key share
    async fn unseal(&self, key: &str) -> Result<VaultStatus>;

    /// Enable a KV v2 engine at `path` unless already mounted. Returns whether it was enabled.
    async fn ensure_kv_engine(&self, root_token: &str, path: &str) -> Result<bool>;
}

/// [`VaultApi`] over `kubectl exec`-style pod exec
pub struct KubeVaultApi {
    pods: Api<Pod>,
    pod: String,
    container: String,
}

impl KubeVaultApi {
    /// Client for the configured vault pod
    pub fn new(client: Client, config: &VaultConfig) -> Self {
        Self {
            pods: Api::namespaced(client, &config.namespace),
            pod: config.pod.clone(),
            container: config.container.clone(),
        }
    }

    /// Run a command in the vault container and return stdout.
    ///
    /// `vault status` exits non-zero while sealed, so the exit status is only
    /// consulted when stdout is empty.
    async fn exec(&self, command: Vec<String>) -> Result<String> {
        let shown = command.first().cloned().unwrap_or_default();
        let params = AttachParams::default()
            .container(self.container.clone())
            .stdin(false)
            .stdout(true)
            .stderr(true);
        let mut attached = self
            .pods
            .exec(&self.pod, command, &params)
            .await
            .map_err(|e| trellis_common::Error::from_kube(format!("exec {}", shown), e))?;

        let mut stdout = String::new();
        let mut stderr = String::new();
        if let Some(mut out) = attached.stdout() {
            out.read_to_string(&mut stdout)
                .await
                .map_err(|e| Error::Vault(format!("failed to read stdout: {}", e)))?;
        }
        if let Some(mut err) = attached.stderr() {
            err.read_to_string(&mut stderr)
                .await
                .map_err(|e| Error::Vault(format!("failed to read stderr: {}", e)))?;
        }
        attached
            .join()
            .await
            .map_err(|e| Error::Vault(format!("exec did not complete: {}", e)))?;

        if stdout.trim().is_empty() {
            return Err(Error::Vault(format!(
                "{} produced no output: {}",
                shown,
                stderr.trim()
            )));
        }
        Ok(stdout)
    }

    async fn exec_json<T: for<'de> Deserialize<'de>>(&self, args: &[&str]) -> Result<T> {
        let out = self
            .exec(args.iter().map(|s| s.to_string()).collect())
            .await?;
        serde_json::from_str(&out)
            .map_err(|e| Error::Vault(format!("unexpected output from {}: {}", args.join(" "), e)))
    }
}

#[async_trait]
impl VaultApi for KubeVaultApi {
    async fn container_started(&self) -> Result<bool> {
        let pod = self
            .pods
            .get_opt(&self.pod)
            .await
            .map_err(|e| trellis_common::Error::from_kube(format!("get pod {}", self.pod), e))?;
        Ok(pod
            .and_then(|p| p.status)
            .and_then(|s| s.container_statuses)
            .unwrap_or_default()
            .iter()
            .any(|c| c.name == self.container && c.started == Some(true)))
    }

    async fn status(&self) -> Result<VaultStatus> {
        self.exec_json(&["vault", "status", "-format=json"]).await
    }

    async fn init(&self, key_shares: u8, key_threshold: u8) -> Result<InitResult> {
        let shares = format!("-key-shares={}", key_shares);
        let threshold = format!("-key-threshold={}", key_threshold);
        self.exec_json(&[
            "vault",
            "operator",
            "init",
            "-format=json",
            shares.as_str(),
            threshold.as_str(),
        ])
        .await
    }

    async fn unseal(&self, key: &str) -> Result<VaultStatus> {
        self.exec_json(&["vault", "operator", "unseal", "-format=json", key])
            .await
    }

    async fn ensure_kv_engine(&self, root_token: &str, path: &str) -> Result<bool> {
        let token = format!("VAULT_TOKEN={}", root_token);
        let mounts: BTreeMap<String, serde_json::Value> = self
            .exec_json(&["env", token.as_str(), "vault", "secrets", "list", "-format=json"])
            .await?;
        if mounts.contains_key(&format!("{}/", path)) {
            return Ok(false);
        }
        let mount = format!("-path={}", path);
        self.exec(
            ["env", token.as_str(), "vault", "secrets", "enable", mount.as_str(), "kv-v2"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
        )
        .await?;
        Ok(true)
    }
}

/// What a driver run did
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VaultOutcome {
    /// Whether this run initialized the vault
    pub initialized_now: bool,
    /// Whether the vault was sealed when the run started
    pub was_sealed: bool,
    /// Result of publishing the root token secret
    pub token: ApplyOutcome,
}

/// Drives a vault from pod start to published root token
pub struct VaultDriver<'a> {
    vault: &'a dyn VaultApi,
    store: &'a dyn CredentialStore,
    cluster: &'a dyn ClusterApi,
    config: &'a VaultConfig,
    interval: Duration,
    publish_timeout: Duration,
    cancel: Option<CancellationToken>,
}

impl<'a> VaultDriver<'a> {
    /// Create a driver
    pub fn new(
        vault: &'a dyn VaultApi,
        store: &'a dyn CredentialStore,
        cluster: &'a dyn ClusterApi,
        config: &'a VaultConfig,
        interval: Duration,
        publish_timeout: Duration,
    ) -> Self {
        Self {
            vault,
            store,
            cluster,
            config,
            interval,
            publish_timeout,
            cancel: None,
        }
    }

    /// Abort waits when `token` is cancelled
    pub fn with_cancel(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }

    fn spec(&self, what: String, timeout: Option<Duration>) -> WaitSpec {
        let spec = match timeout {
            Some(timeout) => WaitSpec::new(what, self.interval, timeout),
            None => WaitSpec::unbounded(what, self.interval),
        };
        match &self.cancel {
            Some(token) => spec.with_cancel(token.clone()),
            None => spec,
        }
    }

    /// Run every step. Safe to repeat: a later run skips init and unseal when done.
    pub async fn run(&self) -> Result<VaultOutcome> {
        self.wait_started().await?;

        let status = self.vault.status().await?;
        debug!(initialized = status.initialized, sealed = status.sealed, "Vault status");

        let (credential, initialized_now) = self.initialize_once(status).await?;
        self.unseal(status.sealed || initialized_now, &credential).await?;

        let root_token = credential.get(ROOT_TOKEN_FIELD)?;
        if self.vault.ensure_kv_engine(root_token, &self.config.kv_path).await? {
            info!(path = %self.config.kv_path, "Enabled KV v2 secrets engine");
        }

        let token = self.publish_token(&credential).await?;
        Ok(VaultOutcome {
            initialized_now,
            was_sealed: status.sealed,
            token,
        })
    }

    async fn wait_started(&self) -> Result<()> {
        let spec = self.spec(
            format!("vault pod {}/{} started", self.config.namespace, self.config.pod),
            self.config.pod_start_timeout(),
        );
        let vault = self.vault;
        wait_until(&spec, || async move {
            match vault.container_started().await {
                Ok(true) => Ok(PollResult::Ready(())),
                Ok(false) => Ok(PollResult::NotYetReady("container not started".to_string())),
                Err(Error::Common(e)) => PollResult::from_error(e),
                Err(e) => Ok(PollResult::TransientError(e.to_string())),
            }
        })
        .await?;
        Ok(())
    }

    async fn initialize_once(&self, status: VaultStatus) -> Result<(Credential, bool)> {
        let existing = self.store.load(UNSEAL_IDENTITY)?;

        match (status.initialized, existing) {
            (true, Some(credential)) => {
                debug!("Vault already initialized, reusing local unseal material");
                Ok((credential, false))
            }
            (true, None) => Err(Error::mismatch(
                UNSEAL_IDENTITY,
                format!(
                    "vault is initialized but {} does not exist; the unseal keys cannot be recovered",
                    self.store.location(UNSEAL_IDENTITY)
                ),
            )),
            (false, Some(_)) => Err(Error::mismatch(
                UNSEAL_IDENTITY,
                format!(
                    "vault is uninitialized but {} exists; remove it if the vault was recreated",
                    self.store.location(UNSEAL_IDENTITY)
                ),
            )),
            (false, None) => {
                info!(
                    shares = self.config.key_shares,
                    threshold = self.config.key_threshold,
                    "Initializing vault"
                );
                let init = self
                    .vault
                    .init(self.config.key_shares, self.config.key_threshold)
                    .await?;
                let credential = Credential::new(
                    UNSEAL_IDENTITY,
                    BTreeMap::from([
                        (UNSEAL_KEYS_FIELD.to_string(), init.unseal_keys_b64.join("\n")),
                        (ROOT_TOKEN_FIELD.to_string(), init.root_token),
                    ]),
                );
                self.store.save(&credential)?;
                Ok((credential, true))
            }
        }
    }

    async fn unseal(&self, sealed: bool, credential: &Credential) -> Result<()> {
        if !sealed {
            debug!("Vault already unsealed");
            return Ok(());
        }

        let keys: Vec<&str> = credential
            .get(UNSEAL_KEYS_FIELD)?
            .lines()
            .filter(|k| !k.is_empty())
            .collect();
        for (submitted, key) in keys.iter().enumerate() {
            let status = self.vault.unseal(key).await?;
            if !status.sealed {
                info!(keys = submitted + 1, "Vault unsealed");
                return Ok(());
            }
        }
        warn!(keys = keys.len(), "Vault still sealed after submitting every key");
        Err(Error::mismatch(
            UNSEAL_IDENTITY,
            "vault rejected the stored unseal keys",
        ))
    }

    async fn publish_token(&self, credential: &Credential) -> Result<ApplyOutcome> {
        let target = SecretTarget::new(
            &self.config.token_secret.name,
            &self.config.token_secret.namespace,
            PublishMode::Apply,
        )
        .with_key(ROOT_TOKEN_FIELD, TOKEN_SECRET_KEY);
        let spec = self.spec(
            format!("namespace {}", target.namespace),
            Some(self.publish_timeout),
        );
        publish_credential(self.cluster, credential, &target, &spec).await
    }
}
