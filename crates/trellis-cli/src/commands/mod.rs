//! CLI commands

use std::path::{Path, PathBuf};

use clap::Args;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use trellis_common::config::{BackendKind, BootstrapConfig, ClusterProfile};
use trellis_common::descriptor::DescriptorSet;
use trellis_common::KubeClusterApi;
use trellis_gitops::{backend_for, BackendSettings, GitOpsBackend};
use trellis_secrets::{FileCredentialStore, KubeVaultApi};

use crate::git::Git2Repo;
use crate::Result;

pub mod bootstrap;
pub mod plan;
pub mod publish;
pub mod unseal;

const CONFIG_FILE_NAME: &str = "trellis.yaml";

/// Arguments shared by every command
#[derive(Args, Debug, Clone)]
pub struct ConfigArgs {
    /// Path to the bootstrap configuration
    /// (default: ./trellis.yaml, then the user config directory)
    #[arg(short = 'f', long = "config", env = "TRELLIS_CONFIG")]
    pub config_file: Option<PathBuf>,

    /// GitOps controller (overrides the config file)
    #[arg(long)]
    pub backend: Option<BackendKind>,

    /// Cluster profile (overrides the config file)
    #[arg(long)]
    pub profile: Option<ClusterProfile>,

    /// Kubeconfig to use instead of the default loading rules
    #[arg(long)]
    pub kubeconfig: Option<PathBuf>,
}

impl ConfigArgs {
    /// Config file to read
    pub fn config_path(&self) -> PathBuf {
        if let Some(path) = &self.config_file {
            return path.clone();
        }
        let local = PathBuf::from(CONFIG_FILE_NAME);
        if local.exists() {
            return local;
        }
        dirs::config_dir()
            .map(|dir| dir.join("trellis").join(CONFIG_FILE_NAME))
            .unwrap_or(local)
    }

    /// Load and validate the configuration with flag overrides applied
    pub fn load(&self) -> Result<BootstrapConfig> {
        let path = self.config_path();
        info!("Config file: {}", path.display());
        let mut config = BootstrapConfig::load(&path)?;
        self.apply_overrides(&mut config);
        config.validate()?;
        Ok(config)
    }

    fn apply_overrides(&self, config: &mut BootstrapConfig) {
        if let Some(backend) = self.backend {
            if backend != config.gitops.backend && config.gitops.namespace.is_some() {
                warn!(
                    "--backend {} keeps the configured controller namespace {}",
                    backend,
                    config.gitops.namespace()
                );
            }
            config.gitops.backend = backend;
        }
        if let Some(profile) = self.profile {
            config.profile = profile;
        }
    }
}

/// Load the descriptor source named by the configuration
pub fn load_descriptors(config: &BootstrapConfig) -> Result<DescriptorSet> {
    Ok(DescriptorSet::load(&config.addons_file, config.vault.enabled)?)
}

/// Live collaborators for a run against a real cluster and repository
pub struct Runtime {
    pub cluster: KubeClusterApi,
    pub backend: Box<dyn GitOpsBackend>,
    pub settings: BackendSettings,
    pub store: FileCredentialStore,
    pub repo: Git2Repo,
    pub vault: KubeVaultApi,
    pub cancel: CancellationToken,
}

impl Runtime {
    /// Connect to the cluster and open the working tree and credential store
    pub async fn connect(config: &BootstrapConfig, kubeconfig: Option<&Path>) -> Result<Self> {
        let settings = BackendSettings::from_config(config)?;
        let backend = backend_for(config.gitops.backend, settings.clone());
        let store = FileCredentialStore::new(&config.state_dir, &config.git.path)?;
        let repo = Git2Repo::open(&config.git, settings.credentials.clone())?;
        let cluster = KubeClusterApi::connect(kubeconfig).await?;
        let vault = KubeVaultApi::new(cluster.client().clone(), &config.vault);

        Ok(Self {
            cluster,
            backend,
            settings,
            store,
            repo,
            vault,
            cancel: cancel_on_interrupt(),
        })
    }
}

/// Token cancelled on the first Ctrl-C; in-flight waits stop at their next check
fn cancel_on_interrupt() -> CancellationToken {
    let token = CancellationToken::new();
    let child = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, cancelling");
            child.cancel();
        }
    });
    token
}
