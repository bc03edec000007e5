//! Config repository as seen by the GitOps controller

use std::path::{Path, PathBuf};

use trellis_common::config::BootstrapConfig;
use trellis_common::descriptor::{DeploymentDescriptor, GitSource, ManifestSource, Phase};
use trellis_common::Error;

/// Credentials for the config repository, read from the configured file
#[derive(Clone, PartialEq, Eq)]
pub enum GitCredentials {
    /// HTTPS basic auth with a token as password
    Token {
        /// User name (`git` unless the file says `user:token`)
        username: String,
        /// Token
        token: String,
    },
    /// SSH private key
    SshKey {
        /// Path to the key file
        path: PathBuf,
        /// PEM/OpenSSH key body
        private_key: String,
    },
}

impl std::fmt::Debug for GitCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Token { username, .. } => write!(f, "Token({})", username),
            Self::SshKey { path, .. } => write!(f, "SshKey({})", path.display()),
        }
    }
}

impl GitCredentials {
    /// Read a key or token file. A file containing a private key block is an SSH key.
    pub fn load(path: &Path) -> Result<Self, Error> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::config(format!(
                "failed to read git credentials {}: {}",
                path.display(),
                e
            ))
        })?;
        Ok(Self::parse(path, &content))
    }

    fn parse(path: &Path, content: &str) -> Self {
        if content.contains("PRIVATE KEY-----") {
            return Self::SshKey {
                path: path.to_path_buf(),
                private_key: content.to_string(),
            };
        }
        let line = content.trim();
        match line.split_once(':') {
            Some((username, token)) if !username.is_empty() => Self::Token {
                username: username.to_string(),
                token: token.to_string(),
            },
            _ => Self::Token {
                username: "git".to_string(),
                token: line.to_string(),
            },
        }
    }
}

/// Everything a backend needs to know about the run
#[derive(Debug, Clone)]
pub struct BackendSettings {
    /// Cluster name
    pub cluster_name: String,
    /// Controller namespace
    pub namespace: String,
    /// Controller install manifest
    pub install_manifest: PathBuf,
    /// Config repository URL as the controller fetches it
    pub repo_url: String,
    /// Branch the controller tracks
    pub branch: String,
    /// Rendered config directory within the repository
    pub cluster_dir: String,
    /// Repository credentials, if the repository is private
    pub credentials: Option<GitCredentials>,
}

impl BackendSettings {
    /// Derive from the bootstrap configuration, reading the credentials file if set
    pub fn from_config(config: &BootstrapConfig) -> Result<Self, Error> {
        let credentials = config
            .git
            .credentials
            .as_deref()
            .map(GitCredentials::load)
            .transpose()?;
        Ok(Self {
            cluster_name: config.cluster_name.clone(),
            namespace: config.gitops.namespace().to_string(),
            install_manifest: config.gitops.install_manifest.clone(),
            repo_url: config.git.url.clone(),
            branch: config.git.branch.clone(),
            cluster_dir: config.cluster_dir().to_string_lossy().into_owned(),
            credentials,
        })
    }

    /// Name of the root deployment that reconciles the rendered cluster directory
    pub fn root_name(&self) -> String {
        format!("{}-config", self.cluster_name)
    }

    /// Root deployment: the rendered cluster directory of the config repository
    pub fn root_descriptor(&self) -> DeploymentDescriptor {
        DeploymentDescriptor {
            name: self.root_name(),
            namespace: self.namespace.clone(),
            phase: Phase::Observability,
            source: ManifestSource::Git(GitSource {
                repo: None,
                path: self.cluster_dir.clone(),
                revision: None,
            }),
        }
    }

    /// Repository and revision a git source resolves to
    pub fn resolve_git<'a>(&'a self, git: &'a GitSource) -> (&'a str, &'a str) {
        (
            git.repo.as_deref().unwrap_or(&self.repo_url),
            git.revision.as_deref().unwrap_or(&self.branch),
        )
    }
}

#[cfg(test)]
pub(crate) fn test_settings(namespace: &str) -> BackendSettings {
    BackendSettings {
        cluster_name: "dev".to_string(),
        namespace: namespace.to_string(),
        install_manifest: PathBuf::from("/bootstrap/install.yaml"),
        repo_url: "https://git.example.com/platform-config.git".to_string(),
        branch: "main".to_string(),
        cluster_dir: "clusters/dev".to_string(),
        credentials: Some(GitCredentials::Token {
            username: "git".to_string(),
            token: "ghp_token".to_string(),
        }),
    }
}
