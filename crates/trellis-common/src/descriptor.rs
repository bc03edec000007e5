//! Deployment descriptors and the add-on descriptor source
//!
//! The descriptor source is a YAML file listing add-ons. Each entry becomes
//! one [`DeploymentDescriptor`]: read once per run and never mutated. The
//! `phase` of an entry decides where in the bootstrap sequence it deploys.
//!
//! ```yaml
//! addons:
//!   - name: ingress-nginx
//!     namespace: ingress-nginx
//!     phase: ingress
//!     helm:
//!       registry: https://kubernetes.github.io/ingress-nginx
//!       chart: ingress-nginx
//!       version: 4.11.3
//!   - name: grafana
//!     namespace: observability
//!     phase: observability
//!     git:
//!       path: addons/grafana
//! ```

use std::collections::HashSet;
use std::fmt;
use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::Error;

/// Where in the bootstrap sequence an add-on deploys
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    /// Before ingress: cert-manager, external-secrets and similar
    Core,
    /// The ingress controller whose address is published
    Ingress,
    /// Secret management
    Vault,
    /// Delivered through a generator committed to the config repository
    Observability,
    /// Everything else, after vault is unsealed
    Addons,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Core => "core",
            Self::Ingress => "ingress",
            Self::Vault => "vault",
            Self::Observability => "observability",
            Self::Addons => "addons",
        };
        f.write_str(s)
    }
}

/// A helm chart from a repository
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HelmSource {
    /// Chart repository URL (`oci://` or `https://`)
    pub registry: String,
    /// Chart name
    pub chart: String,
    /// Chart version
    pub version: String,
    /// Inline values
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub values: Option<Value>,
}

/// Plain manifests or kustomization from a git repository
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GitSource {
    /// Repository URL; `None` means the config repository itself
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub repo: Option<String>,
    /// Path within the repository
    pub path: String,
    /// Branch, tag or commit; `None` tracks the configured branch
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub revision: Option<String>,
}

/// Manifest reference of a descriptor
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ManifestSource {
    /// Helm chart
    Helm(HelmSource),
    /// Git path
    Git(GitSource),
}

/// One add-on to deploy through the GitOps controller
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeploymentDescriptor {
    /// Add-on name; also the name of the controller object
    pub name: String,
    /// Namespace the add-on is deployed into
    pub namespace: String,
    /// Bootstrap phase
    pub phase: Phase,
    /// Manifest reference
    #[serde(flatten)]
    pub source: ManifestSource,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct DescriptorFile {
    addons: Vec<DeploymentDescriptor>,
}

/// All descriptors of a run, in file order
#[derive(Debug, Clone, PartialEq)]
pub struct DescriptorSet {
    addons: Vec<DeploymentDescriptor>,
}

impl DescriptorSet {
    /// Load and validate a descriptor source file
    pub fn load(path: &Path, vault_enabled: bool) -> Result<Self, Error> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::config(format!("failed to read {}: {}", path.display(), e))
        })?;
        let set = Self::from_yaml(&content)?;
        set.validate(vault_enabled)?;
        Ok(set)
    }

    /// Parse without validating
    pub fn from_yaml(content: &str) -> Result<Self, Error> {
        let file: DescriptorFile = serde_yaml::from_str(content)
            .map_err(|e| Error::config(format!("invalid descriptor source: {}", e)))?;
        Ok(Self { addons: file.addons })
    }

    /// Build from descriptors already in memory
    pub fn new(addons: Vec<DeploymentDescriptor>) -> Self {
        Self { addons }
    }

    /// Check names are unique DNS labels and the singleton phases are present once
    pub fn validate(&self, vault_enabled: bool) -> Result<(), Error> {
        let mut seen = HashSet::new();
        for addon in &self.addons {
            if addon.name.is_empty() || addon.namespace.is_empty() {
                return Err(Error::config("add-on name and namespace must not be empty"));
            }
            if !seen.insert(addon.name.as_str()) {
                return Err(Error::config(format!("duplicate add-on '{}'", addon.name)));
            }
        }

        let ingress = self.in_phase(Phase::Ingress).count();
        if ingress != 1 {
            return Err(Error::config(format!(
                "exactly one ingress add-on is required, found {}",
                ingress
            )));
        }
        let vault = self.in_phase(Phase::Vault).count();
        if vault_enabled && vault != 1 {
            return Err(Error::config(format!(
                "exactly one vault add-on is required when vault is enabled, found {}",
                vault
            )));
        }
        Ok(())
    }

    /// Descriptors of one phase, in file order
    pub fn in_phase(&self, phase: Phase) -> impl Iterator<Item = &DeploymentDescriptor> {
        self.addons.iter().filter(move |a| a.phase == phase)
    }

    /// The single descriptor of a singleton phase (ingress, vault)
    pub fn single(&self, phase: Phase) -> Result<&DeploymentDescriptor, Error> {
        let mut found = self.in_phase(phase);
        match (found.next(), found.next()) {
            (Some(addon), None) => Ok(addon),
            _ => Err(Error::config(format!(
                "expected exactly one {} add-on",
                phase
            ))),
        }
    }

    /// Every descriptor, in file order
    pub fn all(&self) -> &[DeploymentDescriptor] {
        &self.addons
    }
}
