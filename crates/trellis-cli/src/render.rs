//! Render cluster parameters into the config repository
//!
//! Output is a pure function of its inputs: files are emitted in sorted order
//! and JSON/YAML maps serialize with sorted keys, so re-rendering an unchanged
//! cluster produces byte-identical files.

use std::path::{Path, PathBuf};

use minijinja::{Environment, UndefinedBehavior};
use serde::Serialize;
use serde_json::{json, Value};
use trellis_common::config::BootstrapConfig;

use crate::Result;

/// File holding the cluster parameters as a ConfigMap
pub const CLUSTER_VALUES_FILE: &str = "cluster-values.yaml";

/// ConfigMap name for the cluster parameters
pub const CLUSTER_VALUES_NAME: &str = "cluster-values";

const TEMPLATE_SUFFIX: &str = ".j2";

/// Facts about the cluster discovered during bootstrap
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ClusterParameters {
    /// Cluster name
    pub cluster_name: String,
    /// Wildcard DNS suffix for ingress hosts
    pub dns_suffix: String,
    /// Address of the ingress controller service
    pub ingress_ip: String,
    /// Default storage class
    pub storage_class: String,
    /// Root CA certificate (PEM, public part only)
    pub ca_cert: String,
}

/// One rendered file, relative to the working tree
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderedFile {
    /// Path relative to the working tree root
    pub path: PathBuf,
    /// File content
    pub content: String,
}

/// Everything rendered for one cluster
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RenderedConfig {
    /// Rendered files in emission order
    pub files: Vec<RenderedFile>,
}

impl RenderedConfig {
    /// Paths of all rendered files
    pub fn paths(&self) -> Vec<PathBuf> {
        self.files.iter().map(|f| f.path.clone()).collect()
    }

    /// Write every file under `root`, leaving files whose content already matches untouched.
    ///
    /// Returns the number of files written.
    pub fn write_to(&self, root: &Path) -> Result<usize> {
        let mut written = 0;
        for file in &self.files {
            let target = root.join(&file.path);
            if std::fs::read_to_string(&target).ok().as_deref() == Some(file.content.as_str()) {
                continue;
            }
            if let Some(parent) = target.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::write(&target, &file.content)?;
            written += 1;
        }
        Ok(written)
    }
}

/// Render the cluster directory: parameters ConfigMap, templates, then the generator
pub fn render(
    config: &BootstrapConfig,
    params: &ClusterParameters,
    generator: Option<(&str, &Value)>,
) -> Result<RenderedConfig> {
    let cluster_dir = config.cluster_dir();
    let mut files = vec![RenderedFile {
        path: cluster_dir.join(CLUSTER_VALUES_FILE),
        content: serde_yaml::to_string(&cluster_values(config, params))?,
    }];

    let templates_dir = config.git.path.join(&config.git.templates_dir);
    for (name, source) in read_templates(&templates_dir)? {
        let output = name.trim_end_matches(TEMPLATE_SUFFIX).to_string();
        files.push(RenderedFile {
            path: cluster_dir.join(output),
            content: render_template(&name, &source, params)?,
        });
    }

    if let Some((name, manifest)) = generator {
        files.push(RenderedFile {
            path: cluster_dir.join(format!("{}.yaml", name)),
            content: serde_yaml::to_string(manifest)?,
        });
    }

    Ok(RenderedConfig { files })
}

fn cluster_values(config: &BootstrapConfig, params: &ClusterParameters) -> Value {
    json!({
        "apiVersion": "v1",
        "kind": "ConfigMap",
        "metadata": {
            "name": CLUSTER_VALUES_NAME,
            "namespace": config.gitops.namespace(),
            "labels": { (trellis_common::MANAGED_BY_LABEL): trellis_common::FIELD_MANAGER }
        },
        "data": {
            "clusterName": params.cluster_name,
            "dnsSuffix": params.dns_suffix,
            "ingressIP": params.ingress_ip,
            "storageClass": params.storage_class,
            "caCert": params.ca_cert,
        }
    })
}

/// `*.j2` files in `dir`, sorted by name. A missing directory has no templates.
fn read_templates(dir: &Path) -> Result<Vec<(String, String)>> {
    if !dir.is_dir() {
        return Ok(Vec::new());
    }
    let mut templates = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        if path.is_file() && name.ends_with(TEMPLATE_SUFFIX) {
            templates.push((name.to_string(), std::fs::read_to_string(&path)?));
        }
    }
    templates.sort();
    Ok(templates)
}

fn render_template(name: &str, source: &str, params: &ClusterParameters) -> Result<String> {
    let mut env = Environment::new();
    env.set_undefined_behavior(UndefinedBehavior::Strict);
    env.set_keep_trailing_newline(true);
    Ok(env.render_named_str(name, source, params)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(repo: &Path) -> BootstrapConfig {
        let mut config = BootstrapConfig::from_yaml(
            r#"
clusterName: dev
gitops:
  backend: argocd
  installManifest: /bootstrap/argocd.yaml
git:
  path: /tmp/placeholder
  url: https://git.example.com/platform-config.git
stateDir: /var/lib/trellis
"#,
        )
        .unwrap();
        config.git.path = repo.to_path_buf();
        config
    }

    fn params() -> ClusterParameters {
        ClusterParameters {
            cluster_name: "dev".to_string(),
            dns_suffix: "test.local".to_string(),
            ingress_ip: "10.0.0.5".to_string(),
            storage_class: "standard".to_string(),
            ca_cert: "-----BEGIN CERTIFICATE-----\nMIIB\n-----END CERTIFICATE-----\n".to_string(),
        }
    }

    #[test]
    fn renders_values_templates_and_generator() {
        let repo = tempfile::tempdir().unwrap();
        let templates = repo.path().join("templates");
        std::fs::create_dir_all(&templates).unwrap();
        std::fs::write(
            templates.join("ingress-host.yaml.j2"),
            "host: grafana.{{ dns_suffix }}\nip: {{ ingress_ip }}\n",
        )
        .unwrap();
        std::fs::write(templates.join("README.md"), "not a template").unwrap();

        let generator = json!({ "kind": "ApplicationSet", "metadata": { "name": "observability" } });
        let rendered = render(&config(repo.path()), &params(), Some(("observability", &generator)))
            .unwrap();

        assert_eq!(
            rendered.paths(),
            vec![
                PathBuf::from("clusters/dev/cluster-values.yaml"),
                PathBuf::from("clusters/dev/ingress-host.yaml"),
                PathBuf::from("clusters/dev/observability.yaml"),
            ]
        );
        assert_eq!(
            rendered.files[1].content,
            "host: grafana.test.local\nip: 10.0.0.5\n"
        );
        let values: Value = serde_yaml::from_str(&rendered.files[0].content).unwrap();
        assert_eq!(values["data"]["ingressIP"], "10.0.0.5");
        assert_eq!(values["metadata"]["namespace"], "argocd");
    }

    #[test]
    fn undefined_template_variable_fails() {
        let repo = tempfile::tempdir().unwrap();
        let templates = repo.path().join("templates");
        std::fs::create_dir_all(&templates).unwrap();
        std::fs::write(templates.join("bad.yaml.j2"), "x: {{ region }}\n").unwrap();

        let err = render(&config(repo.path()), &params(), None).unwrap_err();
        assert!(matches!(err, crate::Error::Template(_)));
    }

    #[test]
    fn rendering_is_deterministic_and_writes_only_changes() {
        let repo = tempfile::tempdir().unwrap();
        let config = config(repo.path());

        let first = render(&config, &params(), None).unwrap();
        let second = render(&config, &params(), None).unwrap();
        assert_eq!(first, second);

        assert_eq!(first.write_to(repo.path()).unwrap(), 1);
        assert_eq!(second.write_to(repo.path()).unwrap(), 0);
    }
}
