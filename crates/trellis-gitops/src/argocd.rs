//! Argo CD backend: Applications, ApplicationSets and repository secrets

use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde_json::{json, Map, Value};
use trellis_common::config::BackendKind;
use trellis_common::descriptor::{DeploymentDescriptor, HelmSource, ManifestSource};
use trellis_common::kube_utils::{condition_status, field_at, field_str, STATUS_TRUE};
use trellis_common::{ObjectRef, MANAGED_BY_LABEL};
use trellis_secrets::{PublishMode, SecretTarget};

use crate::backend::{ControllerCredential, GitOpsBackend, InstallPlan, RefreshRequest};
use crate::source::{BackendSettings, GitCredentials};
use crate::status::{HealthState, ReconciliationStatus, SyncState};

/// apiVersion of Argo CD resources
pub const ARGOCD_API_VERSION: &str = "argoproj.io/v1alpha1";

const REFRESH_ANNOTATION: &str = "argocd.argoproj.io/refresh";
const IN_CLUSTER: &str = "https://kubernetes.default.svc";

/// Argo CD controller
#[derive(Debug, Clone)]
pub struct ArgoCd {
    settings: BackendSettings,
}

impl ArgoCd {
    /// Backend for a controller installed in `settings.namespace`
    pub fn new(settings: BackendSettings) -> Self {
        Self { settings }
    }

    fn source(&self, source: &ManifestSource) -> Value {
        match source {
            ManifestSource::Helm(helm) => helm_source(helm),
            ManifestSource::Git(git) => {
                let (repo, revision) = self.settings.resolve_git(git);
                json!({ "repoURL": repo, "path": git.path, "targetRevision": revision })
            }
        }
    }

    fn labels(&self) -> Value {
        json!({ MANAGED_BY_LABEL: "trellis" })
    }
}

fn helm_source(helm: &HelmSource) -> Value {
    // Argo CD takes OCI registries without the scheme
    let repo = helm.registry.strip_prefix("oci://").unwrap_or(&helm.registry);
    let mut source = json!({
        "repoURL": repo,
        "chart": helm.chart,
        "targetRevision": helm.version
    });
    if let Some(values) = &helm.values {
        source["helm"] = json!({ "valuesObject": values });
    }
    source
}

fn sync_policy() -> Value {
    json!({
        "automated": { "prune": true, "selfHeal": true },
        "syncOptions": ["CreateNamespace=true", "ServerSideApply=true"]
    })
}

impl GitOpsBackend for ArgoCd {
    fn kind(&self) -> BackendKind {
        BackendKind::Argocd
    }

    fn install_plan(&self) -> InstallPlan {
        InstallPlan {
            manifest: self.settings.install_manifest.clone(),
            namespace: self.settings.namespace.clone(),
            deployments: [
                "argocd-server",
                "argocd-repo-server",
                "argocd-redis",
                "argocd-applicationset-controller",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
        }
    }

    fn source_manifests(&self) -> Vec<Value> {
        let mut data = Map::new();
        let mut put = |key: &str, value: &str| {
            data.insert(key.to_string(), Value::String(STANDARD.encode(value)));
        };
        put("type", "git");
        put("url", &self.settings.repo_url);
        match &self.settings.credentials {
            Some(GitCredentials::Token { username, token }) => {
                put("username", username);
                put("password", token);
            }
            Some(GitCredentials::SshKey { private_key, .. }) => put("sshPrivateKey", private_key),
            None => {}
        }

        vec![json!({
            "apiVersion": "v1",
            "kind": "Secret",
            "metadata": {
                "name": format!("{}-repo", self.settings.root_name()),
                "namespace": self.settings.namespace,
                "labels": {
                    "argocd.argoproj.io/secret-type": "repository",
                    MANAGED_BY_LABEL: "trellis"
                }
            },
            "type": "Opaque",
            "data": data
        })]
    }

    fn workload_manifests(&self, descriptor: &DeploymentDescriptor) -> Vec<Value> {
        vec![json!({
            "apiVersion": ARGOCD_API_VERSION,
            "kind": "Application",
            "metadata": {
                "name": descriptor.name,
                "namespace": self.settings.namespace,
                "labels": self.labels()
            },
            "spec": {
                "project": "default",
                "source": self.source(&descriptor.source),
                "destination": { "server": IN_CLUSTER, "namespace": descriptor.namespace },
                "syncPolicy": sync_policy()
            }
        })]
    }

    fn status_ref(&self, descriptor: &DeploymentDescriptor) -> ObjectRef {
        ObjectRef::namespaced(
            ARGOCD_API_VERSION,
            "Application",
            &self.settings.namespace,
            &descriptor.name,
        )
    }

    fn parse_status(&self, object: &Value) -> ReconciliationStatus {
        ReconciliationStatus::new(
            field_str(object, ".status.sync.status")
                .map(SyncState::parse)
                .unwrap_or_default(),
            field_str(object, ".status.health.status")
                .map(HealthState::parse)
                .unwrap_or_default(),
        )
    }

    fn generator_ref(&self, name: &str) -> ObjectRef {
        ObjectRef::namespaced(ARGOCD_API_VERSION, "ApplicationSet", &self.settings.namespace, name)
    }

    fn generator_up_to_date(&self, object: &Value) -> bool {
        condition_status(object, "ResourcesUpToDate") == Some(STATUS_TRUE)
    }

    fn generator_manifest(&self, name: &str, items: &[DeploymentDescriptor]) -> Value {
        let elements: Vec<Value> = items
            .iter()
            .map(|item| {
                json!({
                    "name": item.name,
                    "namespace": item.namespace,
                    "source": self.source(&item.source)
                })
            })
            .collect();

        json!({
            "apiVersion": ARGOCD_API_VERSION,
            "kind": "ApplicationSet",
            "metadata": {
                "name": name,
                "namespace": self.settings.namespace,
                "labels": self.labels()
            },
            "spec": {
                "goTemplate": true,
                "goTemplateOptions": ["missingkey=error"],
                "generators": [{ "list": { "elements": elements } }],
                "template": {
                    "metadata": { "name": "{{.name}}", "labels": self.labels() },
                    "spec": {
                        "project": "default",
                        "destination": { "server": IN_CLUSTER, "namespace": "{{.namespace}}" },
                        "syncPolicy": sync_policy()
                    }
                },
                "templatePatch": "spec:\n  source: {{ toJson .source }}\n"
            }
        })
    }

    fn refresh_ref(&self) -> ObjectRef {
        ObjectRef::namespaced(
            ARGOCD_API_VERSION,
            "Application",
            &self.settings.namespace,
            self.settings.root_name(),
        )
    }

    fn refresh_request(&self) -> RefreshRequest {
        RefreshRequest {
            patch: json!({ "metadata": { "annotations": { REFRESH_ANNOTATION: "hard" } } }),
            token: "hard".to_string(),
        }
    }

    // The controller removes the annotation once the refresh is processed
    fn refresh_complete(&self, object: &Value, _token: &str) -> bool {
        field_at(object, ".metadata.annotations")
            .and_then(|a| a.get(REFRESH_ANNOTATION))
            .is_none()
    }

    fn controller_credentials(&self) -> Vec<ControllerCredential> {
        vec![ControllerCredential {
            identity: "argocd-server".to_string(),
            field: "secretkey".to_string(),
            length: 32,
            target: SecretTarget::new("argocd-secret", &self.settings.namespace, PublishMode::PatchExisting)
                .with_key("secretkey", "server.secretkey"),
        }]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::test_settings;
    use trellis_common::descriptor::{GitSource, Phase};

    fn argocd() -> ArgoCd {
        ArgoCd::new(test_settings("argocd"))
    }

    fn ingress() -> DeploymentDescriptor {
        DeploymentDescriptor {
            name: "ingress-nginx".to_string(),
            namespace: "ingress-nginx".to_string(),
            phase: Phase::Ingress,
            source: ManifestSource::Helm(HelmSource {
                registry: "https://kubernetes.github.io/ingress-nginx".to_string(),
                chart: "ingress-nginx".to_string(),
                version: "4.11.3".to_string(),
                values: Some(json!({ "controller": { "replicaCount": 1 } })),
            }),
        }
    }

    fn grafana() -> DeploymentDescriptor {
        DeploymentDescriptor {
            name: "grafana".to_string(),
            namespace: "observability".to_string(),
            phase: Phase::Observability,
            source: ManifestSource::Git(GitSource {
                repo: None,
                path: "addons/grafana".to_string(),
                revision: None,
            }),
        }
    }

    #[test]
    fn helm_application() {
        let manifests = argocd().workload_manifests(&ingress());
        assert_eq!(manifests.len(), 1);
        let app = &manifests[0];
        assert_eq!(app["kind"], "Application");
        assert_eq!(app["metadata"]["namespace"], "argocd");
        assert_eq!(app["spec"]["source"]["chart"], "ingress-nginx");
        assert_eq!(
            app["spec"]["source"]["helm"]["valuesObject"]["controller"]["replicaCount"],
            1
        );
        assert_eq!(app["spec"]["destination"]["namespace"], "ingress-nginx");
        assert_eq!(
            app["spec"]["syncPolicy"]["syncOptions"][0],
            "CreateNamespace=true"
        );
    }

    #[test]
    fn oci_registry_loses_scheme() {
        let helm = HelmSource {
            registry: "oci://ghcr.io/grafana/helm-charts".to_string(),
            chart: "grafana".to_string(),
            version: "8.5.0".to_string(),
            values: None,
        };
        let source = helm_source(&helm);
        assert_eq!(source["repoURL"], "ghcr.io/grafana/helm-charts");
        assert!(source.get("helm").is_none());
    }

    #[test]
    fn git_application_uses_config_repository() {
        let app = &argocd().workload_manifests(&grafana())[0];
        assert_eq!(
            app["spec"]["source"]["repoURL"],
            "https://git.example.com/platform-config.git"
        );
        assert_eq!(app["spec"]["source"]["targetRevision"], "main");
    }

    #[test]
    fn status_from_sync_and_health() {
        let app = json!({ "status": { "sync": { "status": "Synced" }, "health": { "status": "Healthy" } } });
        assert!(argocd().parse_status(&app).is_converged());

        let app = json!({ "status": { "sync": { "status": "OutOfSync" } } });
        let status = argocd().parse_status(&app);
        assert_eq!(status.sync, SyncState::OutOfSync);
        assert_eq!(status.health, HealthState::Unknown);
    }

    #[test]
    fn repository_secret_carries_token() {
        let secret = &argocd().source_manifests()[0];
        assert_eq!(
            secret["metadata"]["labels"]["argocd.argoproj.io/secret-type"],
            "repository"
        );
        assert_eq!(secret["data"]["password"], STANDARD.encode("ghp_token"));
        assert_eq!(
            secret["data"]["url"],
            STANDARD.encode("https://git.example.com/platform-config.git")
        );
    }

    #[test]
    fn application_set_lists_items() {
        let appset = argocd().generator_manifest("observability", &[grafana(), ingress()]);
        assert_eq!(appset["kind"], "ApplicationSet");
        let elements = &appset["spec"]["generators"][0]["list"]["elements"];
        assert_eq!(elements[0]["name"], "grafana");
        assert_eq!(elements[1]["source"]["chart"], "ingress-nginx");
        assert!(appset["spec"]["templatePatch"]
            .as_str()
            .unwrap()
            .contains("toJson .source"));
    }

    #[test]
    fn generator_up_to_date_condition() {
        let appset = json!({ "status": { "conditions": [{ "type": "ResourcesUpToDate", "status": "True" }] } });
        assert!(argocd().generator_up_to_date(&appset));
        assert!(!argocd().generator_up_to_date(&json!({})));
    }

    #[test]
    fn refresh_completes_when_annotation_cleared() {
        let backend = argocd();
        let request = backend.refresh_request();
        assert_eq!(
            request.patch["metadata"]["annotations"]["argocd.argoproj.io/refresh"],
            "hard"
        );

        let pending = json!({ "metadata": { "annotations": { "argocd.argoproj.io/refresh": "hard" } } });
        assert!(!backend.refresh_complete(&pending, &request.token));
        let done = json!({ "metadata": { "annotations": {} } });
        assert!(backend.refresh_complete(&done, &request.token));
        assert_eq!(backend.refresh_ref().name, "dev-config");
    }

    #[test]
    fn server_secret_key_patches_controller_secret() {
        let creds = argocd().controller_credentials();
        assert_eq!(creds.len(), 1);
        assert_eq!(creds[0].target.name, "argocd-secret");
        assert_eq!(creds[0].target.mode, PublishMode::PatchExisting);
        assert_eq!(creds[0].target.key_map["secretkey"], "server.secretkey");
    }
}
