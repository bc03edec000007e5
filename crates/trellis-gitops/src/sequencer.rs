//! GitOps deployment sequencer
//!
//! ```text
//! NotSubmitted -> Submitted -> {OutOfSync | Progressing} -> Synced & Healthy
//!                      \______________________________________/
//!                                        |
//!                                     TimedOut
//! ```
//!
//! A deployment is submitted through the applier and then polled until the
//! controller reports it Synced and Healthy. No other combination satisfies
//! the wait. On timeout the current object is fetched once more and its
//! describe-style dump travels with the error.

use std::time::Duration;

use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};
use trellis_common::descriptor::DeploymentDescriptor;
use trellis_common::kube_utils::{
    apply_documents, describe, wait_for_deployments_available, wait_for_object,
};
use trellis_common::{wait_until, ApplyOutcome, ClusterApi, Error, ObjectRef, PollResult, WaitSpec};

use crate::backend::GitOpsBackend;
use crate::status::ReconciliationStatus;

/// Wait budgets for the sequencer
#[derive(Debug, Clone)]
pub struct SequencerTimeouts {
    /// Interval between status polls
    pub interval: Duration,
    /// Budget for one deployment to converge
    pub deploy: Duration,
    /// Budget for a forced refresh
    pub refresh: Duration,
    /// Budget for the controller install
    pub install: Duration,
}

impl Default for SequencerTimeouts {
    fn default() -> Self {
        Self {
            interval: trellis_common::poll::DEFAULT_POLL_INTERVAL,
            deploy: trellis_common::poll::DEFAULT_WAIT_TIMEOUT,
            refresh: Duration::from_secs(120),
            install: trellis_common::poll::DEFAULT_WAIT_TIMEOUT,
        }
    }
}

/// Result of a refresh request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshOutcome {
    /// The controller re-read its source
    Refreshed,
    /// Nothing to refresh yet; the controller reads the latest revision when the object is created
    Skipped,
}

/// Drives deployments through one GitOps backend
pub struct DeploymentSequencer<'a> {
    cluster: &'a dyn ClusterApi,
    backend: &'a dyn GitOpsBackend,
    timeouts: SequencerTimeouts,
    cancel: Option<CancellationToken>,
}

impl<'a> DeploymentSequencer<'a> {
    /// Create a sequencer
    pub fn new(
        cluster: &'a dyn ClusterApi,
        backend: &'a dyn GitOpsBackend,
        timeouts: SequencerTimeouts,
    ) -> Self {
        Self {
            cluster,
            backend,
            timeouts,
            cancel: None,
        }
    }

    /// Abort waits when `token` is cancelled
    pub fn with_cancel(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }

    /// The backend in use
    pub fn backend(&self) -> &dyn GitOpsBackend {
        self.backend
    }

    fn spec(&self, what: String, timeout: Duration) -> WaitSpec {
        let spec = WaitSpec::new(what, self.timeouts.interval, timeout);
        match &self.cancel {
            Some(token) => spec.with_cancel(token.clone()),
            None => spec,
        }
    }

    /// Apply the controller install manifest and wait for its deployments
    pub async fn install_controller(&self) -> Result<(), Error> {
        let plan = self.backend.install_plan();
        let yaml = std::fs::read_to_string(&plan.manifest).map_err(|e| {
            Error::config(format!(
                "failed to read install manifest {}: {}",
                plan.manifest.display(),
                e
            ))
        })?;

        let outcomes = apply_documents(self.cluster, &yaml).await?;
        let changed = outcomes
            .iter()
            .filter(|o| **o != ApplyOutcome::Unchanged)
            .count();
        info!(
            controller = %self.backend.kind(),
            objects = outcomes.len(),
            changed,
            "Applied controller install manifest"
        );

        let spec = self.spec(
            format!("{} controller deployments", self.backend.kind()),
            self.timeouts.install,
        );
        wait_for_deployments_available(self.cluster, &plan.namespace, &plan.deployments, &spec)
            .await
    }

    /// Register the config repository with the controller
    pub async fn register_source(&self) -> Result<ApplyOutcome, Error> {
        self.apply_all(&self.backend.source_manifests()).await
    }

    /// Submit a deployment without waiting
    pub async fn submit(&self, descriptor: &DeploymentDescriptor) -> Result<ApplyOutcome, Error> {
        let outcome = self
            .apply_all(&self.backend.workload_manifests(descriptor))
            .await?;
        info!(deployment = %descriptor.name, outcome = %outcome, "Submitted");
        Ok(outcome)
    }

    async fn apply_all(&self, manifests: &[Value]) -> Result<ApplyOutcome, Error> {
        let mut combined = ApplyOutcome::Unchanged;
        for manifest in manifests {
            combined = match (combined, self.cluster.apply(manifest).await?) {
                (ApplyOutcome::Created, _) | (_, ApplyOutcome::Created) => ApplyOutcome::Created,
                (ApplyOutcome::Updated, _) | (_, ApplyOutcome::Updated) => ApplyOutcome::Updated,
                _ => ApplyOutcome::Unchanged,
            };
        }
        Ok(combined)
    }

    /// Block until the deployment reports Synced and Healthy
    pub async fn await_converged(
        &self,
        descriptor: &DeploymentDescriptor,
    ) -> Result<ReconciliationStatus, Error> {
        self.await_status(&self.backend.status_ref(descriptor)).await
    }

    async fn await_status(&self, object: &ObjectRef) -> Result<ReconciliationStatus, Error> {
        let spec = self.spec(format!("{} Synced and Healthy", object), self.timeouts.deploy);
        let cluster = self.cluster;
        let backend = self.backend;

        let waited = wait_until(&spec, || async move {
            match cluster.get(object).await {
                Ok(Some(value)) => {
                    let status = backend.parse_status(&value);
                    if status.is_converged() {
                        Ok(PollResult::Ready(status))
                    } else {
                        Ok(PollResult::NotYetReady(status.to_string()))
                    }
                }
                Ok(None) => Ok(PollResult::NotYetReady(format!("{} not found", object))),
                Err(e) => PollResult::from_error(e),
            }
        })
        .await;

        match waited {
            Ok(status) => {
                info!(object = %object, "Synced and Healthy");
                Ok(status)
            }
            Err(Error::Timeout {
                what,
                last_observed,
                elapsed,
            }) => Err(self.timeout_with_dump(object, what, last_observed, elapsed).await),
            Err(e) => Err(e),
        }
    }

    async fn timeout_with_dump(
        &self,
        object: &ObjectRef,
        what: String,
        last_observed: Option<String>,
        elapsed: Duration,
    ) -> Error {
        let dump = match self.cluster.get(object).await {
            Ok(Some(value)) => describe(&value),
            Ok(None) => format!("{} does not exist", object),
            Err(e) => format!("failed to fetch {}: {}", object, e),
        };
        error!(object = %object, elapsed = ?elapsed, "Timed out waiting for reconciliation\n{}", dump);

        let observed = match last_observed {
            Some(status) => format!("{}\n{}", status, dump),
            None => dump,
        };
        Error::timeout(what, Some(observed), elapsed)
    }

    /// Submit, then block until Synced and Healthy
    pub async fn deploy(
        &self,
        descriptor: &DeploymentDescriptor,
    ) -> Result<ReconciliationStatus, Error> {
        self.submit(descriptor).await?;
        self.await_converged(descriptor).await
    }

    /// Wait for a generator to exist and settle, then for every derived deployment to converge
    pub async fn deploy_via_generator(
        &self,
        name: &str,
        items: &[DeploymentDescriptor],
    ) -> Result<(), Error> {
        let generator = &self.backend.generator_ref(name);
        let spec = self.spec(format!("{} to exist", generator), self.timeouts.deploy);
        wait_for_object(self.cluster, generator, &spec).await?;

        let cluster = self.cluster;
        let backend = self.backend;
        let spec = self.spec(format!("{} up to date", generator), self.timeouts.deploy);
        wait_until(&spec, || async move {
            match cluster.get(generator).await {
                Ok(Some(value)) if backend.generator_up_to_date(&value) => Ok(PollResult::Ready(())),
                Ok(Some(_)) => Ok(PollResult::NotYetReady(format!(
                    "{} has not generated every object",
                    generator
                ))),
                Ok(None) => Ok(PollResult::NotYetReady(format!("{} not found", generator))),
                Err(e) => PollResult::from_error(e),
            }
        })
        .await?;
        debug!(generator = %generator, items = items.len(), "Generator up to date");

        for item in items {
            self.await_converged(item).await?;
        }
        Ok(())
    }

    /// Ask the controller to re-read its source and wait until it has
    pub async fn refresh(&self) -> Result<RefreshOutcome, Error> {
        let target = &self.backend.refresh_ref();
        if self.cluster.get(target).await?.is_none() {
            debug!(object = %target, "Nothing to refresh yet");
            return Ok(RefreshOutcome::Skipped);
        }

        let request = self.backend.refresh_request();
        self.cluster.patch_merge(target, &request.patch).await?;
        info!(object = %target, "Requested source refresh");

        let token = request.token.as_str();
        let cluster = self.cluster;
        let backend = self.backend;
        let spec = self.spec(format!("{} refresh", target), self.timeouts.refresh);
        wait_until(&spec, || async move {
            match cluster.get(target).await {
                Ok(Some(value)) if backend.refresh_complete(&value, token) => {
                    Ok(PollResult::Ready(()))
                }
                Ok(_) => Ok(PollResult::NotYetReady("refresh pending".to_string())),
                Err(e) => PollResult::from_error(e),
            }
        })
        .await?;
        Ok(RefreshOutcome::Refreshed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{InstallPlan, MockGitOpsBackend, RefreshRequest};
    use crate::status::{HealthState, SyncState};
    use serde_json::json;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;
    use trellis_common::cluster::MockClusterApi;
    use trellis_common::descriptor::{HelmSource, ManifestSource, Phase};

    fn ingress() -> DeploymentDescriptor {
        DeploymentDescriptor {
            name: "ingress-nginx".to_string(),
            namespace: "ingress-nginx".to_string(),
            phase: Phase::Ingress,
            source: ManifestSource::Helm(HelmSource {
                registry: "https://kubernetes.github.io/ingress-nginx".to_string(),
                chart: "ingress-nginx".to_string(),
                version: "4.11.3".to_string(),
                values: None,
            }),
        }
    }

    fn app_ref(name: &str) -> ObjectRef {
        ObjectRef::namespaced("argoproj.io/v1alpha1", "Application", "argocd", name)
    }

    /// Backend reading `.status.sync` / `.status.health` directly
    fn backend() -> MockGitOpsBackend {
        let mut backend = MockGitOpsBackend::new();
        backend
            .expect_workload_manifests()
            .returning(|d| vec![json!({ "apiVersion": "argoproj.io/v1alpha1", "kind": "Application", "metadata": { "name": d.name, "namespace": "argocd" } })]);
        backend
            .expect_status_ref()
            .returning(|d| app_ref(&d.name));
        backend.expect_parse_status().returning(|v| {
            ReconciliationStatus::new(
                SyncState::parse(v["status"]["sync"].as_str().unwrap_or("")),
                HealthState::parse(v["status"]["health"].as_str().unwrap_or("")),
            )
        });
        backend
    }

    fn timeouts() -> SequencerTimeouts {
        SequencerTimeouts {
            interval: Duration::from_secs(2),
            deploy: Duration::from_secs(60),
            refresh: Duration::from_secs(30),
            install: Duration::from_secs(60),
        }
    }

    fn status(sync: &str, health: &str) -> Value {
        json!({ "metadata": { "name": "ingress-nginx" }, "status": { "sync": sync, "health": health } })
    }

    #[tokio::test(start_paused = true)]
    async fn deploy_returns_after_third_poll() {
        let backend = backend();
        let mut cluster = MockClusterApi::new();
        cluster
            .expect_apply()
            .times(1)
            .returning(|_| Ok(ApplyOutcome::Created));
        let polls = Arc::new(AtomicU32::new(0));
        let p = polls.clone();
        cluster.expect_get().times(3).returning(move |_| {
            Ok(Some(match p.fetch_add(1, Ordering::SeqCst) {
                0 => status("OutOfSync", "Missing"),
                1 => status("Synced", "Progressing"),
                _ => status("Synced", "Healthy"),
            }))
        });

        let sequencer = DeploymentSequencer::new(&cluster, &backend, timeouts());
        let result = sequencer.deploy(&ingress()).await.unwrap();

        assert!(result.is_converged());
        assert_eq!(polls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn redeploying_converged_app_is_unchanged_and_polls_once() {
        let backend = backend();
        let mut cluster = MockClusterApi::new();
        cluster
            .expect_apply()
            .times(2)
            .returning(|_| Ok(ApplyOutcome::Unchanged));
        cluster
            .expect_get()
            .times(1)
            .returning(|_| Ok(Some(status("Synced", "Healthy"))));
        cluster.expect_patch_merge().times(0);

        let sequencer = DeploymentSequencer::new(&cluster, &backend, timeouts());
        assert_eq!(sequencer.submit(&ingress()).await.unwrap(), ApplyOutcome::Unchanged);
        assert!(sequencer.deploy(&ingress()).await.unwrap().is_converged());
    }

    #[tokio::test(start_paused = true)]
    async fn synced_but_degraded_times_out_with_dump() {
        let backend = backend();
        let mut cluster = MockClusterApi::new();
        cluster
            .expect_apply()
            .returning(|_| Ok(ApplyOutcome::Unchanged));
        cluster
            .expect_get()
            .returning(|_| Ok(Some(status("Synced", "Degraded"))));

        let sequencer = DeploymentSequencer::new(&cluster, &backend, timeouts());
        let err = sequencer.deploy(&ingress()).await.unwrap_err();

        match err {
            Error::Timeout { last_observed, .. } => {
                let observed = last_observed.unwrap();
                assert!(observed.contains("sync=Synced health=Degraded"));
                assert!(observed.contains("name: ingress-nginx"));
            }
            other => panic!("expected timeout, got {other}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn missing_status_object_is_polled_not_failed() {
        let backend = backend();
        let mut cluster = MockClusterApi::new();
        let mut calls = 0;
        cluster.expect_get().times(3).returning(move |_| {
            calls += 1;
            match calls {
                1 => Err(Error::not_ready("Application", "404")),
                2 => Ok(None),
                _ => Ok(Some(status("Synced", "Healthy"))),
            }
        });

        let sequencer = DeploymentSequencer::new(&cluster, &backend, timeouts());
        sequencer.await_converged(&ingress()).await.unwrap();
    }

    #[tokio::test]
    async fn fatal_apply_error_stops_before_polling() {
        let backend = backend();
        let mut cluster = MockClusterApi::new();
        cluster
            .expect_apply()
            .returning(|_| Err(Error::fatal("apply", "admission webhook denied")));
        cluster.expect_get().times(0);

        let sequencer = DeploymentSequencer::new(&cluster, &backend, timeouts());
        let err = sequencer.deploy(&ingress()).await.unwrap_err();
        assert!(matches!(err, Error::Fatal { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn generator_waits_for_existence_then_items() {
        let mut backend = backend();
        backend.expect_generator_ref().returning(|name| {
            ObjectRef::namespaced("argoproj.io/v1alpha1", "ApplicationSet", "argocd", name)
        });
        backend
            .expect_generator_up_to_date()
            .returning(|v| v["status"]["upToDate"] == true);

        let mut cluster = MockClusterApi::new();
        let mut appset_calls = 0;
        cluster
            .expect_get()
            .withf(|o| o.kind == "ApplicationSet")
            .returning(move |_| {
                appset_calls += 1;
                Ok(match appset_calls {
                    1 => None,
                    2 => Some(json!({ "status": { "upToDate": false } })),
                    _ => Some(json!({ "status": { "upToDate": true } })),
                })
            });
        cluster
            .expect_get()
            .withf(|o| o.kind == "Application")
            .times(2)
            .returning(|_| Ok(Some(status("Synced", "Healthy"))));

        let grafana = DeploymentDescriptor {
            name: "grafana".to_string(),
            ..ingress()
        };
        let sequencer = DeploymentSequencer::new(&cluster, &backend, timeouts());
        sequencer
            .deploy_via_generator("observability", &[ingress(), grafana])
            .await
            .unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn refresh_waits_for_token() {
        let mut backend = MockGitOpsBackend::new();
        backend.expect_refresh_ref().returning(|| app_ref("dev-config"));
        backend.expect_refresh_request().returning(|| RefreshRequest {
            patch: json!({ "metadata": { "annotations": { "refresh": "t1" } } }),
            token: "t1".to_string(),
        });
        backend
            .expect_refresh_complete()
            .returning(|v, token| v["status"]["handled"] == token);

        let mut cluster = MockClusterApi::new();
        let mut calls = 0;
        cluster.expect_get().times(3).returning(move |_| {
            calls += 1;
            Ok(Some(if calls < 3 {
                json!({ "status": { "handled": "t0" } })
            } else {
                json!({ "status": { "handled": "t1" } })
            }))
        });
        cluster
            .expect_patch_merge()
            .withf(|_, patch| patch["metadata"]["annotations"]["refresh"] == "t1")
            .times(1)
            .returning(|_, _| Ok(()));

        let sequencer = DeploymentSequencer::new(&cluster, &backend, timeouts());
        assert_eq!(sequencer.refresh().await.unwrap(), RefreshOutcome::Refreshed);
    }

    #[tokio::test]
    async fn refresh_skipped_before_root_exists() {
        let mut backend = MockGitOpsBackend::new();
        backend.expect_refresh_ref().returning(|| app_ref("dev-config"));
        backend.expect_refresh_request().times(0);

        let mut cluster = MockClusterApi::new();
        cluster.expect_get().returning(|_| Ok(None));
        cluster.expect_patch_merge().times(0);

        let sequencer = DeploymentSequencer::new(&cluster, &backend, timeouts());
        assert_eq!(sequencer.refresh().await.unwrap(), RefreshOutcome::Skipped);
    }

    #[tokio::test(start_paused = true)]
    async fn install_applies_manifest_then_waits_for_deployments() {
        let dir = tempfile::tempdir().unwrap();
        let manifest = dir.path().join("install.yaml");
        std::fs::write(
            &manifest,
            "apiVersion: v1\nkind: Namespace\nmetadata:\n  name: argocd\n",
        )
        .unwrap();

        let mut backend = MockGitOpsBackend::new();
        let plan_manifest = manifest.clone();
        backend.expect_install_plan().returning(move || InstallPlan {
            manifest: plan_manifest.clone(),
            namespace: "argocd".to_string(),
            deployments: vec!["argocd-server".to_string()],
        });
        backend
            .expect_kind()
            .returning(|| trellis_common::config::BackendKind::Argocd);

        let mut cluster = MockClusterApi::new();
        let mut seq = mockall::Sequence::new();
        cluster
            .expect_apply()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(ApplyOutcome::Created));
        cluster
            .expect_get()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| {
                Ok(Some(json!({ "status": { "conditions": [{ "type": "Available", "status": "True" }] } })))
            });

        let sequencer = DeploymentSequencer::new(&cluster, &backend, timeouts());
        sequencer.install_controller().await.unwrap();
    }
}
