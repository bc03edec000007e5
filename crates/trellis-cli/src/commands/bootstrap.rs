//! Bootstrap command - take a bare cluster to a GitOps-managed platform
//!
//! Stages run strictly in order and each one gates on the previous:
//! 1. Wait for every node to be Ready
//! 2. Install the GitOps controller and register the config repository
//! 3. Provision controller and Grafana credentials
//! 4. Establish the root CA
//! 5. Deploy core services
//! 6. Deploy ingress
//! 7. Discover the ingress address
//! 8. Render and publish cluster config, then refresh the controller
//! 9. Deploy the root config and the observability generator
//! 10. Initialize, unseal and wire vault into External Secrets
//! 11. Deploy the remaining add-ons
//!
//! Every stage is idempotent; re-running after a failure is the recovery path.

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::time::{Duration, Instant};

use clap::Args;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use trellis_common::config::BootstrapConfig;
use trellis_common::descriptor::{DeploymentDescriptor, DescriptorSet, Phase};
use trellis_common::kube_utils::{service_ref, wait_for_nodes_ready, wait_for_service_address};
use trellis_common::{ClusterApi, WaitSpec};
use trellis_gitops::{
    BackendSettings, DeploymentSequencer, GitOpsBackend, RefreshOutcome, SequencerTimeouts,
};
use trellis_secrets::credentials::{password_generator, random_password};
use trellis_secrets::eso::ensure_secret_store;
use trellis_secrets::pki::{ca_generator, CA_CERT_KEY};
use trellis_secrets::{
    ensure_credential, publish_credential, CredentialStore, PublishMode, SecretTarget, VaultApi,
    VaultDriver,
};

use super::{load_descriptors, ConfigArgs, Runtime};
use crate::git::GitRepo;
use crate::publish::{ConfigPublisher, PublishOutcome};
use crate::render::{render, ClusterParameters, RenderedConfig};
use crate::{Error, Result};

/// Name of the generator delivering the observability phase
pub const OBSERVABILITY_GENERATOR: &str = "observability";

/// Credential identity of the root CA
pub const ROOT_CA_IDENTITY: &str = "root-ca";

/// Namespace the root CA secret is published to, for cert-manager's CA issuer
pub const ROOT_CA_NAMESPACE: &str = "cert-manager";

/// Add-on whose admin password is provisioned ahead of deployment
const GRAFANA_ADDON: &str = "grafana";
const GRAFANA_ADMIN_IDENTITY: &str = "grafana-admin";

/// Bootstrap a cluster
#[derive(Args, Debug)]
pub struct BootstrapArgs {
    #[command(flatten)]
    pub config: ConfigArgs,

    /// Dry run - print the stage plan and rendered config without touching anything
    #[arg(long)]
    pub dry_run: bool,
}

/// A bootstrap stage
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    ClusterReady,
    GitOpsController,
    Credentials,
    CertificateAuthority,
    CoreServices,
    Ingress,
    IngressAddress,
    PublishConfig,
    PlatformServices,
    Vault,
    Addons,
}

impl Stage {
    /// Every stage, in execution order
    pub const ALL: [Stage; 11] = [
        Stage::ClusterReady,
        Stage::GitOpsController,
        Stage::Credentials,
        Stage::CertificateAuthority,
        Stage::CoreServices,
        Stage::Ingress,
        Stage::IngressAddress,
        Stage::PublishConfig,
        Stage::PlatformServices,
        Stage::Vault,
        Stage::Addons,
    ];

    /// Short stable name, used in errors
    pub fn name(&self) -> &'static str {
        match self {
            Stage::ClusterReady => "cluster-ready",
            Stage::GitOpsController => "gitops-controller",
            Stage::Credentials => "credentials",
            Stage::CertificateAuthority => "certificate-authority",
            Stage::CoreServices => "core-services",
            Stage::Ingress => "ingress",
            Stage::IngressAddress => "ingress-address",
            Stage::PublishConfig => "publish-config",
            Stage::PlatformServices => "platform-services",
            Stage::Vault => "vault",
            Stage::Addons => "addons",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            Stage::ClusterReady => "Waiting for cluster nodes",
            Stage::GitOpsController => "Installing GitOps controller",
            Stage::Credentials => "Provisioning credentials",
            Stage::CertificateAuthority => "Establishing root CA",
            Stage::CoreServices => "Deploying core services",
            Stage::Ingress => "Deploying ingress",
            Stage::IngressAddress => "Discovering ingress address",
            Stage::PublishConfig => "Publishing cluster config",
            Stage::PlatformServices => "Deploying platform services",
            Stage::Vault => "Unsealing vault",
            Stage::Addons => "Deploying add-ons",
        };
        f.write_str(text)
    }
}

/// Wall-clock time spent in one stage
#[derive(Debug, Clone, Copy)]
pub struct StageTiming {
    pub stage: Stage,
    pub elapsed: Duration,
}

/// Everything a bootstrap run talks to
pub struct Collaborators<'a> {
    pub cluster: &'a dyn ClusterApi,
    pub backend: &'a dyn GitOpsBackend,
    pub settings: &'a BackendSettings,
    pub store: &'a dyn CredentialStore,
    pub repo: &'a dyn GitRepo,
    pub vault: &'a dyn VaultApi,
}

impl<'a> Collaborators<'a> {
    /// Borrow the live collaborators of a runtime
    pub fn from_runtime(runtime: &'a Runtime) -> Self {
        Self {
            cluster: &runtime.cluster,
            backend: runtime.backend.as_ref(),
            settings: &runtime.settings,
            store: &runtime.store,
            repo: &runtime.repo,
            vault: &runtime.vault,
        }
    }
}

/// The bootstrap orchestrator
pub struct Bootstrap<'a> {
    config: &'a BootstrapConfig,
    descriptors: &'a DescriptorSet,
    deps: Collaborators<'a>,
    cancel: Option<CancellationToken>,
    ca_cert: Option<String>,
    ingress_address: Option<String>,
    timings: Vec<StageTiming>,
}

impl<'a> Bootstrap<'a> {
    pub fn new(
        config: &'a BootstrapConfig,
        descriptors: &'a DescriptorSet,
        deps: Collaborators<'a>,
    ) -> Self {
        Self {
            config,
            descriptors,
            deps,
            cancel: None,
            ca_cert: None,
            ingress_address: None,
            timings: Vec::new(),
        }
    }

    /// Abort waits when `token` is cancelled
    pub fn with_cancel(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }

    /// Ingress address discovered so far
    pub fn ingress_address(&self) -> Option<&str> {
        self.ingress_address.as_deref()
    }

    /// Per-stage timings of the stages run so far
    pub fn timings(&self) -> &[StageTiming] {
        &self.timings
    }

    /// Run every stage
    pub async fn run(&mut self) -> Result<()> {
        self.run_stages(&Stage::ALL).await
    }

    /// Run `stages` in order, stopping at the first failure
    pub async fn run_stages(&mut self, stages: &[Stage]) -> Result<()> {
        let total = stages.len();
        for (i, stage) in stages.iter().enumerate() {
            info!("[Stage {}/{}] {}...", i + 1, total, stage);
            let start = Instant::now();
            let result = self.run_stage(*stage).await;
            self.timings.push(StageTiming {
                stage: *stage,
                elapsed: start.elapsed(),
            });
            if let Err(e) = result {
                self.report_timings();
                return Err(Error::stage(stage.name(), e));
            }
        }
        self.report_timings();
        Ok(())
    }

    fn report_timings(&self) {
        let total: Duration = self.timings.iter().map(|t| t.elapsed).sum();
        for timing in &self.timings {
            info!(
                stage = timing.stage.name(),
                "{:<28} {:>8.1}s",
                timing.stage.to_string(),
                timing.elapsed.as_secs_f64()
            );
        }
        info!("Total {:.1}s", total.as_secs_f64());
    }

    async fn run_stage(&mut self, stage: Stage) -> Result<()> {
        match stage {
            Stage::ClusterReady => self.cluster_ready().await,
            Stage::GitOpsController => self.gitops_controller().await,
            Stage::Credentials => self.credentials().await,
            Stage::CertificateAuthority => self.certificate_authority().await,
            Stage::CoreServices => self.deploy_phase(Phase::Core).await,
            Stage::Ingress => self.ingress().await,
            Stage::IngressAddress => self.discover_ingress_address().await,
            Stage::PublishConfig => self.publish_config().await,
            Stage::PlatformServices => self.platform_services().await,
            Stage::Vault => self.vault().await,
            Stage::Addons => self.deploy_phase(Phase::Addons).await,
        }
    }

    fn spec(&self, what: impl Into<String>, timeout: Duration) -> WaitSpec {
        let spec = WaitSpec::new(what, self.config.timeouts.poll_interval(), timeout);
        match &self.cancel {
            Some(token) => spec.with_cancel(token.clone()),
            None => spec,
        }
    }

    fn sequencer(&self) -> DeploymentSequencer<'a> {
        let timeouts = &self.config.timeouts;
        let sequencer = DeploymentSequencer::new(
            self.deps.cluster,
            self.deps.backend,
            SequencerTimeouts {
                interval: timeouts.poll_interval(),
                deploy: timeouts.deploy(),
                refresh: timeouts.refresh(),
                install: timeouts.controller_install(),
            },
        );
        match &self.cancel {
            Some(token) => sequencer.with_cancel(token.clone()),
            None => sequencer,
        }
    }

    async fn cluster_ready(&mut self) -> Result<()> {
        let spec = self.spec("all nodes Ready", self.config.timeouts.cluster_ready());
        wait_for_nodes_ready(self.deps.cluster, &spec).await?;
        Ok(())
    }

    async fn gitops_controller(&mut self) -> Result<()> {
        let sequencer = self.sequencer();
        sequencer.install_controller().await?;
        let outcome = sequencer.register_source().await?;
        info!(
            repo = %self.deps.settings.repo_url,
            outcome = %outcome,
            "Registered config repository"
        );
        Ok(())
    }

    async fn credentials(&mut self) -> Result<()> {
        let spec = self.spec("credential target", self.config.timeouts.secret_target());

        for wanted in self.deps.backend.controller_credentials() {
            let credential = ensure_credential(
                self.deps.store,
                &wanted.identity,
                password_generator(&wanted.field, wanted.length),
            )?;
            let outcome =
                publish_credential(self.deps.cluster, &credential, &wanted.target, &spec).await?;
            info!(identity = %wanted.identity, secret = %wanted.target.object_ref(), outcome = %outcome, "Published controller credential");
        }

        if let Some(grafana) = self
            .descriptors
            .in_phase(Phase::Observability)
            .find(|d| d.name == GRAFANA_ADDON)
        {
            let credential = ensure_credential(self.deps.store, GRAFANA_ADMIN_IDENTITY, || {
                Ok(BTreeMap::from([
                    ("admin-user".to_string(), "admin".to_string()),
                    ("admin-password".to_string(), random_password(24)),
                ]))
            })?;
            let target = SecretTarget::new(
                GRAFANA_ADMIN_IDENTITY,
                &grafana.namespace,
                PublishMode::ApplyCreatingNamespace,
            );
            let outcome = publish_credential(self.deps.cluster, &credential, &target, &spec).await?;
            info!(secret = %target.object_ref(), outcome = %outcome, "Published Grafana admin credential");
        }
        Ok(())
    }

    async fn certificate_authority(&mut self) -> Result<()> {
        let common_name = format!("{} root CA", self.config.cluster_name);
        let credential = ensure_credential(
            self.deps.store,
            ROOT_CA_IDENTITY,
            ca_generator(&common_name),
        )?;

        let target = SecretTarget::new(
            ROOT_CA_IDENTITY,
            ROOT_CA_NAMESPACE,
            PublishMode::ApplyCreatingNamespace,
        )
        .with_type("kubernetes.io/tls");
        let spec = self.spec("root CA secret", self.config.timeouts.secret_target());
        let outcome = publish_credential(self.deps.cluster, &credential, &target, &spec).await?;
        info!(secret = %target.object_ref(), outcome = %outcome, "Published root CA");

        self.ca_cert = Some(credential.get(CA_CERT_KEY)?.to_string());
        Ok(())
    }

    async fn deploy_phase(&mut self, phase: Phase) -> Result<()> {
        let sequencer = self.sequencer();
        let mut deployed = 0;
        for descriptor in self.descriptors.in_phase(phase) {
            sequencer.deploy(descriptor).await?;
            deployed += 1;
        }
        if deployed == 0 {
            info!(phase = %phase, "Nothing to deploy");
        }
        Ok(())
    }

    async fn ingress(&mut self) -> Result<()> {
        let ingress = self.descriptors.single(Phase::Ingress)?;
        self.sequencer().deploy(ingress).await?;
        Ok(())
    }

    async fn discover_ingress_address(&mut self) -> Result<()> {
        let ingress = self.descriptors.single(Phase::Ingress)?;
        let source = self.config.resolved_profile()?.ingress_address;
        let service = service_ref(&ingress.namespace, &self.config.ingress.service);
        let spec = self.spec(format!("{} address", service), self.config.timeouts.deploy());

        let address = wait_for_service_address(self.deps.cluster, &service, source, &spec).await?;
        info!(service = %service, address = %address, "Discovered ingress address");
        self.ingress_address = Some(address);
        Ok(())
    }

    fn cluster_parameters(&self) -> Result<ClusterParameters> {
        let missing = |what: &str| {
            trellis_common::Error::fatal(
                "render",
                format!("{} is unknown; its stage has not run", what),
            )
        };
        let profile = self.config.resolved_profile()?;
        Ok(ClusterParameters {
            cluster_name: self.config.cluster_name.clone(),
            dns_suffix: profile.dns_suffix,
            ingress_ip: self
                .ingress_address
                .clone()
                .ok_or_else(|| missing("ingress address"))?,
            storage_class: profile.storage_class,
            ca_cert: self.ca_cert.clone().ok_or_else(|| missing("root CA"))?,
        })
    }

    fn observability(&self) -> Vec<DeploymentDescriptor> {
        self.descriptors
            .in_phase(Phase::Observability)
            .cloned()
            .collect()
    }

    /// Render with the current parameters
    pub fn render(&self) -> Result<RenderedConfig> {
        let params = self.cluster_parameters()?;
        let items = self.observability();
        let generator = (!items.is_empty()).then(|| {
            self.deps
                .backend
                .generator_manifest(OBSERVABILITY_GENERATOR, &items)
        });
        render(
            self.config,
            &params,
            generator.as_ref().map(|g| (OBSERVABILITY_GENERATOR, g)),
        )
    }

    async fn publish_config(&mut self) -> Result<()> {
        let rendered = self.render()?;
        let message = format!(
            "trellis: update {} cluster config (ingress {})",
            self.config.cluster_name,
            self.ingress_address.as_deref().unwrap_or_default()
        );

        match ConfigPublisher::new(self.deps.repo).publish(&rendered, &message)? {
            PublishOutcome::NoOpUnchanged => Ok(()),
            PublishOutcome::Committed { .. } => {
                if self.sequencer().refresh().await? == RefreshOutcome::Skipped {
                    info!("Controller has no source object yet; it will read the new revision on creation");
                }
                Ok(())
            }
        }
    }

    async fn platform_services(&mut self) -> Result<()> {
        let sequencer = self.sequencer();
        sequencer.deploy(&self.deps.settings.root_descriptor()).await?;

        if self.config.vault.enabled {
            // Vault reports Healthy only once unsealed, so its wait happens in the vault stage
            sequencer
                .submit(self.descriptors.single(Phase::Vault)?)
                .await?;
        }

        let items = self.observability();
        if !items.is_empty() {
            sequencer
                .deploy_via_generator(OBSERVABILITY_GENERATOR, &items)
                .await?;
        }
        Ok(())
    }

    async fn vault(&mut self) -> Result<()> {
        if !self.config.vault.enabled {
            info!("Vault disabled, skipping");
            return Ok(());
        }

        let timeouts = &self.config.timeouts;
        let driver = VaultDriver::new(
            self.deps.vault,
            self.deps.store,
            self.deps.cluster,
            &self.config.vault,
            timeouts.poll_interval(),
            timeouts.secret_target(),
        );
        let driver = match &self.cancel {
            Some(token) => driver.with_cancel(token.clone()),
            None => driver,
        };
        let outcome = driver.run().await?;
        info!(
            initialized_now = outcome.initialized_now,
            was_sealed = outcome.was_sealed,
            token = %outcome.token,
            "Vault unsealed"
        );

        self.sequencer()
            .await_converged(self.descriptors.single(Phase::Vault)?)
            .await?;

        let spec = self.spec(
            format!("ClusterSecretStore {}", self.config.vault.secret_store),
            timeouts.deploy(),
        );
        ensure_secret_store(self.deps.cluster, &self.config.vault, &spec).await?;
        info!(store = %self.config.vault.secret_store, "External Secrets store ready");
        Ok(())
    }
}

/// Print the stage list and the descriptors each stage deploys
pub fn print_plan(config: &BootstrapConfig, descriptors: &DescriptorSet) {
    println!(
        "Cluster {} ({:?} profile, {} controller)",
        config.cluster_name, config.profile, config.gitops.backend
    );
    for (i, stage) in Stage::ALL.iter().enumerate() {
        println!("{:>2}. {}", i + 1, stage);
        let phase = match stage {
            Stage::CoreServices => Some(Phase::Core),
            Stage::Ingress => Some(Phase::Ingress),
            Stage::PlatformServices => Some(Phase::Observability),
            Stage::Vault if config.vault.enabled => Some(Phase::Vault),
            Stage::Addons => Some(Phase::Addons),
            _ => None,
        };
        for descriptor in phase.into_iter().flat_map(|p| descriptors.in_phase(p)) {
            println!("      - {} -> {}", descriptor.name, descriptor.namespace);
        }
    }
}

/// Placeholder shown for values only known after the cluster is up
const PENDING: &str = "<pending>";

/// Run the bootstrap command
pub async fn run(args: BootstrapArgs) -> Result<()> {
    let config = args.config.load()?;
    let descriptors = load_descriptors(&config)?;

    if args.dry_run {
        return dry_run(&config, &descriptors);
    }

    let runtime = Runtime::connect(&config, args.config.kubeconfig.as_deref()).await?;
    let start = Instant::now();
    let mut bootstrap = Bootstrap::new(&config, &descriptors, Collaborators::from_runtime(&runtime))
        .with_cancel(runtime.cancel.clone());
    bootstrap.run().await?;

    info!(
        "Bootstrap of {} complete in {:.1}s",
        config.cluster_name,
        start.elapsed().as_secs_f64()
    );
    Ok(())
}

fn dry_run(config: &BootstrapConfig, descriptors: &DescriptorSet) -> Result<()> {
    info!("Dry run - would perform the following:");
    print_plan(config, descriptors);

    let settings = BackendSettings::from_config(config)?;
    let backend = trellis_gitops::backend_for(config.gitops.backend, settings);
    let profile = config.resolved_profile()?;
    let params = ClusterParameters {
        cluster_name: config.cluster_name.clone(),
        dns_suffix: profile.dns_suffix,
        ingress_ip: PENDING.to_string(),
        storage_class: profile.storage_class,
        ca_cert: PENDING.to_string(),
    };
    let items: Vec<DeploymentDescriptor> = descriptors
        .in_phase(Phase::Observability)
        .cloned()
        .collect();
    let generator = (!items.is_empty())
        .then(|| backend.generator_manifest(OBSERVABILITY_GENERATOR, &items));
    let rendered = render(
        config,
        &params,
        generator.as_ref().map(|g| (OBSERVABILITY_GENERATOR, g)),
    )?;

    for file in &rendered.files {
        println!("--- {}", display_path(&config.git.path, &file.path));
        print!("{}", file.content);
    }
    if config.vault.enabled && config.vault.pod_start_timeout().is_none() {
        warn!("vault.podStartTimeoutSecs is unset; the vault pod wait is unbounded");
    }
    Ok(())
}

fn display_path(root: &std::path::Path, relative: &std::path::Path) -> String {
    let full: PathBuf = root.join(relative);
    full.display().to_string()
}
