//! Publish command - re-render cluster config and refresh the controller

use clap::Args;

use super::bootstrap::{Bootstrap, Collaborators, Stage};
use super::{load_descriptors, ConfigArgs, Runtime};
use crate::Result;

/// Re-render and publish cluster config
#[derive(Args, Debug)]
pub struct PublishArgs {
    #[command(flatten)]
    pub config: ConfigArgs,
}

/// Stages that recompute the cluster parameters and publish them.
/// The CA stage reuses the stored CA and re-applies its secret to cert-manager.
pub const PUBLISH_STAGES: [Stage; 3] = [
    Stage::CertificateAuthority,
    Stage::IngressAddress,
    Stage::PublishConfig,
];

/// Run the publish command
pub async fn run(args: PublishArgs) -> Result<()> {
    let config = args.config.load()?;
    let descriptors = load_descriptors(&config)?;
    let runtime = Runtime::connect(&config, args.config.kubeconfig.as_deref()).await?;

    Bootstrap::new(&config, &descriptors, Collaborators::from_runtime(&runtime))
        .with_cancel(runtime.cancel.clone())
        .run_stages(&PUBLISH_STAGES)
        .await
}
