//! Unseal command - re-run the vault stage after a vault restart

use clap::Args;
use tracing::info;

use super::bootstrap::{Bootstrap, Collaborators, Stage};
use super::{load_descriptors, ConfigArgs, Runtime};
use crate::{Error, Result};

/// Unseal vault and republish its token
#[derive(Args, Debug)]
pub struct UnsealArgs {
    #[command(flatten)]
    pub config: ConfigArgs,
}

/// Run the unseal command
pub async fn run(args: UnsealArgs) -> Result<()> {
    let config = args.config.load()?;
    if !config.vault.enabled {
        return Err(Error::Common(trellis_common::Error::config(
            "vault is disabled in the configuration",
        )));
    }
    let descriptors = load_descriptors(&config)?;
    let runtime = Runtime::connect(&config, args.config.kubeconfig.as_deref()).await?;

    Bootstrap::new(&config, &descriptors, Collaborators::from_runtime(&runtime))
        .with_cancel(runtime.cancel.clone())
        .run_stages(&[Stage::Vault])
        .await?;
    info!("Vault unsealed");
    Ok(())
}
