//! Trellis CLI library

pub mod commands;
pub mod error;
pub mod git;
pub mod publish;
pub mod render;

pub use error::{Error, Result};

use clap::{Parser, Subcommand};

/// Trellis - bootstrap a cluster into a GitOps-managed platform
#[derive(Parser, Debug)]
#[command(name = "trellis")]
#[command(version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the full bootstrap sequence
    Bootstrap(commands::bootstrap::BootstrapArgs),
    /// Unseal vault and republish its root token
    Unseal(commands::unseal::UnsealArgs),
    /// Re-render and publish cluster config, then refresh the controller
    Publish(commands::publish::PublishArgs),
    /// Print the ordered stage plan and descriptors
    Plan(commands::plan::PlanArgs),
}

impl Cli {
    /// Run the CLI command
    pub async fn run(self) -> Result<()> {
        match self.command {
            Commands::Bootstrap(args) => commands::bootstrap::run(args).await,
            Commands::Unseal(args) => commands::unseal::run(args).await,
            Commands::Publish(args) => commands::publish::run(args).await,
            Commands::Plan(args) => commands::plan::run(args),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use trellis_common::config::BackendKind;

    #[test]
    fn parses_bootstrap_flags() {
        let cli = Cli::try_parse_from([
            "trellis",
            "bootstrap",
            "-f",
            "cluster.yaml",
            "--backend",
            "flux",
            "--profile",
            "managed",
            "--dry-run",
        ])
        .unwrap();
        let Commands::Bootstrap(args) = cli.command else {
            panic!("expected bootstrap");
        };
        assert!(args.dry_run);
        assert_eq!(args.config.backend, Some(BackendKind::Flux));
        assert_eq!(
            args.config.config_file.as_deref(),
            Some(std::path::Path::new("cluster.yaml"))
        );
    }

    #[test]
    fn rejects_unknown_backend() {
        let err = Cli::try_parse_from(["trellis", "plan", "--backend", "spinnaker"]).unwrap_err();
        assert!(err.to_string().contains("must be 'argocd' or 'flux'"));
    }
}
