//! Plan command - print the ordered stages and the add-ons each deploys

use clap::Args;

use super::bootstrap::print_plan;
use super::{load_descriptors, ConfigArgs};
use crate::Result;

/// Show the bootstrap plan
#[derive(Args, Debug)]
pub struct PlanArgs {
    #[command(flatten)]
    pub config: ConfigArgs,
}

/// Run the plan command
pub fn run(args: PlanArgs) -> Result<()> {
    let config = args.config.load()?;
    let descriptors = load_descriptors(&config)?;
    print_plan(&config, &descriptors);
    Ok(())
}
