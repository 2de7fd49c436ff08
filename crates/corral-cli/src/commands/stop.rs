//! `corral stop`: Stop a container and release its resources.

use anyhow::Context;
use clap::Args;
use corral_common::config::CorralConfig;
use corral_runtime::Engine;

use crate::output;

/// Arguments for the `stop` command.
#[derive(Args, Debug)]
pub struct StopArgs {
    /// Container ID.
    pub container: String,
}

/// Executes the `stop` command.
///
/// # Errors
///
/// Returns an error if the container is unknown or cannot be stopped.
pub fn execute(args: &StopArgs, config: CorralConfig) -> anyhow::Result<()> {
    let engine = Engine::new(config)?;
    engine
        .stop(&args.container)
        .with_context(|| format!("stopping container {}", args.container))?;
    output::print_line(&args.container);
    Ok(())
}
