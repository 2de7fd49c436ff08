//! `corral logs`: Print the output of a detached container.

use clap::Args;
use corral_common::config::CorralConfig;
use corral_runtime::Engine;

use crate::output;

/// Arguments for the `logs` command.
#[derive(Args, Debug)]
pub struct LogsArgs {
    /// Container ID.
    pub container: String,
}

/// Executes the `logs` command.
///
/// # Errors
///
/// Returns an error if the container is not found or its log is unreadable.
pub fn execute(args: &LogsArgs, config: CorralConfig) -> anyhow::Result<()> {
    let engine = Engine::new(config)?;
    let logs = engine.logs(&args.container)?;
    output::print_raw(&logs);
    Ok(())
}
