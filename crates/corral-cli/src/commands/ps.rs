//! `corral ps`: List containers.

use clap::Args;
use corral_common::config::CorralConfig;
use corral_common::types::ContainerState;
use corral_runtime::Engine;
use corral_runtime::state::ContainerRecord;

use crate::output;

const HEADERS: [&str; 7] = ["CONTAINER ID", "IMAGE", "COMMAND", "STATUS", "PID", "IP", "CREATED"];

/// Arguments for the `ps` command.
#[derive(Args, Debug)]
pub struct PsArgs {
    /// Show stopped containers too.
    #[arg(short, long)]
    pub all: bool,
}

/// Executes the `ps` command.
///
/// # Errors
///
/// Returns an error if the container records cannot be read.
pub fn execute(args: &PsArgs, config: CorralConfig) -> anyhow::Result<()> {
    let engine = Engine::new(config)?;
    let rows: Vec<Vec<String>> = engine
        .list()?
        .iter()
        .filter(|r| args.all || r.status == ContainerState::Running)
        .map(row)
        .collect();
    output::print_table(&HEADERS, &rows);
    Ok(())
}

fn row(record: &ContainerRecord) -> Vec<String> {
    vec![
        record.id.to_string(),
        record.image.clone(),
        record.command.clone(),
        record.status.to_string(),
        record.pid.to_string(),
        output::or_dash(
            record
                .endpoint
                .as_ref()
                .map(|e| format!("{} ({})", e.ip_address, e.network)),
        ),
        record.created_at.clone(),
    ]
}
