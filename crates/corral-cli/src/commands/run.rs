//! `corral run`: Run a command in a new container.

use std::process::ExitCode;

use anyhow::Context;
use clap::Args;
use corral_common::config::CorralConfig;
use corral_common::types::ResourceLimits;
use corral_network::PortMapping;
use corral_runtime::workspace::Volume;
use corral_runtime::{Engine, RunOptions};

use crate::output;

/// Arguments for the `run` command.
#[derive(Args, Debug)]
pub struct RunArgs {
    /// Attach to the container and wait for it to exit.
    #[arg(short = 'i', long)]
    pub interactive: bool,

    /// Memory limit, e.g. `100m`.
    #[arg(short = 'm', long)]
    pub memory: Option<String>,

    /// Relative CPU weight on the `cpu.shares` scale.
    #[arg(long)]
    pub cpu_shares: Option<String>,

    /// CPUs the container may run on, e.g. `0-1`.
    #[arg(long)]
    pub cpuset: Option<String>,

    /// Bind mount `HOST:CONTAINER`.
    #[arg(short = 'v', long)]
    pub volume: Option<Volume>,

    /// Network to connect the container to.
    #[arg(long = "net")]
    pub network: Option<String>,

    /// Publish a container port, `HOST:CONTAINER`. Requires `--net`.
    #[arg(short = 'p', long = "publish", requires = "network")]
    pub ports: Vec<PortMapping>,

    /// Image name under the image directory.
    pub image: String,

    /// Command to run inside the container.
    #[arg(trailing_var_arg = true, allow_hyphen_values = true, required = true)]
    pub command: Vec<String>,
}

impl RunArgs {
    fn into_options(self) -> RunOptions {
        RunOptions {
            interactive: self.interactive,
            image: self.image,
            command: self.command,
            limits: ResourceLimits {
                memory_limit: self.memory,
                cpu_share: self.cpu_shares,
                cpu_set: self.cpuset,
            },
            volume: self.volume,
            network: self.network,
            ports: self.ports,
        }
    }
}

/// Executes the `run` command.
///
/// A detached run prints the container id and returns. An interactive run
/// exits with the container's exit code.
///
/// # Errors
///
/// Returns an error if the engine cannot be set up or the container fails
/// to start.
pub fn execute(args: RunArgs, config: CorralConfig) -> anyhow::Result<ExitCode> {
    let engine = Engine::new(config).context("initializing engine")?;
    let outcome = engine
        .run(&args.into_options())
        .context("starting container")?;

    match outcome.exit_code {
        Some(code) => Ok(ExitCode::from(u8::try_from(code).unwrap_or(1))),
        None => {
            output::print_line(outcome.id.as_str());
            Ok(ExitCode::SUCCESS)
        }
    }
}
