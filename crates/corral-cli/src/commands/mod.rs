//! CLI command definitions and dispatch.

pub mod init;
pub mod logs;
pub mod network;
pub mod ps;
pub mod run;
pub mod stop;

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand, ValueEnum};
use corral_common::config::CorralConfig;
use corral_common::constants::{DATA_DIR_ENV, DEFAULT_DATA_DIR};

/// corral: a minimal daemon-less container engine.
#[derive(Parser, Debug)]
#[command(name = "corral", version, about, long_about = None)]
pub struct Cli {
    /// Subcommand to execute.
    #[command(subcommand)]
    pub command: Command,

    /// Base directory for networks, containers, images and logs.
    #[arg(long, global = true, env = DATA_DIR_ENV, default_value = DEFAULT_DATA_DIR)]
    pub data_dir: PathBuf,

    /// Log output format.
    #[arg(long, global = true, value_enum, default_value_t = LogFormat::Text)]
    pub log_format: LogFormat,
}

/// Log output format.
#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    /// Human-readable lines.
    Text,
    /// One JSON object per event.
    Json,
}

/// Available CLI subcommands.
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run a command in a new container.
    Run(run::RunArgs),
    /// Container-side init; started by `run`, not meant to be invoked by hand.
    #[command(hide = true)]
    Init,
    /// Manage container networks.
    Network(network::NetworkArgs),
    /// List containers.
    Ps(ps::PsArgs),
    /// Stop a container and release its resources.
    Stop(stop::StopArgs),
    /// Print the output of a detached container.
    Logs(logs::LogsArgs),
}

/// Dispatches the parsed CLI command to its handler.
///
/// # Errors
///
/// Returns an error if the command execution fails.
pub fn execute(cli: Cli) -> anyhow::Result<ExitCode> {
    let config = CorralConfig::from_data_dir(&cli.data_dir);
    match cli.command {
        Command::Run(args) => run::execute(args, config),
        Command::Init => init::execute(),
        Command::Network(args) => network::execute(args, &config).map(|()| ExitCode::SUCCESS),
        Command::Ps(args) => ps::execute(&args, config).map(|()| ExitCode::SUCCESS),
        Command::Stop(args) => stop::execute(&args, config).map(|()| ExitCode::SUCCESS),
        Command::Logs(args) => logs::execute(&args, config).map(|()| ExitCode::SUCCESS),
    }
}
