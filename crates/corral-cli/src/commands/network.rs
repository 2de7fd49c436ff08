//! `corral network`: Create, list and remove container networks.

use anyhow::Context;
use clap::{Args, Subcommand};
use corral_common::config::CorralConfig;
use corral_common::constants::BRIDGE_DRIVER;
use corral_network::NetworkManager;
use corral_network::model::parse_subnet;
use ipnetwork::Ipv4Network;

use crate::output;

/// Arguments for the `network` command.
#[derive(Args, Debug)]
pub struct NetworkArgs {
    /// Network operation.
    #[command(subcommand)]
    pub command: NetworkCommand,
}

/// Network operations.
#[derive(Subcommand, Debug)]
pub enum NetworkCommand {
    /// Create a network and its host interface.
    Create {
        /// Driver that provisions the network.
        #[arg(long, default_value = BRIDGE_DRIVER)]
        driver: String,
        /// IPv4 subnet in CIDR notation, e.g. `192.168.10.0/24`.
        #[arg(long, value_parser = parse_subnet)]
        subnet: Ipv4Network,
        /// Network name.
        name: String,
    },
    /// List networks.
    #[command(alias = "ls")]
    List,
    /// Remove a network and its host interface.
    #[command(alias = "rm")]
    Remove {
        /// Network name.
        name: String,
    },
}

/// Executes the `network` command.
///
/// # Errors
///
/// Returns an error if the registry cannot be loaded or the operation fails.
pub fn execute(args: NetworkArgs, config: &CorralConfig) -> anyhow::Result<()> {
    let mut manager = NetworkManager::new(config).context("loading networks")?;
    match args.command {
        NetworkCommand::Create {
            driver,
            subnet,
            name,
        } => {
            let network = manager
                .create_network(&name, &driver, subnet)
                .with_context(|| format!("creating network {name}"))?;
            output::print_line(&network.name);
        }
        NetworkCommand::List => {
            let rows: Vec<Vec<String>> = manager
                .list_networks()
                .into_iter()
                .map(|n| {
                    vec![
                        n.name,
                        n.subnet.to_string(),
                        n.gateway.to_string(),
                        n.driver,
                    ]
                })
                .collect();
            output::print_table(&["NAME", "SUBNET", "GATEWAY", "DRIVER"], &rows);
        }
        NetworkCommand::Remove { name } => {
            manager
                .delete_network(&name)
                .with_context(|| format!("removing network {name}"))?;
            output::print_line(&name);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use clap::Parser;

    use super::*;
    use crate::commands::{Cli, Command};

    fn parse(args: &[&str]) -> NetworkCommand {
        let cli = Cli::try_parse_from(std::iter::once("corral").chain(args.iter().copied()))
            .unwrap();
        let Command::Network(args) = cli.command else {
            unreachable!("expected the network subcommand");
        };
        args.command
    }

    #[test]
    fn create_defaults_to_bridge() {
        let NetworkCommand::Create {
            driver,
            subnet,
            name,
        } = parse(&["network", "create", "--subnet", "192.168.10.0/24", "net1"])
        else {
            unreachable!("expected create");
        };
        assert_eq!(driver, "bridge");
        assert_eq!(subnet.to_string(), "192.168.10.0/24");
        assert_eq!(name, "net1");
    }

    #[test]
    fn bad_subnet_is_rejected_at_parse_time() {
        assert!(
            Cli::try_parse_from(["corral", "network", "create", "--subnet", "nope", "n"]).is_err()
        );
    }

    #[test]
    fn aliases() {
        assert!(matches!(parse(&["network", "ls"]), NetworkCommand::List));
        assert!(matches!(
            parse(&["network", "rm", "net1"]),
            NetworkCommand::Remove { name } if name == "net1"
        ));
    }

    #[test]
    fn list_on_empty_data_dir_succeeds() {
        let dir = tempfile::tempdir().unwrap();
        let config = CorralConfig::from_data_dir(dir.path());
        execute(
            NetworkArgs {
                command: NetworkCommand::List,
            },
            &config,
        )
        .unwrap();
    }
}
