//! Linux bridge network driver.
//!
//! Each network is a bridge device named after the network, holding the
//! gateway address and masquerading the subnet's outbound traffic. A
//! container joins through a veth pair: the host end is enslaved to the
//! bridge, the peer end is moved into the container's network namespace
//! and configured there with the endpoint address and a default route via
//! the gateway. Port mappings become `DNAT` rules in the nat table.

use std::net::Ipv4Addr;
use std::sync::Arc;

use corral_common::constants::BRIDGE_DRIVER;
use corral_common::error::{CorralError, Result};
use corral_core::namespace::network::netns_exists;
use ipnetwork::Ipv4Network;

use crate::driver::NetworkDriver;
use crate::model::{Endpoint, Network, PortMapping, validate_network_name};
use crate::runner::{CommandRunner, SystemRunner};

/// Bridge driver backed by `ip`, `iptables` and `nsenter`.
pub struct BridgeDriver {
    runner: Arc<dyn CommandRunner>,
}

impl BridgeDriver {
    /// Creates a driver that configures the host network.
    #[must_use]
    pub fn new() -> Self {
        Self::with_runner(Arc::new(SystemRunner))
    }

    /// Creates a driver issuing its commands through `runner`.
    #[must_use]
    pub fn with_runner(runner: Arc<dyn CommandRunner>) -> Self {
        Self { runner }
    }

    fn ip(&self, args: &[&str]) -> Result<()> {
        self.runner.run("ip", args)
    }

    fn iptables(&self, args: &[&str]) -> Result<()> {
        self.runner.run("iptables", args)
    }

    /// Runs `ip <args>` inside the network namespace of `pid`.
    fn ip_in_netns(&self, pid: u32, args: &[&str]) -> Result<()> {
        let pid = pid.to_string();
        let mut full = vec!["--target", pid.as_str(), "--net", "--", "ip"];
        full.extend_from_slice(args);
        self.runner.run("nsenter", &full)
    }

    fn link_exists(&self, name: &str) -> bool {
        self.ip(&["link", "show", name]).is_ok()
    }

    fn delete_link(&self, name: &str) {
        if let Err(e) = self.ip(&["link", "delete", name]) {
            tracing::warn!(link = name, error = %e, "failed to remove link during cleanup");
        }
    }

    fn masquerade(&self, action: &str, network: &Network) -> Result<()> {
        let subnet = network.subnet.to_string();
        self.iptables(&[
            "-t", "nat", action, "POSTROUTING", "-s", &subnet, "!", "-o", &network.name, "-j",
            "MASQUERADE",
        ])
    }

    fn port_forward(&self, action: &str, ip: Ipv4Addr, mapping: PortMapping) -> Result<()> {
        let host_port = mapping.host.to_string();
        let destination = format!("{ip}:{}", mapping.container);
        self.iptables(&[
            "-t", "nat", action, "PREROUTING", "-p", "tcp", "-m", "tcp", "--dport", &host_port,
            "-j", "DNAT", "--to-destination", &destination,
        ])
    }

    fn setup_bridge(&self, network: &Network) -> Result<()> {
        let cidr = network.gateway_cidr();
        self.ip(&["addr", "add", &cidr, "dev", &network.name])?;
        self.ip(&["link", "set", &network.name, "up"])?;
        self.masquerade("-A", network)
    }

    fn setup_endpoint(&self, network: &Network, endpoint: &Endpoint) -> Result<()> {
        let host = endpoint.host_ifname();
        let peer = endpoint.peer_ifname();
        let pid = endpoint.container_pid;

        self.ip(&["link", "set", &host, "master", &network.name])?;
        self.ip(&["link", "set", &host, "up"])?;
        self.ip(&["link", "set", &peer, "netns", &pid.to_string()])?;

        let address = format!("{}/{}", endpoint.ip_address, network.subnet.prefix());
        let gateway = network.gateway.to_string();
        self.ip_in_netns(pid, &["addr", "add", &address, "dev", &peer])?;
        self.ip_in_netns(pid, &["link", "set", &peer, "up"])?;
        self.ip_in_netns(pid, &["link", "set", "lo", "up"])?;
        self.ip_in_netns(pid, &["route", "add", "default", "via", &gateway, "dev", &peer])?;

        for (i, mapping) in endpoint.port_mapping.iter().enumerate() {
            if let Err(e) = self.port_forward("-A", endpoint.ip_address, *mapping) {
                for installed in &endpoint.port_mapping[..i] {
                    if let Err(undo) = self.port_forward("-D", endpoint.ip_address, *installed) {
                        tracing::warn!(
                            endpoint = %endpoint.id,
                            host_port = installed.host,
                            error = %undo,
                            "failed to remove port forward"
                        );
                    }
                }
                return Err(e);
            }
        }
        Ok(())
    }
}

impl Default for BridgeDriver {
    fn default() -> Self {
        Self::new()
    }
}

impl NetworkDriver for BridgeDriver {
    fn name(&self) -> &str {
        BRIDGE_DRIVER
    }

    fn create_network(
        &self,
        name: &str,
        subnet: Ipv4Network,
        gateway: Ipv4Addr,
    ) -> Result<Network> {
        validate_network_name(name)?;
        if self.link_exists(name) {
            return Err(CorralError::network(format!(
                "interface {name} already exists on the host"
            )));
        }

        let network = Network {
            name: name.to_string(),
            driver: BRIDGE_DRIVER.to_string(),
            subnet,
            gateway,
        };

        self.ip(&["link", "add", "name", name, "type", "bridge"])?;
        if let Err(e) = self.setup_bridge(&network) {
            self.delete_link(name);
            return Err(e);
        }

        tracing::info!(bridge = name, subnet = %subnet, gateway = %gateway, "bridge created");
        Ok(network)
    }

    fn delete_network(&self, network: &Network) -> Result<()> {
        if let Err(e) = self.masquerade("-D", network) {
            tracing::debug!(network = %network.name, error = %e, "no masquerade rule to remove");
        }
        if !self.link_exists(&network.name) {
            tracing::debug!(bridge = %network.name, "bridge already absent");
            return Ok(());
        }

        self.ip(&["link", "set", &network.name, "down"])?;
        self.ip(&["link", "delete", &network.name, "type", "bridge"])?;
        tracing::info!(bridge = %network.name, "bridge deleted");
        Ok(())
    }

    fn connect(&self, network: &Network, endpoint: &Endpoint) -> Result<()> {
        if !netns_exists(endpoint.container_pid) {
            return Err(CorralError::network(format!(
                "process {} has no network namespace to join",
                endpoint.container_pid
            )));
        }

        let host = endpoint.host_ifname();
        let peer = endpoint.peer_ifname();
        self.ip(&["link", "add", &host, "type", "veth", "peer", "name", &peer])?;

        // Deleting the host end takes the peer with it, wherever it lives.
        if let Err(e) = self.setup_endpoint(network, endpoint) {
            self.delete_link(&host);
            return Err(e);
        }

        tracing::info!(
            endpoint = %endpoint.id,
            ip = %endpoint.ip_address,
            bridge = %network.name,
            "endpoint connected"
        );
        Ok(())
    }

    fn disconnect(&self, network: &Network, endpoint: &Endpoint) -> Result<()> {
        for mapping in &endpoint.port_mapping {
            if let Err(e) = self.port_forward("-D", endpoint.ip_address, *mapping) {
                tracing::warn!(endpoint = %endpoint.id, port = %mapping, error = %e, "failed to remove port forward");
            }
        }

        let host = endpoint.host_ifname();
        if self.link_exists(&host) {
            self.ip(&["link", "delete", &host])?;
        }
        tracing::info!(endpoint = %endpoint.id, bridge = %network.name, "endpoint disconnected");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;

    /// Records every command and fails those containing a configured fragment.
    #[derive(Default)]
    struct RecordingRunner {
        commands: Mutex<Vec<String>>,
        failing: Vec<String>,
    }

    impl RecordingRunner {
        fn failing_on(fragments: &[&str]) -> Self {
            Self {
                commands: Mutex::default(),
                failing: fragments.iter().map(ToString::to_string).collect(),
            }
        }

        fn commands(&self) -> Vec<String> {
            self.commands.lock().unwrap().clone()
        }
    }

    impl CommandRunner for RecordingRunner {
        fn run(&self, program: &str, args: &[&str]) -> Result<()> {
            let line = format!("{program} {}", args.join(" "));
            let fails = self.failing.iter().any(|f| line.contains(f.as_str()));
            self.commands.lock().unwrap().push(line.clone());
            if fails {
                return Err(CorralError::network(format!("{line} failed")));
            }
            Ok(())
        }
    }

    fn net1() -> Network {
        Network {
            name: "net1".into(),
            driver: BRIDGE_DRIVER.into(),
            subnet: "192.168.10.0/24".parse().unwrap(),
            gateway: Ipv4Addr::new(192, 168, 10, 1),
        }
    }

    fn endpoint(ports: Vec<PortMapping>) -> Endpoint {
        Endpoint {
            id: Endpoint::endpoint_id("a1b2c3d4e5f6", "net1"),
            ip_address: Ipv4Addr::new(192, 168, 10, 2),
            network: "net1".into(),
            container_pid: std::process::id(),
            port_mapping: ports,
        }
    }

    #[test]
    fn create_network_builds_and_raises_bridge() {
        let runner = Arc::new(RecordingRunner::failing_on(&["link show"]));
        let driver = BridgeDriver::with_runner(runner.clone());

        let net = driver
            .create_network("net1", net1().subnet, net1().gateway)
            .unwrap();
        assert_eq!(net, net1());

        let cmds = runner.commands();
        assert_eq!(cmds[1], "ip link add name net1 type bridge");
        assert_eq!(cmds[2], "ip addr add 192.168.10.1/24 dev net1");
        assert_eq!(cmds[3], "ip link set net1 up");
        assert_eq!(
            cmds[4],
            "iptables -t nat -A POSTROUTING -s 192.168.10.0/24 ! -o net1 -j MASQUERADE"
        );
    }

    #[test]
    fn failed_create_removes_partial_bridge() {
        let runner = Arc::new(RecordingRunner::failing_on(&["link show", "addr add"]));
        let driver = BridgeDriver::with_runner(runner.clone());

        assert!(driver
            .create_network("net1", net1().subnet, net1().gateway)
            .is_err());
        let cmds = runner.commands();
        assert_eq!(cmds.last().unwrap(), "ip link delete net1");
    }

    #[test]
    fn existing_interface_is_not_touched() {
        let runner = Arc::new(RecordingRunner::default());
        let driver = BridgeDriver::with_runner(runner.clone());

        assert!(driver
            .create_network("net1", net1().subnet, net1().gateway)
            .is_err());
        assert_eq!(runner.commands(), vec!["ip link show net1"]);
    }

    #[test]
    fn delete_of_absent_bridge_is_a_no_op() {
        let runner = Arc::new(RecordingRunner::failing_on(&["link show", "MASQUERADE"]));
        let driver = BridgeDriver::with_runner(runner.clone());

        driver.delete_network(&net1()).unwrap();
        assert!(!runner.commands().iter().any(|c| c.contains("link delete")));
    }

    #[test]
    fn delete_brings_bridge_down_then_removes_it() {
        let runner = Arc::new(RecordingRunner::default());
        let driver = BridgeDriver::with_runner(runner.clone());

        driver.delete_network(&net1()).unwrap();
        let cmds = runner.commands();
        assert_eq!(cmds[cmds.len() - 2], "ip link set net1 down");
        assert_eq!(cmds[cmds.len() - 1], "ip link delete net1 type bridge");
    }

    #[test]
    fn connect_wires_veth_into_namespace_and_forwards_ports() {
        let runner = Arc::new(RecordingRunner::default());
        let driver = BridgeDriver::with_runner(runner.clone());
        let ep = endpoint(vec![PortMapping { host: 8080, container: 80 }]);
        let pid = ep.container_pid;

        driver.connect(&net1(), &ep).unwrap();
        let cmds = runner.commands();
        assert_eq!(cmds[0], "ip link add vetha1b2c3d4 type veth peer name cif-a1b2c3d4");
        assert_eq!(cmds[1], "ip link set vetha1b2c3d4 master net1");
        assert_eq!(cmds[3], format!("ip link set cif-a1b2c3d4 netns {pid}"));
        assert_eq!(
            cmds[4],
            format!("nsenter --target {pid} --net -- ip addr add 192.168.10.2/24 dev cif-a1b2c3d4")
        );
        assert!(cmds.contains(&format!(
            "nsenter --target {pid} --net -- ip route add default via 192.168.10.1 dev cif-a1b2c3d4"
        )));
        assert_eq!(
            cmds.last().unwrap(),
            "iptables -t nat -A PREROUTING -p tcp -m tcp --dport 8080 -j DNAT --to-destination 192.168.10.2:80"
        );
    }

    #[test]
    fn failed_connect_removes_veth_pair() {
        let runner = Arc::new(RecordingRunner::failing_on(&["netns"]));
        let driver = BridgeDriver::with_runner(runner.clone());

        assert!(driver.connect(&net1(), &endpoint(vec![])).is_err());
        assert_eq!(runner.commands().last().unwrap(), "ip link delete vetha1b2c3d4");
    }

    #[test]
    fn failed_port_forward_rolls_back_earlier_rules() {
        let runner = Arc::new(RecordingRunner::failing_on(&["--dport 9090"]));
        let driver = BridgeDriver::with_runner(runner.clone());
        let ep = endpoint(vec![
            PortMapping { host: 8080, container: 80 },
            PortMapping { host: 9090, container: 90 },
        ]);

        assert!(driver.connect(&net1(), &ep).is_err());
        let cmds = runner.commands();
        assert!(cmds.iter().any(|c| c.contains("-D PREROUTING") && c.contains("--dport 8080")));
        assert_eq!(cmds.last().unwrap(), "ip link delete vetha1b2c3d4");
    }

    #[test]
    fn failed_rule_removal_does_not_stop_rollback() {
        let runner = Arc::new(RecordingRunner::failing_on(&["--dport 7070", "-D PREROUTING"]));
        let driver = BridgeDriver::with_runner(runner.clone());
        let ep = endpoint(vec![
            PortMapping { host: 8080, container: 80 },
            PortMapping { host: 9090, container: 90 },
            PortMapping { host: 7070, container: 70 },
        ]);

        assert!(driver.connect(&net1(), &ep).is_err());
        let cmds = runner.commands();
        for port in ["8080", "9090"] {
            assert!(cmds
                .iter()
                .any(|c| c.contains("-D PREROUTING") && c.contains(&format!("--dport {port} "))));
        }
        assert_eq!(cmds.last().unwrap(), "ip link delete vetha1b2c3d4");
    }

    #[test]
    fn connect_requires_live_namespace() {
        let runner = Arc::new(RecordingRunner::default());
        let driver = BridgeDriver::with_runner(runner.clone());
        let mut ep = endpoint(vec![]);
        ep.container_pid = u32::MAX;

        assert!(driver.connect(&net1(), &ep).is_err());
        assert!(runner.commands().is_empty());
    }

    #[test]
    fn disconnect_removes_forwards_and_host_link() {
        let runner = Arc::new(RecordingRunner::default());
        let driver = BridgeDriver::with_runner(runner.clone());
        let ep = endpoint(vec![PortMapping { host: 8080, container: 80 }]);

        driver.disconnect(&net1(), &ep).unwrap();
        let cmds = runner.commands();
        assert!(cmds[0].starts_with("iptables -t nat -D PREROUTING"));
        assert_eq!(cmds.last().unwrap(), "ip link delete vetha1b2c3d4");
    }
}
