//! Network and endpoint records.

use std::fmt;
use std::net::Ipv4Addr;
use std::str::FromStr;

use corral_common::error::{CorralError, Result};
use ipnetwork::Ipv4Network;
use serde::{Deserialize, Serialize};

/// Longest interface name the kernel accepts (`IFNAMSIZ - 1`).
pub const MAX_IFNAME_LEN: usize = 15;

/// Characters of the endpoint id kept in veth names.
const VETH_ID_LEN: usize = 8;

/// A named virtual network.
///
/// Serialized as the durable record `{network_name, driver, ip_range, gateway}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Network {
    /// Unique network name; also the name of its record file and bridge device.
    #[serde(rename = "network_name")]
    pub name: String,
    /// Key into the driver table.
    pub driver: String,
    /// Subnet, normalized to its network address.
    #[serde(rename = "ip_range")]
    pub subnet: Ipv4Network,
    /// First usable address of the subnet, owned by the bridge.
    pub gateway: Ipv4Addr,
}

impl Network {
    /// Returns the gateway address with the subnet prefix, as assigned to
    /// the bridge interface.
    #[must_use]
    pub fn gateway_cidr(&self) -> String {
        format!("{}/{}", self.gateway, self.subnet.prefix())
    }
}

/// A host port forwarded to a container port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortMapping {
    /// Port on the host.
    pub host: u16,
    /// Port inside the container.
    pub container: u16,
}

impl FromStr for PortMapping {
    type Err = CorralError;

    /// Parses `host:container`, e.g. `8080:80`.
    fn from_str(s: &str) -> Result<Self> {
        let invalid = || {
            CorralError::network(format!(
                "invalid port mapping {s:?}, expected HOST:CONTAINER"
            ))
        };
        let (host, container) = s.split_once(':').ok_or_else(invalid)?;
        Ok(Self {
            host: host.trim().parse().map_err(|_| invalid())?,
            container: container.trim().parse().map_err(|_| invalid())?,
        })
    }
}

impl fmt::Display for PortMapping {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.container)
    }
}

/// A container's attachment to a network.
///
/// The endpoint holds its address exclusively until it is disconnected.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Endpoint {
    /// `{container_id}-{network_name}`.
    pub id: String,
    /// Address drawn from the network's subnet.
    pub ip_address: Ipv4Addr,
    /// Name of the network this endpoint belongs to.
    pub network: String,
    /// Init process of the container; names its network namespace.
    pub container_pid: u32,
    /// Host ports forwarded to the container, in order.
    pub port_mapping: Vec<PortMapping>,
}

impl Endpoint {
    /// Builds the endpoint id for a container on a network.
    #[must_use]
    pub fn endpoint_id(container_id: &str, network: &str) -> String {
        format!("{container_id}-{network}")
    }

    fn short_id(&self) -> String {
        self.id.chars().take(VETH_ID_LEN).collect()
    }

    /// Name of the veth end that stays on the host and joins the bridge.
    #[must_use]
    pub fn host_ifname(&self) -> String {
        format!("veth{}", self.short_id())
    }

    /// Name of the veth end moved into the container.
    #[must_use]
    pub fn peer_ifname(&self) -> String {
        format!("cif-{}", self.short_id())
    }
}

/// Checks a network name for use as a record file name and bridge device.
///
/// # Errors
///
/// Returns [`CorralError::NetworkConfig`] if the name is empty, too long for
/// an interface, or contains characters other than ASCII alphanumerics,
/// `-`, `_` and `.`.
pub fn validate_network_name(name: &str) -> Result<()> {
    if name.is_empty() || name.len() > MAX_IFNAME_LEN {
        return Err(CorralError::network(format!(
            "network name {name:?} must be 1 to {MAX_IFNAME_LEN} characters"
        )));
    }
    if name.starts_with('.')
        || !name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
    {
        return Err(CorralError::network(format!(
            "network name {name:?} contains invalid characters"
        )));
    }
    Ok(())
}

/// Parses a CIDR subnet and normalizes it to its network address.
///
/// # Errors
///
/// Returns [`CorralError::NetworkConfig`] if the text is not IPv4 CIDR.
pub fn parse_subnet(cidr: &str) -> Result<Ipv4Network> {
    let parsed: Ipv4Network = cidr
        .trim()
        .parse()
        .map_err(|e| CorralError::network(format!("invalid subnet {cidr:?}: {e}")))?;
    Ipv4Network::new(parsed.network(), parsed.prefix())
        .map_err(|e| CorralError::network(format!("invalid subnet {cidr:?}: {e}")))
}
