//! Network driver capability set.

use std::net::Ipv4Addr;

use corral_common::error::Result;
use ipnetwork::Ipv4Network;

use crate::model::{Endpoint, Network};

/// Operations every network driver provides.
///
/// Drivers are registered by [`NetworkDriver::name`] in the network
/// manager; a network record names the driver that owns its devices.
pub trait NetworkDriver: Send + Sync {
    /// Key under which the driver is registered.
    fn name(&self) -> &str;

    /// Creates the devices backing a network and returns its record.
    ///
    /// `gateway` has already been reserved in the allocator. On failure the
    /// driver must leave no partially created device behind.
    ///
    /// # Errors
    ///
    /// Returns an error if any device step fails.
    fn create_network(
        &self,
        name: &str,
        subnet: Ipv4Network,
        gateway: Ipv4Addr,
    ) -> Result<Network>;

    /// Removes the devices of a network. Succeeds if they are already gone.
    ///
    /// # Errors
    ///
    /// Returns an error if an existing device cannot be removed.
    fn delete_network(&self, network: &Network) -> Result<()>;

    /// Wires a container into a network using the endpoint's address.
    ///
    /// # Errors
    ///
    /// Returns an error if any link, address, route or forwarding step fails.
    fn connect(&self, network: &Network, endpoint: &Endpoint) -> Result<()>;

    /// Undoes [`NetworkDriver::connect`]. Succeeds if the links are already gone.
    ///
    /// # Errors
    ///
    /// Returns an error if an existing link cannot be removed.
    fn disconnect(&self, network: &Network, endpoint: &Endpoint) -> Result<()>;
}
