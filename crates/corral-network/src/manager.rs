//! Network lifecycle orchestration.
//!
//! [`NetworkManager`] owns the registry, the allocator and the driver table
//! for one engine instance. Every mutating operation undoes its own partial
//! work before returning an error, so a failed create leaves neither a
//! reserved gateway nor a record behind.

use std::collections::HashMap;
use std::net::Ipv4Addr;

use corral_common::config::CorralConfig;
use corral_common::error::{CorralError, Result};
use ipnetwork::Ipv4Network;

use crate::bridge::BridgeDriver;
use crate::driver::NetworkDriver;
use crate::ipam::Ipam;
use crate::model::{Endpoint, Network, PortMapping, validate_network_name};
use crate::registry::NetworkRegistry;

/// Process-scoped network state: records, addresses and drivers.
pub struct NetworkManager {
    registry: NetworkRegistry,
    ipam: Ipam,
    drivers: HashMap<String, Box<dyn NetworkDriver>>,
}

impl NetworkManager {
    /// Loads the registry described by `config` and registers the bridge driver.
    ///
    /// # Errors
    ///
    /// Returns an error if the network records cannot be read.
    pub fn new(config: &CorralConfig) -> Result<Self> {
        let registry = NetworkRegistry::load(&config.network_dir)?;
        let mut manager = Self::with_parts(registry, Ipam::new(&config.ipam_file));
        manager.register_driver(Box::new(BridgeDriver::new()));
        Ok(manager)
    }

    /// Assembles a manager with no drivers registered.
    #[must_use]
    pub fn with_parts(registry: NetworkRegistry, ipam: Ipam) -> Self {
        Self {
            registry,
            ipam,
            drivers: HashMap::new(),
        }
    }

    /// Registers `driver` under its own name, replacing any previous one.
    pub fn register_driver(&mut self, driver: Box<dyn NetworkDriver>) {
        let _ = self.drivers.insert(driver.name().to_string(), driver);
    }

    /// Re-reads the network records from disk.
    ///
    /// # Errors
    ///
    /// Returns an error if the records cannot be read.
    pub fn reload(&mut self) -> Result<()> {
        self.registry.reload()
    }

    /// Returns the address allocator.
    #[must_use]
    pub const fn ipam(&self) -> &Ipam {
        &self.ipam
    }

    /// Looks up a network by name.
    ///
    /// # Errors
    ///
    /// Returns [`CorralError::NotFound`] if no such network exists.
    pub fn network(&self, name: &str) -> Result<&Network> {
        self.registry.get(name)
    }

    /// Returns every network, sorted by name.
    #[must_use]
    pub fn list_networks(&self) -> Vec<Network> {
        self.registry.list()
    }

    /// Creates a network: reserves its gateway, builds its devices through
    /// `driver`, and persists its record.
    ///
    /// # Errors
    ///
    /// Returns [`CorralError::NetworkConfig`] for an invalid or duplicate
    /// name, an unknown driver or a subnet already in use;
    /// [`CorralError::AllocationExhausted`] if no gateway address is free;
    /// or the driver's error if device creation fails.
    pub fn create_network(
        &mut self,
        name: &str,
        driver: &str,
        subnet: Ipv4Network,
    ) -> Result<Network> {
        validate_network_name(name)?;
        if self.registry.contains(name) {
            return Err(CorralError::network(format!(
                "network {name} already exists"
            )));
        }
        let subnet = Ipv4Network::new(subnet.network(), subnet.prefix())
            .map_err(|e| CorralError::network(format!("invalid subnet {subnet}: {e}")))?;
        if let Some(existing) = self.registry.list().into_iter().find(|n| n.subnet == subnet) {
            return Err(CorralError::network(format!(
                "subnet {subnet} is already used by network {}",
                existing.name
            )));
        }
        let driver = lookup_driver(&self.drivers, driver)?;

        let gateway = self.ipam.allocate(&subnet)?;
        let network = match driver.create_network(name, subnet, gateway) {
            Ok(network) => network,
            Err(e) => {
                self.release_quietly(&subnet, gateway);
                return Err(e);
            }
        };

        if let Err(e) = self.registry.insert(network.clone()) {
            if let Err(cleanup) = driver.delete_network(&network) {
                tracing::warn!(network = name, error = %cleanup, "failed to remove devices after record write failure");
            }
            self.release_quietly(&subnet, gateway);
            return Err(e);
        }

        tracing::info!(network = name, subnet = %subnet, gateway = %gateway, "network created");
        Ok(network)
    }

    /// Deletes a network's devices, its gateway reservation and its record.
    ///
    /// # Errors
    ///
    /// Returns [`CorralError::NotFound`] if the network does not exist, or
    /// the driver's error if its devices cannot be removed.
    pub fn delete_network(&mut self, name: &str) -> Result<()> {
        let network = self.registry.get(name)?.clone();
        let driver = self.driver(&network.driver)?;
        driver.delete_network(&network)?;
        self.ipam.release(&network.subnet, network.gateway)?;
        let _ = self.registry.remove(name)?;
        tracing::info!(network = name, "network deleted");
        Ok(())
    }

    /// Attaches the container whose init process is `pid` to network `name`.
    ///
    /// The returned endpoint owns its address until
    /// [`NetworkManager::disconnect`] is called with it.
    ///
    /// # Errors
    ///
    /// Returns [`CorralError::NotFound`] for an unknown network,
    /// [`CorralError::AllocationExhausted`] if the subnet is full, or the
    /// driver's error if wiring fails.
    pub fn connect(
        &self,
        name: &str,
        container_id: &str,
        pid: u32,
        ports: &[PortMapping],
    ) -> Result<Endpoint> {
        let network = self.registry.get(name)?;
        let driver = self.driver(&network.driver)?;
        let ip_address = self.ipam.allocate(&network.subnet)?;

        let endpoint = Endpoint {
            id: Endpoint::endpoint_id(container_id, name),
            ip_address,
            network: name.to_string(),
            container_pid: pid,
            port_mapping: ports.to_vec(),
        };
        if let Err(e) = driver.connect(network, &endpoint) {
            self.release_quietly(&network.subnet, ip_address);
            return Err(e);
        }
        Ok(endpoint)
    }

    /// Detaches an endpoint and returns its address to the pool.
    ///
    /// # Errors
    ///
    /// Returns [`CorralError::NotFound`] if the endpoint's network no longer
    /// exists, or the driver's error if its links cannot be removed.
    pub fn disconnect(&self, endpoint: &Endpoint) -> Result<()> {
        let network = self.registry.get(&endpoint.network)?;
        let driver = self.driver(&network.driver)?;
        driver.disconnect(network, endpoint)?;
        self.ipam.release(&network.subnet, endpoint.ip_address)
    }

    fn driver(&self, name: &str) -> Result<&dyn NetworkDriver> {
        lookup_driver(&self.drivers, name)
    }

    fn release_quietly(&self, subnet: &Ipv4Network, ip: Ipv4Addr) {
        if let Err(e) = self.ipam.release(subnet, ip) {
            tracing::warn!(subnet = %subnet, ip = %ip, error = %e, "failed to release address");
        }
    }
}

fn lookup_driver<'a>(
    drivers: &'a HashMap<String, Box<dyn NetworkDriver>>,
    name: &str,
) -> Result<&'a dyn NetworkDriver> {
    drivers
        .get(name)
        .map(AsRef::as_ref)
        .ok_or_else(|| CorralError::network(format!("unknown network driver {name}")))
}
