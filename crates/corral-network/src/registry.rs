//! Durable name-to-network records.
//!
//! Each network is one JSON file in the network directory, named after the
//! network. The in-memory index is filled by [`NetworkRegistry::load`] and
//! kept in step with the files by [`NetworkRegistry::insert`] and
//! [`NetworkRegistry::remove`].

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use corral_common::constants::IPAM_FILE_NAME;
use corral_common::error::{CorralError, Result};

use crate::model::Network;

/// In-memory index over the network record directory.
#[derive(Debug)]
pub struct NetworkRegistry {
    dir: PathBuf,
    networks: HashMap<String, Network>,
}

impl NetworkRegistry {
    /// Opens the registry rooted at `dir` and loads every record in it.
    ///
    /// A missing directory is an empty registry.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory or a record cannot be read or parsed.
    pub fn load(dir: impl Into<PathBuf>) -> Result<Self> {
        let mut registry = Self {
            dir: dir.into(),
            networks: HashMap::new(),
        };
        registry.reload()?;
        Ok(registry)
    }

    /// Discards the in-memory index and re-reads the record directory.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory or a record cannot be read or parsed.
    pub fn reload(&mut self) -> Result<()> {
        self.networks.clear();
        let entries = match std::fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(CorralError::io(&self.dir, e)),
        };

        for entry in entries {
            let entry = entry.map_err(|e| CorralError::io(&self.dir, e))?;
            let path = entry.path();
            if !is_record_file(&entry, &path) {
                continue;
            }
            let bytes = std::fs::read(&path).map_err(|e| CorralError::io(&path, e))?;
            let network: Network = serde_json::from_slice(&bytes)?;
            tracing::debug!(network = %network.name, path = %path.display(), "network loaded");
            let _ = self.networks.insert(network.name.clone(), network);
        }
        Ok(())
    }

    /// Looks up a network by name.
    ///
    /// # Errors
    ///
    /// Returns [`CorralError::NotFound`] if no such network is registered.
    pub fn get(&self, name: &str) -> Result<&Network> {
        self.networks.get(name).ok_or_else(|| CorralError::NotFound {
            kind: "network",
            id: name.to_string(),
        })
    }

    /// Returns `true` if a network of that name is registered.
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.networks.contains_key(name)
    }

    /// Persists `network` and adds it to the index.
    ///
    /// # Errors
    ///
    /// Returns an error if the record cannot be written.
    pub fn insert(&mut self, network: Network) -> Result<()> {
        std::fs::create_dir_all(&self.dir).map_err(|e| CorralError::io(&self.dir, e))?;
        let path = self.record_path(&network.name);
        let tmp = self.dir.join(format!(".{}.tmp", network.name));
        let bytes = serde_json::to_vec_pretty(&network)?;
        std::fs::write(&tmp, bytes).map_err(|e| CorralError::io(&tmp, e))?;
        std::fs::rename(&tmp, &path).map_err(|e| CorralError::io(&path, e))?;
        let _ = self.networks.insert(network.name.clone(), network);
        Ok(())
    }

    /// Deletes the record of `name` and drops it from the index.
    ///
    /// # Errors
    ///
    /// Returns [`CorralError::NotFound`] if the network is not registered,
    /// or an I/O error if its record cannot be removed.
    pub fn remove(&mut self, name: &str) -> Result<Network> {
        if !self.networks.contains_key(name) {
            return Err(CorralError::NotFound {
                kind: "network",
                id: name.to_string(),
            });
        }
        let path = self.record_path(name);
        match std::fs::remove_file(&path) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(CorralError::io(&path, e)),
        }
        self.networks.remove(name).ok_or_else(|| CorralError::NotFound {
            kind: "network",
            id: name.to_string(),
        })
    }

    /// Returns every registered network, sorted by name.
    #[must_use]
    pub fn list(&self) -> Vec<Network> {
        let mut networks: Vec<Network> = self.networks.values().cloned().collect();
        networks.sort_by(|a, b| a.name.cmp(&b.name));
        networks
    }

    fn record_path(&self, name: &str) -> PathBuf {
        self.dir.join(name)
    }
}

fn is_record_file(entry: &std::fs::DirEntry, path: &Path) -> bool {
    if !entry.file_type().is_ok_and(|t| t.is_file()) {
        return false;
    }
    path.file_name()
        .and_then(|n| n.to_str())
        .is_some_and(|n| !n.starts_with('.') && n != IPAM_FILE_NAME)
}

#[cfg(test)]
mod tests {
    use std::net::Ipv4Addr;

    use super::*;
    use crate::model::parse_subnet;

    fn network(name: &str, cidr: &str) -> Network {
        let subnet = parse_subnet(cidr).unwrap();
        Network {
            name: name.into(),
            driver: "bridge".into(),
            gateway: Ipv4Addr::from(u32::from(subnet.network()) + 1),
            subnet,
        }
    }

    #[test]
    fn missing_directory_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let registry = NetworkRegistry::load(dir.path().join("absent")).unwrap();
        assert!(registry.list().is_empty());
    }

    #[test]
    fn inserted_networks_survive_reload() {
        let dir = tempfile::tempdir().unwrap();
        let mut registry = NetworkRegistry::load(dir.path()).unwrap();
        registry.insert(network("net1", "192.168.10.0/24")).unwrap();
        registry.insert(network("alpha", "10.1.0.0/16")).unwrap();

        let reopened = NetworkRegistry::load(dir.path()).unwrap();
        let names: Vec<_> = reopened.list().into_iter().map(|n| n.name).collect();
        assert_eq!(names, vec!["alpha", "net1"]);
        assert_eq!(
            reopened.get("net1").unwrap().gateway,
            Ipv4Addr::new(192, 168, 10, 1)
        );
    }

    #[test]
    fn scan_skips_allocator_state_and_subdirectories() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("ipam")).unwrap();
        std::fs::write(dir.path().join("ipam").join(IPAM_FILE_NAME), "{}").unwrap();
        std::fs::write(dir.path().join(IPAM_FILE_NAME), "{}").unwrap();
        std::fs::write(dir.path().join(".net1.tmp"), "partial").unwrap();

        let registry = NetworkRegistry::load(dir.path()).unwrap();
        assert!(registry.list().is_empty());
    }

    #[test]
    fn unknown_name_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let mut registry = NetworkRegistry::load(dir.path()).unwrap();
        assert!(matches!(
            registry.get("nope"),
            Err(CorralError::NotFound { kind: "network", .. })
        ));
        assert!(matches!(
            registry.remove("nope"),
            Err(CorralError::NotFound { .. })
        ));
    }

    #[test]
    fn remove_deletes_record() {
        let dir = tempfile::tempdir().unwrap();
        let mut registry = NetworkRegistry::load(dir.path()).unwrap();
        registry.insert(network("net1", "192.168.10.0/24")).unwrap();

        let removed = registry.remove("net1").unwrap();
        assert_eq!(removed.name, "net1");
        assert!(!registry.contains("net1"));
        assert!(!dir.path().join("net1").exists());
    }

    #[test]
    fn corrupt_record_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("broken"), "not json").unwrap();
        assert!(matches!(
            NetworkRegistry::load(dir.path()),
            Err(CorralError::Serialization { .. })
        ));
    }
}
