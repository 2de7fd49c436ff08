//! Persistent container records.
//!
//! Each container has `<container_dir>/<id>/config.json`, enabling
//! daemon-less lifecycle management: `ps`, `stop` and `logs` work from a
//! fresh process by reading these records.

use std::path::PathBuf;

use corral_common::error::{CorralError, Result};
use corral_common::types::{ContainerId, ContainerState, ResourceLimits};
use corral_network::Endpoint;
use serde::{Deserialize, Serialize};

use crate::workspace::Volume;

const RECORD_FILE: &str = "config.json";

/// Persistent record of one container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerRecord {
    /// Container identifier.
    pub id: ContainerId,
    /// Host pid of the init process.
    pub pid: u32,
    /// Image the root filesystem was built from.
    pub image: String,
    /// Command line delivered to init.
    pub command: String,
    /// Current lifecycle state.
    pub status: ContainerState,
    /// Limits applied to the container cgroup.
    pub limits: ResourceLimits,
    /// Network the container joined, if any.
    #[serde(default)]
    pub network: Option<String>,
    /// Endpoint holding the container's address on that network.
    #[serde(default)]
    pub endpoint: Option<Endpoint>,
    /// Host directory bound into the container, if any.
    #[serde(default)]
    pub volume: Option<Volume>,
    /// RFC 3339 creation timestamp.
    pub created_at: String,
}

/// Directory of container records.
#[derive(Debug, Clone)]
pub struct StateStore {
    dir: PathBuf,
}

impl StateStore {
    /// Creates a store rooted at `dir`.
    #[must_use]
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn record_path(&self, id: &str) -> PathBuf {
        self.dir.join(id).join(RECORD_FILE)
    }

    /// Writes `record` atomically.
    ///
    /// # Errors
    ///
    /// Returns an error if the record cannot be serialized or written.
    pub fn save(&self, record: &ContainerRecord) -> Result<()> {
        let path = self.record_path(record.id.as_str());
        let dir = path.parent().unwrap_or(&self.dir);
        std::fs::create_dir_all(dir).map_err(|e| CorralError::io(dir, e))?;

        let tmp = path.with_extension("json.tmp");
        let bytes = serde_json::to_vec_pretty(record)?;
        std::fs::write(&tmp, bytes).map_err(|e| CorralError::io(&tmp, e))?;
        std::fs::rename(&tmp, &path).map_err(|e| CorralError::io(&path, e))?;
        tracing::debug!(id = %record.id, status = %record.status, "container record saved");
        Ok(())
    }

    /// Loads the record of container `id`.
    ///
    /// # Errors
    ///
    /// Returns [`CorralError::NotFound`] if there is no such container, or
    /// an error if its record cannot be read or parsed.
    pub fn load(&self, id: &str) -> Result<ContainerRecord> {
        let path = self.record_path(id);
        match std::fs::read(&path) {
            Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(CorralError::NotFound {
                kind: "container",
                id: id.to_string(),
            }),
            Err(e) => Err(CorralError::io(path, e)),
        }
    }

    /// Returns every record, oldest first.
    ///
    /// Directories without a readable record are skipped with a warning.
    ///
    /// # Errors
    ///
    /// Returns an error if the record directory exists but cannot be read.
    pub fn list(&self) -> Result<Vec<ContainerRecord>> {
        let entries = match std::fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(CorralError::io(&self.dir, e)),
        };

        let mut records = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| CorralError::io(&self.dir, e))?;
            let Some(id) = entry.file_name().to_str().map(ToString::to_string) else {
                continue;
            };
            match self.load(&id) {
                Ok(record) => records.push(record),
                Err(e) => tracing::warn!(id, error = %e, "skipping unreadable container record"),
            }
        }
        records.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(records)
    }

    /// Deletes the record directory of container `id`.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory exists but cannot be removed.
    pub fn remove(&self, id: &str) -> Result<()> {
        let dir = self.dir.join(id);
        match std::fs::remove_dir_all(&dir) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(CorralError::io(dir, e)),
        }
    }
}
