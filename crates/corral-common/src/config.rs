//! Global configuration model for the corral engine.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::constants;

/// Root configuration for the engine.
///
/// Every on-disk location hangs off a single data directory so a test or a
/// second engine instance can be pointed at a scratch tree.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CorralConfig {
    /// Base directory for corral state and data.
    pub data_dir: PathBuf,
    /// Directory holding one record file per network.
    pub network_dir: PathBuf,
    /// Allocator bitmap table.
    pub ipam_file: PathBuf,
    /// Directory holding one record directory per container.
    pub container_dir: PathBuf,
    /// Directory of image root filesystems and image archives.
    pub image_dir: PathBuf,
    /// Directory of unpacked read-only layers and per-container writable layers.
    pub layer_dir: PathBuf,
    /// Directory of merged container root filesystems.
    pub mnt_dir: PathBuf,
    /// Directory of detached container logs.
    pub log_dir: PathBuf,
    /// Mount root of the cgroup filesystem.
    pub cgroup_root: PathBuf,
    /// Parent cgroup for container groups, relative to each hierarchy.
    pub cgroup_parent: String,
}

impl CorralConfig {
    /// Builds a configuration with every path placed under `data_dir`.
    #[must_use]
    pub fn from_data_dir(data_dir: impl AsRef<Path>) -> Self {
        let data_dir = data_dir.as_ref().to_path_buf();
        let network_dir = data_dir.join("network");
        Self {
            ipam_file: network_dir.join("ipam").join(constants::IPAM_FILE_NAME),
            network_dir,
            container_dir: data_dir.join("containers"),
            image_dir: data_dir.join("images"),
            layer_dir: data_dir.join("layers"),
            mnt_dir: data_dir.join("mnt"),
            log_dir: data_dir.join("logs"),
            cgroup_root: PathBuf::from(constants::CGROUP_ROOT),
            cgroup_parent: constants::CGROUP_PARENT.to_string(),
            data_dir,
        }
    }
}

impl Default for CorralConfig {
    fn default() -> Self {
        Self::from_data_dir(constants::data_dir())
    }
}
