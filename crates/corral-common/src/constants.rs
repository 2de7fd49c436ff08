//! System-wide constants and default paths.

use std::path::PathBuf;

/// Default base directory for corral state on the host.
pub const DEFAULT_DATA_DIR: &str = "/var/lib/corral";

/// Environment variable that overrides the data directory.
pub const DATA_DIR_ENV: &str = "CORRAL_DATA_DIR";

/// Cgroup filesystem mount root.
pub const CGROUP_ROOT: &str = "/sys/fs/cgroup";

/// Parent cgroup under which every container group is created.
pub const CGROUP_PARENT: &str = "corral";

/// Subcommand the launcher re-executes itself with inside the new namespaces.
pub const INIT_SUBCOMMAND: &str = "init";

/// File descriptor number the init process reads its command from.
pub const INIT_PIPE_FD: i32 = 3;

/// Environment variable carrying the container hostname into init.
pub const HOSTNAME_ENV: &str = "CORRAL_HOSTNAME";

/// Name of the allocator state file inside the IPAM directory.
pub const IPAM_FILE_NAME: &str = "subnet.json";

/// Driver name of the built-in bridge driver.
pub const BRIDGE_DRIVER: &str = "bridge";

/// Resolves the data directory from the environment, falling back to
/// [`DEFAULT_DATA_DIR`].
#[must_use]
pub fn data_dir() -> PathBuf {
    std::env::var_os(DATA_DIR_ENV).map_or_else(|| PathBuf::from(DEFAULT_DATA_DIR), PathBuf::from)
}
