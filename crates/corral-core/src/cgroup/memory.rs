//! Memory resource control.
//!
//! Writes `memory.limit_in_bytes` on v1 hierarchies and `memory.max` on the
//! unified hierarchy. Both accept a byte count with an optional `k`, `m` or
//! `g` suffix, so the configured string is passed through unchanged.

use std::path::Path;

use corral_common::error::Result;

use super::{CgroupVersion, write_control};

/// Returns the control file holding the hard memory cap.
#[must_use]
pub const fn limit_file(version: CgroupVersion) -> &'static str {
    match version {
        CgroupVersion::V1 => "memory.limit_in_bytes",
        CgroupVersion::V2 => "memory.max",
    }
}

/// Sets the hard memory limit for a cgroup.
///
/// # Errors
///
/// Returns an error if writing the limit file fails.
pub fn set_memory_limit(cgroup_path: &Path, version: CgroupVersion, limit: &str) -> Result<()> {
    write_control(cgroup_path, limit_file(version), limit)?;
    tracing::debug!(limit, "memory limit set");
    Ok(())
}
