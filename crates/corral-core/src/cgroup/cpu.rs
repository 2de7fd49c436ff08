//! CPU weight control.
//!
//! Shares are expressed on the v1 `cpu.shares` scale (2..=262144, default
//! 1024). On the unified hierarchy they are converted to `cpu.weight`
//! (1..=10000, default 100) with the same mapping container runtimes use.

use std::path::Path;

use corral_common::error::{CorralError, Result};

use super::{CgroupVersion, write_control};

const MIN_SHARES: u64 = 2;
const MAX_SHARES: u64 = 262_144;

/// Converts v1 CPU shares to a v2 CPU weight.
#[must_use]
pub const fn shares_to_weight(shares: u64) -> u64 {
    let shares = if shares < MIN_SHARES {
        MIN_SHARES
    } else if shares > MAX_SHARES {
        MAX_SHARES
    } else {
        shares
    };
    1 + ((shares - MIN_SHARES) * 9999) / (MAX_SHARES - MIN_SHARES)
}

/// Sets the relative CPU weight for a cgroup.
///
/// # Errors
///
/// Returns an error if the share is not a number on the unified hierarchy,
/// or if writing the control file fails.
pub fn set_cpu_share(cgroup_path: &Path, version: CgroupVersion, share: &str) -> Result<()> {
    match version {
        CgroupVersion::V1 => write_control(cgroup_path, "cpu.shares", share)?,
        CgroupVersion::V2 => {
            let shares: u64 = share.trim().parse().map_err(|_| CorralError::Config {
                message: format!("cpu share must be a positive integer, got {share:?}"),
            })?;
            write_control(cgroup_path, "cpu.weight", &shares_to_weight(shares).to_string())?;
        }
    }
    tracing::debug!(share, "CPU share set");
    Ok(())
}
