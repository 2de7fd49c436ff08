//! Network namespace addressing.
//!
//! A container's network namespace lives as long as its init process and is
//! addressed through that process id.

use std::path::PathBuf;

/// Returns the namespace file of the network namespace `pid` belongs to.
#[must_use]
pub fn netns_path(pid: u32) -> PathBuf {
    PathBuf::from(format!("/proc/{pid}/ns/net"))
}

/// Returns `true` while the network namespace of `pid` can still be entered.
#[must_use]
pub fn netns_exists(pid: u32) -> bool {
    netns_path(pid).exists()
}
