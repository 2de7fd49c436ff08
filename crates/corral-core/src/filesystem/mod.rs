//! Filesystem management for container isolation.
//!
//! Provides `OverlayFS` layer stacking for container root filesystems,
//! bind mounts for volumes, and the `pivot_root` switch performed by init.

pub mod mount;
pub mod overlayfs;
pub mod pivot_root;
