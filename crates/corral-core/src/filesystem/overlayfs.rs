//! `OverlayFS` management for container root filesystems.
//!
//! The unpacked image is the read-only lower layer; each container gets its
//! own writable upper layer, so containers started from one image never see
//! each other's writes.

use std::path::{Path, PathBuf};

use corral_common::error::{CorralError, Result};

/// Configuration for an `OverlayFS` mount.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OverlayConfig {
    /// Read-only lower layers (bottom to top).
    pub lower_dirs: Vec<PathBuf>,
    /// Writable upper layer directory.
    pub upper_dir: PathBuf,
    /// Work directory required by `OverlayFS`.
    pub work_dir: PathBuf,
    /// Final merged mount point.
    pub merged_dir: PathBuf,
}

impl OverlayConfig {
    /// Lays out the per-container directories for one image layer.
    ///
    /// Upper and work directories live in `layer_dir/<id>/`, the merged
    /// root at `mnt_dir/<id>`.
    #[must_use]
    pub fn for_container(image_layer: &Path, layer_dir: &Path, mnt_dir: &Path, id: &str) -> Self {
        let container_layers = layer_dir.join(id);
        Self {
            lower_dirs: vec![image_layer.to_path_buf()],
            upper_dir: container_layers.join("upper"),
            work_dir: container_layers.join("work"),
            merged_dir: mnt_dir.join(id),
        }
    }

    /// Builds the `mount(2)` data string.
    ///
    /// `OverlayFS` lists lower layers top-most first.
    #[must_use]
    pub fn mount_options(&self) -> String {
        let lowers = self
            .lower_dirs
            .iter()
            .rev()
            .map(|p| p.display().to_string())
            .collect::<Vec<_>>()
            .join(":");
        format!(
            "lowerdir={},upperdir={},workdir={}",
            lowers,
            self.upper_dir.display(),
            self.work_dir.display()
        )
    }
}

/// Mounts an `OverlayFS` with the given configuration.
///
/// Creates the upper, work, and merged directories if they do not exist,
/// then issues the `mount(2)` syscall with overlay-specific options.
///
/// # Errors
///
/// Returns an error if directory creation fails or if the mount syscall fails.
#[cfg(target_os = "linux")]
pub fn mount_overlay(config: &OverlayConfig) -> Result<()> {
    use nix::mount::{MsFlags, mount};

    for dir in [&config.upper_dir, &config.work_dir, &config.merged_dir] {
        std::fs::create_dir_all(dir).map_err(|e| CorralError::io(dir, e))?;
    }

    let opts = config.mount_options();
    mount(
        Some("overlay"),
        &config.merged_dir,
        Some("overlay"),
        MsFlags::empty(),
        Some(opts.as_str()),
    )
    .map_err(|e| CorralError::Config {
        message: format!("overlay mount at {} failed: {e}", config.merged_dir.display()),
    })?;

    tracing::info!(merged = %config.merged_dir.display(), "overlayfs mounted");
    Ok(())
}

/// Stub for non-Linux platforms.
///
/// # Errors
///
/// Always returns an error; `OverlayFS` mounting requires Linux.
#[cfg(not(target_os = "linux"))]
pub fn mount_overlay(_config: &OverlayConfig) -> Result<()> {
    Err(CorralError::Config {
        message: "Linux required for native container operations".into(),
    })
}

/// Unmounts an `OverlayFS` at the given path.
///
/// Uses `MNT_DETACH` to lazily detach the filesystem. A directory with
/// nothing mounted on it is left alone.
///
/// # Errors
///
/// Returns an error if the unmount syscall fails.
pub fn unmount_overlay(merged_dir: &Path) -> Result<()> {
    if super::mount::unmount(merged_dir)? {
        tracing::info!(path = %merged_dir.display(), "overlayfs unmounted");
    }
    Ok(())
}
