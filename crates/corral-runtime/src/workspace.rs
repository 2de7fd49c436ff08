//! Container root filesystem preparation.
//!
//! An image is either a directory `<image_dir>/<image>` or an archive
//! `<image_dir>/<image>.tar`, unpacked once into `<layer_dir>/images/<image>`.
//! Each container mounts the image read-only under its own writable layer
//! and may bind one host directory into the result.

use std::fmt;
use std::path::{Component, Path, PathBuf};
use std::str::FromStr;

use corral_common::config::CorralConfig;
use corral_common::error::{CorralError, Result};
use corral_core::filesystem::mount::{bind_mount, unmount};
use corral_core::filesystem::overlayfs::{OverlayConfig, mount_overlay, unmount_overlay};
use serde::{Deserialize, Serialize};

/// A host directory bound into the container, written `HOST:CONTAINER`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Volume {
    /// Absolute host path.
    pub host: PathBuf,
    /// Absolute path inside the container.
    pub container: PathBuf,
}

impl Volume {
    /// Returns the mount target below a container root.
    #[must_use]
    pub fn target_in(&self, root: &Path) -> PathBuf {
        let relative: PathBuf = self
            .container
            .components()
            .filter(|c| matches!(c, Component::Normal(_)))
            .collect();
        root.join(relative)
    }
}

impl FromStr for Volume {
    type Err = CorralError;

    fn from_str(s: &str) -> Result<Self> {
        let invalid = |why: &str| CorralError::Config {
            message: format!("invalid volume {s:?}: {why}"),
        };
        let (host, container) = s
            .split_once(':')
            .ok_or_else(|| invalid("expected HOST:CONTAINER"))?;
        let host = PathBuf::from(host.trim());
        let container = PathBuf::from(container.trim());
        if !host.is_absolute() || !container.is_absolute() {
            return Err(invalid("both paths must be absolute"));
        }
        if container.components().any(|c| c == Component::ParentDir) {
            return Err(invalid("container path must not contain '..'"));
        }
        Ok(Self { host, container })
    }
}

impl fmt::Display for Volume {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host.display(), self.container.display())
    }
}

/// Produces and destroys container root directories.
pub trait WorkspaceProvider: Send + Sync {
    /// Builds the root filesystem of container `id` from `image`.
    ///
    /// # Errors
    ///
    /// Returns an error if the image is unknown or a mount fails; nothing
    /// is left mounted in that case.
    fn prepare(&self, image: &str, id: &str, volume: Option<&Volume>) -> Result<PathBuf>;

    /// Undoes [`WorkspaceProvider::prepare`]. Succeeds if already gone.
    ///
    /// # Errors
    ///
    /// Returns an error if a mount or directory cannot be removed.
    fn teardown(&self, id: &str, volume: Option<&Volume>) -> Result<()>;
}

/// Overlay-mounted workspaces under the engine's data directory.
#[derive(Debug, Clone)]
pub struct OverlayWorkspace {
    image_dir: PathBuf,
    layer_dir: PathBuf,
    mnt_dir: PathBuf,
}

impl OverlayWorkspace {
    /// Creates a provider using the directories of `config`.
    #[must_use]
    pub fn new(config: &CorralConfig) -> Self {
        Self {
            image_dir: config.image_dir.clone(),
            layer_dir: config.layer_dir.clone(),
            mnt_dir: config.mnt_dir.clone(),
        }
    }

    /// Returns the read-only layer of `image`, unpacking its archive on
    /// first use.
    ///
    /// # Errors
    ///
    /// Returns [`CorralError::NotFound`] if neither an image directory nor
    /// an archive exists, or an I/O error if unpacking fails.
    pub fn image_layer(&self, image: &str) -> Result<PathBuf> {
        validate_image_name(image)?;

        let dir = self.image_dir.join(image);
        if dir.is_dir() {
            return Ok(dir);
        }

        let unpacked = self.layer_dir.join("images").join(image);
        if unpacked.is_dir() {
            return Ok(unpacked);
        }

        let archive = self.image_dir.join(format!("{image}.tar"));
        if !archive.is_file() {
            return Err(CorralError::NotFound {
                kind: "image",
                id: image.to_string(),
            });
        }
        unpack_archive(&archive, &unpacked)?;
        Ok(unpacked)
    }

    fn container_layers(&self, id: &str) -> PathBuf {
        self.layer_dir.join(id)
    }
}

impl WorkspaceProvider for OverlayWorkspace {
    fn prepare(&self, image: &str, id: &str, volume: Option<&Volume>) -> Result<PathBuf> {
        let lower = self.image_layer(image)?;
        let overlay = OverlayConfig::for_container(&lower, &self.layer_dir, &self.mnt_dir, id);
        if let Err(e) = mount_overlay(&overlay) {
            remove_dir_quietly(&self.container_layers(id));
            remove_dir_quietly(&overlay.merged_dir);
            return Err(e);
        }

        if let Some(volume) = volume {
            if let Err(e) = bind_volume(&overlay.merged_dir, volume) {
                if let Err(cleanup) = self.teardown(id, None) {
                    tracing::warn!(id, error = %cleanup, "failed to tear down workspace");
                }
                return Err(e);
            }
        }

        tracing::info!(id, image, root = %overlay.merged_dir.display(), "workspace ready");
        Ok(overlay.merged_dir)
    }

    fn teardown(&self, id: &str, volume: Option<&Volume>) -> Result<()> {
        let merged = self.mnt_dir.join(id);
        // Nothing below `merged` may still be mounted when it is removed.
        if let Some(volume) = volume {
            let _ = unmount(&volume.target_in(&merged))?;
        }
        if merged.exists() {
            unmount_overlay(&merged)?;
            std::fs::remove_dir_all(&merged).map_err(|e| CorralError::io(&merged, e))?;
        }

        let layers = self.container_layers(id);
        if layers.exists() {
            std::fs::remove_dir_all(&layers).map_err(|e| CorralError::io(&layers, e))?;
        }
        tracing::info!(id, "workspace removed");
        Ok(())
    }
}

fn bind_volume(root: &Path, volume: &Volume) -> Result<()> {
    std::fs::create_dir_all(&volume.host).map_err(|e| CorralError::io(&volume.host, e))?;
    let target = volume.target_in(root);
    std::fs::create_dir_all(&target).map_err(|e| CorralError::io(&target, e))?;
    bind_mount(&volume.host, &target)?;
    tracing::debug!(volume = %volume, "volume bound");
    Ok(())
}

/// Unpacks `archive` into `target` through a sibling staging directory so a
/// failed unpack never leaves a half-filled layer behind.
fn unpack_archive(archive: &Path, target: &Path) -> Result<()> {
    tracing::info!(
        archive = %archive.display(),
        target = %target.display(),
        "unpacking image"
    );
    let staging = target.with_extension("unpacking");
    if staging.exists() {
        std::fs::remove_dir_all(&staging).map_err(|e| CorralError::io(&staging, e))?;
    }
    std::fs::create_dir_all(&staging).map_err(|e| CorralError::io(&staging, e))?;

    let file = std::fs::File::open(archive).map_err(|e| CorralError::io(archive, e))?;
    let mut tar = tar::Archive::new(file);
    tar.set_preserve_permissions(true);
    if let Err(e) = tar.unpack(&staging) {
        remove_dir_quietly(&staging);
        return Err(CorralError::io(archive, e));
    }
    std::fs::rename(&staging, target).map_err(|e| CorralError::io(target, e))
}

fn validate_image_name(image: &str) -> Result<()> {
    let ok = !image.is_empty()
        && !image.starts_with('.')
        && image
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
    if ok {
        Ok(())
    } else {
        Err(CorralError::Config {
            message: format!("invalid image name {image:?}"),
        })
    }
}

fn remove_dir_quietly(dir: &Path) {
    if dir.exists() {
        if let Err(e) = std::fs::remove_dir_all(dir) {
            tracing::warn!(path = %dir.display(), error = %e, "failed to remove directory");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn workspace() -> (tempfile::TempDir, OverlayWorkspace) {
        let dir = tempfile::tempdir().unwrap();
        let ws = OverlayWorkspace::new(&CorralConfig::from_data_dir(dir.path()));
        (dir, ws)
    }

    fn write_tar(path: &Path, entries: &[(&str, &[u8])]) {
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        let file = std::fs::File::create(path).unwrap();
        let mut builder = tar::Builder::new(file);
        for (name, data) in entries {
            let mut header = tar::Header::new_gnu();
            header.set_size(data.len() as u64);
            header.set_mode(0o755);
            header.set_cksum();
            builder.append_data(&mut header, name, *data).unwrap();
        }
        builder.finish().unwrap();
    }

    #[test]
    fn volume_parses_host_and_container() {
        let v: Volume = "/srv/data:/data".parse().unwrap();
        assert_eq!(v.host, Path::new("/srv/data"));
        assert_eq!(v.container, Path::new("/data"));
        assert_eq!(v.to_string(), "/srv/data:/data");
        assert_eq!(v.target_in(Path::new("/mnt/c1")), Path::new("/mnt/c1/data"));
    }

    #[test]
    fn volume_rejects_relative_and_escaping_paths() {
        assert!("data:/data".parse::<Volume>().is_err());
        assert!("/srv/data".parse::<Volume>().is_err());
        assert!("/srv:/../etc".parse::<Volume>().is_err());
    }

    #[test]
    fn image_directory_is_used_as_is() {
        let (_dir, ws) = workspace();
        let image = ws.image_dir.join("busybox");
        std::fs::create_dir_all(&image).unwrap();
        assert_eq!(ws.image_layer("busybox").unwrap(), image);
    }

    #[test]
    fn image_archive_is_unpacked_once() {
        let (_dir, ws) = workspace();
        write_tar(
            &ws.image_dir.join("busybox.tar"),
            &[("bin/sh", b"#!fake"), ("etc/hostname", b"box\n")],
        );

        let layer = ws.image_layer("busybox").unwrap();
        assert_eq!(layer, ws.layer_dir.join("images").join("busybox"));
        assert_eq!(std::fs::read(layer.join("bin/sh")).unwrap(), b"#!fake");

        // Second resolution reuses the unpacked layer even without the archive.
        std::fs::remove_file(ws.image_dir.join("busybox.tar")).unwrap();
        assert_eq!(ws.image_layer("busybox").unwrap(), layer);
    }

    #[test]
    fn unknown_image_is_not_found() {
        let (_dir, ws) = workspace();
        assert!(matches!(
            ws.image_layer("ghost"),
            Err(CorralError::NotFound { kind: "image", .. })
        ));
        assert!(ws.image_layer("../etc").is_err());
    }

    #[test]
    fn teardown_of_unknown_container_is_ok() {
        let (_dir, ws) = workspace();
        ws.teardown("0123456789ab", None).unwrap();
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn failed_volume_unmount_keeps_container_root() {
        let (_dir, ws) = workspace();
        let merged = ws.mnt_dir.join("0123456789ab");
        std::fs::create_dir_all(&merged).unwrap();
        // A regular file on the target path makes umount2 fail with ENOTDIR.
        std::fs::write(merged.join("data"), b"keep").unwrap();
        let volume: Volume = "/srv/data:/data/sub".parse().unwrap();

        assert!(ws.teardown("0123456789ab", Some(&volume)).is_err());
        assert_eq!(std::fs::read(merged.join("data")).unwrap(), b"keep");
    }

    #[test]
    fn teardown_removes_writable_layer() {
        let (_dir, ws) = workspace();
        let upper = ws.layer_dir.join("0123456789ab").join("upper");
        std::fs::create_dir_all(&upper).unwrap();
        ws.teardown("0123456789ab", None).unwrap();
        assert!(!ws.layer_dir.join("0123456789ab").exists());
    }
}
