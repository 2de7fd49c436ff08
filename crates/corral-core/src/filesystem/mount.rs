//! Mount utilities for container filesystem setup.

use std::path::Path;

use corral_common::error::{CorralError, Result};

/// Mounts a fresh `proc` filesystem at `target`.
///
/// Run inside the new PID namespace so `/proc` shows the container's own
/// process tree.
///
/// # Errors
///
/// Returns an error if the directory cannot be created or the mount fails.
#[cfg(target_os = "linux")]
pub fn mount_proc(target: &Path) -> Result<()> {
    use nix::mount::{MsFlags, mount};

    std::fs::create_dir_all(target).map_err(|e| CorralError::io(target, e))?;
    mount(
        Some("proc"),
        target,
        Some("proc"),
        MsFlags::MS_NOEXEC | MsFlags::MS_NOSUID | MsFlags::MS_NODEV,
        None::<&str>,
    )
    .map_err(|e| CorralError::Namespace {
        message: format!("mounting proc at {} failed: {e}", target.display()),
    })?;
    tracing::debug!(target = %target.display(), "proc mounted");
    Ok(())
}

/// Stub for non-Linux platforms.
///
/// # Errors
///
/// Always returns an error; mounting requires Linux.
#[cfg(not(target_os = "linux"))]
pub fn mount_proc(_target: &Path) -> Result<()> {
    Err(CorralError::Config {
        message: "Linux required for native container operations".into(),
    })
}

/// Creates a bind mount from source to target, creating both directories.
///
/// # Errors
///
/// Returns an error if a directory cannot be created or `mount(2)` fails.
#[cfg(target_os = "linux")]
pub fn bind_mount(source: &Path, target: &Path) -> Result<()> {
    use nix::mount::{MsFlags, mount};

    for dir in [source, target] {
        std::fs::create_dir_all(dir).map_err(|e| CorralError::io(dir, e))?;
    }
    mount(
        Some(source),
        target,
        None::<&str>,
        MsFlags::MS_BIND | MsFlags::MS_REC,
        None::<&str>,
    )
    .map_err(|e| CorralError::Namespace {
        message: format!(
            "bind mount {} -> {} failed: {e}",
            source.display(),
            target.display()
        ),
    })?;
    tracing::debug!(
        source = %source.display(),
        target = %target.display(),
        "bind mount created"
    );
    Ok(())
}

/// Stub for non-Linux platforms.
///
/// # Errors
///
/// Always returns an error; mounting requires Linux.
#[cfg(not(target_os = "linux"))]
pub fn bind_mount(_source: &Path, _target: &Path) -> Result<()> {
    Err(CorralError::Config {
        message: "Linux required for native container operations".into(),
    })
}

/// Lazily detaches whatever is mounted at `target`.
///
/// Returns `false` when `target` does not exist or is not a mount point.
///
/// # Errors
///
/// Returns an error for any other `umount2(2)` failure; whatever is mounted
/// at `target` is then still in place.
#[cfg(target_os = "linux")]
pub fn unmount(target: &Path) -> Result<bool> {
    use nix::errno::Errno;

    match nix::mount::umount2(target, nix::mount::MntFlags::MNT_DETACH) {
        Ok(()) => {
            tracing::debug!(target = %target.display(), "unmounted");
            Ok(true)
        }
        Err(Errno::EINVAL | Errno::ENOENT) => Ok(false),
        Err(e) => Err(CorralError::Namespace {
            message: format!("unmount {} failed: {e}", target.display()),
        }),
    }
}

/// Stub for non-Linux platforms.
///
/// # Errors
///
/// Always returns an error; mounting requires Linux.
#[cfg(not(target_os = "linux"))]
pub fn unmount(_target: &Path) -> Result<bool> {
    Err(CorralError::Config {
        message: "Linux required for native container operations".into(),
    })
}

#[cfg(all(test, target_os = "linux"))]
mod tests {
    use super::*;

    #[test]
    fn missing_target_has_nothing_to_unmount() {
        let dir = tempfile::tempdir().unwrap();
        assert!(!unmount(&dir.path().join("absent")).unwrap());
    }

    #[test]
    fn unresolvable_target_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("file"), b"").unwrap();
        assert!(unmount(&dir.path().join("file").join("below")).is_err());
    }
}
