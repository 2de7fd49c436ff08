//! Root filesystem switching via `pivot_root(2)`.
//!
//! More thorough than `chroot` because it changes the root mount of the
//! namespace rather than just the process's view of `/`.

use std::path::Path;

use corral_common::error::{CorralError, Result};

/// Name of the directory the old root is parked under during the switch.
const OLD_ROOT: &str = ".pivot_root";

/// Makes `new_root` the root of the current mount namespace.
///
/// `new_root` is bind-mounted onto itself (`pivot_root` requires a mount
/// point), the old root is moved under it, the working directory is reset
/// to `/`, and the old root is detached and removed.
///
/// # Errors
///
/// Returns an error if any mount, `pivot_root(2)`, or cleanup step fails.
#[cfg(target_os = "linux")]
pub fn pivot_root(new_root: &Path) -> Result<()> {
    use nix::mount::{MntFlags, MsFlags, mount, umount2};

    let fail = |step: &str, e: nix::Error| CorralError::Namespace {
        message: format!("pivot_root into {}: {step} failed: {e}", new_root.display()),
    };

    mount(
        Some(new_root),
        new_root,
        None::<&str>,
        MsFlags::MS_BIND | MsFlags::MS_REC,
        None::<&str>,
    )
    .map_err(|e| fail("self bind mount", e))?;

    let put_old = new_root.join(OLD_ROOT);
    std::fs::create_dir_all(&put_old).map_err(|e| CorralError::io(&put_old, e))?;

    nix::unistd::pivot_root(new_root, &put_old).map_err(|e| fail("pivot_root", e))?;
    nix::unistd::chdir("/").map_err(|e| fail("chdir", e))?;

    let old = Path::new("/").join(OLD_ROOT);
    umount2(&old, MntFlags::MNT_DETACH).map_err(|e| fail("detach old root", e))?;
    std::fs::remove_dir(&old).map_err(|e| CorralError::io(&old, e))?;

    tracing::info!(new_root = %new_root.display(), "root filesystem switched");
    Ok(())
}

/// Stub for non-Linux platforms.
///
/// # Errors
///
/// Always returns an error; `pivot_root` requires Linux.
#[cfg(not(target_os = "linux"))]
pub fn pivot_root(_new_root: &Path) -> Result<()> {
    Err(CorralError::Config {
        message: "Linux required for native container operations".into(),
    })
}
