//! Container log files.
//!
//! Detached containers write stdout and stderr to one file per container.

use std::path::{Path, PathBuf};

use corral_common::error::{CorralError, Result};

/// Returns the log file path for a container.
#[must_use]
pub fn log_path(log_dir: &Path, container_id: &str) -> PathBuf {
    log_dir.join(format!("{container_id}.log"))
}

/// Reads container logs from disk.
///
/// Returns an empty string if the log file does not exist yet, which is
/// the case for interactive containers.
///
/// # Errors
///
/// Returns an error if the file exists but cannot be read.
pub fn read_logs(log_dir: &Path, container_id: &str) -> Result<String> {
    let path = log_path(log_dir, container_id);
    match std::fs::read(&path) {
        Ok(bytes) => Ok(String::from_utf8_lossy(&bytes).into_owned()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(String::new()),
        Err(e) => Err(CorralError::io(path, e)),
    }
}
