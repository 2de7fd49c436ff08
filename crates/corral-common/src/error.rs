//! Unified error types for the corral workspace.
//!
//! Every crate returns [`CorralError`]; the variants follow the failure
//! classes of the engine (cgroup resources, namespaces, network
//! configuration, address exhaustion, missing objects) plus the ambient
//! I/O and serialization failures.

use std::path::PathBuf;

use thiserror::Error;

/// Top-level error type shared across the workspace.
#[derive(Debug, Error)]
pub enum CorralError {
    /// An I/O operation failed.
    #[error("I/O error at {path}: {source}")]
    Io {
        /// Path where the I/O error occurred.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },

    /// A cgroup subsystem directory or control file could not be created or written.
    #[error("cgroup resource error at {path}: {message}")]
    Resource {
        /// Cgroup path involved in the failure.
        path: PathBuf,
        /// Description of the failure.
        message: String,
    },

    /// Process creation inside new namespaces failed.
    #[error("namespace error: {message}")]
    Namespace {
        /// Description of the failure.
        message: String,
    },

    /// A network definition or device operation is invalid or failed.
    #[error("network configuration error: {message}")]
    NetworkConfig {
        /// Description of the failure.
        message: String,
    },

    /// No free address is left in a subnet.
    #[error("no free address left in subnet {subnet}")]
    AllocationExhausted {
        /// Subnet in CIDR notation.
        subnet: String,
    },

    /// A required resource was not found.
    #[error("{kind} not found: {id}")]
    NotFound {
        /// Type of the missing resource.
        kind: &'static str,
        /// Identifier of the missing resource.
        id: String,
    },

    /// A configuration value is invalid.
    #[error("invalid configuration: {message}")]
    Config {
        /// Description of the invalid configuration.
        message: String,
    },

    /// Serialization or deserialization failed.
    #[error("serialization error: {source}")]
    Serialization {
        /// Underlying serialization error.
        #[from]
        source: serde_json::Error,
    },
}

impl CorralError {
    /// Builds an [`CorralError::Io`] for the given path.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Builds a [`CorralError::NetworkConfig`] from any displayable message.
    pub fn network(message: impl Into<String>) -> Self {
        Self::NetworkConfig {
            message: message.into(),
        }
    }
}

/// Convenience alias used throughout the workspace.
pub type Result<T> = std::result::Result<T, CorralError>;
