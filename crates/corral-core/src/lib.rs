//! # corral-core
//!
//! Low-level Linux isolation primitives for the corral engine.
//!
//! This crate provides safe abstractions over:
//! - **Namespaces**: the clone flag set for PID, mount, network, IPC and UTS
//!   isolation, plus in-namespace helpers.
//! - **Cgroups**: per-container memory, CPU share and cpuset limits on v1
//!   and v2 hierarchies.
//! - **Filesystem**: `OverlayFS` root filesystems, bind mounts and `pivot_root`.
//!
//! Every syscall failure is mapped onto the workspace error type.

#![cfg_attr(test, allow(clippy::expect_used, clippy::unwrap_used))]

pub mod cgroup;
pub mod filesystem;
pub mod namespace;
