//! # corral-runtime
//!
//! Container lifecycle for the corral engine.
//!
//! - [`process`]: clone-based spawning into fresh namespaces.
//! - [`workspace`]: overlay root filesystems and volume binds.
//! - [`launcher`]: workspace plus init process plus control pipe.
//! - [`init`]: the in-container side that execs the workload.
//! - [`state`] and [`logs`]: per-container records and output.
//! - [`engine`]: the orchestrator tying launch, cgroups and networking.

#![allow(unsafe_code)]
#![cfg_attr(test, allow(clippy::expect_used, clippy::unwrap_used))]

pub mod engine;
pub mod init;
pub mod launcher;
pub mod logs;
pub mod process;
pub mod state;
pub mod workspace;

pub use engine::{Engine, RunOptions, RunOutcome};
