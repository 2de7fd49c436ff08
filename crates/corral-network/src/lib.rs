//! # corral-network
//!
//! Attaches containers to virtual networks.
//!
//! - [`ipam`]: persistent per-subnet address bitmaps.
//! - [`driver`]: the capability set every network driver implements.
//! - [`bridge`]: the Linux bridge driver (bridge device, veth pairs, NAT).
//! - [`registry`]: durable name-to-network records.
//! - [`manager`]: composes the above into create/delete/list/connect.

#![cfg_attr(test, allow(clippy::expect_used, clippy::unwrap_used))]

pub mod bridge;
pub mod driver;
pub mod ipam;
pub mod manager;
pub mod model;
pub mod registry;
pub mod runner;

pub use manager::NetworkManager;
pub use model::{Endpoint, Network, PortMapping};
