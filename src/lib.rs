//! wgmeshd - WireGuard mesh provisioning and reconciliation
//!
//! Designs WireGuard mesh topologies (address plan, keys, neighbor
//! adjacency, per-peer configs) and reconciles the resulting design with
//! the live kernel state of managed interfaces, behind a small REST API.
//!
//! # Subsystems
//!
//! - Mesh resolution and config synthesis ([`mesh`], [`ipam`], [`keys`])
//! - Lock-guarded persisted interface state ([`store`])
//! - Transactional runtime reconciliation ([`service`], [`runtime`])
//! - HTTP surface ([`daemon`])
//!
//! # Usage
//!
//! ```no_run
//! use std::sync::Arc;
//! use wgmeshd::daemon::{DaemonConfig, DaemonService};
//! use wgmeshd::runtime::WgCli;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = DaemonConfig::from_env();
//!     let daemon = DaemonService::new(&config, Arc::new(WgCli::default()));
//!     daemon.run_http(([127, 0, 0, 1], 8686).into()).await?;
//!     Ok(())
//! }
//! ```

pub mod daemon;
pub mod error;
pub mod ipam;
pub mod keys;
pub mod mesh;
pub mod runtime;
pub mod service;
pub mod store;

pub use daemon::{DaemonConfig, DaemonService};
pub use error::{Result, WgMeshError};
pub use mesh::MeshSpec;
pub use service::ProvisioningService;
pub use store::StateStore;
