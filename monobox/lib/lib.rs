//! `monobox` is a Kubernetes-native controller for warm pools of ephemeral execution sandboxes.
//!
//! # Overview
//!
//! monobox keeps short-lived, single-container execution environments ready before anyone asks
//! for them. It handles:
//! - Sandbox lifecycle management (provisioning, phase sync, TTL enforcement, cleanup)
//! - Warm pools that pre-provision sandboxes to hide cold-start latency
//! - Claiming a ready sandbox for a caller, optionally recording external storage
//! - Command execution, file transfer and log retrieval inside running sandboxes
//!
//! # Architecture
//!
//! monobox consists of several key components:
//!
//! - **Resource model**: `Sandbox`, `SandboxPool` and `SandboxTemplate` custom resources plus
//!   the backing-pod construction
//! - **Resource store**: trait-based access to the cluster control plane, with a production
//!   adapter and an in-memory double for tests and local development
//! - **Reconcilers**: timer-driven convergence loops for sandboxes and pools, nudged by watch
//!   events
//! - **Claim coordinator**: conflict-checked handout of warm pool members
//! - **Exec gateway**: command execution with structured argv, upload/download and logs
//!
//! State lives entirely in the cluster; every reconciliation reads fresh and writes with
//! version-checked patches, so any number of triggers can interleave safely.
//!
//! # Usage Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use monobox::{config::ControllerConfig, ops::SandboxOps, store::KubeStore};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = ControllerConfig::from_env();
//!     let store = Arc::new(KubeStore::try_default().await?);
//!     let ops = SandboxOps::new(store.clone(), store, config);
//!
//!     let claimed = ops.claim("default", "py-pool", None).await?;
//!     let result = ops.execute("default", &claimed.name, "python -V", None).await?;
//!     println!("{}", result.stdout);
//!
//!     Ok(())
//! }
//! ```
//!
//! # Modules
//!
//! - [`claim`] - Warm-sandbox claim protocol
//! - [`cli`] - Command-line interface and argument parsing
//! - [`config`] - Controller configuration and defaults
//! - [`exec`] - Command execution, file transfer and log retrieval
//! - [`ops`] - Named consumer operations with serializable arguments and results
//! - [`reconcile`] - Timer- and watch-driven reconcilers
//! - [`resource`] - Custom resource types and backing-pod construction
//! - [`store`] - Resource store trait and its adapters
//! - [`utils`] - Common utilities and helpers

#![warn(missing_docs)]

mod error;

//--------------------------------------------------------------------------------------------------
// Exports
//--------------------------------------------------------------------------------------------------

pub mod claim;
pub mod cli;
pub mod config;
pub mod exec;
pub mod ops;
pub mod reconcile;
pub mod resource;
pub mod store;
pub mod utils;

pub use error::*;
