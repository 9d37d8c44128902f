//! `fireward` provisions and tears down jailed Firecracker microVMs on a single host.
//!
//! # Overview
//!
//! A create request is turned into a validated machine specification, then into a launch
//! specification: jailer arguments, drives, vsock devices, network interfaces and log pipes. The
//! launch runs an ordered pipeline of named steps, which callers extend by anchoring extra steps
//! before existing ones. Once booted, an instance is stopped by racing a graceful power-off
//! against a deadline, and its network attachment and chroot are always cleaned up.
//!
//! # Usage Example
//!
//! ```rust,no_run
//! use fireward::{config::FirewardConfig, management::VmmManager, server::CreateVmRequest};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let manager = VmmManager::new(FirewardConfig::load(None)?)?;
//!
//!     let created = manager
//!         .create(CreateVmRequest {
//!             kernel_path: "/var/lib/fireward/vmlinux".into(),
//!             root_drive_path: "/var/lib/fireward/rootfs.ext4".into(),
//!             cni_network_name: "fcnet".into(),
//!             vcpu_count: 2,
//!             mem_size_mib: 512,
//!             ..Default::default()
//!         })
//!         .await?;
//!
//!     println!("{} is running with pid {}", created.id, created.pid);
//!     Ok(())
//! }
//! ```
//!
//! # Modules
//!
//! - [`api`] - Client for the hypervisor control socket
//! - [`cli`] - Command-line interface and argument parsing
//! - [`config`] - Configuration types and validation
//! - [`handlers`] - The boot pipeline and its placement strategy
//! - [`launch`] - Translation of a machine into a launch specification
//! - [`management`] - Bookkeeping of launched instances
//! - [`network`] - CNI attachment and network namespaces
//! - [`runtime`] - Process supervision, graceful stop and detached stop
//! - [`server`] - REST API server implementation
//!
//! # Platform Support
//!
//! - Linux on `x86_64` and `aarch64`

#![warn(missing_docs)]

mod error;
mod log;

//--------------------------------------------------------------------------------------------------
// Exports
//--------------------------------------------------------------------------------------------------

pub mod api;
pub mod cli;
pub mod config;
pub mod handlers;
pub mod launch;
pub mod management;
pub mod network;
pub mod runtime;
pub mod server;

pub use error::*;
pub use log::*;
