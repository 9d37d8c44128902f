//! Translation of a machine configuration into a complete launch specification.
//!
//! [`LaunchSpec::build`] parses drives and vsock devices, generates the network interface name,
//! decides the log and metrics pipes and maps the sandbox descriptor onto jailer arguments.
//! Temporary files created on the way are owned by the spec's [`ScopedResources`].

mod builder;
mod drive;
mod fifo;
mod resources;
mod spec;
mod vsock;

//--------------------------------------------------------------------------------------------------
// Exports
//--------------------------------------------------------------------------------------------------

pub use builder::*;
pub use drive::*;
pub use fifo::*;
pub use resources::*;
pub use spec::*;
pub use vsock::*;
