//! Supervision of jailed hypervisors.
//!
//! [`LaunchBackend::start`] runs the resolved boot pipeline and hands back a [`RunningInstance`],
//! whose [`stop`](RunningInstance::stop) races a graceful shutdown against a deadline.
//! [`stop_vmm`] stops an instance known only by id and pid, through its control socket.

mod arch;
mod instance;
mod machine;
mod process;
mod provider;
mod stop;

#[cfg(test)]
pub(crate) mod fakes;

//--------------------------------------------------------------------------------------------------
// Exports
//--------------------------------------------------------------------------------------------------

pub use arch::*;
pub use instance::*;
pub use process::*;
pub use provider::*;
pub use stop::*;
