//! Client for the hypervisor control API spoken over each instance's unix socket.

mod client;
mod models;

#[cfg(test)]
pub(crate) mod mock;

//--------------------------------------------------------------------------------------------------
// Exports
//--------------------------------------------------------------------------------------------------

pub use client::*;
pub use models::*;
