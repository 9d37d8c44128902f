//! The boot sequence of a jailed hypervisor and the placement strategy extending it.

mod pipeline;
mod placement;

//--------------------------------------------------------------------------------------------------
// Exports
//--------------------------------------------------------------------------------------------------

pub use pipeline::*;
pub use placement::*;
