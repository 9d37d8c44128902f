//! Configuration types and helpers.

mod cni;
mod defaults;
mod fireward;
mod machine;
mod sandbox;

//--------------------------------------------------------------------------------------------------
// Exports
//--------------------------------------------------------------------------------------------------

pub use cni::*;
pub use defaults::*;
pub use fireward::*;
pub use machine::*;
pub use sandbox::*;
