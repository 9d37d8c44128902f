//! Bookkeeping of the instances launched by this host.

mod manager;

#[cfg(test)]
pub(crate) use manager::tests as fixtures;

//--------------------------------------------------------------------------------------------------
// Exports
//--------------------------------------------------------------------------------------------------

pub use manager::*;
