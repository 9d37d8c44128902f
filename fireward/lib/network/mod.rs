//! Network attachment of instances through CNI plugins and named network namespaces.

mod attachment;
mod cni;
mod netns;

//--------------------------------------------------------------------------------------------------
// Exports
//--------------------------------------------------------------------------------------------------

pub use attachment::*;
pub use cni::*;
pub use netns::*;
