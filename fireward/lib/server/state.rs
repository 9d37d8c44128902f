//! Server state management.
//!
//! [`ServerState`] hands the instance manager to every request handler.

use std::sync::Arc;

use crate::management::VmmManager;

//-------------------------------------------------------------------------------------------------
// Types
//-------------------------------------------------------------------------------------------------

/// Shared server state containing the instance manager
#[derive(Clone)]
pub struct ServerState {
    /// The shared manager
    manager: Arc<VmmManager>,
}

//-------------------------------------------------------------------------------------------------
// Methods
//-------------------------------------------------------------------------------------------------

impl ServerState {
    /// Creates a new ServerState around `manager`
    pub fn new(manager: VmmManager) -> Self {
        Self {
            manager: Arc::new(manager),
        }
    }

    /// Gets a reference to the manager
    pub fn manager(&self) -> &Arc<VmmManager> {
        &self.manager
    }
}
