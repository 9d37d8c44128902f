//! HTTP API of the lifecycle engine.
//!
//! - `GET /healthz` answers `OK`
//! - `POST /create` launches an instance
//! - `POST /stop` stops one

mod handlers;
mod listener;
mod routes;
mod state;
mod types;

//--------------------------------------------------------------------------------------------------
// Exports
//--------------------------------------------------------------------------------------------------

pub use handlers::*;
pub use listener::*;
pub use routes::*;
pub use state::*;
pub use types::*;
