//! Route definitions for the HTTP server.

use axum::{
    routing::{get, post},
    Router,
};

use super::{handlers, state::ServerState};

//-------------------------------------------------------------------------------------------------
// Functions
//-------------------------------------------------------------------------------------------------

/// Creates a new router with all API endpoints configured
///
/// ## Arguments
/// * `state` - The shared server state
pub fn create_router(state: ServerState) -> Router {
    Router::new()
        .route("/healthz", get(handlers::health_handler))
        .route("/create", post(handlers::create_handler))
        .route("/stop", post(handlers::stop_handler))
        .with_state(state)
}
