//! HTTP request handlers for the REST API.
//!
//! Each handler decodes its body, hands it to the [`VmmManager`](crate::management::VmmManager)
//! and maps the outcome onto a status code. Errors the caller can fix are `422`, everything else
//! is `500`.

use axum::{
    extract::{rejection::JsonRejection, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};

use super::{
    state::ServerState,
    types::{CreateVmRequest, CreateVmResponse, ErrorResponse, StopVmRequest},
};
use crate::{FirewardError, FirewardResult};

//-------------------------------------------------------------------------------------------------
// Functions: Handlers
//-------------------------------------------------------------------------------------------------

/// Handler for the GET /healthz endpoint
pub async fn health_handler() -> impl IntoResponse {
    (StatusCode::OK, "OK\n")
}

/// Handler for the POST /create endpoint
///
/// Launches an instance and answers with its id, pid and guest address
pub async fn create_handler(
    State(state): State<ServerState>,
    payload: Result<Json<CreateVmRequest>, JsonRejection>,
) -> impl IntoResponse {
    let req = match payload {
        Ok(Json(req)) => req,
        Err(rejection) => return unprocessable(rejection.body_text()),
    };

    match handle_create(state, req).await {
        Ok(response) => (StatusCode::CREATED, Json(response)).into_response(),
        Err(e) if e.is_client_error() => unprocessable(e.to_string()),
        Err(e) => {
            tracing::error!("failed to create vm: {}", e);
            internal_error(format!("An error occurs when starting the vm: {e}"))
        }
    }
}

/// Handler for the POST /stop endpoint
///
/// Stops an instance and answers with a plain text description of what happened
pub async fn stop_handler(
    State(state): State<ServerState>,
    payload: Result<Json<StopVmRequest>, JsonRejection>,
) -> impl IntoResponse {
    let req = match payload {
        Ok(Json(req)) => req,
        Err(rejection) => return unprocessable(rejection.body_text()),
    };

    if let Some(missing) = req.missing_fields() {
        return unprocessable(missing);
    }

    match handle_stop(state, req).await {
        Ok(result) => (StatusCode::CREATED, format!("{result}\n")).into_response(),
        Err(e) if e.is_client_error() => unprocessable(e.to_string()),
        Err(e) => {
            tracing::error!("failed to stop vm: {}", e);
            internal_error(format!(
                "An error occurred while stopping Firecracker VMM: {e}"
            ))
        }
    }
}

//-------------------------------------------------------------------------------------------------
// Functions: Helpers
//-------------------------------------------------------------------------------------------------

async fn handle_create(state: ServerState, req: CreateVmRequest) -> FirewardResult<CreateVmResponse> {
    let created = state.manager().create(req).await?;
    Ok(CreateVmResponse {
        ip: created.ip.unwrap_or_default(),
        pid: created.pid,
        vm_id: created.id,
    })
}

async fn handle_stop(state: ServerState, req: StopVmRequest) -> FirewardResult<String> {
    if req.vmm_id.trim().is_empty() {
        return Err(FirewardError::Validation("vmmId cannot be blank".into()));
    }

    state.manager().stop(req).await
}

fn unprocessable(error: impl Into<String>) -> Response {
    (
        StatusCode::UNPROCESSABLE_ENTITY,
        Json(ErrorResponse::new(error)),
    )
        .into_response()
}

fn internal_error(error: impl Into<String>) -> Response {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(ErrorResponse::new(error)),
    )
        .into_response()
}

//-------------------------------------------------------------------------------------------------
// Tests
//-------------------------------------------------------------------------------------------------
