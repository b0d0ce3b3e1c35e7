//! Allocation endpoint.
//!
//! `POST /api/v1/allocate` binds a standing-by instance of a build to a
//! game session and returns where players should connect.

use axum::{
    extract::{rejection::JsonRejection, State},
    routing::post,
    Json, Router,
};
use tracing::{info, warn};

use crate::allocation::{AllocateRequest, AllocateResponse};
use crate::api::error::ApiError;
use crate::api::request_context::RequestContext;
use crate::state::AppState;

pub fn routes() -> Router<AppState> {
    Router::new().route("/api/v1/allocate", post(allocate))
}

/// Allocate a standing-by instance to a session.
///
/// POST /api/v1/allocate
async fn allocate(
    State(state): State<AppState>,
    ctx: RequestContext,
    body: Result<Json<AllocateRequest>, JsonRejection>,
) -> Result<Json<AllocateResponse>, ApiError> {
    let Json(req) = body.map_err(|rejection| {
        ApiError::bad_request("invalid_request", rejection.body_text())
            .with_request_id(ctx.request_id.clone())
    })?;

    let args = req
        .validate()
        .map_err(|e| ApiError::from(e).with_request_id(ctx.request_id.clone()))?;

    match state
        .engine()
        .allocate_within(&args, state.allocation_timeout())
        .await
    {
        Ok(response) => {
            info!(
                request_id = %ctx.request_id,
                build_id = %args.build_id,
                session_id = %args.session_id,
                ip = %response.ipv4_address,
                "Allocation served"
            );
            Ok(Json(response))
        }
        Err(e) => {
            warn!(
                request_id = %ctx.request_id,
                build_id = %args.build_id,
                session_id = %args.session_id,
                error = %e,
                "Allocation refused"
            );
            Err(ApiError::from(e).with_request_id(ctx.request_id))
        }
    }
}
