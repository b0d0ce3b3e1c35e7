//! Build API endpoints.
//!
//! Builds are addressed as `/v1/builds/{namespace}/{name}`. Writes go
//! through the store's admission checks; an invalid spec is rejected, never
//! clamped.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, patch},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::api::error::ApiError;
use crate::api::request_context::RequestContext;
use crate::model::{Build, BuildSpec, ObjectKey};
use crate::state::AppState;

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/", get(list_builds).post(create_build))
        .route("/{namespace}/{name}", get(get_build).delete(delete_build))
        .route("/{namespace}/{name}/scale", patch(scale_build))
}

// =============================================================================
// Request/Response Types
// =============================================================================

fn default_namespace() -> String {
    "default".to_string()
}

#[derive(Debug, Deserialize, Serialize)]
pub struct CreateBuildRequest {
    #[serde(default = "default_namespace")]
    pub namespace: String,
    pub name: String,
    pub spec: BuildSpec,
}

/// Change the scaling targets of a build. Omitted fields keep their value.
#[derive(Debug, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ScaleBuildRequest {
    #[serde(default)]
    pub standing_by: Option<usize>,
    #[serde(default)]
    pub max: Option<usize>,
    /// Reject the change if the build moved past this version.
    #[serde(default)]
    pub resource_version: Option<u64>,
}

#[derive(Debug, Serialize)]
pub struct ListBuildsResponse {
    pub items: Vec<Build>,
}

// =============================================================================
// Handlers
// =============================================================================

/// GET /v1/builds
async fn list_builds(
    State(state): State<AppState>,
    ctx: RequestContext,
) -> Result<Json<ListBuildsResponse>, ApiError> {
    let items = state
        .store()
        .list_builds()
        .await
        .map_err(|e| ApiError::from(e).with_request_id(ctx.request_id))?;
    Ok(Json(ListBuildsResponse { items }))
}

/// POST /v1/builds
async fn create_build(
    State(state): State<AppState>,
    ctx: RequestContext,
    Json(req): Json<CreateBuildRequest>,
) -> Result<Response, ApiError> {
    if req.name.trim().is_empty() {
        return Err(ApiError::bad_request("invalid_name", "Build name cannot be empty")
            .with_request_id(ctx.request_id));
    }

    let build = state
        .store()
        .create_build(Build::new(req.namespace, req.name, req.spec))
        .await
        .map_err(|e| ApiError::from(e).with_request_id(ctx.request_id.clone()))?;

    info!(
        request_id = %ctx.request_id,
        build = %build.key(),
        build_id = %build.spec.build_id,
        standing_by = build.spec.standing_by,
        max = build.spec.max,
        "Build created"
    );
    Ok((StatusCode::CREATED, Json(build)).into_response())
}

/// GET /v1/builds/{namespace}/{name}
async fn get_build(
    State(state): State<AppState>,
    ctx: RequestContext,
    Path((namespace, name)): Path<(String, String)>,
) -> Result<Json<Build>, ApiError> {
    let build = state
        .store()
        .get_build(&ObjectKey::new(namespace, name))
        .await
        .map_err(|e| ApiError::from(e).with_request_id(ctx.request_id))?;
    Ok(Json(build))
}

/// PATCH /v1/builds/{namespace}/{name}/scale
async fn scale_build(
    State(state): State<AppState>,
    ctx: RequestContext,
    Path((namespace, name)): Path<(String, String)>,
    Json(req): Json<ScaleBuildRequest>,
) -> Result<Json<Build>, ApiError> {
    let key = ObjectKey::new(namespace, name);
    let current = state
        .store()
        .get_build(&key)
        .await
        .map_err(|e| ApiError::from(e).with_request_id(ctx.request_id.clone()))?;

    let mut spec = current.spec;
    if let Some(standing_by) = req.standing_by {
        spec.standing_by = standing_by;
    }
    if let Some(max) = req.max {
        spec.max = max;
    }

    let build = state
        .store()
        .update_build_spec(&key, spec, req.resource_version)
        .await
        .map_err(|e| ApiError::from(e).with_request_id(ctx.request_id.clone()))?;

    info!(
        request_id = %ctx.request_id,
        build = %key,
        standing_by = build.spec.standing_by,
        max = build.spec.max,
        "Build scaled"
    );
    Ok(Json(build))
}

/// DELETE /v1/builds/{namespace}/{name}
///
/// Instances of the build are deleted along with it.
async fn delete_build(
    State(state): State<AppState>,
    ctx: RequestContext,
    Path((namespace, name)): Path<(String, String)>,
) -> Result<StatusCode, ApiError> {
    let key = ObjectKey::new(namespace, name);
    state
        .store()
        .delete_build(&key)
        .await
        .map_err(|e| ApiError::from(e).with_request_id(ctx.request_id.clone()))?;
    info!(request_id = %ctx.request_id, build = %key, "Build deleted");
    Ok(StatusCode::NO_CONTENT)
}
