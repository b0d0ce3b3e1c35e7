//! Instance API endpoints.
//!
//! Besides read access this carries the two writes that come from outside
//! the operator: heartbeats reported by the game process, and the
//! unhealthy mark set when heartbeats stop.

use axum::{
    extract::{Path, Query, State},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::api::error::ApiError;
use crate::api::request_context::RequestContext;
use crate::heartbeat::{self, Heartbeat, HeartbeatResponse};
use crate::model::{Instance, ObjectKey};
use crate::state::AppState;

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/", get(list_instances))
        .route("/{namespace}/{name}", get(get_instance))
        .route("/{namespace}/{name}/heartbeat", post(report_heartbeat))
        .route("/{namespace}/{name}/unhealthy", post(mark_unhealthy))
}

/// Query parameters for listing instances.
#[derive(Debug, Deserialize)]
pub struct ListInstancesQuery {
    /// Only instances owned by this build.
    pub build: Option<String>,
    /// Namespace of `build`.
    #[serde(default = "default_namespace")]
    pub namespace: String,
}

fn default_namespace() -> String {
    "default".to_string()
}

#[derive(Debug, Serialize)]
pub struct ListInstancesResponse {
    pub items: Vec<Instance>,
}

/// GET /v1/instances
async fn list_instances(
    State(state): State<AppState>,
    ctx: RequestContext,
    Query(query): Query<ListInstancesQuery>,
) -> Result<Json<ListInstancesResponse>, ApiError> {
    let result = match query.build {
        Some(build) => {
            state
                .store()
                .list_instances_for_build(&ObjectKey::new(query.namespace, build))
                .await
        }
        None => state.store().list_instances().await,
    };
    let items = result.map_err(|e| ApiError::from(e).with_request_id(ctx.request_id))?;
    Ok(Json(ListInstancesResponse { items }))
}

/// GET /v1/instances/{namespace}/{name}
async fn get_instance(
    State(state): State<AppState>,
    ctx: RequestContext,
    Path((namespace, name)): Path<(String, String)>,
) -> Result<Json<Instance>, ApiError> {
    let instance = state
        .store()
        .get_instance(&ObjectKey::new(namespace, name))
        .await
        .map_err(|e| ApiError::from(e).with_request_id(ctx.request_id))?;
    Ok(Json(instance))
}

/// POST /v1/instances/{namespace}/{name}/heartbeat
async fn report_heartbeat(
    State(state): State<AppState>,
    ctx: RequestContext,
    Path((namespace, name)): Path<(String, String)>,
    Json(report): Json<Heartbeat>,
) -> Result<Json<HeartbeatResponse>, ApiError> {
    let key = ObjectKey::new(namespace, name);
    let response = heartbeat::apply_heartbeat(state.store(), &key, &report)
        .await
        .map_err(|e| ApiError::from(e).with_request_id(ctx.request_id))?;
    Ok(Json(response))
}

/// POST /v1/instances/{namespace}/{name}/unhealthy
async fn mark_unhealthy(
    State(state): State<AppState>,
    ctx: RequestContext,
    Path((namespace, name)): Path<(String, String)>,
) -> Result<Json<Instance>, ApiError> {
    let key = ObjectKey::new(namespace, name);
    let instance = heartbeat::mark_unhealthy(state.store(), &key)
        .await
        .map_err(|e| ApiError::from(e).with_request_id(ctx.request_id.clone()))?;
    info!(request_id = %ctx.request_id, instance = %key, "Instance marked unhealthy");
    Ok(Json(instance))
}
