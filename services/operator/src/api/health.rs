//! Health check endpoints.
//!
//! Polled by the orchestrator to decide whether the operator is up
//! and able to serve allocations.

use axum::{extract::State, http::StatusCode, response::IntoResponse, routing::get, Json, Router};
use chrono::Utc;
use serde::Serialize;

use crate::state::AppState;

const SERVICE_NAME: &str = "fleet-operator";

/// Health check response.
#[derive(Debug, Serialize)]
#[cfg_attr(test, derive(serde::Deserialize))]
pub struct HealthResponse {
    /// Service status: "ok" or "degraded".
    pub status: String,

    pub service: String,

    pub version: String,

    /// Current timestamp (RFC 3339).
    pub timestamp: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub components: Option<ComponentHealth>,
}

/// Component health details.
#[derive(Debug, Serialize)]
#[cfg_attr(test, derive(serde::Deserialize))]
pub struct ComponentHealth {
    /// Object store reachability.
    pub store: ComponentStatus,

    /// Host port capacity. Degraded while no node can take instances.
    pub ports: ComponentStatus,
}

/// Individual component status.
#[derive(Debug, Serialize)]
#[cfg_attr(test, derive(serde::Deserialize))]
pub struct ComponentStatus {
    /// Status: "ok", "degraded", or "unavailable".
    pub status: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/livez", get(livez))
}

fn response(status: &str, components: Option<ComponentHealth>) -> HealthResponse {
    HealthResponse {
        status: status.to_string(),
        service: SERVICE_NAME.to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        timestamp: Utc::now().to_rfc3339(),
        components,
    }
}

/// Is the process serving requests? Does not check dependencies.
async fn healthz() -> impl IntoResponse {
    Json(response("ok", None))
}

/// Can the operator serve allocations? Returns 503 when the store is
/// unreachable. Missing port capacity is reported but does not fail the
/// check.
async fn readyz(State(state): State<AppState>) -> impl IntoResponse {
    let store = match state.store().list_nodes().await {
        Ok(_) => ComponentStatus {
            status: "ok".to_string(),
            message: None,
        },
        Err(e) => ComponentStatus {
            status: "unavailable".to_string(),
            message: Some(e.to_string()),
        },
    };
    let store_ok = store.status == "ok";

    let snapshot = state.registry().snapshot();
    let ports = if snapshot.node_count == 0 {
        ComponentStatus {
            status: "degraded".to_string(),
            message: Some("no eligible nodes".to_string()),
        }
    } else {
        ComponentStatus {
            status: "ok".to_string(),
            message: Some(format!("{} free across {} nodes", snapshot.free, snapshot.node_count)),
        }
    };
    let all_ok = store_ok && ports.status == "ok";

    let body = response(
        if all_ok { "ok" } else { "degraded" },
        Some(ComponentHealth { store, ports }),
    );
    if store_ok {
        (StatusCode::OK, Json(body))
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, Json(body))
    }
}

async fn livez() -> impl IntoResponse {
    StatusCode::OK
}
