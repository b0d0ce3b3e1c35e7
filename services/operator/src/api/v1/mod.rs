//! API v1 routes.

mod builds;
mod instances;

use axum::Router;

use crate::state::AppState;

pub fn routes() -> Router<AppState> {
    Router::new()
        .nest("/builds", builds::routes())
        .nest("/instances", instances::routes())
}
