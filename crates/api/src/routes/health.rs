use axum::extract::State;
use axum::{routing::get, Json, Router};
use serde::Serialize;

use crate::state::AppState;

/// Health check response payload.
#[derive(Serialize)]
pub struct HealthResponse {
    /// Overall service status.
    pub status: &'static str,
    /// Crate version from Cargo.toml.
    pub version: &'static str,
    /// Registered definitions.
    pub definitions: usize,
    /// Retained executions, active and finished.
    pub executions: usize,
}

/// GET /health -- returns service status and tracker sizes.
async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    let tracker = &state.tracker;
    let status = if tracker.coordinator().is_shutting_down() {
        "shutting_down"
    } else {
        "ok"
    };

    Json(HealthResponse {
        status,
        version: env!("CARGO_PKG_VERSION"),
        definitions: tracker.registry().len().await,
        executions: tracker.store().len().await,
    })
}

/// Mount health check routes.
pub fn router() -> Router<AppState> {
    Router::new().route("/health", get(health_check))
}
