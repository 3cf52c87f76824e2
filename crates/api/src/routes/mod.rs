pub mod executions;
pub mod health;
pub mod jobs;

use axum::routing::{get, post};
use axum::Router;

use crate::handlers;
use crate::state::AppState;

/// Build the route tree.
///
/// Route hierarchy:
///
/// ```text
/// /jobs                          list definitions with last state
/// /jobs/{*path}                  definition detail or folder listing
///
/// /submit/{*path}                submit an execution (POST)
/// /stream/{*path}                SSE event stream (?workflowId=&fromSequence=)
///
/// /executions                    list executions (?path=&state=)
/// /executions/{id}               execution with full history
/// /executions/{id}/cancel        cancel (POST)
/// ```
pub fn api_routes() -> Router<AppState> {
    Router::new()
        .nest("/jobs", jobs::router())
        .route("/submit/{*path}", post(handlers::submit::submit_job))
        .route("/stream/{*path}", get(handlers::stream::stream_job))
        .nest("/executions", executions::router())
}
