//! Handler for `POST /submit/{*path}`.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use serde::Serialize;
use tumbler_core::path::JobPath;
use tumbler_core::state::ExecutionState;
use tumbler_core::types::WorkflowId;

use crate::error::AppResult;
use crate::query::parse_job_path;
use crate::response::DataResponse;
use crate::state::AppState;

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmitResponse {
    pub workflow_id: WorkflowId,
    pub job_path: JobPath,
    /// State at the time of the response; the run proceeds in the background.
    pub state: ExecutionState,
}

/// POST /submit/{*path}
///
/// Starts a new execution of the definition `path` resolves to. Returns 202
/// with the workflow id to stream; every call creates an independent
/// execution.
pub async fn submit_job(
    State(state): State<AppState>,
    Path(raw): Path<String>,
) -> AppResult<impl IntoResponse> {
    let job_path = parse_job_path(&raw)?;
    let tracker = &state.tracker;

    let workflow_id = tracker.coordinator().submit(&job_path).await?;
    let current = tracker.store().handle(&workflow_id).await?.state();

    Ok((
        StatusCode::ACCEPTED,
        Json(DataResponse {
            data: SubmitResponse {
                workflow_id,
                job_path,
                state: current,
            },
        }),
    ))
}
