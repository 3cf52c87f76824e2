//! Handlers for the `/executions` resource.

use axum::extract::{Path, Query, State};
use axum::Json;
use futures::StreamExt;
use tumbler_core::state::StateEvent;
use tumbler_pipeline::{Execution, ExecutionSummary};

use crate::error::AppResult;
use crate::query::{parse_workflow_id, ExecutionListParams};
use crate::response::DataResponse;
use crate::state::AppState;

/// GET /executions?path=&state=
///
/// Summaries of retained executions, newest first. `path` matches the path
/// itself and everything below it.
pub async fn list_executions(
    State(state): State<AppState>,
    Query(params): Query<ExecutionListParams>,
) -> AppResult<Json<DataResponse<Vec<ExecutionSummary>>>> {
    let filter = params.into_filter()?;
    let data = state.tracker.store().list(filter).await.collect().await;
    Ok(Json(DataResponse { data }))
}

/// GET /executions/{id}
pub async fn get_execution(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> AppResult<Json<DataResponse<Execution>>> {
    let workflow_id = parse_workflow_id(&id)?;
    let execution = state.tracker.store().get(&workflow_id).await?;
    Ok(Json(DataResponse { data: execution }))
}

/// POST /executions/{id}/cancel
///
/// Returns the `Cancelled` event. Cancelling a finished execution is 409.
pub async fn cancel_execution(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> AppResult<Json<DataResponse<StateEvent>>> {
    let workflow_id = parse_workflow_id(&id)?;
    let event = state.tracker.coordinator().cancel(&workflow_id).await?;

    tracing::info!(%workflow_id, "Execution cancelled by request");

    Ok(Json(DataResponse { data: event }))
}
