//! Handlers for the `/jobs` resource: the definition catalog.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::Json;
use futures::{future, StreamExt};
use serde::Serialize;
use tumbler_core::definition::{Definition, DefinitionKind};
use tumbler_core::error::CoreError;
use tumbler_core::path::JobPath;
use tumbler_core::state::ExecutionState;
use tumbler_core::types::WorkflowId;
use tumbler_pipeline::{ExecutionFilter, ExecutionSummary, Tracker};

use crate::error::AppResult;
use crate::query::parse_job_path;
use crate::response::DataResponse;
use crate::state::AppState;

/// How many executions the detail view includes.
const RECENT_EXECUTIONS: usize = 20;

/// One catalog entry with the state of its most recent run.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobSummary {
    pub path: JobPath,
    pub kind: DefinitionKind,
    pub description: Option<String>,
    pub disabled: bool,
    pub last_state: Option<ExecutionState>,
    pub last_workflow_id: Option<WorkflowId>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobDetail {
    /// The requested path; may sit below a wildcard definition.
    pub path: JobPath,
    pub definition: Definition,
    pub recent_executions: Vec<ExecutionSummary>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FolderView {
    pub path: JobPath,
    pub jobs: Vec<JobSummary>,
}

#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum JobView {
    Definition(JobDetail),
    Folder(FolderView),
}

async fn summarize(tracker: &Tracker, definition: &Definition) -> JobSummary {
    let last = tracker.store().latest_matching(&definition.path).await;
    JobSummary {
        path: definition.path.clone(),
        kind: definition.kind,
        description: definition.description.clone(),
        disabled: definition.disabled,
        last_state: last.as_ref().map(|s| s.state),
        last_workflow_id: last.map(|s| s.workflow_id),
    }
}

async fn summarize_all(tracker: &Tracker, definitions: &[Arc<Definition>]) -> Vec<JobSummary> {
    let mut summaries = Vec::new();
    for definition in definitions {
        summaries.push(summarize(tracker, definition).await);
    }
    summaries
}

/// GET /jobs
///
/// Every registered definition with its last known state, in path order.
pub async fn list_jobs(
    State(state): State<AppState>,
) -> AppResult<Json<DataResponse<Vec<JobSummary>>>> {
    let definitions = state.tracker.registry().definitions().await;
    let data = summarize_all(&state.tracker, &definitions).await;
    Ok(Json(DataResponse { data }))
}

/// GET /jobs/{*path}
///
/// Resolves `path` to a definition (exact or wildcard) and returns it with
/// its recent executions. A path that is only a folder prefix lists the
/// definitions below it instead.
pub async fn get_job(
    State(state): State<AppState>,
    Path(raw): Path<String>,
) -> AppResult<Json<DataResponse<JobView>>> {
    let path = parse_job_path(&raw)?;
    let tracker = &state.tracker;

    let view = match tracker.registry().resolve(&path).await {
        Ok(definition) => {
            // A wildcard covers every run below its prefix; anything else
            // only its own runs.
            let prefix = path.parent().filter(|_| path.is_wildcard());
            let filter = ExecutionFilter {
                path: Some(prefix.clone().unwrap_or_else(|| path.clone())),
                state: None,
            };
            let recent_executions = tracker
                .store()
                .list(filter)
                .await
                .filter(|s| future::ready(prefix.is_some() || s.job_path == path))
                .take(RECENT_EXECUTIONS)
                .collect()
                .await;

            JobView::Definition(JobDetail {
                path,
                definition: definition.as_ref().clone(),
                recent_executions,
            })
        }
        Err(CoreError::NotFound { .. }) => {
            let children = tracker.registry().list_under(&path).await;
            if children.is_empty() {
                return Err(CoreError::not_found("Job", &path).into());
            }
            let jobs = summarize_all(tracker, &children).await;
            JobView::Folder(FolderView { path, jobs })
        }
        Err(e) => return Err(e.into()),
    };

    Ok(Json(DataResponse { data: view }))
}
