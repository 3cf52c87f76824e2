//! Shared query parameter types and path/id parsing for API handlers.

use serde::Deserialize;
use tumbler_core::path::JobPath;
use tumbler_core::state::ExecutionState;
use tumbler_core::types::{SequenceNumber, WorkflowId};
use tumbler_pipeline::ExecutionFilter;

use crate::error::{AppError, AppResult};

/// `?workflowId=&fromSequence=` on the stream endpoint.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamParams {
    pub workflow_id: Option<String>,
    pub from_sequence: Option<SequenceNumber>,
}

/// `?path=&state=` on the executions listing.
#[derive(Debug, Default, Deserialize)]
pub struct ExecutionListParams {
    pub path: Option<String>,
    pub state: Option<String>,
}

impl ExecutionListParams {
    pub fn into_filter(self) -> AppResult<ExecutionFilter> {
        let path = self.path.as_deref().map(parse_job_path).transpose()?;
        let state = self
            .state
            .as_deref()
            .map(|name| {
                ExecutionState::from_name(name)
                    .ok_or_else(|| AppError::BadRequest(format!("Unknown state '{name}'")))
            })
            .transpose()?;
        Ok(ExecutionFilter { path, state })
    }
}

/// Parse a path taken from the URL. Malformed paths are `VALIDATION_ERROR`.
pub fn parse_job_path(raw: &str) -> AppResult<JobPath> {
    Ok(JobPath::parse(raw)?)
}

pub fn parse_workflow_id(raw: &str) -> AppResult<WorkflowId> {
    raw.parse()
        .map_err(|_| AppError::BadRequest(format!("Invalid workflow id '{raw}'")))
}
