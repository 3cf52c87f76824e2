//! The seam between the tracker and whatever actually executes a definition.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tumbler_core::definition::Definition;
use tumbler_core::path::JobPath;
use tumbler_core::types::WorkflowId;

use crate::dsl::ScriptError;
use crate::execution::ExecutionHandle;

#[derive(Debug, thiserror::Error)]
pub enum RunnerError {
    #[error("Failed to spawn '{command}': {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Step '{step}' exited with code {code:?}")]
    StepFailed { step: String, code: Option<i32> },

    #[error("Definition has no runnable steps: {0}")]
    NoSteps(String),

    #[error("Invalid pipeline script: {0}")]
    Script(#[from] ScriptError),

    #[error("Unsupported step '{0}'")]
    UnsupportedStep(String),

    #[error("Step '{step}' is missing its '{argument}' argument")]
    MissingArgument { step: String, argument: &'static str },

    #[error("Runner timed out after {0:?}")]
    Timeout(Duration),

    #[error("Runner panicked: {0}")]
    Panicked(String),

    #[error("{0}")]
    Other(String),
}

/// Executes a resolved definition for one workflow.
///
/// Implementations return the run's result payload on success. They must
/// stop promptly when their future is dropped, which is how cancellation
/// and shutdown reach them.
#[async_trait]
pub trait JobRunner: Send + Sync + 'static {
    /// Reject a definition this runner could never execute, before any
    /// execution is created for it.
    fn validate(&self, _definition: &Definition) -> Result<(), RunnerError> {
        Ok(())
    }

    async fn run(
        &self,
        definition: Arc<Definition>,
        ctx: RunContext,
    ) -> Result<serde_json::Value, RunnerError>;
}

/// What a runner may see of its execution.
#[derive(Clone)]
pub struct RunContext {
    handle: Arc<ExecutionHandle>,
}

impl RunContext {
    pub(crate) fn new(handle: Arc<ExecutionHandle>) -> Self {
        Self { handle }
    }

    pub fn workflow_id(&self) -> WorkflowId {
        self.handle.workflow_id()
    }

    pub fn job_path(&self) -> &JobPath {
        self.handle.job_path()
    }

    /// Publish one line of output. Returns `false` once the execution has
    /// left `Running` (e.g. it was cancelled), at which point the runner
    /// should wind down.
    pub fn emit_output(&self, line: impl Into<String>) -> bool {
        self.emit_line(None, line)
    }

    /// Publish one line of output, tagged with the stage producing it.
    pub fn emit_line(&self, stage: Option<&str>, line: impl Into<String>) -> bool {
        let mut payload = serde_json::json!({ "line": line.into() });
        if let Some(stage) = stage {
            payload["stage"] = stage.into();
        }
        self.record(payload)
    }

    /// Publish a stage boundary.
    pub fn emit_stage(&self, stage: &str, status: StageStatus) -> bool {
        self.record(serde_json::json!({
            "line": format!("[{stage}] {}", status.as_str()),
            "stage": stage,
            "status": status.as_str(),
        }))
    }

    fn record(&self, payload: serde_json::Value) -> bool {
        self.handle.record_output(payload).is_ok()
    }
}

/// Stage boundary carried by stage output events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageStatus {
    Started,
    Succeeded,
    Failed,
}

impl StageStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Started => "started",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
        }
    }
}
