//! Execution state machine.
//!
//! An [`ExecutionHandle`] exclusively owns one workflow run. Every accepted
//! transition appends one [`StateEvent`] with the next sequence number and
//! publishes it to the event bus, all under the execution's lock, so the
//! recorded history, the current state and the bus stay in lockstep.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::Utc;
use serde::Serialize;
use tumbler_core::error::CoreError;
use tumbler_core::path::JobPath;
use tumbler_core::state::{ExecutionState, StateEvent};
use tumbler_core::types::{SequenceNumber, Timestamp, WorkflowId};
use tumbler_events::EventBus;

// ---------------------------------------------------------------------------
// Execution record
// ---------------------------------------------------------------------------

/// The record of one run, as returned by snapshots.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Execution {
    pub workflow_id: WorkflowId,
    pub job_path: JobPath,
    pub state: ExecutionState,
    pub history: Vec<StateEvent>,
    pub created_at: Timestamp,
    pub started_at: Option<Timestamp>,
    pub ended_at: Option<Timestamp>,
    /// Set once output was dropped for exceeding the per-execution limit.
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub output_truncated: bool,
    #[serde(skip)]
    output_events: usize,
}

/// Current-state view of an execution without its history.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionSummary {
    pub workflow_id: WorkflowId,
    pub job_path: JobPath,
    pub state: ExecutionState,
    pub event_count: usize,
    pub created_at: Timestamp,
    pub started_at: Option<Timestamp>,
    pub ended_at: Option<Timestamp>,
}

impl Execution {
    fn new(workflow_id: WorkflowId, job_path: JobPath) -> Self {
        Self {
            workflow_id,
            job_path,
            state: ExecutionState::Pending,
            history: Vec::new(),
            created_at: Utc::now(),
            started_at: None,
            ended_at: None,
            output_truncated: false,
            output_events: 0,
        }
    }

    pub fn summary(&self) -> ExecutionSummary {
        ExecutionSummary {
            workflow_id: self.workflow_id,
            job_path: self.job_path.clone(),
            state: self.state,
            event_count: self.history.len(),
            created_at: self.created_at,
            started_at: self.started_at,
            ended_at: self.ended_at,
        }
    }

    /// Sequence number of the most recent event.
    pub fn last_sequence(&self) -> Option<SequenceNumber> {
        self.history.last().map(|e| e.sequence_number)
    }

    fn next_sequence(&self) -> SequenceNumber {
        self.history.len() as SequenceNumber
    }
}

// ---------------------------------------------------------------------------
// ExecutionHandle
// ---------------------------------------------------------------------------

/// Output events recorded per execution before further lines are dropped.
pub const DEFAULT_OUTPUT_LIMIT: usize = 10_000;

pub struct ExecutionHandle {
    workflow_id: WorkflowId,
    job_path: JobPath,
    inner: Mutex<Execution>,
    bus: Arc<EventBus>,
    output_limit: usize,
}

impl ExecutionHandle {
    /// Create a `Pending` execution. The caller must have opened the
    /// workflow's topic on `bus`.
    pub(crate) fn new(workflow_id: WorkflowId, job_path: JobPath, bus: Arc<EventBus>) -> Self {
        Self {
            workflow_id,
            inner: Mutex::new(Execution::new(workflow_id, job_path.clone())),
            job_path,
            bus,
            output_limit: DEFAULT_OUTPUT_LIMIT,
        }
    }

    /// Cap the number of output events kept for this execution.
    pub(crate) fn with_output_limit(mut self, limit: usize) -> Self {
        self.output_limit = limit;
        self
    }

    fn lock(&self) -> MutexGuard<'_, Execution> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn workflow_id(&self) -> WorkflowId {
        self.workflow_id
    }

    pub fn job_path(&self) -> &JobPath {
        &self.job_path
    }

    pub fn state(&self) -> ExecutionState {
        self.lock().state
    }

    pub fn is_terminal(&self) -> bool {
        self.state().is_terminal()
    }

    /// When the execution reached its terminal state.
    pub fn ended_at(&self) -> Option<Timestamp> {
        self.lock().ended_at
    }

    pub fn snapshot(&self) -> Execution {
        self.lock().clone()
    }

    pub fn summary(&self) -> ExecutionSummary {
        self.lock().summary()
    }

    /// `Pending -> Running`.
    pub fn start(&self) -> Result<StateEvent, CoreError> {
        self.transition(ExecutionState::Running, serde_json::json!({}))
    }

    /// `Running -> Succeeded`.
    pub fn succeed(&self, payload: serde_json::Value) -> Result<StateEvent, CoreError> {
        self.transition(ExecutionState::Succeeded, payload)
    }

    /// `Running -> Failed`.
    pub fn fail(&self, payload: serde_json::Value) -> Result<StateEvent, CoreError> {
        self.transition(ExecutionState::Failed, payload)
    }

    /// `{Pending, Running} -> Cancelled`.
    pub fn cancel(&self, payload: serde_json::Value) -> Result<StateEvent, CoreError> {
        self.transition(ExecutionState::Cancelled, payload)
    }

    /// Apply a transition.
    ///
    /// Rejected requests (`InvalidTransition`, `AlreadyTerminal`) leave the
    /// state and history untouched and publish nothing.
    pub fn transition(
        &self,
        to: ExecutionState,
        payload: serde_json::Value,
    ) -> Result<StateEvent, CoreError> {
        let mut execution = self.lock();
        let from = execution.state;

        if from.is_terminal() {
            tracing::warn!(
                workflow_id = %self.workflow_id,
                %from,
                %to,
                "Transition rejected: execution already terminal",
            );
            return Err(CoreError::AlreadyTerminal { state: from });
        }
        if !from.can_transition_to(to) {
            tracing::warn!(
                workflow_id = %self.workflow_id,
                %from,
                %to,
                "Transition rejected: no such edge",
            );
            return Err(CoreError::InvalidTransition { from, to });
        }

        let event = self.append(&mut execution, to, payload)?;
        match to {
            ExecutionState::Running => execution.started_at = Some(event.timestamp),
            s if s.is_terminal() => execution.ended_at = Some(event.timestamp),
            _ => {}
        }

        tracing::info!(
            workflow_id = %self.workflow_id,
            path = %self.job_path,
            sequence = event.sequence_number,
            %from,
            %to,
            "Execution state changed",
        );
        Ok(event)
    }

    /// Append a runner output event while `Running`.
    ///
    /// Output events keep the state unchanged and are not transitions. Once
    /// the output limit is reached a single truncation marker is appended
    /// and later lines are dropped: `Ok(None)`, the execution keeps running.
    pub fn record_output(
        &self,
        payload: serde_json::Value,
    ) -> Result<Option<StateEvent>, CoreError> {
        let mut execution = self.lock();
        let state = execution.state;

        if state.is_terminal() {
            return Err(CoreError::AlreadyTerminal { state });
        }
        if state != ExecutionState::Running {
            return Err(CoreError::InvalidTransition {
                from: state,
                to: ExecutionState::Running,
            });
        }
        if execution.output_truncated {
            return Ok(None);
        }

        let payload = if execution.output_events < self.output_limit {
            payload
        } else {
            tracing::warn!(
                workflow_id = %self.workflow_id,
                limit = self.output_limit,
                "Output limit reached, dropping further lines",
            );
            execution.output_truncated = true;
            serde_json::json!({
                "line": format!("[output truncated after {} lines]", self.output_limit),
                "truncated": true,
            })
        };

        let event = self.append(&mut execution, ExecutionState::Running, payload)?;
        execution.output_events += 1;
        Ok(Some(event))
    }

    /// Publish first, then record: a failed publish leaves the execution
    /// unchanged. Runs under the execution lock.
    fn append(
        &self,
        execution: &mut Execution,
        to: ExecutionState,
        payload: serde_json::Value,
    ) -> Result<StateEvent, CoreError> {
        let event = StateEvent {
            sequence_number: execution.next_sequence(),
            workflow_id: self.workflow_id,
            from_state: execution.state,
            to_state: to,
            timestamp: Utc::now(),
            payload,
        };

        self.bus.publish(event.clone())?;

        execution.history.push(event.clone());
        execution.state = to;
        Ok(event)
    }
}
