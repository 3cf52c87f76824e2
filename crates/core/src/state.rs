//! Execution lifecycle states and the events recording their changes.
//!
//! ```text
//! Pending ──start──▶ Running ──▶ Succeeded
//!    │                  │──────▶ Failed
//!    └──────cancel──────┴──────▶ Cancelled
//! ```
//!
//! `Succeeded`, `Failed` and `Cancelled` are terminal and absorbing.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::types::{SequenceNumber, Timestamp, WorkflowId};

/// SSE event name for a state transition.
pub const EVENT_KIND_STATE: &str = "state";

/// SSE event name for runner output appended while running.
pub const EVENT_KIND_OUTPUT: &str = "output";

// ---------------------------------------------------------------------------
// ExecutionState
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionState {
    Pending,
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

impl ExecutionState {
    /// All states, initial first.
    pub const ALL: [ExecutionState; 5] = [
        ExecutionState::Pending,
        ExecutionState::Running,
        ExecutionState::Succeeded,
        ExecutionState::Failed,
        ExecutionState::Cancelled,
    ];

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ExecutionState::Succeeded | ExecutionState::Failed | ExecutionState::Cancelled
        )
    }

    /// Whether `self -> to` is an edge of the state machine.
    pub fn can_transition_to(self, to: ExecutionState) -> bool {
        use ExecutionState::*;
        matches!(
            (self, to),
            (Pending, Running)
                | (Running, Succeeded)
                | (Running, Failed)
                | (Pending, Cancelled)
                | (Running, Cancelled)
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ExecutionState::Pending => "pending",
            ExecutionState::Running => "running",
            ExecutionState::Succeeded => "succeeded",
            ExecutionState::Failed => "failed",
            ExecutionState::Cancelled => "cancelled",
        }
    }

    /// Case-insensitive lookup, used for query-string filters.
    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|s| s.as_str().eq_ignore_ascii_case(name.trim()))
    }
}

impl fmt::Display for ExecutionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// StateEvent
// ---------------------------------------------------------------------------

/// Immutable record of one change within an execution.
///
/// Sequence numbers start at 0 and increase by one per event of the same
/// workflow. Output events keep `from_state == to_state == Running`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StateEvent {
    pub sequence_number: SequenceNumber,
    pub workflow_id: WorkflowId,
    pub from_state: ExecutionState,
    pub to_state: ExecutionState,
    pub timestamp: Timestamp,
    pub payload: serde_json::Value,
}

impl StateEvent {
    pub fn is_terminal(&self) -> bool {
        self.to_state.is_terminal()
    }

    /// Whether this records runner output rather than a transition.
    pub fn is_output(&self) -> bool {
        self.from_state == self.to_state
    }

    /// Wire name of the event kind.
    pub fn kind(&self) -> &'static str {
        if self.is_output() {
            EVENT_KIND_OUTPUT
        } else {
            EVENT_KIND_STATE
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ExecutionState::*;

    #[test]
    fn only_declared_edges_are_allowed() {
        let allowed = [
            (Pending, Running),
            (Running, Succeeded),
            (Running, Failed),
            (Pending, Cancelled),
            (Running, Cancelled),
        ];
        for from in ExecutionState::ALL {
            for to in ExecutionState::ALL {
                assert_eq!(
                    from.can_transition_to(to),
                    allowed.contains(&(from, to)),
                    "{from} -> {to}"
                );
            }
        }
    }

    #[test]
    fn terminal_states_have_no_outgoing_edges() {
        for from in ExecutionState::ALL.into_iter().filter(|s| s.is_terminal()) {
            assert!(ExecutionState::ALL
                .into_iter()
                .all(|to| !from.can_transition_to(to)));
        }
    }

    #[test]
    fn from_name_is_case_insensitive() {
        assert_eq!(ExecutionState::from_name("RUNNING"), Some(Running));
        assert_eq!(ExecutionState::from_name(" failed "), Some(Failed));
        assert_eq!(ExecutionState::from_name("done"), None);
    }

    #[test]
    fn event_serializes_camel_case_with_lowercase_states() {
        let event = StateEvent {
            sequence_number: 0,
            workflow_id: WorkflowId::new(),
            from_state: Pending,
            to_state: Running,
            timestamp: chrono::Utc::now(),
            payload: serde_json::json!({}),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["sequenceNumber"], 0);
        assert_eq!(json["fromState"], "pending");
        assert_eq!(json["toState"], "running");
        assert_eq!(event.kind(), EVENT_KIND_STATE);
    }

    #[test]
    fn output_event_kind() {
        let event = StateEvent {
            sequence_number: 3,
            workflow_id: WorkflowId::new(),
            from_state: Running,
            to_state: Running,
            timestamp: chrono::Utc::now(),
            payload: serde_json::json!({ "line": "hello" }),
        };
        assert!(event.is_output());
        assert!(!event.is_terminal());
        assert_eq!(event.kind(), EVENT_KIND_OUTPUT);
    }
}
