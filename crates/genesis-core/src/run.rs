//! Run state types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle state of a single step node.
///
/// Terminal states are never left; a node's state only changes through the
/// scheduler's transition function.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepState {
    Waiting,
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

impl StepState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            StepState::Succeeded | StepState::Failed | StepState::Cancelled
        )
    }
}

impl fmt::Display for StepState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            StepState::Waiting => "WAITING",
            StepState::Running => "RUNNING",
            StepState::Succeeded => "SUCCEEDED",
            StepState::Failed => "FAILED",
            StepState::Cancelled => "CANCELLED",
        };
        f.write_str(s)
    }
}

/// Final outcome of one step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepOutcome {
    pub name: String,
    pub state: StepState,
}

/// Summary of a completed pipeline run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunReport {
    pub pipeline_name: String,
    pub queued_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    pub duration_ms: u64,
    /// Per-step outcomes in topological order, the synthesized root
    /// included.
    pub steps: Vec<StepOutcome>,
}

impl RunReport {
    /// True iff every step, the root included, succeeded.
    pub fn is_success(&self) -> bool {
        self.steps.iter().all(|s| s.state == StepState::Succeeded)
    }
}
