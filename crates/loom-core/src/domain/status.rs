//! Task status state machine.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Status of a task record.
///
/// State transitions:
/// - Pending -> Running (claim)
/// - Running -> Success | Broken | Error (report)
/// - Running -> Deferred (body required a task that is not done yet)
/// - Running -> Pending (liveness reclaim after a crashed worker)
/// - Pending | Deferred -> Broken (an upstream dependency failed)
/// - Deferred -> Pending (all incoming edges are success)
/// - Broken | Error -> Pending (operator retry)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    /// Eligible once its dependencies are satisfied.
    Pending,

    /// Postponed until its incoming edges resolve.
    Deferred,

    /// Claimed by a worker.
    Running,

    /// Completed; result available.
    Success,

    /// Permanently not performable without an external change.
    Broken,

    /// Unexpected failure; retryable.
    Error,
}

impl TaskStatus {
    pub const ALL: [TaskStatus; 6] = [
        TaskStatus::Pending,
        TaskStatus::Deferred,
        TaskStatus::Running,
        TaskStatus::Success,
        TaskStatus::Broken,
        TaskStatus::Error,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Deferred => "deferred",
            TaskStatus::Running => "running",
            TaskStatus::Success => "success",
            TaskStatus::Broken => "broken",
            TaskStatus::Error => "error",
        }
    }

    /// Finished executing, successfully or not.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskStatus::Success | TaskStatus::Broken | TaskStatus::Error
        )
    }

    /// Terminal failure; the operator may retry it.
    pub fn is_failed(self) -> bool {
        matches!(self, TaskStatus::Broken | TaskStatus::Error)
    }

    /// Still waiting for its turn to run.
    pub fn is_waiting(self) -> bool {
        matches!(self, TaskStatus::Pending | TaskStatus::Deferred)
    }

    /// Is `self -> next` an edge of the state machine?
    pub fn can_transition_to(self, next: TaskStatus) -> bool {
        use TaskStatus::*;
        matches!(
            (self, next),
            (Pending, Running)
                | (Running, Success)
                | (Running, Broken)
                | (Running, Error)
                | (Running, Deferred)
                | (Running, Pending)
                | (Pending, Broken)
                | (Deferred, Broken)
                | (Deferred, Pending)
                | (Broken, Pending)
                | (Error, Pending)
        )
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown task status: {0:?}")]
pub struct UnknownStatus(pub String);

impl FromStr for TaskStatus {
    type Err = UnknownStatus;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        TaskStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| UnknownStatus(s.to_string()))
    }
}
