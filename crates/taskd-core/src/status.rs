//! Lifecycle enums for Tasks and worker slots, and the progress snapshot.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// Lifecycle state of a Task.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskState {
    /// Submitted, not yet verified.
    #[default]
    Created,
    /// Verified, waiting for its resources.
    Waiting,
    /// Holding its resources and running on an executor.
    Executing,
    /// Running the implementation's compensating step after a failure.
    Rollback,
    /// Completed successfully.
    Finished,
    /// Failed (schema, verify, run, or infrastructure).
    Failed,
    /// Cancelled on request or by deadlock avoidance.
    Aborted,
}

impl TaskState {
    /// Returns true if the task will never change state again.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Finished | Self::Failed | Self::Aborted)
    }

    /// Returns true for the states a restarted dispatcher treats as stale.
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Created | Self::Waiting | Self::Executing)
    }

    /// Returns true if the task has been granted resources and not yet ended.
    pub fn is_running(&self) -> bool {
        matches!(self, Self::Executing | Self::Rollback)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "CREATED",
            Self::Waiting => "WAITING",
            Self::Executing => "EXECUTING",
            Self::Rollback => "ROLLBACK",
            Self::Finished => "FINISHED",
            Self::Failed => "FAILED",
            Self::Aborted => "ABORTED",
        }
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// State of one worker-process slot.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkerState {
    /// Process spawned (or respawning), not yet checked in.
    #[default]
    Starting,
    /// Checked in and ready to accept a task.
    Idle,
    /// Running a task.
    Executing,
}

/// Progress snapshot reported by a running task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskStatus {
    pub percentage: f64,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub extra: Option<Value>,
}

impl TaskStatus {
    pub fn new(percentage: f64, message: impl Into<String>) -> Self {
        Self {
            percentage,
            message: Some(message.into()),
            extra: None,
        }
    }

    /// A snapshot carrying only a percentage.
    pub fn percentage(percentage: f64) -> Self {
        Self {
            percentage,
            message: None,
            extra: None,
        }
    }

    pub fn with_extra(mut self, extra: Value) -> Self {
        self.extra = Some(extra);
        self
    }
}

impl Default for TaskStatus {
    /// What a task without its own status reporter answers while running.
    fn default() -> Self {
        Self::new(50.0, "Executing...")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_states() {
        assert!(TaskState::Finished.is_terminal());
        assert!(TaskState::Failed.is_terminal());
        assert!(TaskState::Aborted.is_terminal());
        assert!(!TaskState::Rollback.is_terminal());
        assert!(!TaskState::Waiting.is_terminal());
    }

    #[test]
    fn test_state_serializes_screaming() {
        let json = serde_json::to_string(&TaskState::Rollback).unwrap();
        assert_eq!(json, "\"ROLLBACK\"");
        assert_eq!(TaskState::Executing.to_string(), "EXECUTING");
    }
}
