//! The persisted Task record and its companions.

use crate::{Args, TaskError, TaskId, TaskState, TaskStatus};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A Task represents one submitted job and everything observed about it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    /// Unique, monotonic task identifier.
    pub id: TaskId,

    /// Registered task type name (e.g. `disk.erase`).
    pub name: String,

    /// Positional arguments.
    pub args: Args,

    /// Who submitted the task.
    #[serde(default)]
    pub user: Option<String>,

    /// Session the task was submitted from.
    #[serde(default)]
    pub session_id: Option<String>,

    /// Current lifecycle state.
    pub state: TaskState,

    /// Resource names the task needs, as returned by `verify()`.
    #[serde(default)]
    pub resources: Vec<String>,

    /// Human-readable description.
    #[serde(default)]
    pub description: Option<String>,

    /// Last progress snapshot.
    #[serde(default)]
    pub progress: Option<TaskStatus>,

    /// Warnings reported while running.
    #[serde(default)]
    pub warnings: Vec<TaskError>,

    /// Return value of a successful run.
    #[serde(default)]
    pub result: Option<Value>,

    /// Failure cause for FAILED and ABORTED tasks.
    #[serde(default)]
    pub error: Option<TaskError>,

    /// Captured worker output, when output capture is enabled.
    #[serde(default)]
    pub output: Option<String>,

    /// Resource usage of the worker process at the time of completion.
    #[serde(default)]
    pub rusage: Option<ResourceUsage>,

    /// Parent task, for subtasks.
    #[serde(default)]
    pub parent: Option<TaskId>,

    /// Subtasks started by this task.
    #[serde(default)]
    pub subtask_ids: Vec<TaskId>,

    /// Run with the worker's debugger hook enabled.
    #[serde(default)]
    pub debugger: bool,

    pub created_at: DateTime<Utc>,

    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,

    #[serde(default)]
    pub finished_at: Option<DateTime<Utc>>,
}

impl Task {
    /// Create a new Task in the CREATED state.
    pub fn new(id: TaskId, name: impl Into<String>, args: Args) -> Self {
        Self {
            id,
            name: name.into(),
            args,
            user: None,
            session_id: None,
            state: TaskState::Created,
            resources: Vec::new(),
            description: None,
            progress: None,
            warnings: Vec::new(),
            result: None,
            error: None,
            output: None,
            rusage: None,
            parent: None,
            subtask_ids: Vec::new(),
            debugger: false,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
        }
    }

    /// Builder method to set the submitting user.
    pub fn with_user(mut self, user: impl Into<String>) -> Self {
        self.user = Some(user.into());
        self
    }

    /// Builder method to mark this task as a subtask.
    pub fn with_parent(mut self, parent: TaskId) -> Self {
        self.parent = Some(parent);
        self
    }

    /// Move to `state`, stamping start and finish times.
    pub fn set_state(&mut self, state: TaskState) {
        self.state = state;
        let now = Utc::now();
        if state == TaskState::Executing && self.started_at.is_none() {
            self.started_at = Some(now);
        }
        if state.is_terminal() && self.finished_at.is_none() {
            self.finished_at = Some(now);
        }
    }

    /// Check if the task is in a terminal state.
    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    /// The outcome of this task as seen by a joining parent.
    pub fn outcome(&self) -> SubtaskOutcome {
        SubtaskOutcome {
            id: self.id,
            state: self.state,
            result: self.result.clone(),
            error: self.error.clone(),
        }
    }
}

/// CPU and memory usage sampled from a worker process.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceUsage {
    /// User CPU time, in seconds.
    pub utime: f64,
    /// System CPU time, in seconds.
    pub stime: f64,
    /// Resident set size, in bytes.
    pub rss: u64,
}

/// Final state of a subtask, handed back by `join_subtasks`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubtaskOutcome {
    pub id: TaskId,
    pub state: TaskState,
    #[serde(default)]
    pub result: Option<Value>,
    #[serde(default)]
    pub error: Option<TaskError>,
}
