//! Message types of the control channel.
//!
//! Every line on the channel is one JSON [`Frame`]. Both ends may issue
//! requests; responses are matched to requests by `id`.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use taskd_core::{
    Args, Environment, ExecutorKey, SubtaskOutcome, Task, TaskError, TaskId, TaskState,
    TaskStatus,
};

/// One line on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "frame", rename_all = "snake_case")]
pub enum Frame {
    Request {
        id: u64,
        request: Request,
    },
    Response {
        id: u64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        response: Option<Response>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<TaskError>,
    },
}

impl Frame {
    pub fn reply(id: u64, result: Result<Response, TaskError>) -> Self {
        match result {
            Ok(response) => Frame::Response {
                id,
                response: Some(response),
                error: None,
            },
            Err(error) => Frame::Response {
                id,
                response: None,
                error: Some(error),
            },
        }
    }
}

/// Calls carried by the channel.
///
/// The worker sends `Checkin` once, then answers `Run`, `Abort` and
/// `GetStatus` from the dispatcher, and issues the remaining task-side calls
/// while a task runs. `Submit`, `AbortTask` and `GetTask` come from clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "method", content = "params", rename_all = "snake_case")]
pub enum Request {
    Checkin {
        key: ExecutorKey,
    },
    Run(RunRequest),
    Abort,
    GetStatus,
    PutStatus(StatusReport),
    PutWarning(TaskError),
    PutProgress(TaskStatus),
    VerifySubtask {
        name: String,
        args: Args,
    },
    RunSubtask {
        name: String,
        args: Args,
        #[serde(default)]
        env: Option<Environment>,
    },
    JoinSubtasks {
        ids: Vec<TaskId>,
    },
    AbortSubtask {
        id: TaskId,
    },
    RegisterResource {
        name: String,
        #[serde(default)]
        parents: Vec<String>,
    },
    UnregisterResource {
        name: String,
    },
    Submit {
        name: String,
        args: Args,
        #[serde(default)]
        user: Option<String>,
        #[serde(default)]
        strict: bool,
    },
    AbortTask {
        id: TaskId,
    },
    GetTask {
        id: TaskId,
    },
}

impl Request {
    pub fn method(&self) -> &'static str {
        match self {
            Request::Checkin { .. } => "checkin",
            Request::Run(_) => "run",
            Request::Abort => "abort",
            Request::GetStatus => "get_status",
            Request::PutStatus(_) => "put_status",
            Request::PutWarning(_) => "put_warning",
            Request::PutProgress(_) => "put_progress",
            Request::VerifySubtask { .. } => "verify_subtask",
            Request::RunSubtask { .. } => "run_subtask",
            Request::JoinSubtasks { .. } => "join_subtasks",
            Request::AbortSubtask { .. } => "abort_subtask",
            Request::RegisterResource { .. } => "register_resource",
            Request::UnregisterResource { .. } => "unregister_resource",
            Request::Submit { .. } => "submit",
            Request::AbortTask { .. } => "abort_task",
            Request::GetTask { .. } => "get_task",
        }
    }
}

/// Successful results.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum Response {
    Ack,
    Status(Option<TaskStatus>),
    TaskId(TaskId),
    Resources(Vec<String>),
    Outcomes(Vec<SubtaskOutcome>),
    Task(Box<Task>),
}

/// Everything a worker needs to execute one task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunRequest {
    pub id: TaskId,
    pub name: String,
    /// Implementation unit holding the class.
    pub module: String,
    pub class_name: String,
    pub args: Args,
    #[serde(default)]
    pub user: Option<String>,
    #[serde(default)]
    pub environment: Environment,
    /// `host:port` of a debugger to attach to before running.
    #[serde(default)]
    pub debugger: Option<String>,
}

/// Result or transient state pushed by a worker for its current task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusReport {
    pub state: TaskState,
    #[serde(default)]
    pub result: Option<Value>,
    #[serde(default)]
    pub error: Option<TaskError>,
}

impl StatusReport {
    pub fn finished(result: Value) -> Self {
        Self {
            state: TaskState::Finished,
            result: Some(result),
            error: None,
        }
    }

    /// A failure; cancellation errors report ABORTED instead of FAILED.
    pub fn failed(error: TaskError) -> Self {
        let state = if error.is_abort() {
            TaskState::Aborted
        } else {
            TaskState::Failed
        };
        Self {
            state,
            result: None,
            error: Some(error),
        }
    }

    pub fn rollback() -> Self {
        Self {
            state: TaskState::Rollback,
            result: None,
            error: None,
        }
    }
}
