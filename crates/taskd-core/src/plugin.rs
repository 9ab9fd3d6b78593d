//! The contract a task implementation exposes to the dispatcher and the worker.
//!
//! Every implementation provides [`TaskPlugin`]. The optional steps of the
//! contract are separate traits ([`Rollback`], [`Abortable`],
//! [`StatusReporter`]) that an implementation opts into by returning itself
//! from the matching `as_*` accessor.

use async_trait::async_trait;
use serde_json::Value;

use crate::{Args, Environment, SubtaskOutcome, TaskError, TaskId, TaskState, TaskStatus};

/// What an implementation is instantiated with.
#[derive(Debug, Clone, Default)]
pub struct TaskEnv {
    pub task_id: TaskId,
    pub user: Option<String>,
    pub environment: Environment,
}

#[async_trait]
pub trait TaskPlugin: Send + Sync {
    /// Check arguments and system state, returning the resource names the
    /// task must hold while it runs.
    fn verify(&self, args: &Args) -> Result<Vec<String>, TaskError>;

    /// Instance description, computed after a successful `verify()`.
    fn describe(&self, _args: &Args) -> Option<String> {
        None
    }

    /// Execute the task body.
    async fn run(&self, ctx: &dyn TaskContext, args: &Args) -> Result<Value, TaskError>;

    fn as_rollback(&self) -> Option<&dyn Rollback> {
        None
    }

    fn as_abortable(&self) -> Option<&dyn Abortable> {
        None
    }

    fn as_status_reporter(&self) -> Option<&dyn StatusReporter> {
        None
    }
}

/// Compensating step run after `run()` fails.
#[async_trait]
pub trait Rollback: Send + Sync {
    async fn rollback(&self, ctx: &dyn TaskContext, args: &Args) -> Result<(), TaskError>;
}

/// Cooperative cancellation. Called concurrently with `run()`, which is
/// expected to return a [`TaskError::aborted`] promptly afterwards.
pub trait Abortable: Send + Sync {
    fn abort(&self) -> Result<(), TaskError>;
}

/// Live progress of a running instance.
pub trait StatusReporter: Send + Sync {
    fn get_status(&self) -> TaskStatus;
}

/// Services the dispatcher offers to a running task.
#[async_trait]
pub trait TaskContext: Send + Sync {
    fn task_id(&self) -> TaskId;

    fn user(&self) -> Option<&str>;

    fn environment(&self) -> &Environment;

    /// Record a non-fatal issue on the running task.
    async fn add_warning(&self, warning: TaskError) -> Result<(), TaskError>;

    /// Push a progress snapshot without waiting to be polled.
    async fn put_progress(&self, status: TaskStatus) -> Result<(), TaskError>;

    /// Validate and verify a subtask without starting it.
    async fn verify_subtask(&self, name: &str, args: &Args) -> Result<Vec<String>, TaskError>;

    /// Start a subtask on its own executor. `env` overrides entries of the
    /// parent's environment.
    async fn run_subtask(
        &self,
        name: &str,
        args: Args,
        env: Option<Environment>,
    ) -> Result<TaskId, TaskError>;

    /// Wait until every listed subtask has reached a terminal state.
    async fn join_subtasks(&self, ids: &[TaskId]) -> Result<Vec<SubtaskOutcome>, TaskError>;

    async fn abort_subtask(&self, id: TaskId) -> Result<(), TaskError>;

    async fn register_resource(&self, name: &str, parents: &[String]) -> Result<(), TaskError>;

    async fn unregister_resource(&self, name: &str) -> Result<(), TaskError>;

    /// Run one subtask to completion and return its result, failing with the
    /// subtask's own error.
    async fn call_subtask(&self, name: &str, args: Args) -> Result<Value, TaskError> {
        let id = self.run_subtask(name, args, None).await?;
        let mut outcomes = self.join_subtasks(&[id]).await?;
        let outcome = outcomes
            .pop()
            .ok_or_else(|| TaskError::internal(format!("subtask {} vanished", id)))?;
        match outcome.state {
            TaskState::Finished => Ok(outcome.result.unwrap_or(Value::Null)),
            _ => Err(outcome.error.unwrap_or_else(|| {
                TaskError::new(crate::errno::EFAULT, format!("subtask {} {}", id, outcome.state))
            })),
        }
    }
}
