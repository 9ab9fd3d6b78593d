//! Core domain errors and the serializable task error.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use thiserror::Error;

/// errno-style codes carried by [`TaskError`].
///
/// Values follow Linux numbering so they round-trip through logs and
/// persisted records unchanged.
pub mod errno {
    pub const ENOENT: i32 = 2;
    pub const EINTR: i32 = 4;
    pub const EFAULT: i32 = 14;
    pub const EBUSY: i32 = 16;
    pub const EINVAL: i32 = 22;
    pub const EDEADLK: i32 = 35;
    pub const EBADMSG: i32 = 74;
    pub const ENOTSUP: i32 = 95;
    pub const ETIMEDOUT: i32 = 110;
}

/// Core domain errors for taskd.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Task type not registered.
    #[error("Unknown task type: {0}")]
    UnknownTaskType(String),

    /// Task not found.
    #[error("Task not found: {0}")]
    TaskNotFound(String),

    /// Task class not exported by the given module.
    #[error("Class '{class}' not found in module '{module}'")]
    ClassNotFound { module: String, class: String },

    /// Task type registered twice.
    #[error("Duplicate task type: {0}")]
    DuplicateTaskType(String),

    /// Invalid hook pattern.
    #[error("Invalid hook pattern '{pattern}': {reason}")]
    InvalidPattern { pattern: String, reason: String },

    /// Invalid input.
    #[error("Invalid input: {0}")]
    InvalidInput(String),
}

/// Classification of a [`TaskError`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    /// Argument schema violation. `extra` holds a list of [`ValidationIssue`].
    ValidationException,
    /// Resource or precondition failure raised from `verify()`.
    VerifyException,
    /// Generic application failure.
    #[default]
    TaskException,
    /// Explicit cancellation.
    TaskAbortException,
    /// Failure outside the task contract (bookkeeping bugs, protocol misuse).
    InternalError,
}

/// One offending field of a failed schema validation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationIssue {
    pub path: Vec<Value>,
    pub code: i32,
    pub message: String,
}

/// Serializable failure of a task, a warning, or a control-channel call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskError {
    #[serde(rename = "type")]
    pub kind: ErrorKind,
    pub code: i32,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stacktrace: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extra: Option<Value>,
}

impl TaskError {
    /// Create a generic task failure.
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            kind: ErrorKind::TaskException,
            code,
            message: message.into(),
            stacktrace: None,
            extra: None,
        }
    }

    /// Create a failure raised from `verify()`.
    pub fn verify(code: i32, message: impl Into<String>) -> Self {
        Self::new(code, message).with_kind(ErrorKind::VerifyException)
    }

    /// Create a cancellation error.
    pub fn aborted(message: impl Into<String>) -> Self {
        Self::new(errno::EINTR, message).with_kind(ErrorKind::TaskAbortException)
    }

    /// Create an error for a failure outside the task contract.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(errno::EFAULT, message).with_kind(ErrorKind::InternalError)
    }

    /// Create a schema validation error from its offending fields.
    pub fn validation(issues: Vec<ValidationIssue>) -> Self {
        let extra = serde_json::to_value(&issues).unwrap_or(Value::Null);
        Self::new(errno::EBADMSG, "Validation Exception Errors")
            .with_kind(ErrorKind::ValidationException)
            .with_extra(extra)
    }

    /// The error every task of a dead worker process resolves with.
    pub fn executor_died() -> Self {
        Self::new(errno::EFAULT, "Task executor died")
    }

    /// The error for a worker process that could not be started.
    pub fn cannot_spawn() -> Self {
        Self::new(errno::EFAULT, "Cannot spawn task executor")
    }

    /// The error for tasks left unfinished by a previous dispatcher lifetime.
    pub fn owning_process_died() -> Self {
        Self::new(errno::EINTR, "dispatcher process died")
    }

    /// The error for tasks waiting on a resource that can never be granted.
    pub fn deadlock() -> Self {
        Self::new(errno::EDEADLK, "Resource deadlock avoided")
            .with_kind(ErrorKind::TaskAbortException)
    }

    pub fn with_kind(mut self, kind: ErrorKind) -> Self {
        self.kind = kind;
        self
    }

    pub fn with_extra(mut self, extra: Value) -> Self {
        self.extra = Some(extra);
        self
    }

    pub fn with_stacktrace(mut self, stacktrace: impl Into<String>) -> Self {
        self.stacktrace = Some(stacktrace.into());
        self
    }

    /// Returns true if the error represents a cancellation.
    pub fn is_abort(&self) -> bool {
        self.kind == ErrorKind::TaskAbortException
    }

    /// Decode the offending fields of a validation error.
    pub fn validation_issues(&self) -> Vec<ValidationIssue> {
        match (&self.kind, &self.extra) {
            (ErrorKind::ValidationException, Some(extra)) => {
                serde_json::from_value(extra.clone()).unwrap_or_default()
            }
            _ => Vec::new(),
        }
    }
}

impl fmt::Display for TaskError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.code, self.message)
    }
}

impl std::error::Error for TaskError {}

impl From<CoreError> for TaskError {
    fn from(err: CoreError) -> Self {
        let code = match &err {
            CoreError::UnknownTaskType(_) | CoreError::InvalidInput(_) => errno::EINVAL,
            CoreError::TaskNotFound(_) | CoreError::ClassNotFound { .. } => errno::ENOENT,
            _ => errno::EFAULT,
        };
        TaskError::new(code, err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_validation_issues_round_trip_through_extra() {
        let err = TaskError::validation(vec![ValidationIssue {
            path: vec![json!(0), json!("name")],
            code: errno::EINVAL,
            message: "expected string".to_string(),
        }]);

        assert_eq!(err.kind, ErrorKind::ValidationException);
        assert_eq!(err.code, errno::EBADMSG);
        let issues = err.validation_issues();
        assert_eq!(issues.len(), 1);
        assert_eq!(issues[0].path, vec![json!(0), json!("name")]);
    }

    #[test]
    fn test_deadlock_is_abort() {
        let err = TaskError::deadlock();
        assert!(err.is_abort());
        assert_eq!(err.code, errno::EDEADLK);
    }

    #[test]
    fn test_serialized_kind_field_is_named_type() {
        let err = TaskError::verify(errno::EBUSY, "disk in use");
        let value = serde_json::to_value(&err).unwrap();
        assert_eq!(value["type"], "VerifyException");
        assert!(value.get("stacktrace").is_none());
    }
}
