//! taskd Core Domain Types
//!
//! This crate contains pure domain types with no dependencies on:
//! - Sockets or the control-channel wire format
//! - Process management
//! - Runtime specifics
//!
//! Both the dispatcher and the worker runner build on these types, and task
//! implementations are written against the [`plugin`] traits.

pub mod args;
pub mod error;
pub mod ids;
pub mod plugin;
pub mod registry;
pub mod status;
pub mod task;

// Re-export commonly used types
pub use args::{Args, Environment};
pub use error::{errno, CoreError, ErrorKind, TaskError, ValidationIssue};
pub use ids::{ExecutorKey, TaskId};
pub use plugin::{Abortable, Rollback, StatusReporter, TaskContext, TaskEnv, TaskPlugin};
pub use registry::{HookType, Registry, TaskFactory, TaskHook, TaskType};
pub use status::{TaskState, TaskStatus, WorkerState};
pub use task::{ResourceUsage, SubtaskOutcome, Task};
