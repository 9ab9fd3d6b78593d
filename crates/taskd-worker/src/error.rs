//! Worker errors.

use taskd_core::{errno, CoreError, TaskError};
use taskd_proto::ProtoError;
use thiserror::Error;

/// Failures that end the worker process. Task failures are not among them:
/// those are reported to the dispatcher and the worker goes back to idle.
#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("Cannot connect to dispatcher: {0}")]
    Connect(#[source] std::io::Error),

    #[error("Check-in refused: {0}")]
    Checkin(TaskError),

    #[error("Control channel error: {0}")]
    Channel(#[from] ProtoError),

    #[error("Registry error: {0}")]
    Registry(#[from] CoreError),
}

impl WorkerError {
    /// Exit code of the worker process for this error.
    pub fn exit_code(&self) -> i32 {
        match self {
            WorkerError::Connect(_) => errno::ETIMEDOUT,
            WorkerError::Checkin(_) | WorkerError::Registry(_) => errno::EINVAL,
            WorkerError::Channel(_) => errno::EBADMSG,
        }
    }
}
