//! Error types for the control channel.

use taskd_core::{errno, TaskError};
use thiserror::Error;

/// Errors that can occur on a control-channel peer.
#[derive(Debug, Error)]
pub enum ProtoError {
    /// Reading or writing the underlying stream failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// The remote end went away before answering.
    #[error("Channel closed")]
    ChannelClosed,

    /// Timeout waiting for response.
    #[error("Timeout waiting for response")]
    Timeout,

    /// The remote handler answered with an error.
    #[error("Remote error: {0}")]
    Remote(TaskError),

    /// The remote answered with a response of the wrong shape.
    #[error("Unexpected response to {0}")]
    UnexpectedResponse(&'static str),
}

impl ProtoError {
    /// Returns true if the failure means the channel itself is unusable.
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            ProtoError::Io(_) | ProtoError::ChannelClosed | ProtoError::Timeout
        )
    }
}

impl From<ProtoError> for TaskError {
    fn from(err: ProtoError) -> Self {
        match err {
            ProtoError::Remote(e) => e,
            ProtoError::Timeout => TaskError::new(errno::ETIMEDOUT, err.to_string()),
            other => TaskError::new(errno::EFAULT, other.to_string()),
        }
    }
}
