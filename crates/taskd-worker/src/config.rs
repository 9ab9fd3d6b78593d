//! Worker configuration.

use std::path::PathBuf;

use taskd_core::ExecutorKey;
use taskd_proto::DEFAULT_SOCKET_PATH;

/// Worker configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Dispatcher control socket.
    pub socket_path: PathBuf,

    /// Key the dispatcher passed on our command line.
    pub key: ExecutorKey,
}

impl Config {
    pub fn new(key: impl Into<ExecutorKey>) -> Self {
        Self {
            socket_path: PathBuf::from(DEFAULT_SOCKET_PATH),
            key: key.into(),
        }
    }

    pub fn with_socket(mut self, socket_path: impl Into<PathBuf>) -> Self {
        self.socket_path = socket_path.into();
        self
    }
}
