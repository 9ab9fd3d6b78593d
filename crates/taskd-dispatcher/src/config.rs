//! Dispatcher configuration.

use std::path::PathBuf;
use std::time::Duration;

use taskd_proto::DEFAULT_SOCKET_PATH;

/// Dispatcher configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Unix socket the control server listens on and workers dial back to.
    pub socket_path: PathBuf,

    /// Worker runner executable spawned for every executor slot.
    pub worker_path: PathBuf,

    /// Directory of the file-backed task store. `None` keeps tasks in memory.
    pub store_dir: Option<PathBuf>,

    /// Delay before a dead worker process is respawned.
    pub respawn_delay: Duration,

    /// How often running tasks are polled for progress.
    pub poll_interval: Duration,

    /// Timeout of a single `get_status` round-trip.
    pub status_timeout: Duration,

    /// How long a new executor may take to check in.
    pub checkin_timeout: Duration,

    /// Upper bound on executors serving top-level tasks. `None` grows on
    /// demand. Subtasks and hooks may grow the pool past it.
    pub max_executors: Option<usize>,

    /// `host:port` of a debugger every task attaches to.
    pub debugger: Option<String>,

    /// Store worker stdout/stderr in the task record.
    pub capture_output: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            socket_path: PathBuf::from(DEFAULT_SOCKET_PATH),
            worker_path: PathBuf::from("/usr/local/libexec/taskd-worker"),
            store_dir: None,
            respawn_delay: Duration::from_secs(1),
            poll_interval: Duration::from_secs(1),
            status_timeout: Duration::from_secs(5),
            checkin_timeout: Duration::from_secs(30),
            max_executors: None,
            debugger: None,
            capture_output: true,
        }
    }
}
