//! Starting worker processes.
//!
//! [`WorkerSpawner`] is the seam between an executor and the operating
//! system. [`ProcessSpawner`] runs the worker executable; tests plug in a
//! spawner that runs the worker runner in-process.

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use taskd_core::ExecutorKey;
use taskd_proto::SOCKET_ENV;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tracing::debug;

/// Spawn errors.
#[derive(Debug, Error)]
pub enum SpawnError {
    #[error("Cannot spawn {path}: {source}")]
    Spawn {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Process I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

/// Lines written by a worker process to stdout and stderr.
#[derive(Debug, Clone, Default)]
pub struct OutputBuffer(Arc<Mutex<String>>);

impl OutputBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_line(&self, line: &str) {
        let mut buf = self.0.lock().unwrap_or_else(PoisonError::into_inner);
        buf.push_str(line);
        buf.push('\n');
    }

    /// Take everything collected so far, leaving the buffer empty.
    pub fn take(&self) -> String {
        std::mem::take(&mut *self.0.lock().unwrap_or_else(PoisonError::into_inner))
    }
}

/// One running worker process.
#[async_trait]
pub trait WorkerProcess: Send {
    fn pid(&self) -> Option<u32>;

    /// Wait for the process to exit, returning its exit code if it has one.
    async fn wait(&mut self) -> Result<Option<i32>, SpawnError>;

    /// Ask the operating system to terminate the process.
    fn start_kill(&mut self) -> Result<(), SpawnError>;
}

#[async_trait]
pub trait WorkerSpawner: Send + Sync {
    /// Start a worker that will check in with `key`.
    async fn spawn(
        &self,
        key: &ExecutorKey,
        output: OutputBuffer,
    ) -> Result<Box<dyn WorkerProcess>, SpawnError>;
}

/// Spawns the worker executable with the key as its only argument.
pub struct ProcessSpawner {
    worker_path: PathBuf,
    socket_path: PathBuf,
}

impl ProcessSpawner {
    pub fn new(worker_path: impl Into<PathBuf>, socket_path: impl Into<PathBuf>) -> Self {
        Self {
            worker_path: worker_path.into(),
            socket_path: socket_path.into(),
        }
    }
}

fn collect_lines<R>(reader: R, output: OutputBuffer) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            output.push_line(&line);
        }
    })
}

#[async_trait]
impl WorkerSpawner for ProcessSpawner {
    async fn spawn(
        &self,
        key: &ExecutorKey,
        output: OutputBuffer,
    ) -> Result<Box<dyn WorkerProcess>, SpawnError> {
        let mut child = Command::new(&self.worker_path)
            .arg(key.as_str())
            .env(SOCKET_ENV, &self.socket_path)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| SpawnError::Spawn {
                path: self.worker_path.clone(),
                source,
            })?;

        let mut readers = Vec::new();
        if let Some(stdout) = child.stdout.take() {
            readers.push(collect_lines(stdout, output.clone()));
        }
        if let Some(stderr) = child.stderr.take() {
            readers.push(collect_lines(stderr, output));
        }

        debug!(executor = %key, pid = ?child.id(), "Spawned worker process");
        Ok(Box::new(ChildProcess { child, readers }))
    }
}

struct ChildProcess {
    child: Child,
    readers: Vec<JoinHandle<()>>,
}

#[async_trait]
impl WorkerProcess for ChildProcess {
    fn pid(&self) -> Option<u32> {
        self.child.id()
    }

    async fn wait(&mut self) -> Result<Option<i32>, SpawnError> {
        let status = self.child.wait().await?;
        // Drain the pipes so the output is complete once we return.
        for reader in self.readers.drain(..) {
            let _ = reader.await;
        }
        Ok(status.code())
    }

    fn start_kill(&mut self) -> Result<(), SpawnError> {
        self.child.start_kill()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_output_buffer_take_empties() {
        let buf = OutputBuffer::new();
        buf.push_line("one");
        buf.push_line("two");
        assert_eq!(buf.take(), "one\ntwo\n");
        assert_eq!(buf.take(), "");
    }

    #[tokio::test]
    async fn test_missing_executable() {
        let spawner = ProcessSpawner::new("/nonexistent/taskd-worker", "/tmp/taskd.sock");
        let result = spawner
            .spawn(&ExecutorKey::generate(), OutputBuffer::new())
            .await;
        assert!(matches!(result, Err(SpawnError::Spawn { .. })));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_output_collected_until_exit() {
        // `echo` prints its single argument, here the executor key.
        let spawner = ProcessSpawner::new("echo", "/tmp/taskd.sock");
        let output = OutputBuffer::new();
        let key = ExecutorKey::new("hello-from-worker");
        let mut process = spawner.spawn(&key, output.clone()).await.unwrap();
        assert!(process.pid().is_some());
        assert_eq!(process.wait().await.unwrap(), Some(0));
        assert_eq!(output.take(), "hello-from-worker\n");
    }
}
