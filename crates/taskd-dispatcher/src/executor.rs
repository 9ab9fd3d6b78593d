//! One worker-process slot.
//!
//! An [`Executor`] keeps a worker process alive for as long as it exists:
//! the respawn loop restarts the process whenever it exits. The process dials
//! back to the dispatcher and checks in with the executor's key, after which
//! the executor drives it over the control channel.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde_json::Value;
use taskd_core::{ExecutorKey, ResourceUsage, TaskError, TaskState, TaskStatus, WorkerState};
use taskd_proto::{Peer, ProtoError, Request, Response, RunRequest, StatusReport};
use tokio::sync::{oneshot, watch, Notify};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::spawner::{OutputBuffer, WorkerSpawner};
use crate::task::TaskHandle;

/// Timing knobs of an executor.
#[derive(Debug, Clone)]
pub struct ExecutorSettings {
    pub respawn_delay: Duration,
    pub status_timeout: Duration,
    pub capture_output: bool,
}

#[derive(Default)]
struct ExecutorInner {
    conn: Option<Arc<Peer>>,
    pid: Option<u32>,
    task: Option<Arc<TaskHandle>>,
    result_tx: Option<oneshot::Sender<Result<Value, TaskError>>>,
    /// Kills the current process when cancelled.
    kill: Option<CancellationToken>,
}

pub struct Executor {
    key: ExecutorKey,
    settings: ExecutorSettings,
    spawner: Arc<dyn WorkerSpawner>,
    inner: Mutex<ExecutorInner>,
    state: watch::Sender<WorkerState>,
    /// Woken whenever this executor becomes idle.
    idle: Arc<Notify>,
    output: OutputBuffer,
    shutdown: CancellationToken,
}

impl Executor {
    /// Create an executor and start its respawn loop.
    pub fn start(
        settings: ExecutorSettings,
        spawner: Arc<dyn WorkerSpawner>,
        idle: Arc<Notify>,
    ) -> Arc<Self> {
        let (state, _) = watch::channel(WorkerState::Starting);
        let executor = Arc::new(Self {
            key: ExecutorKey::generate(),
            settings,
            spawner,
            inner: Mutex::new(ExecutorInner::default()),
            state,
            idle,
            output: OutputBuffer::new(),
            shutdown: CancellationToken::new(),
        });

        let this = Arc::clone(&executor);
        tokio::spawn(async move { this.respawn_loop().await });
        executor
    }

    fn lock(&self) -> MutexGuard<'_, ExecutorInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn key(&self) -> &ExecutorKey {
        &self.key
    }

    pub fn state(&self) -> WorkerState {
        *self.state.borrow()
    }

    pub fn pid(&self) -> Option<u32> {
        self.lock().pid
    }

    pub fn current_task(&self) -> Option<Arc<TaskHandle>> {
        self.lock().task.clone()
    }

    pub fn is_dead(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    async fn respawn_loop(self: Arc<Self>) {
        while !self.shutdown.is_cancelled() {
            let kill = CancellationToken::new();
            self.lock().kill = Some(kill.clone());
            self.output.take();

            match self.spawner.spawn(&self.key, self.output.clone()).await {
                Ok(mut process) => {
                    self.lock().pid = process.pid();
                    info!(executor = %self.key, pid = ?process.pid(), "Worker process started");

                    let exit = tokio::select! {
                        exit = process.wait() => exit,
                        _ = kill.cancelled() => {
                            if let Err(e) = process.start_kill() {
                                warn!(executor = %self.key, error = %e, "Cannot kill worker process");
                            }
                            process.wait().await
                        }
                    };
                    match exit {
                        Ok(code) => info!(executor = %self.key, ?code, "Worker process exited"),
                        Err(e) => warn!(executor = %self.key, error = %e, "Lost track of worker process"),
                    }
                    self.process_exited(TaskError::executor_died()).await;
                }
                Err(e) => {
                    error!(executor = %self.key, error = %e, "Cannot spawn worker process");
                    self.process_exited(TaskError::cannot_spawn()).await;
                }
            }

            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = tokio::time::sleep(self.settings.respawn_delay) => {}
            }
        }
        debug!(executor = %self.key, "Respawn loop stopped");
    }

    /// Resolve the running task (if any) with `error` and go back to STARTING.
    async fn process_exited(&self, error: TaskError) {
        let (conn, result_tx, task) = {
            let mut inner = self.lock();
            inner.pid = None;
            inner.kill = None;
            (inner.conn.take(), inner.result_tx.take(), inner.task.clone())
        };
        self.state.send_replace(WorkerState::Starting);

        if let Some(conn) = conn {
            conn.close().await;
        }
        if let Some(tx) = result_tx {
            if let Some(task) = &task {
                error!(
                    task_id = %task.id(),
                    executor = %self.key,
                    "Executor died while running task"
                );
            }
            let _ = tx.send(Err(error));
        }
    }

    /// Terminate the current worker process. The respawn loop brings up a
    /// fresh one unless the executor is dead.
    pub fn kill(&self) {
        if let Some(kill) = &self.lock().kill {
            kill.cancel();
        }
    }

    /// Stop the respawn loop and terminate the process.
    pub fn die(&self) {
        info!(executor = %self.key, "Executor shutting down");
        self.shutdown.cancel();
        self.kill();
    }

    /// The worker process connected and presented our key.
    pub fn checkin(&self, conn: Arc<Peer>) {
        let pid = {
            let mut inner = self.lock();
            inner.conn = Some(conn);
            inner.pid
        };
        info!(executor = %self.key, ?pid, "Worker checked in");
        self.state.send_replace(WorkerState::Idle);
        self.idle.notify_waiters();
    }

    /// The control channel of `conn` closed.
    pub fn connection_lost(&self, conn: &Arc<Peer>) {
        let current = {
            let mut inner = self.lock();
            let current = inner.conn.as_ref().is_some_and(|c| Arc::ptr_eq(c, conn));
            if current {
                inner.conn = None;
            }
            current
        };
        if current {
            warn!(executor = %self.key, "Control channel lost, killing worker process");
            self.kill();
        }
    }

    /// Take an idle executor for a task. Returns false if it is not idle.
    pub fn try_claim(&self) -> bool {
        self.state.send_if_modified(|state| {
            if *state == WorkerState::Idle {
                *state = WorkerState::Executing;
                true
            } else {
                false
            }
        })
    }

    /// Give back a claimed executor that ended up not running anything.
    pub fn release_claim(&self) {
        let released = self.state.send_if_modified(|state| {
            if *state == WorkerState::Executing {
                *state = WorkerState::Idle;
                true
            } else {
                false
            }
        });
        if released {
            self.idle.notify_waiters();
        }
    }

    /// Wait until the worker process has checked in, or `timeout` elapses.
    pub async fn wait_checked_in(&self, timeout: Duration) -> bool {
        let mut rx = self.state.subscribe();
        let ready = rx.wait_for(|state| *state != WorkerState::Starting);
        let checked_in = matches!(tokio::time::timeout(timeout, ready).await, Ok(Ok(_)));
        checked_in
    }

    /// Run `task` on the worker process and settle it in a terminal state.
    /// The executor must have been claimed.
    pub async fn run(self: &Arc<Self>, task: &Arc<TaskHandle>, request: RunRequest) {
        let (result_tx, result_rx) = oneshot::channel();
        let conn = {
            let mut inner = self.lock();
            inner.task = Some(Arc::clone(task));
            inner.result_tx = Some(result_tx);
            inner.conn.clone()
        };
        task.set_executor(self);
        self.output.take();
        info!(task_id = %task.id(), executor = %self.key, pid = ?self.pid(), "Running task");

        match conn {
            Some(conn) => {
                if let Err(e) = conn.call(Request::Run(request)).await {
                    error!(task_id = %task.id(), executor = %self.key, error = %e, "Cannot start task on worker");
                    self.kill();
                }
            }
            None => {
                error!(task_id = %task.id(), executor = %self.key, "Executor has no control channel");
                self.kill();
            }
        }

        let outcome = match result_rx.await {
            Ok(outcome) => outcome,
            Err(_) => Err(TaskError::executor_died()),
        };

        if self.settings.capture_output {
            task.set_output(self.output.take());
        }

        match outcome {
            Ok(result) => {
                info!(task_id = %task.id(), "Task finished");
                task.finish(TaskState::Finished, Some(result), None);
            }
            Err(e) if e.is_abort() => {
                info!(task_id = %task.id(), "Task aborted");
                task.finish(TaskState::Aborted, None, Some(e));
            }
            Err(e) => {
                warn!(task_id = %task.id(), error = %e, "Task failed");
                task.finish(TaskState::Failed, None, Some(e));
            }
        }

        {
            let mut inner = self.lock();
            inner.task = None;
            inner.result_tx = None;
        }
        self.release_claim();
    }

    /// Poll the worker for progress. A worker that does not answer is
    /// considered wedged and is killed.
    pub async fn get_status(&self) -> Option<TaskStatus> {
        let conn = self.lock().conn.clone()?;
        match conn
            .call_timeout(Request::GetStatus, self.settings.status_timeout)
            .await
        {
            Ok(Response::Status(status)) => status,
            Ok(_) => None,
            Err(e) => {
                error!(executor = %self.key, error = %e, "Cannot obtain task status, killing worker");
                self.kill();
                None
            }
        }
    }

    /// Inbound result or state report for the current task.
    pub fn put_status(&self, report: StatusReport) -> Result<(), TaskError> {
        let pid = self.pid();
        let task = self
            .current_task()
            .ok_or_else(|| TaskError::internal("put_status without a running task"))?;

        if let Some(rusage) = pid.and_then(sample_rusage) {
            task.set_rusage(rusage);
        }

        let outcome = match report.state {
            TaskState::Rollback => {
                task.set_state(TaskState::Rollback, None, None);
                return Ok(());
            }
            TaskState::Finished => Ok(report.result.unwrap_or(Value::Null)),
            TaskState::Aborted => Err(report.error.unwrap_or_else(|| TaskError::aborted("Aborted"))),
            TaskState::Failed => Err(report
                .error
                .unwrap_or_else(|| TaskError::internal("Task failed without an error"))),
            other => {
                return Err(TaskError::internal(format!(
                    "Invalid reported state {}",
                    other
                )))
            }
        };

        if let Some(tx) = self.lock().result_tx.take() {
            let _ = tx.send(outcome);
        }
        Ok(())
    }

    pub fn put_warning(&self, warning: TaskError) -> Result<(), TaskError> {
        let task = self
            .current_task()
            .ok_or_else(|| TaskError::internal("put_warning without a running task"))?;
        task.add_warning(warning);
        Ok(())
    }

    pub fn put_progress(&self, status: TaskStatus) -> Result<(), TaskError> {
        let task = self
            .current_task()
            .ok_or_else(|| TaskError::internal("put_progress without a running task"))?;
        task.set_progress(status);
        Ok(())
    }

    /// Ask the worker to abort the current task, killing the process if the
    /// request cannot be delivered or is refused.
    pub async fn abort(&self) {
        info!(executor = %self.key, "Trying to abort task");
        let conn = self.lock().conn.clone();
        let result = match conn {
            Some(conn) => conn.call(Request::Abort).await,
            None => Err(ProtoError::ChannelClosed),
        };
        if let Err(e) = result {
            warn!(executor = %self.key, error = %e, "Failed to abort task gracefully, killing worker");
            self.kill();
        }
    }
}

/// CPU time and RSS of `pid`, from procfs.
#[cfg(target_os = "linux")]
fn sample_rusage(pid: u32) -> Option<ResourceUsage> {
    let ticks = clock_ticks()? as f64;
    let stat = std::fs::read_to_string(format!("/proc/{}/stat", pid)).ok()?;
    let (utime, stime) = parse_cpu_ticks(&stat)?;
    let status = std::fs::read_to_string(format!("/proc/{}/status", pid)).ok()?;
    Some(ResourceUsage {
        utime: utime as f64 / ticks,
        stime: stime as f64 / ticks,
        rss: parse_vm_rss(&status)?,
    })
}

#[cfg(not(target_os = "linux"))]
fn sample_rusage(_pid: u32) -> Option<ResourceUsage> {
    None
}

/// Unit of the CPU times in `/proc/<pid>/stat`, taken from the
/// `AT_CLKTCK` entry of our own auxiliary vector.
#[cfg(target_os = "linux")]
fn clock_ticks() -> Option<u64> {
    use std::sync::OnceLock;

    const AT_CLKTCK: usize = 17;
    static TICKS: OnceLock<Option<u64>> = OnceLock::new();

    *TICKS.get_or_init(|| {
        let auxv = std::fs::read("/proc/self/auxv").ok()?;
        let mut words = auxv
            .chunks_exact(std::mem::size_of::<usize>())
            .filter_map(|word| word.try_into().ok().map(usize::from_ne_bytes));
        while let (Some(key), Some(value)) = (words.next(), words.next()) {
            if key == AT_CLKTCK && value > 0 {
                return Some(value as u64);
            }
        }
        None
    })
}

/// `utime` and `stime` ticks from a `/proc/<pid>/stat` line.
#[cfg(any(target_os = "linux", test))]
fn parse_cpu_ticks(stat: &str) -> Option<(u64, u64)> {
    // Fields after the parenthesised command name, which may contain spaces.
    let rest = stat.get(stat.rfind(')')? + 2..)?;
    let fields: Vec<&str> = rest.split_whitespace().collect();
    Some((fields.get(11)?.parse().ok()?, fields.get(12)?.parse().ok()?))
}

/// Resident set size in bytes from a `/proc/<pid>/status` document.
#[cfg(any(target_os = "linux", test))]
fn parse_vm_rss(status: &str) -> Option<u64> {
    let line = status.lines().find(|l| l.starts_with("VmRSS:"))?;
    let mut parts = line["VmRSS:".len()..].split_whitespace();
    let amount: u64 = parts.next()?.parse().ok()?;
    match parts.next() {
        Some("kB") | None => Some(amount * 1024),
        Some(_) => None,
    }
}
