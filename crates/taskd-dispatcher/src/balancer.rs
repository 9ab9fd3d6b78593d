//! The balancer: admission, resource-gated scheduling, and executor pool.
//!
//! Submissions are admitted one at a time by the distribution loop, which
//! validates arguments, runs `verify()` to learn each task's resources, and
//! parks the task in WAITING. [`Balancer::schedule_tasks`] starts every
//! waiting task whose resources are all free, each on its own executor.

use std::collections::BTreeMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex as StdMutex, MutexGuard, PoisonError};

use serde_json::json;
use taskd_core::{
    Args, CoreError, Environment, ErrorKind, ExecutorKey, Registry, SubtaskOutcome, Task,
    TaskEnv, TaskError, TaskId, TaskState, TaskType,
};
use taskd_proto::Peer;
use thiserror::Error;
use tokio::sync::{mpsc, Mutex, Notify};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::events::{EventBus, TASK_INTERNAL_ERROR};
use crate::executor::{Executor, ExecutorSettings};
use crate::resources::ResourceGraph;
use crate::schema::{params_schema, SchemaValidator};
use crate::spawner::WorkerSpawner;
use crate::store::{StoreError, TaskStore};
use crate::task::TaskHandle;

/// Balancer errors.
#[derive(Debug, Error)]
pub enum BalancerError {
    #[error("Unknown task type {0}")]
    UnknownTaskType(String),

    #[error("Task not found: {0}")]
    TaskNotFound(TaskId),

    #[error("Invalid arguments: {0}")]
    InvalidArgs(String),

    #[error("Unknown executor key {0}")]
    UnknownExecutor(ExecutorKey),

    #[error("Balancer is not running")]
    NotRunning,

    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}

impl From<CoreError> for BalancerError {
    fn from(err: CoreError) -> Self {
        match err {
            CoreError::UnknownTaskType(name) => BalancerError::UnknownTaskType(name),
            other => BalancerError::InvalidArgs(other.to_string()),
        }
    }
}

impl From<BalancerError> for TaskError {
    fn from(err: BalancerError) -> Self {
        use taskd_core::errno;
        let code = match &err {
            BalancerError::UnknownTaskType(_) | BalancerError::InvalidArgs(_) => errno::EINVAL,
            BalancerError::TaskNotFound(_) | BalancerError::UnknownExecutor(_) => errno::ENOENT,
            BalancerError::NotRunning | BalancerError::Store(_) => errno::EFAULT,
        };
        TaskError::new(code, err.to_string())
    }
}

/// Who submits a task, and how.
#[derive(Debug, Clone, Default)]
pub struct Submission {
    pub user: Option<String>,
    pub session_id: Option<String>,
    /// Enforce `readOnly` fields of the parameter schema.
    pub strict: bool,
    pub environment: Environment,
}

impl Submission {
    pub fn user(user: impl Into<String>) -> Self {
        Self {
            user: Some(user.into()),
            ..Self::default()
        }
    }
}

/// Collaborators a balancer is built from.
pub struct BalancerDeps {
    pub registry: Arc<Registry>,
    pub validator: Arc<dyn SchemaValidator>,
    pub store: Arc<dyn TaskStore>,
    pub bus: Arc<dyn EventBus>,
    pub spawner: Arc<dyn WorkerSpawner>,
}

pub struct Balancer {
    config: Config,
    registry: Arc<Registry>,
    validator: Arc<dyn SchemaValidator>,
    store: Arc<dyn TaskStore>,
    bus: Arc<dyn EventBus>,
    spawner: Arc<dyn WorkerSpawner>,
    resources: ResourceGraph,
    /// Every task of this lifetime, queued ones included, by id.
    task_list: StdMutex<BTreeMap<TaskId, Arc<TaskHandle>>>,
    /// Serializes admission and scheduling passes.
    distribution_lock: Mutex<()>,
    queue_tx: mpsc::UnboundedSender<Arc<TaskHandle>>,
    queue_rx: StdMutex<Option<mpsc::UnboundedReceiver<Arc<TaskHandle>>>>,
    executors: StdMutex<Vec<Arc<Executor>>>,
    executor_idle: Arc<Notify>,
    shutdown: CancellationToken,
}

impl Balancer {
    /// Build a balancer, failing every task a previous lifetime left active.
    pub fn new(config: Config, deps: BalancerDeps) -> Result<Arc<Self>, BalancerError> {
        let (queue_tx, queue_rx) = mpsc::unbounded_channel();
        let balancer = Arc::new(Self {
            config,
            registry: deps.registry,
            validator: deps.validator,
            store: deps.store,
            bus: deps.bus,
            spawner: deps.spawner,
            resources: ResourceGraph::new(),
            task_list: StdMutex::new(BTreeMap::new()),
            distribution_lock: Mutex::new(()),
            queue_tx,
            queue_rx: StdMutex::new(Some(queue_rx)),
            executors: StdMutex::new(Vec::new()),
            executor_idle: Arc::new(Notify::new()),
            shutdown: CancellationToken::new(),
        });
        balancer.recover_stale_tasks()?;
        Ok(balancer)
    }

    fn recover_stale_tasks(&self) -> Result<(), BalancerError> {
        let stale = self.store.query(&[
            TaskState::Executing,
            TaskState::Rollback,
            TaskState::Waiting,
            TaskState::Created,
        ])?;
        for mut task in stale {
            info!(task_id = %task.id, name = %task.name, state = %task.state, "Stale task being set to FAILED");
            task.error = Some(TaskError::owning_process_died());
            task.set_state(TaskState::Failed);
            self.store.save(&task)?;
        }
        Ok(())
    }

    fn tasks(&self) -> MutexGuard<'_, BTreeMap<TaskId, Arc<TaskHandle>>> {
        self.task_list.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn executor_list(&self) -> MutexGuard<'_, Vec<Arc<Executor>>> {
        self.executors.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn resources(&self) -> &ResourceGraph {
        &self.resources
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Start the distribution loop.
    pub fn start(self: &Arc<Self>) -> Result<JoinHandle<()>, BalancerError> {
        let mut rx = self
            .queue_rx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .ok_or(BalancerError::NotRunning)?;
        let this = Arc::clone(self);
        info!("Balancer started");
        Ok(tokio::spawn(async move {
            loop {
                let task = tokio::select! {
                    _ = this.shutdown.cancelled() => break,
                    task = rx.recv() => match task {
                        Some(task) => task,
                        None => break,
                    },
                };
                this.admit(task).await;
            }
            debug!("Distribution loop stopped");
        }))
    }

    /// Stop the distribution loop and every executor.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
        for executor in self.executor_list().drain(..) {
            executor.die();
        }
    }

    /// Queue a task. Returns as soon as the task is persisted.
    pub fn submit(
        &self,
        name: &str,
        args: Args,
        submission: Submission,
    ) -> Result<TaskId, BalancerError> {
        let task_type = self.registry.get(name).map_err(|e| {
            warn!(name, "Cannot submit task: unknown task type");
            BalancerError::from(e)
        })?;
        args.validate_keys()?;

        let mut task = Task::new(self.store.next_id()?, name, args);
        task.user = submission.user;
        task.session_id = submission.session_id;
        task.debugger = self.config.debugger.is_some();

        let handle = TaskHandle::new(
            task,
            task_type,
            submission.environment,
            submission.strict,
            Arc::clone(&self.store),
            Arc::clone(&self.bus),
        );
        let id = handle.id();
        handle.created();
        self.tasks().insert(id, Arc::clone(&handle));
        self.queue_tx
            .send(handle)
            .map_err(|_| BalancerError::NotRunning)?;
        info!(task_id = %id, name, "Task submitted");
        Ok(id)
    }

    /// Schema validation and `verify()` for one task type.
    fn verify(
        &self,
        task_type: &TaskType,
        args: &Args,
        env: &TaskEnv,
        strict: bool,
    ) -> Result<Verified, TaskError> {
        if let Some(schema) = &task_type.params_schema {
            let issues = self
                .validator
                .validate(&params_schema(schema), &args.to_value(), strict);
            if !issues.is_empty() {
                return Err(TaskError::validation(issues));
            }
        }

        let instance = task_type.instantiate(env);
        let resources = match catch_unwind(AssertUnwindSafe(|| instance.verify(args))) {
            Ok(resources) => resources?,
            Err(_) => {
                let err = TaskError::internal(format!("{}: verify() panicked", task_type.name));
                self.report_error(&err.message, &err);
                return Err(err);
            }
        };
        Ok(Verified {
            resources,
            description: instance.describe(args),
            abortable: instance.as_abortable().is_some(),
        })
    }

    async fn admit(self: &Arc<Self>, task: Arc<TaskHandle>) {
        {
            let _guard = self.distribution_lock.lock().await;
            if task.state() != TaskState::Created {
                debug!(task_id = %task.id(), "Skipping task that ended while queued");
                return;
            }
            debug!(task_id = %task.id(), name = %task.name(), "Picked up task");

            let env = TaskEnv {
                task_id: task.id(),
                user: task.user(),
                environment: task.environment().clone(),
            };
            match self.verify(task.task_type(), &task.args(), &env, task.is_strict()) {
                Ok(verified) => {
                    debug!(task_id = %task.id(), resources = ?verified.resources, "Task verified");
                    task.set_verified(verified.resources, verified.description, verified.abortable);
                    task.set_state(TaskState::Waiting, None, None);
                }
                Err(e) => {
                    warn!(task_id = %task.id(), error = %e, "Cannot verify task");
                    if !matches!(
                        e.kind,
                        ErrorKind::VerifyException | ErrorKind::ValidationException | ErrorKind::InternalError
                    ) {
                        self.report_error(
                            &format!("Task {} verify() raised an invalid exception", task.name()),
                            &e,
                        );
                    }
                    task.fail(e);
                    return;
                }
            }
        }
        self.schedule_tasks(false).await;
    }

    /// Start every waiting task whose resources are free. When nothing can
    /// start and nothing is running, abort waiting tasks that need a
    /// resource missing from the graph: no exit will ever free it.
    pub async fn schedule_tasks(self: &Arc<Self>, on_exit: bool) {
        let (started, deadlocked) = {
            let _guard = self.distribution_lock.lock().await;
            let tasks: Vec<Arc<TaskHandle>> = self.tasks().values().cloned().collect();

            let mut started = Vec::new();
            for task in tasks.iter().filter(|t| t.state() == TaskState::Waiting) {
                if !self.resources.acquire(&task.resources()) {
                    continue;
                }
                task.set_holds_resources(true);
                task.set_state(TaskState::Executing, None, None);
                started.push(Arc::clone(task));
            }

            let mut deadlocked = Vec::new();
            let running = tasks.iter().any(|t| t.state().is_running());
            if started.is_empty() && !running {
                for task in tasks.iter().filter(|t| t.state() == TaskState::Waiting) {
                    let missing = self.resources.missing(&task.resources());
                    if !missing.is_empty() {
                        warn!(task_id = %task.id(), ?missing, on_exit, "Resource deadlock avoided");
                        deadlocked.push(Arc::clone(task));
                    }
                }
            }
            (started, deadlocked)
        };

        for task in deadlocked {
            task.finish(TaskState::Aborted, None, Some(TaskError::deadlock()));
        }
        for task in started {
            self.start_task(task);
        }
    }

    fn start_task(self: &Arc<Self>, task: Arc<TaskHandle>) {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            match this.assign_executor(task.parent().is_some()).await {
                Ok(executor) => {
                    task.set_executor(&executor);
                    if task.abort_requested() {
                        executor.release_claim();
                        task.finish(TaskState::Aborted, None, Some(TaskError::aborted("Aborted")));
                    } else {
                        let watcher = this.progress_watcher(&task, &executor);
                        executor
                            .run(&task, task.run_request(this.config.debugger.clone()))
                            .await;
                        watcher.abort();
                    }
                }
                Err(e) => {
                    error!(task_id = %task.id(), error = %e, "Cannot assign executor");
                    task.fail(e);
                }
            }
            this.task_exited(&task).await;
        });
    }

    fn progress_watcher(&self, task: &Arc<TaskHandle>, executor: &Arc<Executor>) -> JoinHandle<()> {
        let task = Arc::clone(task);
        let executor = Arc::clone(executor);
        let interval = self.config.poll_interval;
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = task.wait_ended() => return,
                    _ = tokio::time::sleep(interval) => {}
                }
                let running_here = executor
                    .current_task()
                    .is_some_and(|t| Arc::ptr_eq(&t, &task));
                if !running_here {
                    continue;
                }
                if let Some(progress) = executor.get_status().await {
                    task.set_progress(progress);
                }
            }
        })
    }

    /// Release the task's resources and re-evaluate waiting tasks.
    pub async fn task_exited(self: &Arc<Self>, task: &Arc<TaskHandle>) {
        if task.take_holds_resources() {
            self.resources.release(&task.resources());
        }
        debug!(task_id = %task.id(), state = %task.state(), "Task exited");
        self.schedule_tasks(true).await;
    }

    /// Claim the first idle executor, creating one if the pool may grow.
    /// Subtasks are not bound by `max_executors`: their parent holds an
    /// executor while it waits for them.
    pub async fn assign_executor(&self, subtask: bool) -> Result<Arc<Executor>, TaskError> {
        loop {
            if self.shutdown.is_cancelled() {
                return Err(TaskError::cannot_spawn());
            }

            let idle = self.executor_idle.notified();
            tokio::pin!(idle);
            idle.as_mut().enable();

            let fresh = {
                let mut executors = self.executor_list();
                if let Some(executor) = executors.iter().find(|e| e.try_claim()) {
                    return Ok(Arc::clone(executor));
                }
                let can_grow = subtask
                    || self
                        .config
                        .max_executors
                        .map_or(true, |max| executors.len() < max);
                if can_grow {
                    let executor = Executor::start(
                        self.executor_settings(),
                        Arc::clone(&self.spawner),
                        Arc::clone(&self.executor_idle),
                    );
                    debug!(executor = %executor.key(), pool = executors.len() + 1, "Created executor");
                    executors.push(Arc::clone(&executor));
                    Some(executor)
                } else {
                    None
                }
            };

            match fresh {
                Some(executor) => {
                    if !executor.wait_checked_in(self.config.checkin_timeout).await {
                        error!(executor = %executor.key(), "Executor did not check in");
                        return Err(TaskError::cannot_spawn());
                    }
                    if executor.try_claim() {
                        return Ok(executor);
                    }
                }
                None => idle.await,
            }
        }
    }

    fn executor_settings(&self) -> ExecutorSettings {
        ExecutorSettings {
            respawn_delay: self.config.respawn_delay,
            status_timeout: self.config.status_timeout,
            capture_output: self.config.capture_output,
        }
    }

    pub fn executor_by_key(&self, key: &ExecutorKey) -> Option<Arc<Executor>> {
        self.executor_list().iter().find(|e| e.key() == key).cloned()
    }

    pub fn executors(&self) -> Vec<Arc<Executor>> {
        self.executor_list().clone()
    }

    /// Bind a worker connection to the executor owning `key`.
    pub fn checkin(&self, key: &ExecutorKey, conn: Arc<Peer>) -> Result<Arc<Executor>, BalancerError> {
        let executor = self
            .executor_by_key(key)
            .ok_or_else(|| BalancerError::UnknownExecutor(key.clone()))?;
        executor.checkin(conn);
        Ok(executor)
    }

    /// Validate and verify a subtask on behalf of a running task.
    pub fn verify_subtask(&self, name: &str, args: &Args) -> Result<Vec<String>, TaskError> {
        let task_type = self.registry.get(name)?;
        args.validate_keys()?;
        let env = TaskEnv::default();
        self.verify(&task_type, args, &env, false).map(|v| v.resources)
    }

    /// Create and start a subtask of `parent`. Validation and `verify()` run
    /// here, in the caller's request; the subtask does not take resources.
    pub async fn run_subtask(
        self: &Arc<Self>,
        parent: &Arc<TaskHandle>,
        name: &str,
        args: Args,
        env: Option<Environment>,
    ) -> Result<TaskId, TaskError> {
        let task_type = self.registry.get(name)?;
        args.validate_keys()?;

        let mut environment = parent.environment().clone();
        environment.extend(env.unwrap_or_default());

        let parent_record = parent.snapshot();
        let mut task = Task::new(self.store.next_id().map_err(BalancerError::from)?, name, args);
        task.parent = Some(parent_record.id);
        task.user = parent_record.user;
        task.session_id = parent_record.session_id;
        task.debugger = parent_record.debugger;

        let env = TaskEnv {
            task_id: task.id,
            user: task.user.clone(),
            environment: environment.clone(),
        };
        let verified = self.verify(&task_type, &task.args, &env, false)?;

        let handle = TaskHandle::new(
            task,
            task_type,
            environment,
            false,
            Arc::clone(&self.store),
            Arc::clone(&self.bus),
        );
        let id = handle.id();
        handle.set_verified(verified.resources, verified.description, verified.abortable);
        handle.created();
        parent.add_subtask(id);
        info!(task_id = %id, parent = %parent_record.id, name, "Subtask created");

        {
            let _guard = self.distribution_lock.lock().await;
            self.tasks().insert(id, Arc::clone(&handle));
            handle.set_state(TaskState::Executing, None, None);
        }
        self.start_task(handle);
        Ok(id)
    }

    /// Wait for every listed task to end.
    pub async fn join_subtasks(&self, ids: &[TaskId]) -> Result<Vec<SubtaskOutcome>, TaskError> {
        let handles = ids
            .iter()
            .map(|id| self.handle(*id).map_err(TaskError::from))
            .collect::<Result<Vec<_>, _>>()?;
        let mut outcomes = Vec::with_capacity(handles.len());
        for handle in handles {
            handle.wait_ended().await;
            outcomes.push(handle.outcome());
        }
        Ok(outcomes)
    }

    fn handle(&self, id: TaskId) -> Result<Arc<TaskHandle>, BalancerError> {
        self.tasks()
            .get(&id)
            .cloned()
            .ok_or(BalancerError::TaskNotFound(id))
    }

    /// Abort a task and, recursively, its subtasks.
    pub async fn abort(&self, id: TaskId, error: Option<TaskError>) -> Result<(), BalancerError> {
        let root = self.handle(id).map_err(|e| {
            warn!(task_id = %id, "Cannot abort task: unknown task id");
            e
        })?;

        let mut pending = vec![(root, error)];
        while let Some((task, error)) = pending.pop() {
            for sub in task.subtask_ids() {
                if let Ok(handle) = self.handle(sub) {
                    pending.push((handle, None));
                }
            }
            self.abort_one(&task, error).await;
        }
        Ok(())
    }

    async fn abort_one(&self, task: &Arc<TaskHandle>, error: Option<TaskError>) {
        let error = error.unwrap_or_else(|| TaskError::aborted("Aborted"));
        match task.state() {
            TaskState::Created | TaskState::Waiting => {
                info!(task_id = %task.id(), "Task aborted before start");
                task.finish(TaskState::Aborted, None, Some(error));
            }
            TaskState::Executing | TaskState::Rollback => match task.executor() {
                Some(executor) => executor.abort().await,
                None => task.request_abort(),
            },
            _ => debug!(task_id = %task.id(), "Task already ended"),
        }
    }

    /// The task running on `executor`, for calls a worker makes on its behalf.
    pub fn task_of(&self, executor: &Executor) -> Result<Arc<TaskHandle>, TaskError> {
        executor
            .current_task()
            .ok_or_else(|| TaskError::internal("No task is running on this executor"))
    }

    pub fn get_task(&self, id: TaskId) -> Result<Option<Task>, BalancerError> {
        if let Some(handle) = self.tasks().get(&id) {
            return Ok(Some(handle.snapshot()));
        }
        Ok(self.store.get(id)?)
    }

    /// Tasks of this lifetime, optionally filtered by state.
    pub fn get_tasks(&self, state: Option<TaskState>) -> Vec<Task> {
        self.tasks()
            .values()
            .filter(|t| state.map_or(true, |s| t.state() == s))
            .map(|t| t.snapshot())
            .collect()
    }

    pub fn get_active_tasks(&self) -> Vec<Task> {
        self.tasks()
            .values()
            .filter(|t| t.state().is_active())
            .map(|t| t.snapshot())
            .collect()
    }

    pub fn get_task_handle(&self, id: TaskId) -> Option<Arc<TaskHandle>> {
        self.handle(id).ok()
    }

    /// Flag a failure of the dispatcher's own bookkeeping.
    pub fn report_error(&self, message: &str, err: &TaskError) {
        error!(error = %err, "{}", message);
        self.bus.publish(
            TASK_INTERNAL_ERROR,
            json!({"message": message, "error": err}),
        );
    }
}

struct Verified {
    resources: Vec<String>,
    description: Option<String>,
    abortable: bool,
}
