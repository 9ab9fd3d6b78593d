//! Live handle of one task inside the dispatcher.
//!
//! A [`TaskHandle`] wraps the persisted [`Task`] record. Every state change
//! and warning goes through it, is written to the store, and is announced on
//! the event bus.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use serde_json::{json, Value};
use taskd_core::{
    Args, Environment, ResourceUsage, SubtaskOutcome, Task, TaskError, TaskId, TaskState,
    TaskStatus, TaskType,
};
use taskd_proto::RunRequest;
use tokio::sync::watch;
use tracing::{debug, warn};

use crate::events::{EventBus, TASK_CHANGED, TASK_CREATED, TASK_PROGRESS, TASK_UPDATED};
use crate::executor::Executor;
use crate::store::TaskStore;

pub struct TaskHandle {
    record: Mutex<Task>,
    task_type: Arc<TaskType>,
    environment: Environment,
    strict: bool,
    abortable: AtomicBool,
    /// Set while the task holds its resources in the graph.
    holds_resources: AtomicBool,
    abort_requested: AtomicBool,
    executor: Mutex<Weak<Executor>>,
    ended: watch::Sender<bool>,
    store: Arc<dyn TaskStore>,
    bus: Arc<dyn EventBus>,
}

impl TaskHandle {
    pub fn new(
        task: Task,
        task_type: Arc<TaskType>,
        environment: Environment,
        strict: bool,
        store: Arc<dyn TaskStore>,
        bus: Arc<dyn EventBus>,
    ) -> Arc<Self> {
        let (ended, _) = watch::channel(task.state.is_terminal());
        Arc::new(Self {
            record: Mutex::new(task),
            task_type,
            environment,
            strict,
            abortable: AtomicBool::new(false),
            holds_resources: AtomicBool::new(false),
            abort_requested: AtomicBool::new(false),
            executor: Mutex::new(Weak::new()),
            ended,
            store,
            bus,
        })
    }

    fn lock(&self) -> MutexGuard<'_, Task> {
        self.record.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn id(&self) -> TaskId {
        self.lock().id
    }

    pub fn name(&self) -> String {
        self.lock().name.clone()
    }

    pub fn state(&self) -> TaskState {
        self.lock().state
    }

    pub fn args(&self) -> Args {
        self.lock().args.clone()
    }

    pub fn parent(&self) -> Option<TaskId> {
        self.lock().parent
    }

    pub fn resources(&self) -> Vec<String> {
        self.lock().resources.clone()
    }

    pub fn subtask_ids(&self) -> Vec<TaskId> {
        self.lock().subtask_ids.clone()
    }

    pub fn task_type(&self) -> &Arc<TaskType> {
        &self.task_type
    }

    pub fn environment(&self) -> &Environment {
        &self.environment
    }

    pub fn user(&self) -> Option<String> {
        self.lock().user.clone()
    }

    pub fn is_strict(&self) -> bool {
        self.strict
    }

    /// Copy of the current record.
    pub fn snapshot(&self) -> Task {
        self.lock().clone()
    }

    pub fn outcome(&self) -> SubtaskOutcome {
        self.lock().outcome()
    }

    fn persist(&self, task: &Task) {
        if let Err(e) = self.store.save(task) {
            warn!(task_id = %task.id, error = %e, "Cannot persist task");
        }
    }

    /// Persist the freshly built record and announce it.
    pub fn created(&self) {
        let task = self.snapshot();
        self.persist(&task);
        self.bus.publish(
            TASK_CREATED,
            json!({"id": task.id, "name": task.name, "state": task.state}),
        );
        self.bus
            .publish(TASK_CHANGED, json!({"operation": "create", "ids": [task.id]}));
    }

    /// Move to `state`, optionally recording progress and an error.
    pub fn set_state(&self, state: TaskState, progress: Option<TaskStatus>, error: Option<TaskError>) {
        let task = {
            let mut task = self.lock();
            if task.state.is_terminal() {
                debug!(task_id = %task.id, from = %task.state, to = %state, "Ignoring change of ended task");
                return;
            }
            if let Some(error) = error {
                task.error = Some(error);
            }
            if let Some(progress) = &progress {
                task.progress = Some(progress.clone());
            }
            task.set_state(state);
            task.clone()
        };

        debug!(task_id = %task.id, state = %state, "Task state changed");
        self.persist(&task);

        let mut event = json!({"id": task.id, "name": task.name, "state": state});
        if state == TaskState::Executing {
            event["started_at"] = json!(task.started_at);
        }
        if state == TaskState::Finished {
            event["finished_at"] = json!(task.finished_at);
            event["result"] = task.result.clone().unwrap_or(Value::Null);
        }
        self.bus.publish(TASK_UPDATED, event);
        self.bus
            .publish(TASK_CHANGED, json!({"operation": "update", "ids": [task.id]}));

        if let Some(progress) = progress {
            self.emit_progress(&task, &progress);
        }
        if state.is_terminal() {
            self.ended.send_replace(true);
        }
    }

    /// Settle the task in a terminal state.
    pub fn finish(&self, state: TaskState, result: Option<Value>, error: Option<TaskError>) {
        let progress = match state {
            TaskState::Finished => TaskStatus::new(100.0, ""),
            TaskState::Aborted => {
                let last = self.lock().progress.as_ref().map_or(0.0, |p| p.percentage);
                TaskStatus::new(last, "Aborted")
            }
            _ => {
                let message = error.as_ref().map(|e| e.message.clone()).unwrap_or_default();
                TaskStatus::new(0.0, message)
            }
        };
        if let Some(result) = result {
            self.lock().result = Some(result);
        }
        self.set_state(state, Some(progress), error);
    }

    pub fn fail(&self, error: TaskError) {
        self.finish(TaskState::Failed, None, Some(error));
    }

    pub fn add_warning(&self, warning: TaskError) {
        let task = {
            let mut task = self.lock();
            task.warnings.push(warning);
            task.clone()
        };
        self.persist(&task);
        self.bus
            .publish(TASK_CHANGED, json!({"operation": "update", "ids": [task.id]}));
    }

    /// Record and announce a progress snapshot. Not persisted.
    pub fn set_progress(&self, progress: TaskStatus) {
        let task = {
            let mut task = self.lock();
            task.progress = Some(progress.clone());
            task.clone()
        };
        self.emit_progress(&task, &progress);
    }

    fn emit_progress(&self, task: &Task, progress: &TaskStatus) {
        self.bus.publish(
            TASK_PROGRESS,
            json!({
                "id": task.id,
                "name": task.name,
                "state": task.state,
                "percentage": progress.percentage,
                "message": progress.message,
                "extra": progress.extra,
                "abortable": self.abortable.load(Ordering::Relaxed),
            }),
        );
    }

    /// Record what `verify()` produced.
    pub fn set_verified(&self, resources: Vec<String>, description: Option<String>, abortable: bool) {
        let mut task = self.lock();
        task.resources = resources;
        task.description = description;
        self.abortable.store(abortable, Ordering::Relaxed);
    }

    pub fn set_output(&self, output: String) {
        let task = {
            let mut task = self.lock();
            task.output = Some(output);
            task.clone()
        };
        self.persist(&task);
    }

    pub fn set_rusage(&self, rusage: ResourceUsage) {
        self.lock().rusage = Some(rusage);
    }

    pub fn add_subtask(&self, id: TaskId) {
        let task = {
            let mut task = self.lock();
            task.subtask_ids.push(id);
            task.clone()
        };
        self.persist(&task);
    }

    /// Human description: the instance's own once verified, the class-level
    /// one before that, and the type name as a last resort.
    pub fn get_description(&self) -> String {
        let task = self.lock();
        task.description
            .clone()
            .or_else(|| self.task_type.early_description.clone())
            .unwrap_or_else(|| task.name.clone())
    }

    pub fn is_abortable(&self) -> bool {
        self.abortable.load(Ordering::Relaxed)
    }

    pub fn set_holds_resources(&self, holds: bool) {
        self.holds_resources.store(holds, Ordering::SeqCst);
    }

    /// Clear the resource flag, returning whether it was set.
    pub fn take_holds_resources(&self) -> bool {
        self.holds_resources.swap(false, Ordering::SeqCst)
    }

    pub fn request_abort(&self) {
        self.abort_requested.store(true, Ordering::SeqCst);
    }

    pub fn abort_requested(&self) -> bool {
        self.abort_requested.load(Ordering::SeqCst)
    }

    pub fn set_executor(&self, executor: &Arc<Executor>) {
        *self.executor.lock().unwrap_or_else(PoisonError::into_inner) = Arc::downgrade(executor);
    }

    pub fn executor(&self) -> Option<Arc<Executor>> {
        self.executor
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .upgrade()
    }

    pub fn is_ended(&self) -> bool {
        *self.ended.borrow()
    }

    /// Wait until the task reaches a terminal state.
    pub async fn wait_ended(&self) {
        let mut rx = self.ended.subscribe();
        // The sender lives in `self`, so the channel cannot close here.
        let _ = rx.wait_for(|ended| *ended).await;
    }

    /// The envelope sent to a worker to run this task.
    pub fn run_request(&self, debugger: Option<String>) -> RunRequest {
        let task = self.lock();
        RunRequest {
            id: task.id,
            name: task.name.clone(),
            module: self.task_type.module.clone(),
            class_name: self.task_type.class_name.clone(),
            args: task.args.clone(),
            user: task.user.clone(),
            environment: self.environment.clone(),
            debugger: if task.debugger { debugger } else { None },
        }
    }
}
