//! The worker's task loop.
//!
//! The dispatcher hands over one run request at a time. The runner resolves
//! the implementation, runs `before` hooks, the task body and `after` hooks,
//! and reports the outcome with `put_status`. A failing body is compensated
//! with `rollback()` when the implementation has one, then `error` hooks run
//! and the failure is reported with a stack trace.

use std::backtrace::Backtrace;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use serde_json::Value;
use taskd_core::{
    errno, Args, Environment, HookType, Registry, TaskContext, TaskEnv, TaskError, TaskPlugin,
    TaskStatus,
};
use taskd_proto::{Peer, Request, RequestHandler, Response, RunRequest, StatusReport};
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

use crate::context::RemoteContext;
use crate::error::WorkerError;
use crate::loader::Loader;

/// Environment key carrying the task result to `after` hooks.
pub const RESULT_ENV: &str = "TASK_RESULT";
/// Environment key carrying the serialized failure to `error` hooks.
pub const ERROR_ENV: &str = "TASK_ERROR";

#[derive(Default)]
struct Slot {
    instance: Option<Arc<dyn TaskPlugin>>,
    context: Option<RemoteContext>,
    /// A run request is queued but has not been picked up yet.
    queued: bool,
    /// An abort arrived for the queued request.
    abort_pending: bool,
}

pub struct Runner {
    loader: Loader,
    slot: Mutex<Slot>,
    queue_tx: mpsc::Sender<RunRequest>,
    queue_rx: Mutex<Option<mpsc::Receiver<RunRequest>>>,
    /// True while a task body (or its hooks) is running.
    running: watch::Sender<bool>,
}

impl Runner {
    pub fn new(registry: Arc<Registry>) -> Arc<Self> {
        let (queue_tx, queue_rx) = mpsc::channel(1);
        let (running, _) = watch::channel(false);
        Arc::new(Self {
            loader: Loader::new(registry),
            slot: Mutex::new(Slot::default()),
            queue_tx,
            queue_rx: Mutex::new(Some(queue_rx)),
            running,
        })
    }

    fn slot(&self) -> MutexGuard<'_, Slot> {
        self.slot.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Run requests until the control channel closes. Only a channel failure
    /// is an error; task failures are reported and the loop goes on.
    pub async fn run(self: &Arc<Self>, peer: Arc<Peer>) -> Result<(), WorkerError> {
        let mut rx = self
            .queue_rx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .ok_or(WorkerError::Channel(taskd_proto::ProtoError::ChannelClosed))?;

        loop {
            let request = tokio::select! {
                _ = peer.closed() => break,
                request = rx.recv() => match request {
                    Some(request) => request,
                    None => break,
                },
            };
            self.execute(&peer, request).await?;
        }
        info!("Control channel closed, worker exiting");
        Ok(())
    }

    async fn execute(&self, peer: &Arc<Peer>, request: RunRequest) -> Result<(), WorkerError> {
        info!(task_id = %request.id, name = %request.name, "Running task");
        if let Some(debugger) = &request.debugger {
            info!(task_id = %request.id, %debugger, "Debugger attach requested");
        }

        let outcome = self.run_task(peer, &request).await;

        let report = match outcome {
            Ok(result) => {
                info!(task_id = %request.id, "Task finished");
                StatusReport::finished(result)
            }
            Err(err) => {
                warn!(task_id = %request.id, error = %err, "Task failed");
                StatusReport::failed(err)
            }
        };
        let delivered = peer.call(Request::PutStatus(report)).await;

        {
            let mut slot = self.slot();
            slot.instance = None;
            slot.context = None;
        }
        self.running.send_replace(false);
        delivered?;
        Ok(())
    }

    async fn run_task(&self, peer: &Arc<Peer>, request: &RunRequest) -> Result<Value, TaskError> {
        let task_type = match self.loader.load(&request.module, &request.class_name) {
            Ok(task_type) => task_type,
            Err(e) => {
                let mut slot = self.slot();
                slot.queued = false;
                slot.abort_pending = false;
                return Err(with_trace(TaskError::from(e)));
            }
        };

        let env = TaskEnv {
            task_id: request.id,
            user: request.user.clone(),
            environment: request.environment.clone(),
        };
        let ctx = RemoteContext::new(Arc::clone(peer), env.clone());
        let instance: Arc<dyn TaskPlugin> = Arc::from(task_type.instantiate(&env));

        {
            let mut slot = self.slot();
            slot.queued = false;
            if std::mem::take(&mut slot.abort_pending) {
                info!(task_id = %request.id, "Task aborted before it started");
                return Err(TaskError::aborted("Aborted"));
            }
            slot.instance = Some(Arc::clone(&instance));
            slot.context = Some(ctx.clone());
            self.running.send_replace(true);
        }

        let args = &request.args;
        let body = async {
            self.run_hooks(&ctx, HookType::Before, &request.name, args, None)
                .await?;
            let result = run_body(&instance, &ctx, args).await?;
            let mut env = Environment::new();
            env.insert(RESULT_ENV.to_string(), result.to_string());
            self.run_hooks(&ctx, HookType::After, &request.name, args, Some(env))
                .await?;
            Ok::<_, TaskError>(result)
        };

        match body.await {
            Ok(result) => Ok(result),
            Err(err) => {
                let err = with_trace(err);
                if let Some(rollback) = instance.as_rollback() {
                    if let Err(e) = peer.call(Request::PutStatus(StatusReport::rollback())).await {
                        warn!(task_id = %request.id, error = %e, "Cannot report rollback");
                    }
                    if let Err(e) = rollback.rollback(&ctx, args).await {
                        error!(task_id = %request.id, error = %e, "Task exception during rollback");
                    }
                }

                let mut env = Environment::new();
                env.insert(
                    ERROR_ENV.to_string(),
                    serde_json::to_string(&err).unwrap_or_default(),
                );
                if let Err(e) = self
                    .run_hooks(&ctx, HookType::Error, &request.name, args, Some(env))
                    .await
                {
                    debug!(task_id = %request.id, error = %e, "Error hook failed");
                }
                Err(err)
            }
        }
    }

    /// Run every matching hook as a subtask with the task's own arguments,
    /// one after another.
    async fn run_hooks(
        &self,
        ctx: &RemoteContext,
        hook_type: HookType,
        name: &str,
        args: &Args,
        env: Option<Environment>,
    ) -> Result<(), TaskError> {
        for hook in self.loader.hooks(hook_type, name, args) {
            debug!(task = name, hook = %hook, ?hook_type, "Running hook");
            let id = ctx.run_subtask(&hook, args.clone(), env.clone()).await?;
            ctx.join_subtasks(&[id]).await?;
        }
        Ok(())
    }

    /// Progress of the running task. Waits while a run request is queued
    /// but not started; `None` once the worker is idle.
    async fn status(&self) -> Option<TaskStatus> {
        let mut running = self.running.subscribe();
        loop {
            {
                let slot = self.slot();
                if let Some(instance) = &slot.instance {
                    let reported = instance.as_status_reporter().map(|r| r.get_status());
                    return Some(
                        reported
                            .or_else(|| slot.context.as_ref().and_then(|c| c.last_progress()))
                            .unwrap_or_default(),
                    );
                }
                if !slot.queued {
                    return None;
                }
            }
            running.changed().await.ok()?;
        }
    }

    fn abort(&self) -> Result<(), TaskError> {
        let instance = {
            let mut slot = self.slot();
            match &slot.instance {
                Some(instance) => Arc::clone(instance),
                None if slot.queued => {
                    slot.abort_pending = true;
                    return Ok(());
                }
                None => return Err(TaskError::new(errno::ENOTSUP, "No task is running")),
            }
        };
        let abortable = instance
            .as_abortable()
            .ok_or_else(|| TaskError::new(errno::ENOTSUP, "Abort not supported"))?;
        abortable
            .abort()
            .map_err(|e| TaskError::new(errno::EFAULT, format!("Cannot abort: {}", e.message)))
    }
}

/// Run the task body on its own task so a panic becomes a task failure
/// instead of taking the worker down.
async fn run_body(
    instance: &Arc<dyn TaskPlugin>,
    ctx: &RemoteContext,
    args: &Args,
) -> Result<Value, TaskError> {
    let instance = Arc::clone(instance);
    let ctx = ctx.clone();
    let args = args.clone();
    let handle = tokio::spawn(async move { instance.run(&ctx, &args).await });
    match handle.await {
        Ok(outcome) => outcome,
        Err(join_err) => {
            let message = match join_err.try_into_panic() {
                Ok(payload) => payload
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| payload.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic".to_string()),
                Err(_) => "task body cancelled".to_string(),
            };
            Err(TaskError::new(
                errno::EFAULT,
                format!("Task panicked: {}", message),
            ))
        }
    }
}

fn with_trace(err: TaskError) -> TaskError {
    if err.stacktrace.is_some() {
        return err;
    }
    err.with_stacktrace(Backtrace::force_capture().to_string())
}

#[async_trait]
impl RequestHandler for Runner {
    async fn handle(&self, request: Request) -> Result<Response, TaskError> {
        match request {
            Request::Run(run) => {
                let id = run.id;
                self.slot().queued = true;
                self.queue_tx
                    .try_send(run)
                    .map_err(|_| TaskError::new(errno::EBUSY, "Worker is busy"))?;
                debug!(task_id = %id, "Run request queued");
                Ok(Response::Ack)
            }
            Request::Abort => {
                self.abort()?;
                Ok(Response::Ack)
            }
            Request::GetStatus => Ok(Response::Status(self.status().await)),
            other => Err(TaskError::new(
                errno::ENOTSUP,
                format!("{} is not served by workers", other.method()),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::time::Duration;

    use serde_json::json;
    use taskd_core::{Abortable, Rollback, TaskHook, TaskId, TaskState, TaskType};
    use tokio::sync::mpsc::UnboundedSender;

    /// Records what the worker reports, as the dispatcher would see it.
    struct Recorder {
        tx: UnboundedSender<Request>,
        next_subtask: AtomicUsize,
    }

    #[async_trait]
    impl RequestHandler for Recorder {
        async fn handle(&self, request: Request) -> Result<Response, TaskError> {
            let response = match &request {
                Request::RunSubtask { .. } => {
                    let id = self.next_subtask.fetch_add(1, Ordering::SeqCst) as u64;
                    Response::TaskId(TaskId::new(100 + id))
                }
                Request::JoinSubtasks { .. } => Response::Outcomes(Vec::new()),
                _ => Response::Ack,
            };
            let _ = self.tx.send(request);
            Ok(response)
        }
    }

    struct Echo;

    #[async_trait]
    impl TaskPlugin for Echo {
        fn verify(&self, _args: &Args) -> Result<Vec<String>, TaskError> {
            Ok(Vec::new())
        }

        async fn run(&self, _ctx: &dyn TaskContext, args: &Args) -> Result<Value, TaskError> {
            Ok(args.to_value())
        }
    }

    struct Failing {
        rolled_back: Arc<AtomicBool>,
    }

    #[async_trait]
    impl TaskPlugin for Failing {
        fn verify(&self, _args: &Args) -> Result<Vec<String>, TaskError> {
            Ok(Vec::new())
        }

        async fn run(&self, _ctx: &dyn TaskContext, _args: &Args) -> Result<Value, TaskError> {
            Err(TaskError::new(errno::EINVAL, "bad pool"))
        }

        fn as_rollback(&self) -> Option<&dyn Rollback> {
            Some(self)
        }
    }

    #[async_trait]
    impl Rollback for Failing {
        async fn rollback(&self, _ctx: &dyn TaskContext, _args: &Args) -> Result<(), TaskError> {
            self.rolled_back.store(true, Ordering::SeqCst);
            Err(TaskError::new(errno::EFAULT, "rollback failed too"))
        }
    }

    struct Waiting {
        aborted: Arc<tokio::sync::Notify>,
    }

    #[async_trait]
    impl TaskPlugin for Waiting {
        fn verify(&self, _args: &Args) -> Result<Vec<String>, TaskError> {
            Ok(Vec::new())
        }

        async fn run(&self, _ctx: &dyn TaskContext, _args: &Args) -> Result<Value, TaskError> {
            self.aborted.notified().await;
            Err(TaskError::aborted("Aborted"))
        }

        fn as_abortable(&self) -> Option<&dyn Abortable> {
            Some(self)
        }
    }

    impl Abortable for Waiting {
        fn abort(&self) -> Result<(), TaskError> {
            self.aborted.notify_one();
            Ok(())
        }
    }

    struct Panicking;

    #[async_trait]
    impl TaskPlugin for Panicking {
        fn verify(&self, _args: &Args) -> Result<Vec<String>, TaskError> {
            Ok(Vec::new())
        }

        async fn run(&self, _ctx: &dyn TaskContext, _args: &Args) -> Result<Value, TaskError> {
            panic!("boom")
        }
    }

    fn registry(rolled_back: Arc<AtomicBool>) -> Arc<Registry> {
        let mut registry = Registry::new();
        registry
            .register_task(TaskType::new("test.echo", "plugins/test", "EchoTask", |_: &TaskEnv| {
                Box::new(Echo) as Box<dyn TaskPlugin>
            }))
            .unwrap();
        registry
            .register_task(TaskType::new(
                "test.failing",
                "plugins/test",
                "FailingTask",
                move |_: &TaskEnv| {
                    Box::new(Failing {
                        rolled_back: Arc::clone(&rolled_back),
                    }) as Box<dyn TaskPlugin>
                },
            ))
            .unwrap();
        let aborted = Arc::new(tokio::sync::Notify::new());
        registry
            .register_task(TaskType::new(
                "test.waiting",
                "plugins/test",
                "WaitingTask",
                move |_: &TaskEnv| {
                    Box::new(Waiting {
                        aborted: Arc::clone(&aborted),
                    }) as Box<dyn TaskPlugin>
                },
            ))
            .unwrap();
        registry
            .register_task(TaskType::new("test.panic", "plugins/test", "PanicTask", |_: &TaskEnv| {
                Box::new(Panicking) as Box<dyn TaskPlugin>
            }))
            .unwrap();
        registry.register_hook(TaskHook::new(HookType::Before, "test.echo", "hook.before").unwrap());
        registry.register_hook(
            TaskHook::new(HookType::After, "test.*", "hook.after")
                .unwrap()
                .with_condition(|args| args.str(0) != Some("quiet")),
        );
        registry.register_hook(TaskHook::new(HookType::Error, "test.failing", "hook.error").unwrap());
        Arc::new(registry)
    }

    struct Harness {
        runner: Arc<Runner>,
        worker: Arc<Peer>,
        dispatcher: Arc<Peer>,
        calls: mpsc::UnboundedReceiver<Request>,
        rolled_back: Arc<AtomicBool>,
    }

    fn harness() -> Harness {
        let rolled_back = Arc::new(AtomicBool::new(false));
        let runner = Runner::new(registry(Arc::clone(&rolled_back)));
        let (ours, theirs) = tokio::io::duplex(64 * 1024);
        let (tx, calls) = mpsc::unbounded_channel();
        let dispatcher = Peer::spawn(
            theirs,
            Arc::new(Recorder {
                tx,
                next_subtask: AtomicUsize::new(0),
            }),
        );
        let worker = Peer::spawn(ours, runner.clone());
        let loop_runner = Arc::clone(&runner);
        let loop_peer = Arc::clone(&worker);
        tokio::spawn(async move { loop_runner.run(loop_peer).await });
        Harness {
            runner,
            worker,
            dispatcher,
            calls,
            rolled_back,
        }
    }

    fn run_request(id: u64, name: &str, class: &str, args: Vec<Value>) -> Request {
        Request::Run(RunRequest {
            id: TaskId::new(id),
            name: name.to_string(),
            module: "plugins/test".to_string(),
            class_name: class.to_string(),
            args: Args::new(args),
            user: Some("root".to_string()),
            environment: Environment::new(),
            debugger: None,
        })
    }

    async fn next_status(calls: &mut mpsc::UnboundedReceiver<Request>) -> StatusReport {
        loop {
            match calls.recv().await.unwrap() {
                Request::PutStatus(report) => return report,
                _ => continue,
            }
        }
    }

    #[tokio::test]
    async fn test_run_reports_result_after_hooks() {
        let mut h = harness();
        h.dispatcher
            .call(run_request(1, "test.echo", "EchoTask", vec![json!("ada0")]))
            .await
            .unwrap();

        match h.calls.recv().await.unwrap() {
            Request::RunSubtask { name, env, .. } => {
                assert_eq!(name, "hook.before");
                assert!(env.is_none());
            }
            other => panic!("expected before hook, got {:?}", other),
        }
        assert!(matches!(h.calls.recv().await.unwrap(), Request::JoinSubtasks { .. }));
        match h.calls.recv().await.unwrap() {
            Request::RunSubtask { name, env, .. } => {
                assert_eq!(name, "hook.after");
                assert_eq!(env.unwrap()[RESULT_ENV], r#"["ada0"]"#);
            }
            other => panic!("expected after hook, got {:?}", other),
        }

        let report = next_status(&mut h.calls).await;
        assert_eq!(report.state, TaskState::Finished);
        assert_eq!(report.result, Some(json!(["ada0"])));
    }

    #[tokio::test]
    async fn test_hook_condition_filters() {
        let mut h = harness();
        h.dispatcher
            .call(run_request(1, "test.echo", "EchoTask", vec![json!("quiet")]))
            .await
            .unwrap();

        let mut hooks = Vec::new();
        loop {
            match h.calls.recv().await.unwrap() {
                Request::RunSubtask { name, .. } => hooks.push(name),
                Request::PutStatus(_) => break,
                _ => {}
            }
        }
        assert_eq!(hooks, vec!["hook.before".to_string()]);
    }

    #[tokio::test]
    async fn test_failure_rolls_back_then_reports() {
        let mut h = harness();
        h.dispatcher
            .call(run_request(2, "test.failing", "FailingTask", vec![]))
            .await
            .unwrap();

        let rollback = next_status(&mut h.calls).await;
        assert_eq!(rollback.state, TaskState::Rollback);

        let mut error_hook_env = None;
        let failed = loop {
            match h.calls.recv().await.unwrap() {
                Request::RunSubtask { name, env, .. } if name == "hook.error" => {
                    error_hook_env = env;
                }
                Request::PutStatus(report) => break report,
                _ => {}
            }
        };
        assert!(h.rolled_back.load(Ordering::SeqCst));
        assert_eq!(failed.state, TaskState::Failed);
        let error = failed.error.unwrap();
        assert_eq!(error.code, errno::EINVAL);
        assert_eq!(error.message, "bad pool");
        assert!(error.stacktrace.is_some());
        assert!(error_hook_env.unwrap()[ERROR_ENV].contains("bad pool"));
    }

    #[tokio::test]
    async fn test_abort_running_task() {
        let mut h = harness();
        h.dispatcher
            .call(run_request(3, "test.waiting", "WaitingTask", vec![]))
            .await
            .unwrap();

        // The status poll returns once the body is running.
        let status = h.dispatcher.call(Request::GetStatus).await.unwrap();
        assert_eq!(status, Response::Status(Some(TaskStatus::default())));

        h.dispatcher.call(Request::Abort).await.unwrap();
        let report = next_status(&mut h.calls).await;
        assert_eq!(report.state, TaskState::Aborted);
    }

    #[tokio::test]
    async fn test_abort_without_task_not_supported() {
        let h = harness();
        let err = h.dispatcher.call(Request::Abort).await.unwrap_err();
        match err {
            taskd_proto::ProtoError::Remote(e) => assert_eq!(e.code, errno::ENOTSUP),
            other => panic!("unexpected error {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_abort_not_supported_by_task() {
        let h = harness();
        {
            let mut slot = h.runner.slot();
            slot.instance = Some(Arc::new(Echo) as Arc<dyn TaskPlugin>);
        }
        let err = h.dispatcher.call(Request::Abort).await.unwrap_err();
        assert!(matches!(err, taskd_proto::ProtoError::Remote(e) if e.code == errno::ENOTSUP));
    }

    #[tokio::test]
    async fn test_panic_becomes_failure() {
        let mut h = harness();
        h.dispatcher
            .call(run_request(4, "test.panic", "PanicTask", vec![]))
            .await
            .unwrap();
        let report = next_status(&mut h.calls).await;
        assert_eq!(report.state, TaskState::Failed);
        assert!(report.error.unwrap().message.contains("boom"));

        // The worker survives and takes the next request.
        h.dispatcher
            .call(run_request(5, "test.echo", "EchoTask", vec![json!("quiet")]))
            .await
            .unwrap();
        assert_eq!(next_status(&mut h.calls).await.state, TaskState::Finished);
    }

    #[tokio::test]
    async fn test_unknown_class_fails_task() {
        let mut h = harness();
        h.dispatcher
            .call(run_request(6, "test.gone", "GoneTask", vec![]))
            .await
            .unwrap();
        let report = next_status(&mut h.calls).await;
        assert_eq!(report.state, TaskState::Failed);
    }

    #[tokio::test]
    async fn test_status_of_idle_worker_is_empty() {
        let h = harness();
        let status = tokio::time::timeout(
            Duration::from_secs(5),
            h.dispatcher.call(Request::GetStatus),
        )
        .await
        .expect("idle status poll should not block")
        .unwrap();
        assert_eq!(status, Response::Status(None));
        assert!(!h.worker.is_closed());
    }

    #[tokio::test]
    async fn test_status_after_task_ends_is_empty() {
        let mut h = harness();
        h.dispatcher
            .call(run_request(7, "test.echo", "EchoTask", vec![json!("quiet")]))
            .await
            .unwrap();
        assert_eq!(next_status(&mut h.calls).await.state, TaskState::Finished);

        let status = tokio::time::timeout(
            Duration::from_secs(5),
            h.dispatcher.call(Request::GetStatus),
        )
        .await
        .expect("status poll after the task should not block")
        .unwrap();
        assert_eq!(status, Response::Status(None));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_descriptor_numbers_in_args_stay_open() {
        use std::os::fd::AsRawFd;

        let mut h = harness();
        let file = tempfile::tempfile().unwrap();
        let raw = file.as_raw_fd();
        h.dispatcher
            .call(run_request(
                8,
                "test.echo",
                "EchoTask",
                vec![json!("quiet"), json!({"$fd": raw})],
            ))
            .await
            .unwrap();
        let report = next_status(&mut h.calls).await;
        assert_eq!(report.state, TaskState::Finished);
        assert_eq!(report.result, Some(json!(["quiet", {"$fd": raw}])));

        // The worker does not own descriptors named in arguments.
        assert!(file.metadata().is_ok());
        assert!(file.try_clone().is_ok());
    }
}
