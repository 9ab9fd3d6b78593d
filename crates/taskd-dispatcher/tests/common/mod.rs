//! In-process dispatcher for integration tests.
//!
//! Workers run the real worker runner on a tokio task, connected to the
//! control server through an in-memory duplex stream. Killing a worker
//! aborts that task, which the executor observes as a process exit.

#![allow(dead_code)]

use std::collections::HashMap;
use std::error::Error;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, OnceLock, Weak};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use taskd_core::{Args, ExecutorKey, Registry, Task, TaskId, TaskState};
use taskd_dispatcher::server::serve_connection;
use taskd_dispatcher::{
    Balancer, BalancerDeps, BasicValidator, BroadcastEventBus, Config, Event, Executor, MemoryTaskStore,
    OutputBuffer, SpawnError, Submission, TaskStore, WorkerProcess, WorkerSpawner,
};
use taskd_worker::WorkerError;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

pub type TestResult = Result<(), Box<dyn Error>>;

/// How long any single task may take to end in a test.
pub const TASK_TIMEOUT: Duration = Duration::from_secs(10);

pub struct InProcessSpawner {
    balancer: OnceLock<Weak<Balancer>>,
    registry: Arc<Registry>,
    kills: Mutex<HashMap<ExecutorKey, CancellationToken>>,
    spawned: AtomicUsize,
}

impl InProcessSpawner {
    fn new(registry: Arc<Registry>) -> Self {
        Self {
            balancer: OnceLock::new(),
            registry,
            kills: Mutex::new(HashMap::new()),
            spawned: AtomicUsize::new(0),
        }
    }

    /// Number of worker processes started so far.
    pub fn spawned(&self) -> usize {
        self.spawned.load(Ordering::SeqCst)
    }

    /// Make the worker of `key` die as if the process crashed.
    pub fn crash(&self, key: &ExecutorKey) {
        if let Some(kill) = self.kills.lock().unwrap().get(key) {
            kill.cancel();
        }
    }
}

#[async_trait]
impl WorkerSpawner for InProcessSpawner {
    async fn spawn(
        &self,
        key: &ExecutorKey,
        output: OutputBuffer,
    ) -> Result<Box<dyn WorkerProcess>, SpawnError> {
        let balancer = self
            .balancer
            .get()
            .and_then(Weak::upgrade)
            .ok_or_else(|| SpawnError::Other("dispatcher is gone".to_string()))?;

        let (dispatcher_end, worker_end) = tokio::io::duplex(256 * 1024);
        tokio::spawn(serve_connection(balancer, dispatcher_end));
        let worker = tokio::spawn(taskd_worker::serve(
            worker_end,
            key.clone(),
            Arc::clone(&self.registry),
        ));

        let kill = CancellationToken::new();
        self.kills.lock().unwrap().insert(key.clone(), kill.clone());
        self.spawned.fetch_add(1, Ordering::SeqCst);
        output.push_line(&format!("worker {} started", key));

        Ok(Box::new(InProcessWorker { worker, kill }))
    }
}

struct InProcessWorker {
    worker: JoinHandle<Result<(), WorkerError>>,
    kill: CancellationToken,
}

#[async_trait]
impl WorkerProcess for InProcessWorker {
    fn pid(&self) -> Option<u32> {
        None
    }

    async fn wait(&mut self) -> Result<Option<i32>, SpawnError> {
        tokio::select! {
            exit = &mut self.worker => Ok(match exit {
                Ok(Ok(())) => Some(0),
                Ok(Err(e)) => Some(e.exit_code()),
                Err(_) => None,
            }),
            _ = self.kill.cancelled() => {
                self.worker.abort();
                Ok(None)
            }
        }
    }

    fn start_kill(&mut self) -> Result<(), SpawnError> {
        self.kill.cancel();
        Ok(())
    }
}

pub struct Harness {
    pub balancer: Arc<Balancer>,
    pub spawner: Arc<InProcessSpawner>,
    pub bus: Arc<BroadcastEventBus>,
    pub store: Arc<dyn TaskStore>,
    distribution: JoinHandle<()>,
}

/// Short timings so tests do not sit in respawn or poll delays.
pub fn config() -> Config {
    Config {
        respawn_delay: Duration::from_millis(50),
        poll_interval: Duration::from_millis(20),
        status_timeout: Duration::from_secs(2),
        checkin_timeout: Duration::from_secs(5),
        ..Config::default()
    }
}

pub fn start(config: Config) -> Harness {
    start_with_store(config, Arc::new(MemoryTaskStore::new()))
}

pub fn start_with_store(config: Config, store: Arc<dyn TaskStore>) -> Harness {
    let registry = Arc::new(taskd_plugins::registry().expect("registry"));
    let spawner = Arc::new(InProcessSpawner::new(Arc::clone(&registry)));
    let bus = Arc::new(BroadcastEventBus::default());

    let balancer = Balancer::new(
        config,
        BalancerDeps {
            registry,
            validator: Arc::new(BasicValidator),
            store: Arc::clone(&store),
            bus: bus.clone(),
            spawner: spawner.clone(),
        },
    )
    .expect("balancer");
    let _ = spawner.balancer.set(Arc::downgrade(&balancer));
    let distribution = balancer.start().expect("distribution loop");

    Harness {
        balancer,
        spawner,
        bus,
        store,
        distribution,
    }
}

impl Harness {
    pub fn submit(&self, name: &str, args: Vec<Value>) -> Result<TaskId, Box<dyn Error>> {
        Ok(self
            .balancer
            .submit(name, Args::new(args), Submission::user("root"))?)
    }

    /// Wait for the task to end and return its record.
    pub async fn wait(&self, id: TaskId) -> Result<Task, Box<dyn Error>> {
        let handle = self
            .balancer
            .get_task_handle(id)
            .ok_or_else(|| format!("task {} not found", id))?;
        tokio::time::timeout(TASK_TIMEOUT, handle.wait_ended()).await?;
        Ok(handle.snapshot())
    }

    /// Poll until the task reaches `state`.
    pub async fn wait_for_state(&self, id: TaskId, state: TaskState) -> Result<Task, Box<dyn Error>> {
        let handle = self
            .balancer
            .get_task_handle(id)
            .ok_or_else(|| format!("task {} not found", id))?;
        tokio::time::timeout(TASK_TIMEOUT, async {
            while handle.state() != state {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await?;
        Ok(handle.snapshot())
    }

    /// Wait until the task body is running inside its worker. Returns the
    /// executor it runs on.
    pub async fn wait_running(&self, id: TaskId) -> Result<Arc<Executor>, Box<dyn Error>> {
        let handle = self
            .balancer
            .get_task_handle(id)
            .ok_or_else(|| format!("task {} not found", id))?;
        let executor = tokio::time::timeout(TASK_TIMEOUT, async {
            loop {
                if let Some(executor) = handle.executor() {
                    let here = executor
                        .current_task()
                        .is_some_and(|t| Arc::ptr_eq(&t, &handle));
                    if here {
                        return executor;
                    }
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await?;
        // The worker answers status requests only once the task has started.
        executor.get_status().await;
        Ok(executor)
    }

    pub fn events(&self) -> broadcast::Receiver<Event> {
        self.bus.subscribe()
    }

    pub fn register_resource(&self, name: &str) {
        self.balancer
            .resources()
            .register(name, &[taskd_dispatcher::resources::SYSTEM_RESOURCE.to_string()]);
    }

    pub fn shutdown(self) {
        self.balancer.shutdown();
        self.distribution.abort();
    }
}

/// States announced for task `id` by `task.updated` events received so far.
pub fn updated_states(rx: &mut broadcast::Receiver<Event>, id: TaskId) -> Vec<TaskState> {
    let mut states = Vec::new();
    while let Ok(event) = rx.try_recv() {
        if event.name != taskd_dispatcher::events::TASK_UPDATED {
            continue;
        }
        if event.payload["id"] != serde_json::json!(id) {
            continue;
        }
        if let Ok(state) = serde_json::from_value(event.payload["state"].clone()) {
            states.push(state);
        }
    }
    states
}
