//! taskd dispatcher daemon

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use taskd_dispatcher::logging::init_logging;
use taskd_dispatcher::server::serve;
use taskd_dispatcher::{
    Balancer, BalancerDeps, BasicValidator, BroadcastEventBus, Config, JsonFileTaskStore,
    MemoryTaskStore, ProcessSpawner, TaskStore,
};
use taskd_proto::DEFAULT_SOCKET_PATH;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// taskd task dispatcher.
#[derive(Parser, Debug)]
#[command(name = "taskd", about = "taskd task dispatcher")]
struct Args {
    /// Control socket path.
    #[arg(long, default_value = DEFAULT_SOCKET_PATH)]
    socket: PathBuf,

    /// Worker runner executable.
    #[arg(long, default_value = "/usr/local/libexec/taskd-worker")]
    worker: PathBuf,

    /// Directory for task records. Tasks are kept in memory when omitted.
    #[arg(long)]
    store_dir: Option<PathBuf>,

    /// Delay before respawning a dead worker, in milliseconds.
    #[arg(long, default_value_t = 1000)]
    respawn_delay_ms: u64,

    /// Progress polling interval, in milliseconds.
    #[arg(long, default_value_t = 1000)]
    poll_interval_ms: u64,

    /// Timeout of a progress poll, in milliseconds.
    #[arg(long, default_value_t = 5000)]
    status_timeout_ms: u64,

    /// How long a new worker may take to check in, in seconds.
    #[arg(long, default_value_t = 30)]
    checkin_timeout_secs: u64,

    /// Maximum number of worker processes.
    #[arg(long)]
    max_executors: Option<usize>,

    /// Debugger address (host:port) tasks attach to.
    #[arg(long)]
    debugger: Option<String>,

    /// Do not store worker output in task records.
    #[arg(long)]
    no_output_capture: bool,

    /// Log level (error, warn, info, debug, trace).
    #[arg(long)]
    log_level: Option<String>,
}

impl Args {
    fn config(&self) -> Config {
        Config {
            socket_path: self.socket.clone(),
            worker_path: self.worker.clone(),
            store_dir: self.store_dir.clone(),
            respawn_delay: Duration::from_millis(self.respawn_delay_ms),
            poll_interval: Duration::from_millis(self.poll_interval_ms),
            status_timeout: Duration::from_millis(self.status_timeout_ms),
            checkin_timeout: Duration::from_secs(self.checkin_timeout_secs),
            max_executors: self.max_executors,
            debugger: self.debugger.clone(),
            capture_output: !self.no_output_capture,
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    init_logging(args.log_level.as_deref());

    let config = args.config();
    let store: Arc<dyn TaskStore> = match &config.store_dir {
        Some(dir) => Arc::new(JsonFileTaskStore::open(dir)?),
        None => Arc::new(MemoryTaskStore::new()),
    };
    let registry = Arc::new(taskd_plugins::registry()?);
    info!(task_types = registry.names().len(), "Task registry loaded");

    let deps = BalancerDeps {
        registry,
        validator: Arc::new(BasicValidator),
        store,
        bus: Arc::new(BroadcastEventBus::default()),
        spawner: Arc::new(ProcessSpawner::new(&config.worker_path, &config.socket_path)),
    };
    let socket_path = config.socket_path.clone();
    let balancer = Balancer::new(config, deps)?;
    balancer.start()?;

    let shutdown = CancellationToken::new();
    let server = tokio::spawn({
        let balancer = Arc::clone(&balancer);
        let shutdown = shutdown.clone();
        async move { serve(balancer, &socket_path, shutdown).await }
    });

    info!("Starting taskd dispatcher");
    tokio::signal::ctrl_c().await?;
    info!("Shutting down");

    shutdown.cancel();
    balancer.shutdown();
    server.await??;
    Ok(())
}
