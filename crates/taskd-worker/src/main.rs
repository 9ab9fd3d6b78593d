//! taskd Worker Runner

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use taskd_proto::{DEFAULT_SOCKET_PATH, SOCKET_ENV};
use taskd_worker::{connect_and_run, Config};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

/// Runs tasks for the taskd dispatcher. Started by the dispatcher.
#[derive(Parser, Debug)]
#[command(name = "taskd-worker")]
struct Args {
    /// Executor key to check in with.
    key: String,

    /// Dispatcher control socket.
    #[arg(long, env = SOCKET_ENV, default_value = DEFAULT_SOCKET_PATH)]
    socket: PathBuf,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    // stdout and stderr are captured by the dispatcher into the task record.
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("taskd=debug"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .init();

    let config = Config::new(args.key).with_socket(args.socket);
    let registry = match taskd_plugins::registry() {
        Ok(registry) => Arc::new(registry),
        Err(e) => {
            error!(error = %e, "Cannot load task registry");
            std::process::exit(taskd_core::errno::EINVAL);
        }
    };

    info!(executor = %config.key, pid = std::process::id(), "Starting worker");
    if let Err(e) = connect_and_run(&config, registry).await {
        error!(error = %e, "Worker stopped");
        std::process::exit(e.exit_code());
    }
}
