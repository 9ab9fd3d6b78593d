//! taskctl - command line client for the taskd dispatcher.

use std::error::Error;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use clap::{Parser, Subcommand};
use serde_json::Value;
use taskd_core::{errno, Args, Task, TaskError, TaskId};
use taskd_proto::{Peer, Request, RequestHandler, Response, DEFAULT_SOCKET_PATH, SOCKET_ENV};
use tokio::net::UnixStream;

/// taskctl - submit and inspect dispatcher tasks
#[derive(Parser)]
#[command(name = "taskctl")]
#[command(about = "CLI for the taskd dispatcher", long_about = None)]
struct Cli {
    /// Dispatcher control socket
    #[arg(short, long, env = SOCKET_ENV, default_value = DEFAULT_SOCKET_PATH)]
    socket: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Submit a task
    Submit {
        /// Task type, e.g. disk.erase
        name: String,

        /// Arguments as a JSON array
        #[arg(default_value = "[]")]
        args: String,

        /// Submitting user
        #[arg(short, long)]
        user: Option<String>,

        /// Reject unknown properties in arguments
        #[arg(long)]
        strict: bool,

        /// Wait for the task to end and print it
        #[arg(short, long)]
        wait: bool,
    },

    /// Abort a task and its subtasks
    Abort {
        /// Task ID
        id: u64,
    },

    /// Show a task
    #[command(name = "get-task")]
    GetTask {
        /// Task ID
        id: u64,

        /// Print the raw JSON record
        #[arg(long)]
        json: bool,
    },
}

/// Clients only issue calls.
struct NoRequests;

#[async_trait]
impl RequestHandler for NoRequests {
    async fn handle(&self, request: Request) -> Result<Response, TaskError> {
        Err(TaskError::new(
            errno::ENOTSUP,
            format!("{} is not served by clients", request.method()),
        ))
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    let cli = Cli::parse();

    let stream = UnixStream::connect(&cli.socket)
        .await
        .map_err(|e| format!("Cannot connect to {}: {}", cli.socket.display(), e))?;
    let peer = Peer::spawn(stream, Arc::new(NoRequests));

    let result = match cli.command {
        Commands::Submit {
            name,
            args,
            user,
            strict,
            wait,
        } => submit(&peer, name, &args, user, strict, wait).await,
        Commands::Abort { id } => abort(&peer, TaskId::new(id)).await,
        Commands::GetTask { id, json } => {
            let task = get_task(&peer, TaskId::new(id)).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&task)?);
            } else {
                print_task(&task);
            }
            Ok(())
        }
    };

    peer.close().await;
    result
}

async fn submit(
    peer: &Peer,
    name: String,
    args: &str,
    user: Option<String>,
    strict: bool,
    wait: bool,
) -> Result<(), Box<dyn Error>> {
    let args: Vec<Value> = serde_json::from_str(args)
        .map_err(|e| format!("Arguments must be a JSON array: {}", e))?;

    let response = peer
        .call(Request::Submit {
            name,
            args: Args::new(args),
            user,
            strict,
        })
        .await?;
    let id = match response {
        Response::TaskId(id) => id,
        other => return Err(format!("Unexpected response: {:?}", other).into()),
    };
    println!("Task submitted: {}", id);

    if wait {
        let task = loop {
            let task = get_task(peer, id).await?;
            if task.is_terminal() {
                break task;
            }
            tokio::time::sleep(Duration::from_millis(500)).await;
        };
        print_task(&task);
    }
    Ok(())
}

async fn abort(peer: &Peer, id: TaskId) -> Result<(), Box<dyn Error>> {
    peer.call(Request::AbortTask { id }).await?;
    println!("Abort requested: {}", id);
    Ok(())
}

async fn get_task(peer: &Peer, id: TaskId) -> Result<Task, Box<dyn Error>> {
    match peer.call(Request::GetTask { id }).await? {
        Response::Task(task) => Ok(*task),
        other => Err(format!("Unexpected response: {:?}", other).into()),
    }
}

fn print_task(task: &Task) {
    println!("  ID:         {}", task.id);
    println!("  Name:       {}", task.name);
    println!("  State:      {}", task.state);
    if let Some(description) = &task.description {
        println!("  About:      {}", description);
    }
    if let Some(user) = &task.user {
        println!("  User:       {}", user);
    }
    println!("  Created:    {}", format_timestamp(task.created_at));
    if let Some(finished) = task.finished_at {
        println!("  Finished:   {}", format_timestamp(finished));
    }
    if let Some(progress) = &task.progress {
        println!(
            "  Progress:   {:.0}% {}",
            progress.percentage,
            progress.message.as_deref().unwrap_or_default()
        );
    }
    if !task.resources.is_empty() {
        println!("  Resources:  {}", task.resources.join(", "));
    }
    if let Some(result) = &task.result {
        println!("  Result:     {}", result);
    }
    if let Some(error) = &task.error {
        println!("  Error:      [{}] {}", error.code, error.message);
    }
    for warning in &task.warnings {
        println!("  Warning:    {}", warning.message);
    }
    if !task.subtask_ids.is_empty() {
        let ids: Vec<String> = task.subtask_ids.iter().map(ToString::to_string).collect();
        println!("  Subtasks:   {}", ids.join(", "));
    }
}

fn format_timestamp(at: chrono::DateTime<chrono::Utc>) -> String {
    at.format("%Y-%m-%d %H:%M:%S").to_string()
}
