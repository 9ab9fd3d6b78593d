//! Control server: worker check-ins, task-side calls, and client requests.

use std::path::Path;
use std::sync::{Arc, OnceLock};

use async_trait::async_trait;
use taskd_core::{errno, TaskError};
use taskd_proto::{Peer, Request, RequestHandler, Response};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::UnixListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::balancer::{Balancer, Submission};
use crate::executor::Executor;

/// Requests arriving on one connection. A connection becomes a worker
/// connection once it checks in.
struct Connection {
    balancer: Arc<Balancer>,
    peer: Arc<Peer>,
    executor: OnceLock<Arc<Executor>>,
}

impl Connection {
    fn executor(&self) -> Result<&Arc<Executor>, TaskError> {
        self.executor
            .get()
            .ok_or_else(|| TaskError::new(errno::EINVAL, "Worker has not checked in"))
    }
}

#[async_trait]
impl RequestHandler for Connection {
    async fn handle(&self, request: Request) -> Result<Response, TaskError> {
        match request {
            Request::Checkin { key } => {
                let executor = self.balancer.checkin(&key, Arc::clone(&self.peer))?;
                if self.executor.set(executor).is_err() {
                    return Err(TaskError::new(errno::EINVAL, "Already checked in"));
                }
                Ok(Response::Ack)
            }
            Request::PutStatus(report) => {
                self.executor()?.put_status(report)?;
                Ok(Response::Ack)
            }
            Request::PutWarning(warning) => {
                self.executor()?.put_warning(warning)?;
                Ok(Response::Ack)
            }
            Request::PutProgress(status) => {
                self.executor()?.put_progress(status)?;
                Ok(Response::Ack)
            }
            Request::VerifySubtask { name, args } => {
                self.executor()?;
                let resources = self.balancer.verify_subtask(&name, &args)?;
                Ok(Response::Resources(resources))
            }
            Request::RunSubtask { name, args, env } => {
                let parent = self.balancer.task_of(self.executor()?)?;
                let id = self.balancer.run_subtask(&parent, &name, args, env).await?;
                Ok(Response::TaskId(id))
            }
            Request::JoinSubtasks { ids } => {
                self.executor()?;
                let outcomes = self.balancer.join_subtasks(&ids).await?;
                Ok(Response::Outcomes(outcomes))
            }
            Request::AbortSubtask { id } => {
                self.executor()?;
                self.balancer.abort(id, None).await?;
                Ok(Response::Ack)
            }
            Request::RegisterResource { name, parents } => {
                self.executor()?;
                self.balancer.resources().register(&name, &parents);
                self.balancer.schedule_tasks(false).await;
                Ok(Response::Ack)
            }
            Request::UnregisterResource { name } => {
                self.executor()?;
                self.balancer.resources().unregister(&name);
                Ok(Response::Ack)
            }
            Request::Submit {
                name,
                args,
                user,
                strict,
            } => {
                let submission = Submission {
                    user,
                    strict,
                    ..Submission::default()
                };
                let id = self.balancer.submit(&name, args, submission)?;
                Ok(Response::TaskId(id))
            }
            Request::AbortTask { id } => {
                self.balancer.abort(id, None).await?;
                Ok(Response::Ack)
            }
            Request::GetTask { id } => match self.balancer.get_task(id)? {
                Some(task) => Ok(Response::Task(Box::new(task))),
                None => Err(TaskError::new(errno::ENOENT, format!("Task {} not found", id))),
            },
            other @ (Request::Run(_) | Request::Abort | Request::GetStatus) => Err(TaskError::new(
                errno::ENOTSUP,
                format!("{} is served by workers", other.method()),
            )),
        }
    }
}

/// Serve one control connection until it closes.
pub async fn serve_connection<S>(balancer: Arc<Balancer>, stream: S)
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let (peer, reader) = Peer::new(stream);
    let connection = Arc::new(Connection {
        balancer,
        peer: Arc::clone(&peer),
        executor: OnceLock::new(),
    });
    let handler: Arc<dyn RequestHandler> = connection.clone();
    let _ = reader.spawn(handler).await;

    if let Some(executor) = connection.executor.get() {
        executor.connection_lost(&peer);
    }
    debug!("Control connection closed");
}

/// Accept control connections on a Unix socket until `shutdown` fires.
pub async fn serve(
    balancer: Arc<Balancer>,
    socket_path: &Path,
    shutdown: CancellationToken,
) -> std::io::Result<()> {
    if socket_path.exists() {
        std::fs::remove_file(socket_path)?;
    }
    let listener = UnixListener::bind(socket_path)?;
    info!(socket = %socket_path.display(), "Control server listening");

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, _)) => {
                    tokio::spawn(serve_connection(Arc::clone(&balancer), stream));
                }
                Err(e) => warn!(error = %e, "Accept failed"),
            },
        }
    }

    let _ = std::fs::remove_file(socket_path);
    Ok(())
}
