//! The task context of a worker: every call goes to the dispatcher.

use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use taskd_core::{
    Args, Environment, SubtaskOutcome, TaskContext, TaskEnv, TaskError, TaskId, TaskStatus,
};
use taskd_proto::{Peer, ProtoError, Request, Response};

/// [`TaskContext`] backed by the control channel.
#[derive(Clone)]
pub struct RemoteContext {
    peer: Arc<Peer>,
    env: TaskEnv,
    /// Last progress the task pushed, answered to status polls when the
    /// implementation has no status accessor of its own.
    progress: Arc<Mutex<Option<TaskStatus>>>,
}

impl RemoteContext {
    pub fn new(peer: Arc<Peer>, env: TaskEnv) -> Self {
        Self {
            peer,
            env,
            progress: Arc::new(Mutex::new(None)),
        }
    }

    pub fn last_progress(&self) -> Option<TaskStatus> {
        self.progress
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    async fn ack(&self, request: Request) -> Result<(), TaskError> {
        let method = request.method();
        match self.peer.call(request).await? {
            Response::Ack => Ok(()),
            _ => Err(ProtoError::UnexpectedResponse(method).into()),
        }
    }
}

#[async_trait]
impl TaskContext for RemoteContext {
    fn task_id(&self) -> TaskId {
        self.env.task_id
    }

    fn user(&self) -> Option<&str> {
        self.env.user.as_deref()
    }

    fn environment(&self) -> &Environment {
        &self.env.environment
    }

    async fn add_warning(&self, warning: TaskError) -> Result<(), TaskError> {
        self.ack(Request::PutWarning(warning)).await
    }

    async fn put_progress(&self, status: TaskStatus) -> Result<(), TaskError> {
        *self.progress.lock().unwrap_or_else(PoisonError::into_inner) = Some(status.clone());
        self.ack(Request::PutProgress(status)).await
    }

    async fn verify_subtask(&self, name: &str, args: &Args) -> Result<Vec<String>, TaskError> {
        let request = Request::VerifySubtask {
            name: name.to_string(),
            args: args.clone(),
        };
        match self.peer.call(request).await? {
            Response::Resources(resources) => Ok(resources),
            _ => Err(ProtoError::UnexpectedResponse("verify_subtask").into()),
        }
    }

    async fn run_subtask(
        &self,
        name: &str,
        args: Args,
        env: Option<Environment>,
    ) -> Result<TaskId, TaskError> {
        let request = Request::RunSubtask {
            name: name.to_string(),
            args,
            env,
        };
        match self.peer.call(request).await? {
            Response::TaskId(id) => Ok(id),
            _ => Err(ProtoError::UnexpectedResponse("run_subtask").into()),
        }
    }

    async fn join_subtasks(&self, ids: &[TaskId]) -> Result<Vec<SubtaskOutcome>, TaskError> {
        let request = Request::JoinSubtasks { ids: ids.to_vec() };
        match self.peer.call(request).await? {
            Response::Outcomes(outcomes) => Ok(outcomes),
            _ => Err(ProtoError::UnexpectedResponse("join_subtasks").into()),
        }
    }

    async fn abort_subtask(&self, id: TaskId) -> Result<(), TaskError> {
        self.ack(Request::AbortSubtask { id }).await
    }

    async fn register_resource(&self, name: &str, parents: &[String]) -> Result<(), TaskError> {
        self.ack(Request::RegisterResource {
            name: name.to_string(),
            parents: parents.to_vec(),
        })
        .await
    }

    async fn unregister_resource(&self, name: &str) -> Result<(), TaskError> {
        self.ack(Request::UnregisterResource {
            name: name.to_string(),
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use taskd_core::errno;
    use taskd_proto::RequestHandler;

    /// Stands in for the dispatcher end of the channel.
    struct FakeDispatcher;

    #[async_trait]
    impl RequestHandler for FakeDispatcher {
        async fn handle(&self, request: Request) -> Result<Response, TaskError> {
            match request {
                Request::VerifySubtask { name, .. } => Ok(Response::Resources(vec![name])),
                Request::RunSubtask { .. } => Ok(Response::TaskId(TaskId::new(7))),
                Request::JoinSubtasks { .. } => Ok(Response::Ack),
                Request::PutProgress(_) | Request::PutWarning(_) => Ok(Response::Ack),
                _ => Err(TaskError::new(errno::ENOTSUP, "not here")),
            }
        }
    }

    struct Silent;

    #[async_trait]
    impl RequestHandler for Silent {
        async fn handle(&self, _request: Request) -> Result<Response, TaskError> {
            Err(TaskError::new(errno::ENOTSUP, "worker side"))
        }
    }

    fn context() -> RemoteContext {
        let (ours, theirs) = tokio::io::duplex(64 * 1024);
        let _dispatcher = Peer::spawn(theirs, Arc::new(FakeDispatcher));
        let peer = Peer::spawn(ours, Arc::new(Silent));
        RemoteContext::new(
            peer,
            TaskEnv {
                task_id: TaskId::new(3),
                user: Some("root".to_string()),
                environment: Environment::new(),
            },
        )
    }

    #[tokio::test]
    async fn test_calls_map_responses() {
        let ctx = context();
        assert_eq!(ctx.task_id(), TaskId::new(3));
        assert_eq!(ctx.user(), Some("root"));

        let resources = ctx.verify_subtask("disk.erase", &Args::default()).await.unwrap();
        assert_eq!(resources, vec!["disk.erase".to_string()]);

        let id = ctx.run_subtask("disk.erase", Args::default(), None).await.unwrap();
        assert_eq!(id, TaskId::new(7));
    }

    #[tokio::test]
    async fn test_wrong_response_shape_is_an_error() {
        let ctx = context();
        let err = ctx.join_subtasks(&[TaskId::new(7)]).await.unwrap_err();
        assert_eq!(err.code, errno::EFAULT);

        let err = ctx.abort_subtask(TaskId::new(7)).await.unwrap_err();
        assert_eq!(err.code, errno::ENOTSUP);
    }

    #[tokio::test]
    async fn test_progress_remembered() {
        let ctx = context();
        assert!(ctx.last_progress().is_none());
        ctx.put_progress(TaskStatus::new(30.0, "copying")).await.unwrap();
        assert_eq!(ctx.last_progress(), Some(TaskStatus::new(30.0, "copying")));
    }
}
