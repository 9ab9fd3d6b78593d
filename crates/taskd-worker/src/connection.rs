//! Connection to the dispatcher.

use std::sync::Arc;

use taskd_core::{ExecutorKey, Registry};
use taskd_proto::{Peer, ProtoError, Request, RequestHandler, Response};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::UnixStream;
use tracing::info;

use crate::config::Config;
use crate::error::WorkerError;
use crate::runner::Runner;

/// Check in over `stream` with `key` and run tasks until the dispatcher
/// closes the channel.
pub async fn serve<S>(stream: S, key: ExecutorKey, registry: Arc<Registry>) -> Result<(), WorkerError>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let runner = Runner::new(registry);
    let (peer, reader) = Peer::new(stream);
    let handler: Arc<dyn RequestHandler> = runner.clone();
    reader.spawn(handler);

    match peer.call(Request::Checkin { key: key.clone() }).await {
        Ok(Response::Ack) => {}
        Ok(_) => return Err(ProtoError::UnexpectedResponse("checkin").into()),
        Err(ProtoError::Remote(e)) => return Err(WorkerError::Checkin(e)),
        Err(e) => return Err(e.into()),
    }
    info!(executor = %key, "Checked in, waiting for tasks");

    let result = runner.run(Arc::clone(&peer)).await;
    peer.close().await;
    result
}

/// Connect to the dispatcher socket and serve it.
pub async fn connect_and_run(config: &Config, registry: Arc<Registry>) -> Result<(), WorkerError> {
    info!(socket = %config.socket_path.display(), "Connecting to dispatcher");
    let stream = UnixStream::connect(&config.socket_path)
        .await
        .map_err(WorkerError::Connect)?;
    serve(stream, config.key.clone(), registry).await
}
