//! Symmetric JSON-lines RPC peer.
//!
//! A [`Peer`] owns the write half of a stream and a table of calls awaiting
//! their response. The read half is driven by a [`PeerReader`] task which
//! resolves those calls and hands inbound requests to a [`RequestHandler`].
//! Each inbound request is served on its own task, so a slow handler (a
//! subtask join, say) never blocks the channel.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use taskd_core::TaskError;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, ReadHalf};
use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::error::ProtoError;
use crate::protocol::{Frame, Request, Response};

/// Serves requests issued by the remote end.
#[async_trait]
pub trait RequestHandler: Send + Sync {
    async fn handle(&self, request: Request) -> Result<Response, TaskError>;
}

type Writer = Box<dyn AsyncWrite + Send + Unpin>;
type Pending = StdMutex<HashMap<u64, oneshot::Sender<Result<Response, TaskError>>>>;

struct Shared {
    writer: Mutex<Writer>,
    pending: Pending,
    next_id: AtomicU64,
    closed: CancellationToken,
}

impl Shared {
    async fn send_json<T: Serialize>(&self, message: &T) -> Result<(), ProtoError> {
        let json = serde_json::to_string(message)?;
        trace!("Sending frame: {}", json);

        let mut writer = self.writer.lock().await;
        writer.write_all(json.as_bytes()).await?;
        writer.write_all(b"\n").await?;
        writer.flush().await?;
        Ok(())
    }

    fn fail_pending(&self) {
        // Dropping the senders wakes every caller with `ChannelClosed`.
        if let Ok(mut pending) = self.pending.lock() {
            pending.clear();
        }
    }
}

/// Handle for issuing calls over one control channel.
pub struct Peer {
    shared: Arc<Shared>,
}

impl Peer {
    /// Wrap a stream. The returned reader must be started for calls to
    /// complete.
    pub fn new<S>(stream: S) -> (Arc<Self>, PeerReader<S>)
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (read, write) = tokio::io::split(stream);
        let shared = Arc::new(Shared {
            writer: Mutex::new(Box::new(write)),
            pending: StdMutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            closed: CancellationToken::new(),
        });
        let reader = PeerReader {
            read,
            shared: Arc::clone(&shared),
        };
        (Arc::new(Self { shared }), reader)
    }

    /// Wrap a stream and start serving it with `handler`.
    pub fn spawn<S>(stream: S, handler: Arc<dyn RequestHandler>) -> Arc<Self>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (peer, reader) = Self::new(stream);
        reader.spawn(handler);
        peer
    }

    /// Issue a call and wait for its response.
    pub async fn call(&self, request: Request) -> Result<Response, ProtoError> {
        self.call_with(request, None).await
    }

    /// Issue a call, giving up after `timeout`.
    pub async fn call_timeout(
        &self,
        request: Request,
        timeout: Duration,
    ) -> Result<Response, ProtoError> {
        self.call_with(request, Some(timeout)).await
    }

    async fn call_with(
        &self,
        request: Request,
        timeout: Option<Duration>,
    ) -> Result<Response, ProtoError> {
        let id = self.shared.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.pending()?.insert(id, tx);

        if self.shared.closed.is_cancelled() {
            self.forget(id);
            return Err(ProtoError::ChannelClosed);
        }

        debug!(id, method = request.method(), "Issuing call");
        if let Err(e) = self.shared.send_json(&Frame::Request { id, request }).await {
            self.forget(id);
            return Err(e);
        }

        let received = match timeout {
            Some(limit) => match tokio::time::timeout(limit, rx).await {
                Ok(received) => received,
                Err(_) => {
                    self.forget(id);
                    return Err(ProtoError::Timeout);
                }
            },
            None => rx.await,
        };

        match received {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(error)) => Err(ProtoError::Remote(error)),
            Err(_) => Err(ProtoError::ChannelClosed),
        }
    }

    fn pending(
        &self,
    ) -> Result<
        std::sync::MutexGuard<'_, HashMap<u64, oneshot::Sender<Result<Response, TaskError>>>>,
        ProtoError,
    > {
        self.shared
            .pending
            .lock()
            .map_err(|_| ProtoError::ChannelClosed)
    }

    fn forget(&self, id: u64) {
        if let Ok(mut pending) = self.shared.pending.lock() {
            pending.remove(&id);
        }
    }

    /// Returns true once the channel has been closed by either end.
    pub fn is_closed(&self) -> bool {
        self.shared.closed.is_cancelled()
    }

    /// Wait until the channel is closed.
    pub async fn closed(&self) {
        self.shared.closed.cancelled().await
    }

    /// Close the channel. Outstanding calls fail with `ChannelClosed` and the
    /// remote end sees end-of-file.
    pub async fn close(&self) {
        self.shared.closed.cancel();
        self.shared.fail_pending();
        let mut writer = self.shared.writer.lock().await;
        if let Err(e) = writer.shutdown().await {
            debug!(error = %e, "Shutdown of control channel failed");
        }
    }
}

/// Read side of a [`Peer`].
pub struct PeerReader<S> {
    read: ReadHalf<S>,
    shared: Arc<Shared>,
}

impl<S> PeerReader<S>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    /// Start the read loop on a background task.
    pub fn spawn(self, handler: Arc<dyn RequestHandler>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let shared = Arc::clone(&self.shared);
            if let Err(e) = self.read_loop(handler).await {
                warn!(error = %e, "Control channel read loop failed");
            }
            shared.closed.cancel();
            shared.fail_pending();
            debug!("Control channel closed");
        })
    }

    async fn read_loop(self, handler: Arc<dyn RequestHandler>) -> Result<(), ProtoError> {
        let PeerReader { read, shared } = self;
        let mut reader = BufReader::new(read);
        let mut line = String::new();

        loop {
            line.clear();
            let bytes_read = tokio::select! {
                _ = shared.closed.cancelled() => return Ok(()),
                read = reader.read_line(&mut line) => read?,
            };

            if bytes_read == 0 {
                debug!("Control channel EOF");
                return Ok(());
            }

            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }
            trace!("Received frame: {}", trimmed);

            match serde_json::from_str::<Frame>(trimmed) {
                Ok(Frame::Request { id, request }) => {
                    let handler = Arc::clone(&handler);
                    let shared = Arc::clone(&shared);
                    tokio::spawn(async move {
                        let method = request.method();
                        let result = handler.handle(request).await;
                        if let Err(e) = &result {
                            debug!(id, method, error = %e, "Call answered with error");
                        }
                        if let Err(e) = shared.send_json(&Frame::reply(id, result)).await {
                            debug!(id, method, error = %e, "Cannot send response");
                        }
                    });
                }
                Ok(Frame::Response {
                    id,
                    response,
                    error,
                }) => {
                    let waiter = shared.pending.lock().ok().and_then(|mut p| p.remove(&id));
                    let Some(waiter) = waiter else {
                        warn!(id, "Response to unknown call");
                        continue;
                    };
                    let result = match (response, error) {
                        (_, Some(error)) => Err(error),
                        (Some(response), None) => Ok(response),
                        (None, None) => Ok(Response::Ack),
                    };
                    let _ = waiter.send(result);
                }
                Err(e) => {
                    let preview: String = trimmed.chars().take(200).collect();
                    warn!(error = %e, preview = %preview, "Failed to parse frame");
                }
            }
        }
    }
}
