//! taskd control-channel protocol
//!
//! JSON-lines frames exchanged between the dispatcher, its worker processes,
//! and command-line clients, plus the RPC peer that carries them over any
//! `AsyncRead + AsyncWrite` stream.

pub mod error;
pub mod peer;
pub mod protocol;

pub use error::ProtoError;
pub use peer::{Peer, PeerReader, RequestHandler};
pub use protocol::{Frame, Request, Response, RunRequest, StatusReport};

/// Environment variable naming the dispatcher's control socket.
pub const SOCKET_ENV: &str = "TASKD_SOCKET";

/// Default location of the dispatcher's control socket.
pub const DEFAULT_SOCKET_PATH: &str = "/var/run/taskd.sock";
