//! Per-client session state, owned exclusively by one event loop thread.

use std::sync::Arc;

use mio::net::TcpStream;
use mio::Token;

use crate::classify::QueryKind;
use crate::pool::BackendConnection;

/// Where a session is in its request/reply cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SessionPhase {
    /// Waiting for the client to send a frame.
    AwaitClientBytes,
    /// Request forwarded; waiting for the first backend bytes.
    AwaitBackendReply,
    /// Backend bytes are flowing back to the client.
    StreamingBackendToClient,
    /// Being torn down.
    Closing,
}

/// A backend connection currently borrowed on behalf of one client.
pub(crate) struct BorrowedBackend {
    /// The Busy connection; this loop thread is its exclusive I/O owner.
    pub conn: Arc<BackendConnection>,
    /// Classification the connection was acquired under, so release puts
    /// it back into the pool it came from.
    pub kind: QueryKind,
    /// Token the backend fd is registered under.
    pub token: Token,
}

/// One registered client socket and everything attached to it. Keyed by
/// its registration token in the loop's session map.
pub(crate) struct ClientSession {
    pub stream: TcpStream,
    pub backend: Option<BorrowedBackend>,
    pub phase: SessionPhase,
}

impl ClientSession {
    pub(crate) fn new(stream: TcpStream) -> Self {
        Self {
            stream,
            backend: None,
            phase: SessionPhase::AwaitClientBytes,
        }
    }
}
