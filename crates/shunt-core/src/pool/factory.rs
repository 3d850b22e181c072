//! Opens non-blocking backend connections.

use std::io;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use mio::net::TcpStream;

use super::connection::BackendConnection;

/// Upper bound on the connect spin-wait. Generous for a LAN backend while
/// still letting a janitor replacement cycle fail instead of hang.
const CONNECT_DEADLINE: Duration = Duration::from_secs(10);

/// Errors produced while establishing a backend connection.
#[derive(Debug, thiserror::Error)]
pub enum FactoryError {
    /// The connect attempt failed outright.
    #[error("failed to connect to backend {addr}: {source}")]
    Connect {
        /// The backend endpoint.
        addr: SocketAddr,
        /// The underlying socket error.
        #[source]
        source: io::Error,
    },

    /// The non-blocking connect did not complete within the deadline.
    #[error("connect to backend {addr} timed out")]
    Timeout {
        /// The backend endpoint.
        addr: SocketAddr,
    },
}

/// Creates [`BackendConnection`]s to one configured endpoint.
///
/// Used to fill pools at startup and by the janitor when replacing stale
/// connections. The master and replica pools each get their own factory so
/// deployments can point them at distinct endpoints.
#[derive(Debug, Clone)]
pub struct BackendFactory {
    addr: SocketAddr,
}

impl BackendFactory {
    /// A factory connecting to `addr`.
    #[must_use]
    pub fn new(addr: SocketAddr) -> Self {
        Self { addr }
    }

    /// The endpoint this factory connects to.
    #[must_use]
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Opens a fresh non-blocking connection, spinning until the handshake
    /// completes, and returns it in the Idle state.
    ///
    /// # Errors
    ///
    /// Returns [`FactoryError::Connect`] if the socket reports a failure and
    /// [`FactoryError::Timeout`] if the handshake does not finish in time.
    pub fn create(&self) -> Result<BackendConnection, FactoryError> {
        let stream = TcpStream::connect(self.addr).map_err(|source| FactoryError::Connect {
            addr: self.addr,
            source,
        })?;

        let deadline = Instant::now() + CONNECT_DEADLINE;
        loop {
            // A refused or reset connect surfaces through SO_ERROR.
            if let Some(source) = stream.take_error().map_err(|source| FactoryError::Connect {
                addr: self.addr,
                source,
            })? {
                return Err(FactoryError::Connect {
                    addr: self.addr,
                    source,
                });
            }

            match stream.peer_addr() {
                Ok(_) => break,
                Err(e)
                    if e.kind() == io::ErrorKind::NotConnected
                        || e.raw_os_error() == Some(libc::EINPROGRESS) =>
                {
                    if Instant::now() >= deadline {
                        return Err(FactoryError::Timeout { addr: self.addr });
                    }
                    std::hint::spin_loop();
                }
                Err(source) => {
                    return Err(FactoryError::Connect {
                        addr: self.addr,
                        source,
                    })
                }
            }
        }

        Ok(BackendConnection::new(stream, self.addr))
    }
}
