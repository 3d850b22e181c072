//! Blocking accept loop feeding the event loop group.

use std::io;
use std::net::{SocketAddr, TcpListener};
use std::sync::atomic::{AtomicBool, Ordering};

use tracing::{debug, error, info};

use crate::event::EventLoopGroup;

/// Errors raised by the acceptor.
#[derive(Debug, thiserror::Error)]
pub enum AcceptorError {
    /// Could not bind the listen socket.
    #[error("failed to bind listen port {port}: {source}")]
    Bind {
        /// Requested port.
        port: u16,
        /// Underlying error.
        #[source]
        source: io::Error,
    },

    /// The listen socket failed in a way accept cannot recover from.
    #[error("listen socket failed: {0}")]
    Listen(#[source] io::Error),
}

/// Accepts client connections and hands them to the group.
///
/// The listener stays in blocking mode: `accept` is the one intentionally
/// blocking call in the whole system. A signal handler installed without
/// `SA_RESTART` makes `accept` return `EINTR`, which is how shutdown breaks
/// the loop.
pub struct Acceptor {
    listener: TcpListener,
}

impl Acceptor {
    /// Binds the wildcard address on `port`.
    ///
    /// # Errors
    ///
    /// Returns [`AcceptorError::Bind`] when the port is unavailable.
    pub fn bind(port: u16) -> Result<Self, AcceptorError> {
        let listener = TcpListener::bind(("0.0.0.0", port))
            .map_err(|source| AcceptorError::Bind { port, source })?;
        Ok(Self { listener })
    }

    /// The actual bound address, useful when `port` was zero.
    ///
    /// # Errors
    ///
    /// Propagates the socket error.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accepts until `running` goes false or the socket fails fatally.
    ///
    /// Transient accept errors (aborted handshakes, interruptions) are
    /// skipped; anything else is surfaced so the caller can exit non-zero.
    ///
    /// # Errors
    ///
    /// Returns [`AcceptorError::Listen`] on an unrecoverable socket error.
    pub fn run(&self, group: &EventLoopGroup, running: &AtomicBool) -> Result<(), AcceptorError> {
        info!(addr = ?self.listener.local_addr().ok(), "accepting connections");
        while running.load(Ordering::Acquire) {
            match self.listener.accept() {
                Ok((stream, peer)) => {
                    debug!(%peer, "accepted client");
                    group.dispatch(stream);
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {
                    // Signal delivery; the loop condition decides.
                }
                Err(e) if e.kind() == io::ErrorKind::ConnectionAborted => {
                    debug!(error = %e, "client aborted during accept");
                }
                Err(e) => {
                    error!(error = %e, "accept failed");
                    return Err(AcceptorError::Listen(e));
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::DirectBufferPool;
    use crate::classify::VerbClassifier;
    use crate::pool::PoolVariant;
    use crate::route::Router;
    use std::sync::Arc;

    #[test]
    fn test_bind_ephemeral_port() {
        let acceptor = Acceptor::bind(0).unwrap();
        let addr = acceptor.local_addr().unwrap();
        assert_ne!(addr.port(), 0);
    }

    #[test]
    fn test_bind_conflict_is_an_error() {
        let first = Acceptor::bind(0).unwrap();
        let port = first.local_addr().unwrap().port();
        assert!(matches!(
            Acceptor::bind(port),
            Err(AcceptorError::Bind { .. })
        ));
    }

    #[test]
    fn test_accepted_clients_reach_the_group() {
        let buffers = Arc::new(DirectBufferPool::new(4, 256));
        let router = Arc::new(Router::new(
            PoolVariant::Cas.build(1),
            PoolVariant::Cas.build(1),
            VerbClassifier,
        ));
        let group = EventLoopGroup::new(1, buffers, router).unwrap();

        let acceptor = Acceptor::bind(0).unwrap();
        let addr = acceptor.local_addr().unwrap();
        let running = Arc::new(AtomicBool::new(true));

        let flag = Arc::clone(&running);
        let accept_thread = std::thread::spawn(move || {
            let _ = acceptor.run(&group, flag.as_ref());
            group.shutdown();
        });

        let client = std::net::TcpStream::connect(addr).unwrap();
        std::thread::sleep(std::time::Duration::from_millis(100));
        drop(client);

        // Unblock the accept call so the loop observes the cleared flag.
        running.store(false, Ordering::Release);
        let _ = std::net::TcpStream::connect(addr);
        accept_thread.join().unwrap();
    }
}
