//! Event loops: one thread, one multiplexer, many client sockets.
//!
//! Each [`EventLoopHandle`] owns a worker thread running a readiness loop:
//! wait on the poller (1 s timeout), drain pending registrations from the
//! dispatcher, then service ready sockets. Client bytes are classified,
//! forwarded to a pooled backend connection, and the backend's reply is
//! streamed back - the whole round trip without an allocation or a lock.
//!
//! Everything a session touches is owned by its loop thread. The only data
//! crossing thread boundaries are the registration queue (multi-producer,
//! lock-free push) and the shared buffer/connection pools, which are
//! atomic throughout.

mod group;
mod session;

pub use group::EventLoopGroup;

use std::io::{self, Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_queue::SegQueue;
use fxhash::FxHashMap;
use mio::unix::SourceFd;
use mio::{Events, Interest, Poll, Token, Waker};
use tracing::{debug, error, info, warn};

use crate::buffer::DirectBufferPool;
use crate::classify::QueryKind;
use crate::pool::BackendConnection;
use crate::route::Router;

use session::{BorrowedBackend, ClientSession, SessionPhase};

/// Token reserved for the cross-thread waker.
const WAKER_TOKEN: Token = Token(usize::MAX);

/// How long one poll wait may block.
const POLL_TIMEOUT: Duration = Duration::from_secs(1);

/// Ready-event buffer size per poll call.
const EVENTS_CAPACITY: usize = 1024;

/// Spin budget for a non-blocking write before the peer is declared
/// unresponsive. Writes here are request frames and reply chunks that fit
/// kernel socket buffers, so hitting this limit means a stalled peer.
const WRITE_SPIN_LIMIT: usize = 1 << 20;

/// How long `shutdown` waits for a worker thread to exit.
const SHUTDOWN_DEADLINE: Duration = Duration::from_secs(2);

/// Errors raised while standing up an event loop.
#[derive(Debug, thiserror::Error)]
pub enum EventError {
    /// Could not create the readiness poller.
    #[error("failed to create poller for worker {id}: {source}")]
    Poller {
        /// Worker index.
        id: usize,
        /// Underlying error.
        #[source]
        source: io::Error,
    },

    /// Could not create the cross-thread waker.
    #[error("failed to create waker for worker {id}: {source}")]
    Waker {
        /// Worker index.
        id: usize,
        /// Underlying error.
        #[source]
        source: io::Error,
    },

    /// Could not spawn the worker thread.
    #[error("failed to spawn worker {id}: {message}")]
    Spawn {
        /// Worker index.
        id: usize,
        /// Error message.
        message: String,
    },
}

/// Handle to one running event loop thread.
///
/// `register` may be called from any thread; everything else about the
/// loop is private to its worker.
pub struct EventLoopHandle {
    id: usize,
    pending: Arc<SegQueue<std::net::TcpStream>>,
    waker: Arc<Waker>,
    shutdown: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl EventLoopHandle {
    /// Spawns a worker thread running a fresh event loop.
    ///
    /// # Errors
    ///
    /// Returns an error if the poller, waker, or thread cannot be created.
    pub fn spawn(
        id: usize,
        buffers: Arc<DirectBufferPool>,
        router: Arc<Router>,
    ) -> Result<Self, EventError> {
        let poll = Poll::new().map_err(|source| EventError::Poller { id, source })?;
        let waker = Arc::new(
            Waker::new(poll.registry(), WAKER_TOKEN)
                .map_err(|source| EventError::Waker { id, source })?,
        );
        let pending = Arc::new(SegQueue::new());
        let shutdown = Arc::new(AtomicBool::new(false));

        let event_loop = EventLoop {
            id,
            poll,
            pending: Arc::clone(&pending),
            buffers,
            router,
            sessions: FxHashMap::default(),
            backends: FxHashMap::default(),
            next_token: 0,
            shutdown: Arc::clone(&shutdown),
        };

        let thread = thread::Builder::new()
            .name(format!("shunt-worker-{id}"))
            .spawn(move || event_loop.run())
            .map_err(|e| EventError::Spawn {
                id,
                message: e.to_string(),
            })?;

        Ok(Self {
            id,
            pending,
            waker,
            shutdown,
            thread: Some(thread),
        })
    }

    /// Hands a freshly accepted client socket to this loop.
    ///
    /// Lock-free: a queue push and a waker write. Called by the dispatcher
    /// thread.
    pub fn register(&self, stream: std::net::TcpStream) {
        self.pending.push(stream);
        if let Err(e) = self.waker.wake() {
            warn!(worker = self.id, error = %e, "failed to wake event loop");
        }
    }

    /// Flags the loop to stop and interrupts its poll wait.
    pub fn request_shutdown(&self) {
        self.shutdown.store(true, Ordering::Release);
        let _ = self.waker.wake();
    }

    /// Waits up to [`SHUTDOWN_DEADLINE`] for the worker to exit, then
    /// joins it. A worker that overruns the deadline is abandoned with a
    /// warning rather than blocking teardown.
    pub fn join_with_deadline(mut self) {
        let Some(thread) = self.thread.take() else {
            return;
        };
        let deadline = Instant::now() + SHUTDOWN_DEADLINE;
        while !thread.is_finished() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(10));
        }
        if thread.is_finished() {
            if thread.join().is_err() {
                warn!(worker = self.id, "worker thread panicked");
            }
        } else {
            warn!(worker = self.id, "worker thread did not stop in time");
        }
    }
}

/// The loop itself. Lives entirely on its worker thread after spawn.
struct EventLoop {
    id: usize,
    poll: Poll,
    pending: Arc<SegQueue<std::net::TcpStream>>,
    buffers: Arc<DirectBufferPool>,
    router: Arc<Router>,
    sessions: FxHashMap<Token, ClientSession>,
    /// Backend registration token -> owning client token.
    backends: FxHashMap<Token, Token>,
    next_token: usize,
    shutdown: Arc<AtomicBool>,
}

impl EventLoop {
    fn run(mut self) {
        let mut events = Events::with_capacity(EVENTS_CAPACITY);
        info!(worker = self.id, "event loop running");

        loop {
            if self.shutdown.load(Ordering::Acquire) {
                break;
            }

            if let Err(e) = self.poll.poll(&mut events, Some(POLL_TIMEOUT)) {
                if e.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                // Resilient: a poll failure is logged, never fatal.
                error!(worker = self.id, error = %e, "poll failed");
                continue;
            }

            self.drain_pending();

            for event in events.iter() {
                let token = event.token();
                if token == WAKER_TOKEN {
                    continue;
                }
                if self.sessions.contains_key(&token) {
                    self.handle_client_readable(token);
                } else if self.backends.contains_key(&token) {
                    self.handle_backend_readable(token);
                }
                // Unknown tokens are events for sessions closed earlier in
                // this batch; nothing to do.
            }
        }

        self.teardown();
    }

    fn drain_pending(&mut self) {
        while let Some(stream) = self.pending.pop() {
            if let Err(e) = self.register_client(stream) {
                warn!(worker = self.id, error = %e, "failed to register client");
            }
        }
    }

    fn register_client(&mut self, stream: std::net::TcpStream) -> io::Result<()> {
        stream.set_nonblocking(true)?;
        let mut stream = mio::net::TcpStream::from_std(stream);
        let token = self.alloc_token();
        self.poll
            .registry()
            .register(&mut stream, token, Interest::READABLE)?;
        self.sessions.insert(token, ClientSession::new(stream));
        Ok(())
    }

    fn alloc_token(&mut self) -> Token {
        let token = Token(self.next_token);
        self.next_token += 1;
        token
    }

    /// Client socket has bytes: read, classify, forward.
    fn handle_client_readable(&mut self, token: Token) {
        let buffers = Arc::clone(&self.buffers);
        let Some(mut lease) = buffers.lease() else {
            warn!(worker = self.id, "buffer pool exhausted; deferring client read");
            self.rearm_client(token);
            return;
        };

        // Read until WouldBlock: the poller only re-arms on new readiness.
        loop {
            lease.clear();
            let n = {
                let Some(session) = self.sessions.get_mut(&token) else {
                    return;
                };
                match session.stream.read(lease.as_mut_slice()) {
                    Ok(0) => {
                        // Client hung up.
                        self.close_session(token);
                        return;
                    }
                    Ok(n) => n,
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => return,
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                    Err(e) => {
                        debug!(worker = self.id, error = %e, "client read failed");
                        self.close_session(token);
                        return;
                    }
                }
            };
            lease.set_filled(n);
            self.forward_to_backend(token, lease.filled());
            if !self.sessions.contains_key(&token) {
                return;
            }
        }
    }

    /// Pushes one client frame toward a backend, borrowing one if the
    /// session has none.
    fn forward_to_backend(&mut self, token: Token, frame: &[u8]) {
        // More client bytes while a backend is already borrowed belong to
        // the in-flight request; keep them on the same connection.
        let existing = self
            .sessions
            .get(&token)
            .and_then(|s| s.backend.as_ref())
            .map(|b| (Arc::clone(&b.conn), b.kind));
        if let Some((conn, kind)) = existing {
            if let Err(e) = write_full(|bytes| conn.write(bytes), frame) {
                debug!(worker = self.id, error = %e, "backend write failed");
                self.backend_failed(token, Some((conn, kind)));
            }
            return;
        }

        let kind = self.router.classify(frame);
        let Some(conn) = self.router.acquire(kind) else {
            warn!(worker = self.id, ?kind, "pool exhausted; dropping client");
            self.close_session(token);
            return;
        };

        if let Err(e) = write_full(|bytes| conn.write(bytes), frame) {
            debug!(worker = self.id, error = %e, "backend write failed");
            self.discard_backend(&conn, kind);
            self.close_session(token);
            return;
        }

        let backend_token = self.alloc_token();
        let fd = conn.raw_fd();
        if let Err(e) =
            self.poll
                .registry()
                .register(&mut SourceFd(&fd), backend_token, Interest::READABLE)
        {
            error!(worker = self.id, error = %e, "failed to register backend fd");
            self.discard_backend(&conn, kind);
            self.close_session(token);
            return;
        }

        self.backends.insert(backend_token, token);
        if let Some(session) = self.sessions.get_mut(&token) {
            session.backend = Some(BorrowedBackend {
                conn,
                kind,
                token: backend_token,
            });
            session.phase = SessionPhase::AwaitBackendReply;
        } else {
            // Session vanished between read and registration; undo.
            self.backends.remove(&backend_token);
            let _ = self.poll.registry().deregister(&mut SourceFd(&fd));
            self.router.release(conn, kind);
        }
    }

    /// Backend socket has reply bytes: stream them back to the client.
    fn handle_backend_readable(&mut self, backend_token: Token) {
        let Some(&client_token) = self.backends.get(&backend_token) else {
            return;
        };
        let Some((conn, kind)) = self
            .sessions
            .get(&client_token)
            .and_then(|s| s.backend.as_ref())
            .map(|b| (Arc::clone(&b.conn), b.kind))
        else {
            self.backends.remove(&backend_token);
            return;
        };

        let buffers = Arc::clone(&self.buffers);
        let Some(mut lease) = buffers.lease() else {
            warn!(worker = self.id, "buffer pool exhausted; deferring backend read");
            self.rearm_backend(backend_token, conn.raw_fd());
            return;
        };

        loop {
            lease.clear();
            match conn.read(lease.as_mut_slice()) {
                Ok(0) => {
                    // Backend closed under us mid-conversation.
                    self.backend_failed(client_token, Some((conn, kind)));
                    return;
                }
                Ok(n) => {
                    lease.set_filled(n);
                    if let Some(session) = self.sessions.get_mut(&client_token) {
                        session.phase = SessionPhase::StreamingBackendToClient;
                        if let Err(e) =
                            write_full(|bytes| session.stream.write(bytes), lease.filled())
                        {
                            debug!(worker = self.id, error = %e, "client write failed");
                            self.close_session(client_token);
                            return;
                        }
                    } else {
                        return;
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    // Drained. If nothing streamed yet this was a spurious
                    // wakeup; keep waiting for the reply.
                    let streamed = self
                        .sessions
                        .get(&client_token)
                        .is_some_and(|s| s.phase == SessionPhase::StreamingBackendToClient);
                    if streamed {
                        self.return_backend(client_token);
                    }
                    return;
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    debug!(worker = self.id, error = %e, "backend read failed");
                    self.backend_failed(client_token, Some((conn, kind)));
                    return;
                }
            }
        }
    }

    /// Reply fully drained: hand the backend connection back to its pool
    /// and go wait for the client's next frame.
    fn return_backend(&mut self, client_token: Token) {
        let borrowed = self
            .sessions
            .get_mut(&client_token)
            .and_then(|s| s.backend.take());
        if let Some(borrowed) = borrowed {
            self.deregister_backend(&borrowed);
            self.router.release(borrowed.conn, borrowed.kind);
        }
        if let Some(session) = self.sessions.get_mut(&client_token) {
            session.phase = SessionPhase::AwaitClientBytes;
        }
    }

    /// Backend I/O failure: the connection is dead. Destroy it, remove it
    /// from its pool, and close the client session. The pool gap is
    /// refilled by the janitor's next sweep.
    fn backend_failed(
        &mut self,
        client_token: Token,
        known: Option<(Arc<BackendConnection>, QueryKind)>,
    ) {
        let borrowed = self
            .sessions
            .get_mut(&client_token)
            .and_then(|s| s.backend.take());
        if let Some(borrowed) = borrowed {
            self.deregister_backend(&borrowed);
            self.discard_backend(&borrowed.conn, borrowed.kind);
        } else if let Some((conn, kind)) = known {
            self.discard_backend(&conn, kind);
        }
        if let Some(session) = self.sessions.get_mut(&client_token) {
            session.phase = SessionPhase::Closing;
        }
        self.close_session(client_token);
    }

    /// Stale-destroy-remove for a connection that failed under us.
    fn discard_backend(&self, conn: &Arc<BackendConnection>, kind: QueryKind) {
        conn.mark_stale();
        conn.destroy();
        self.router.pool_for(kind).remove(conn);
    }

    fn deregister_backend(&mut self, borrowed: &BorrowedBackend) {
        self.backends.remove(&borrowed.token);
        let fd = borrowed.conn.raw_fd();
        let _ = self.poll.registry().deregister(&mut SourceFd(&fd));
    }

    /// Tears a session down, releasing any borrowed backend.
    fn close_session(&mut self, token: Token) {
        let Some(mut session) = self.sessions.remove(&token) else {
            return;
        };
        session.phase = SessionPhase::Closing;
        if let Some(borrowed) = session.backend.take() {
            self.deregister_backend(&borrowed);
            self.router.release(borrowed.conn, borrowed.kind);
        }
        let _ = self.poll.registry().deregister(&mut session.stream);
        // Dropping the stream closes the socket.
    }

    /// Forces the poller to renotify a client socket whose read was
    /// skipped.
    fn rearm_client(&mut self, token: Token) {
        let Some(session) = self.sessions.get_mut(&token) else {
            return;
        };
        let _ = self
            .poll
            .registry()
            .reregister(&mut session.stream, token, Interest::READABLE);
    }

    /// Same, for a borrowed backend fd.
    fn rearm_backend(&mut self, token: Token, fd: std::os::fd::RawFd) {
        let _ = self
            .poll
            .registry()
            .reregister(&mut SourceFd(&fd), token, Interest::READABLE);
    }

    fn teardown(&mut self) {
        let tokens: Vec<Token> = self.sessions.keys().copied().collect();
        for token in tokens {
            self.close_session(token);
        }
        info!(worker = self.id, "event loop stopped");
    }
}

/// Writes all of `bytes` through a non-blocking writer, spinning briefly on
/// `WouldBlock`.
fn write_full<F>(mut write: F, mut bytes: &[u8]) -> io::Result<()>
where
    F: FnMut(&[u8]) -> io::Result<usize>,
{
    let mut spins = 0usize;
    while !bytes.is_empty() {
        match write(bytes) {
            Ok(0) => {
                return Err(io::Error::new(
                    io::ErrorKind::WriteZero,
                    "socket accepted zero bytes",
                ))
            }
            Ok(n) => {
                bytes = &bytes[n..];
                spins = 0;
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                spins += 1;
                if spins > WRITE_SPIN_LIMIT {
                    return Err(io::Error::new(
                        io::ErrorKind::TimedOut,
                        "peer stalled mid-write",
                    ));
                }
                std::hint::spin_loop();
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classify::VerbClassifier;
    use crate::pool::{BackendFactory, ConnectionPool, PoolVariant};
    use std::io::{Read as _, Write as _};
    use std::net::{TcpListener, TcpStream};
    use std::time::Duration;

    fn spawn_echo_backend() -> std::net::SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        thread::spawn(move || {
            for stream in listener.incoming() {
                let Ok(mut stream) = stream else { break };
                thread::spawn(move || {
                    let mut buf = [0u8; 4096];
                    loop {
                        match stream.read(&mut buf) {
                            Ok(0) | Err(_) => break,
                            Ok(n) => {
                                if stream.write_all(&buf[..n]).is_err() {
                                    break;
                                }
                            }
                        }
                    }
                });
            }
        });
        addr
    }

    fn test_router(backend: std::net::SocketAddr, capacity: usize) -> Arc<Router> {
        let factory = BackendFactory::new(backend);
        let master = PoolVariant::Cas.build(capacity);
        let replica = PoolVariant::Cas.build(capacity);
        for _ in 0..capacity {
            assert!(master.offer(Arc::new(factory.create().unwrap())));
            assert!(replica.offer(Arc::new(factory.create().unwrap())));
        }
        Arc::new(Router::new(master, replica, VerbClassifier))
    }

    /// Connects a client through a loopback listener and hands the server
    /// half to the loop as the "client" socket.
    fn client_pair(handle: &EventLoopHandle) -> TcpStream {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let client = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (server_half, _) = listener.accept().unwrap();
        handle.register(server_half);
        client
    }

    #[test]
    fn test_select_round_trip_through_one_loop() {
        let backend = spawn_echo_backend();
        let buffers = Arc::new(DirectBufferPool::new(16, 1024));
        let router = test_router(backend, 2);
        let handle = EventLoopHandle::spawn(0, buffers, Arc::clone(&router)).unwrap();

        let mut client = client_pair(&handle);
        client
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();

        let query = b"SELECT 1;";
        client.write_all(query).unwrap();

        let mut reply = vec![0u8; query.len()];
        client.read_exact(&mut reply).unwrap();
        assert_eq!(&reply, query);

        // The borrowed replica connection went back after the reply.
        thread::sleep(Duration::from_millis(100));
        assert!(router.replica_pool().acquire().is_some());

        handle.request_shutdown();
        handle.join_with_deadline();
    }

    #[test]
    fn test_sequential_queries_reuse_the_session() {
        let backend = spawn_echo_backend();
        let buffers = Arc::new(DirectBufferPool::new(16, 1024));
        let router = test_router(backend, 2);
        let handle = EventLoopHandle::spawn(0, buffers, router).unwrap();

        let mut client = client_pair(&handle);
        client
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();

        for query in [&b"SELECT a FROM t;"[..], b"INSERT INTO t VALUES(1);"] {
            client.write_all(query).unwrap();
            let mut reply = vec![0u8; query.len()];
            client.read_exact(&mut reply).unwrap();
            assert_eq!(reply, query);
            // Give the loop time to drain the reply and return the borrow
            // before the next frame arrives.
            thread::sleep(Duration::from_millis(50));
        }

        handle.request_shutdown();
        handle.join_with_deadline();
    }

    #[test]
    fn test_client_disconnect_releases_resources() {
        let backend = spawn_echo_backend();
        let buffers = Arc::new(DirectBufferPool::new(16, 1024));
        let router = test_router(backend, 1);
        let handle = EventLoopHandle::spawn(0, buffers, Arc::clone(&router)).unwrap();

        let client = client_pair(&handle);
        thread::sleep(Duration::from_millis(100));
        drop(client);
        thread::sleep(Duration::from_millis(200));

        // Nothing leaked: the single master connection is still borrowable.
        assert_eq!(router.master_pool().size(), 1);

        handle.request_shutdown();
        handle.join_with_deadline();
    }

    #[test]
    fn test_shutdown_stops_the_worker() {
        let backend = spawn_echo_backend();
        let buffers = Arc::new(DirectBufferPool::new(4, 512));
        let router = test_router(backend, 1);
        let handle = EventLoopHandle::spawn(7, buffers, router).unwrap();

        let _client = client_pair(&handle);
        thread::sleep(Duration::from_millis(50));
        handle.request_shutdown();
        handle.join_with_deadline();
    }
}
