//! Backend connection with an atomic state machine.

use std::io::{self, Read, Write};
use std::net::SocketAddr;
use std::os::fd::{AsRawFd, RawFd};
use std::sync::atomic::{AtomicU8, Ordering};
use std::time::Instant;

use mio::net::TcpStream;

/// The four disjoint states of a backend connection.
///
/// Transitions are CAS-only:
///
/// ```text
/// Idle <-> Busy        (try_acquire / release)
/// Idle  -> Stale       (mark_stale)
/// Busy  -> Stale       (mark_stale)
/// *     -> Destroyed   (destroy; absorbing)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnState {
    /// Resting in the pool, available to borrowers.
    Idle = 0,
    /// Exclusively owned by one borrower; only that thread may do I/O.
    Busy = 1,
    /// Failed a health check or aged out; awaiting destruction.
    Stale = 2,
    /// Terminal. The socket has been shut down.
    Destroyed = 3,
}

impl ConnState {
    fn from_raw(raw: u8) -> Self {
        match raw {
            0 => Self::Idle,
            1 => Self::Busy,
            2 => Self::Stale,
            _ => Self::Destroyed,
        }
    }
}

/// One non-blocking socket to a backend server plus the atomic state that
/// grants exclusive I/O ownership.
///
/// Winning the Idle -> Busy CAS is the only way to earn the right to call
/// [`read`](Self::read) or [`write`](Self::write); the state machine is the
/// whole synchronization story, there are no locks.
pub struct BackendConnection {
    stream: TcpStream,
    fd: RawFd,
    state: AtomicU8,
    created_at: Instant,
    peer: SocketAddr,
}

impl BackendConnection {
    /// Wraps an established non-blocking stream, starting in `Idle`.
    #[must_use]
    pub fn new(stream: TcpStream, peer: SocketAddr) -> Self {
        let fd = stream.as_raw_fd();
        Self {
            stream,
            fd,
            state: AtomicU8::new(ConnState::Idle as u8),
            created_at: Instant::now(),
            peer,
        }
    }

    /// Current state. Snapshot only; may be stale by the time it is read.
    #[must_use]
    pub fn state(&self) -> ConnState {
        ConnState::from_raw(self.state.load(Ordering::Acquire))
    }

    /// Claims the connection for exclusive use: `Idle -> Busy`.
    ///
    /// Exactly one of any number of concurrent callers succeeds.
    #[inline]
    pub fn try_acquire(&self) -> bool {
        self.state
            .compare_exchange(
                ConnState::Idle as u8,
                ConnState::Busy as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    /// Hands the connection back: `Busy -> Idle`.
    ///
    /// Fails if the caller did not hold the connection Busy.
    #[inline]
    pub fn release(&self) -> bool {
        self.state
            .compare_exchange(
                ConnState::Busy as u8,
                ConnState::Idle as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    /// Marks the connection stale from `Idle` or `Busy`.
    ///
    /// Refuses once destroyed.
    pub fn mark_stale(&self) -> bool {
        let mut current = self.state.load(Ordering::Acquire);
        loop {
            if current == ConnState::Destroyed as u8 {
                return false;
            }
            match self.state.compare_exchange(
                current,
                ConnState::Stale as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(observed) => current = observed,
            }
        }
    }

    /// Enters the terminal state and severs the connection.
    ///
    /// The swap guarantees the shutdown runs exactly once no matter how
    /// many threads race here; the fd itself is returned to the OS when the
    /// last reference drops.
    pub fn destroy(&self) {
        let prev = self.state.swap(ConnState::Destroyed as u8, Ordering::AcqRel);
        if prev != ConnState::Destroyed as u8 {
            let _ = self.stream.shutdown(std::net::Shutdown::Both);
        }
    }

    /// Reads from the backend socket. `Ok(0)` means the remote end closed.
    ///
    /// Caller must hold the connection Busy (or be its destroyer holding
    /// the only reference).
    #[inline]
    pub fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        (&self.stream).read(buf)
    }

    /// Writes to the backend socket, returning the byte count accepted.
    #[inline]
    pub fn write(&self, buf: &[u8]) -> io::Result<usize> {
        (&self.stream).write(buf)
    }

    /// Raw fd, for registering the socket with a readiness multiplexer.
    #[must_use]
    pub fn raw_fd(&self) -> RawFd {
        self.fd
    }

    /// Monotonic creation timestamp, used for age-based eviction.
    #[must_use]
    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    /// The backend endpoint this connection points at.
    #[must_use]
    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    /// `true` while the connection rests Idle.
    #[must_use]
    pub fn is_usable(&self) -> bool {
        self.state() == ConnState::Idle
    }
}

impl std::fmt::Debug for BackendConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackendConnection")
            .field("peer", &self.peer)
            .field("state", &self.state())
            .field("fd", &self.fd)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;
    use std::sync::Arc;
    use std::thread;

    fn connected(listener: &TcpListener) -> BackendConnection {
        let addr = listener.local_addr().unwrap();
        let stream = TcpStream::connect(addr).unwrap();
        BackendConnection::new(stream, addr)
    }

    #[test]
    fn test_state_machine_happy_path() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let conn = connected(&listener);

        assert_eq!(conn.state(), ConnState::Idle);
        assert!(conn.is_usable());
        assert!(conn.try_acquire());
        assert_eq!(conn.state(), ConnState::Busy);
        assert!(!conn.try_acquire());
        assert!(conn.release());
        assert_eq!(conn.state(), ConnState::Idle);
        assert!(!conn.release());
    }

    #[test]
    fn test_mark_stale_from_idle_and_busy() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();

        let conn = connected(&listener);
        assert!(conn.mark_stale());
        assert_eq!(conn.state(), ConnState::Stale);

        let conn = connected(&listener);
        assert!(conn.try_acquire());
        assert!(conn.mark_stale());
        assert_eq!(conn.state(), ConnState::Stale);
        // A stale connection can no longer be borrowed or released.
        assert!(!conn.try_acquire());
        assert!(!conn.release());
    }

    #[test]
    fn test_destroyed_is_absorbing() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let conn = connected(&listener);

        conn.destroy();
        assert_eq!(conn.state(), ConnState::Destroyed);
        assert!(!conn.mark_stale());
        assert!(!conn.try_acquire());
        assert!(!conn.release());
        // Idempotent.
        conn.destroy();
        assert_eq!(conn.state(), ConnState::Destroyed);
    }

    #[test]
    fn test_exactly_one_concurrent_acquirer_wins() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let conn = Arc::new(connected(&listener));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let conn = Arc::clone(&conn);
            handles.push(thread::spawn(move || usize::from(conn.try_acquire())));
        }
        let winners: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();
        assert_eq!(winners, 1);
        assert_eq!(conn.state(), ConnState::Busy);
    }
}
