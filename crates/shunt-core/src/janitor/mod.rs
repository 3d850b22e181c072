//! Background pool maintenance.
//!
//! One janitor thread per pool. Each sweep borrows idle connections one at
//! a time, checks age and liveness, and swaps anything unhealthy for a
//! fresh connection from the factory. The hot path is never quiesced: a
//! connection under probe is simply Busy, indistinguishable from one
//! serving a request, and the sweep is bounded by pool capacity.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::pool::{BackendConnection, BackendFactory, ConnectionPool};

/// Errors raised while starting a janitor.
#[derive(Debug, thiserror::Error)]
pub enum JanitorError {
    /// The OS refused to spawn the sweep thread.
    #[error("failed to spawn janitor thread for {pool}: {message}")]
    Spawn {
        /// Pool label.
        pool: &'static str,
        /// Error message.
        message: String,
    },
}

/// Outcome of one sweep.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SweepStats {
    /// Connections borrowed and inspected.
    pub checked: usize,
    /// Unhealthy connections destroyed and replaced.
    pub replaced: usize,
    /// Additional connections created to top the pool back up.
    pub refilled: usize,
}

impl SweepStats {
    fn any_work(&self) -> bool {
        self.checked > 0 || self.replaced > 0 || self.refilled > 0
    }
}

/// Periodic health checker for one connection pool.
pub struct Janitor {
    pool: Arc<dyn ConnectionPool>,
    factory: BackendFactory,
    max_idle: Duration,
    interval: Duration,
    label: &'static str,
}

impl Janitor {
    /// Creates a janitor for `pool`, replacing bad connections via
    /// `factory`.
    #[must_use]
    pub fn new(
        pool: Arc<dyn ConnectionPool>,
        factory: BackendFactory,
        max_idle: Duration,
        interval: Duration,
        label: &'static str,
    ) -> Self {
        Self {
            pool,
            factory,
            max_idle,
            interval,
            label,
        }
    }

    /// Runs one sweep immediately on the calling thread.
    ///
    /// Borrows up to `capacity` connections; each is aged, probed, and
    /// either released or destroyed and replaced. Afterwards the pool is
    /// topped up to capacity, refilling gaps left by connections the event
    /// loops destroyed after I/O failures.
    pub fn sweep(&self) -> SweepStats {
        let mut stats = SweepStats::default();

        for _ in 0..self.pool.capacity() {
            let Some(conn) = self.pool.acquire() else {
                // Nothing idle left to inspect.
                break;
            };
            stats.checked += 1;

            let expired = conn.created_at().elapsed() > self.max_idle;
            let healthy = !expired && self.probe(&conn);

            if healthy {
                self.pool.release(conn);
            } else {
                debug!(
                    pool = self.label,
                    peer = %conn.peer(),
                    expired,
                    "recycling unhealthy connection"
                );
                conn.mark_stale();
                conn.destroy();
                self.pool.remove(&conn);
                if self.replace() {
                    stats.replaced += 1;
                }
            }
        }

        stats.refilled = self.refill();
        stats
    }

    /// Probes liveness with a non-blocking read.
    ///
    /// An idle backend has nothing to send, so the expected healthy answer
    /// is `WouldBlock`. A zero-length read means the remote end closed.
    fn probe(&self, conn: &BackendConnection) -> bool {
        let mut probe_buf = [0u8; 8];
        match conn.read(&mut probe_buf) {
            Ok(0) => false,
            Ok(_) => true,
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => true,
            Err(_) => false,
        }
    }

    /// Creates one replacement and offers it. Returns `true` on success.
    fn replace(&self) -> bool {
        match self.factory.create() {
            Ok(fresh) => {
                let fresh = Arc::new(fresh);
                if self.pool.offer(Arc::clone(&fresh)) {
                    true
                } else {
                    // Pool refused it (filled concurrently); don't leak the
                    // socket.
                    fresh.destroy();
                    false
                }
            }
            Err(e) => {
                warn!(pool = self.label, error = %e, "failed to create replacement connection");
                false
            }
        }
    }

    /// Tops the pool up to capacity. Stops at the first failure so an
    /// unreachable backend costs one connect attempt per sweep.
    fn refill(&self) -> usize {
        let mut refilled = 0;
        for _ in 0..self.pool.capacity() {
            if self.pool.size() >= self.pool.capacity() {
                break;
            }
            match self.factory.create() {
                Ok(fresh) => {
                    let fresh = Arc::new(fresh);
                    if self.pool.offer(Arc::clone(&fresh)) {
                        refilled += 1;
                    } else {
                        fresh.destroy();
                        break;
                    }
                }
                Err(e) => {
                    warn!(pool = self.label, error = %e, "failed to refill pool");
                    break;
                }
            }
        }
        refilled
    }

    /// Starts the sweep thread.
    ///
    /// # Errors
    ///
    /// Returns [`JanitorError::Spawn`] if the thread cannot be created.
    pub fn spawn(self) -> Result<JanitorHandle, JanitorError> {
        let shutdown = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&shutdown);
        let label = self.label;

        let thread = thread::Builder::new()
            .name(format!("shunt-janitor-{label}"))
            .spawn(move || {
                info!(pool = self.label, interval = ?self.interval, "janitor started");
                while !flag.load(Ordering::Acquire) {
                    thread::park_timeout(self.interval);
                    if flag.load(Ordering::Acquire) {
                        break;
                    }
                    let stats = self.sweep();
                    if stats.any_work() {
                        info!(
                            pool = self.label,
                            checked = stats.checked,
                            replaced = stats.replaced,
                            refilled = stats.refilled,
                            "sweep complete"
                        );
                    }
                }
                info!(pool = self.label, "janitor stopped");
            })
            .map_err(|e| JanitorError::Spawn {
                pool: label,
                message: e.to_string(),
            })?;

        Ok(JanitorHandle {
            shutdown,
            thread: Some(thread),
            label,
        })
    }
}

/// Handle to a running janitor thread.
pub struct JanitorHandle {
    shutdown: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
    label: &'static str,
}

impl JanitorHandle {
    /// Signals the janitor to stop at its next wake-up and interrupts the
    /// current sleep.
    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::Release);
        if let Some(thread) = &self.thread {
            thread.thread().unpark();
        }
    }

    /// Signals shutdown and waits for the thread to exit.
    pub fn shutdown_and_join(mut self) {
        self.shutdown();
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                warn!(pool = self.label, "janitor thread panicked");
            }
        }
    }
}

impl Drop for JanitorHandle {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::Release);
        if let Some(thread) = self.thread.take() {
            thread.thread().unpark();
            let _ = thread.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::{PoolVariant, ScanCasPool};
    use std::net::TcpListener;
    use std::thread::sleep;

    #[test]
    fn test_sweep_replaces_expired_connection() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let factory = BackendFactory::new(listener.local_addr().unwrap());
        let pool: Arc<dyn ConnectionPool> = Arc::new(ScanCasPool::new(4));

        // One old connection, then three young ones.
        let old = Arc::new(factory.create().unwrap());
        assert!(pool.offer(Arc::clone(&old)));
        sleep(Duration::from_millis(120));
        for _ in 0..3 {
            assert!(pool.offer(Arc::new(factory.create().unwrap())));
        }

        let janitor = Janitor::new(
            Arc::clone(&pool),
            factory,
            Duration::from_millis(80),
            Duration::from_secs(30),
            "test",
        );
        let stats = janitor.sweep();

        assert_eq!(stats.replaced, 1);
        assert_eq!(pool.size(), 4);
        assert_eq!(old.state(), crate::pool::ConnState::Destroyed);
        // The replacement is younger than the connection it displaced.
        let mut survivors = Vec::new();
        while let Some(conn) = pool.acquire() {
            assert!(!Arc::ptr_eq(&conn, &old));
            assert!(conn.created_at() > old.created_at());
            survivors.push(conn);
        }
        assert_eq!(survivors.len(), 4);
    }

    #[test]
    fn test_sweep_replaces_remotely_closed_connection() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let factory = BackendFactory::new(listener.local_addr().unwrap());
        let pool: Arc<dyn ConnectionPool> = PoolVariant::Cas.build(1);

        let dead = Arc::new(factory.create().unwrap());
        // Accept the backend half and close it so the probe sees EOF.
        let (accepted, _) = listener.accept().unwrap();
        drop(accepted);
        sleep(Duration::from_millis(50));
        assert!(pool.offer(Arc::clone(&dead)));

        let janitor = Janitor::new(
            Arc::clone(&pool),
            factory,
            Duration::from_secs(300),
            Duration::from_secs(30),
            "test",
        );
        let stats = janitor.sweep();

        assert_eq!(stats.checked, 1);
        assert_eq!(stats.replaced, 1);
        assert_eq!(pool.size(), 1);
        assert_eq!(dead.state(), crate::pool::ConnState::Destroyed);
    }

    #[test]
    fn test_sweep_keeps_healthy_pool_intact() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let factory = BackendFactory::new(listener.local_addr().unwrap());
        let pool: Arc<dyn ConnectionPool> = PoolVariant::Ring.build(4);
        for _ in 0..4 {
            assert!(pool.offer(Arc::new(factory.create().unwrap())));
        }

        let janitor = Janitor::new(
            Arc::clone(&pool),
            factory,
            Duration::from_secs(300),
            Duration::from_secs(30),
            "test",
        );
        let stats = janitor.sweep();

        assert_eq!(stats.replaced, 0);
        assert_eq!(stats.refilled, 0);
        assert_eq!(pool.size(), 4);
    }

    #[test]
    fn test_sweep_refills_external_gaps() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let factory = BackendFactory::new(listener.local_addr().unwrap());
        let pool: Arc<dyn ConnectionPool> = PoolVariant::Cas.build(3);
        for _ in 0..3 {
            assert!(pool.offer(Arc::new(factory.create().unwrap())));
        }

        // An event loop hitting a backend failure destroys and removes the
        // connection itself, leaving a gap for the next sweep.
        let casualty = pool.acquire().unwrap();
        casualty.mark_stale();
        casualty.destroy();
        assert!(pool.remove(&casualty));
        assert_eq!(pool.size(), 2);

        let janitor = Janitor::new(
            Arc::clone(&pool),
            factory,
            Duration::from_secs(300),
            Duration::from_secs(30),
            "test",
        );
        let stats = janitor.sweep();

        assert_eq!(stats.refilled, 1);
        assert_eq!(pool.size(), 3);
    }

    #[test]
    fn test_spawned_janitor_shuts_down_promptly() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let factory = BackendFactory::new(listener.local_addr().unwrap());
        let pool: Arc<dyn ConnectionPool> = PoolVariant::Cas.build(2);

        let janitor = Janitor::new(
            pool,
            factory,
            Duration::from_secs(300),
            // Long interval: shutdown must interrupt the sleep, not wait it
            // out.
            Duration::from_secs(3600),
            "test",
        );
        let handle = janitor.spawn().unwrap();
        sleep(Duration::from_millis(50));
        handle.shutdown_and_join();
    }
}
