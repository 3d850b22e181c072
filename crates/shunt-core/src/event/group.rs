//! Round-robin ownership of N event loops.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tracing::info;

use crate::buffer::DirectBufferPool;
use crate::route::Router;

use super::{EventError, EventLoopHandle};

/// Owns the worker event loops and spreads accepted sockets across them.
pub struct EventLoopGroup {
    handles: Vec<EventLoopHandle>,
    next: AtomicUsize,
}

impl EventLoopGroup {
    /// Spawns `worker_count` event loops sharing one buffer pool and one
    /// router.
    ///
    /// # Errors
    ///
    /// Returns the first spawn failure. Already-spawned loops are shut down
    /// by drop.
    pub fn new(
        worker_count: usize,
        buffers: Arc<DirectBufferPool>,
        router: Arc<Router>,
    ) -> Result<Self, EventError> {
        let mut handles = Vec::with_capacity(worker_count);
        for id in 0..worker_count {
            handles.push(EventLoopHandle::spawn(
                id,
                Arc::clone(&buffers),
                Arc::clone(&router),
            )?);
        }
        info!(workers = worker_count, "event loop group started");
        Ok(Self {
            handles,
            next: AtomicUsize::new(0),
        })
    }

    /// Assigns an accepted client socket to the next loop, round-robin.
    pub fn dispatch(&self, stream: std::net::TcpStream) {
        let idx = self.next.fetch_add(1, Ordering::Relaxed) % self.handles.len();
        self.handles[idx].register(stream);
    }

    /// Number of worker loops.
    #[must_use]
    pub fn worker_count(&self) -> usize {
        self.handles.len()
    }

    /// Stops every loop and joins the worker threads, each with a bounded
    /// wait.
    pub fn shutdown(self) {
        for handle in &self.handles {
            handle.request_shutdown();
        }
        for handle in self.handles {
            handle.join_with_deadline();
        }
        info!("all worker threads stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classify::VerbClassifier;
    use crate::pool::PoolVariant;
    use crate::route::Router;

    fn empty_router() -> Arc<Router> {
        Arc::new(Router::new(
            PoolVariant::Cas.build(1),
            PoolVariant::Cas.build(1),
            VerbClassifier,
        ))
    }

    #[test]
    fn test_group_spawns_and_shuts_down() {
        let buffers = Arc::new(DirectBufferPool::new(4, 256));
        let group = EventLoopGroup::new(4, buffers, empty_router()).unwrap();
        assert_eq!(group.worker_count(), 4);
        group.shutdown();
    }

    #[test]
    fn test_dispatch_round_robins_across_loops() {
        let buffers = Arc::new(DirectBufferPool::new(4, 256));
        let group = EventLoopGroup::new(2, buffers, empty_router()).unwrap();

        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let mut clients = Vec::new();
        for _ in 0..4 {
            clients.push(std::net::TcpStream::connect(addr).unwrap());
            let (server_half, _) = listener.accept().unwrap();
            group.dispatch(server_half);
        }

        std::thread::sleep(std::time::Duration::from_millis(100));
        group.shutdown();
    }
}
