//! Pool selection from classified client frames.

use std::sync::Arc;

use crate::classify::{QueryClassifier, QueryKind};
use crate::pool::{BackendConnection, ConnectionPool};

/// Routes classified frames to the master or replica pool.
///
/// Reads go to the replica pool; writes and anything unrecognised go to the
/// master, since sending a write to a replica corrupts it while sending a
/// read to the master merely costs capacity. Stateless and shared by every
/// worker thread.
pub struct Router {
    master: Arc<dyn ConnectionPool>,
    replica: Arc<dyn ConnectionPool>,
    classifier: Box<dyn QueryClassifier>,
}

impl Router {
    /// Builds a router over the two pools and a frame classifier.
    #[must_use]
    pub fn new(
        master: Arc<dyn ConnectionPool>,
        replica: Arc<dyn ConnectionPool>,
        classifier: impl QueryClassifier + 'static,
    ) -> Self {
        Self {
            master,
            replica,
            classifier: Box::new(classifier),
        }
    }

    /// Classifies the head of a client frame.
    #[must_use]
    pub fn classify(&self, frame: &[u8]) -> QueryKind {
        self.classifier.classify(frame)
    }

    /// The pool serving `kind`.
    #[must_use]
    pub fn pool_for(&self, kind: QueryKind) -> &Arc<dyn ConnectionPool> {
        match kind {
            QueryKind::Read => &self.replica,
            QueryKind::Write | QueryKind::Unknown => &self.master,
        }
    }

    /// Borrows a connection from the pool serving `kind`.
    ///
    /// Returns `None` when that pool is exhausted.
    #[must_use]
    pub fn acquire(&self, kind: QueryKind) -> Option<Arc<BackendConnection>> {
        self.pool_for(kind).acquire()
    }

    /// Returns a borrowed connection to the pool it came from.
    ///
    /// The caller passes back the classification it acquired with so the
    /// connection lands in its origin pool.
    pub fn release(&self, conn: Arc<BackendConnection>, kind: QueryKind) {
        self.pool_for(kind).release(conn);
    }

    /// The master (write) pool.
    #[must_use]
    pub fn master_pool(&self) -> &Arc<dyn ConnectionPool> {
        &self.master
    }

    /// The replica (read) pool.
    #[must_use]
    pub fn replica_pool(&self) -> &Arc<dyn ConnectionPool> {
        &self.replica
    }
}

impl std::fmt::Debug for Router {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Router")
            .field("master_size", &self.master.size())
            .field("replica_size", &self.replica.size())
            .finish()
    }
}
