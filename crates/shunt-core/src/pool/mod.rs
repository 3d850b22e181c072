//! Lock-free backend connection pooling.
//!
//! Two interchangeable implementations sit behind the [`ConnectionPool`]
//! trait:
//!
//! - [`ScanCasPool`] - fixed slot array, claim by rotating CAS scan
//! - [`RingPool`] - power-of-two ring with cache-line padded sequences
//!
//! Both keep connections as `Arc`s inside epoch-managed atomic slots, so a
//! scan can dereference a slot without risking a use-after-free against a
//! concurrent removal: destruction of the slot cell is deferred until every
//! in-flight reader has unpinned.
//!
//! ```text
//!  worker ──acquire──▶ pool ──CAS Idle→Busy──▶ BackendConnection
//!  worker ──release──▶ pool ──CAS Busy→Idle──▶ (back in the bag)
//!  janitor ─remove──▶ slot cleared, destruction deferred
//! ```

mod connection;
mod factory;
mod padded;
mod ring;
mod scan_cas;

pub use connection::{BackendConnection, ConnState};
pub use factory::{BackendFactory, FactoryError};
pub use padded::PaddedCounter;
pub use ring::RingPool;
pub use scan_cas::ScanCasPool;

use std::str::FromStr;
use std::sync::Arc;

/// The pooling contract worker threads and the janitor program against.
///
/// Every method is lock-free; `acquire` and `release` are additionally
/// wait-free in the common path. Stored connections are always Idle or
/// Busy - callers that mark a connection Stale or Destroyed must remove it.
pub trait ConnectionPool: Send + Sync {
    /// Borrows an idle connection, transitioning it to Busy.
    ///
    /// Returns `None` after a full unsuccessful sweep. That can happen even
    /// while empty slots exist if concurrent borrowers drained the pool.
    fn acquire(&self) -> Option<Arc<BackendConnection>>;

    /// Returns a borrowed connection, transitioning it Busy -> Idle.
    ///
    /// A connection that is not Busy is left untouched; the caller broke
    /// the borrowing contract and the pool refuses to double-publish it.
    fn release(&self, conn: Arc<BackendConnection>);

    /// Adds a fresh connection. Returns `false` when the pool is full.
    fn offer(&self, conn: Arc<BackendConnection>) -> bool;

    /// Removes a specific connection. Returns `false` if it was not found.
    fn remove(&self, conn: &Arc<BackendConnection>) -> bool;

    /// Current number of pooled connections. Snapshot only.
    fn size(&self) -> usize;

    /// Fixed capacity chosen at construction.
    fn capacity(&self) -> usize;
}

/// Which [`ConnectionPool`] implementation to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PoolVariant {
    /// [`ScanCasPool`].
    #[default]
    Cas,
    /// [`RingPool`].
    Ring,
}

impl PoolVariant {
    /// Constructs a pool of this variant behind a shared handle.
    #[must_use]
    pub fn build(self, capacity: usize) -> Arc<dyn ConnectionPool> {
        match self {
            Self::Cas => Arc::new(ScanCasPool::new(capacity)),
            Self::Ring => Arc::new(RingPool::new(capacity)),
        }
    }
}

impl std::fmt::Display for PoolVariant {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Cas => f.write_str("cas"),
            Self::Ring => f.write_str("ring"),
        }
    }
}

/// Error returned when a pool variant name is not recognised.
#[derive(Debug, thiserror::Error)]
#[error("unknown pool variant {0:?} (expected \"cas\" or \"ring\")")]
pub struct UnknownPoolVariant(String);

impl FromStr for PoolVariant {
    type Err = UnknownPoolVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "cas" => Ok(Self::Cas),
            "ring" => Ok(Self::Ring),
            other => Err(UnknownPoolVariant(other.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_variant_parsing() {
        assert_eq!("cas".parse::<PoolVariant>().unwrap(), PoolVariant::Cas);
        assert_eq!("ring".parse::<PoolVariant>().unwrap(), PoolVariant::Ring);
        assert!("lifo".parse::<PoolVariant>().is_err());
    }

    #[test]
    fn test_variant_display_round_trips() {
        for variant in [PoolVariant::Cas, PoolVariant::Ring] {
            assert_eq!(variant.to_string().parse::<PoolVariant>().unwrap(), variant);
        }
    }

    #[test]
    fn test_build_respects_variant_capacity_rules() {
        assert_eq!(PoolVariant::Cas.build(5).capacity(), 5);
        // The ring rounds up to the next power of two.
        assert_eq!(PoolVariant::Ring.build(5).capacity(), 8);
    }
}
