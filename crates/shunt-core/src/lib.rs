//! # Shunt Core
//!
//! The hot-path engine of the Shunt proxy: a transparent TCP middleware
//! that sits between SQL clients and a master/replica backend pair, routes
//! each request by its leading verb, and shuttles bytes on a lock-free,
//! zero-allocation path.
//!
//! This crate provides:
//! - **Buffer pool**: pre-allocated direct buffers handed out by atomic
//!   slot swap
//! - **Connection pools**: two lock-free implementations (CAS slot scan
//!   and padded ring) behind one trait
//! - **Classifier + router**: zero-allocation verb lookahead feeding
//!   master/replica pool selection
//! - **Event loops**: one readiness multiplexer per worker thread
//! - **Janitor**: background probe-and-replace pool maintenance
//!
//! ## Design Principles
//!
//! 1. **No locks on the hot path** - per-connection state CAS and atomic
//!    slot arrays carry all shared mutation
//! 2. **No allocation after startup** - buffers and connections are
//!    pre-allocated and pooled
//! 3. **Exactly three blocking points** - the accept call, the poll wait,
//!    and the janitor sleep; nothing else may suspend
//! 4. **Failure stays local** - an I/O error is confined to the owning
//!    loop iteration; shutdown is the only thing that stops a worker
//!
//! ## Example
//!
//! ```rust,ignore
//! use shunt_core::{
//!     Acceptor, BackendFactory, DirectBufferPool, EventLoopGroup,
//!     ProxyConfig, Router, VerbClassifier,
//! };
//!
//! let config = ProxyConfig::default();
//! let pool = config.pool_variant.build(config.pool_capacity);
//! // ... fill pools, build the router, start the group, run the acceptor
//! ```

#![deny(missing_docs)]
#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
// Unsafe is confined to the buffer pool's raw allocations and the
// epoch-guarded pool slots; every block carries a SAFETY comment.
#![allow(unsafe_code)]

pub mod acceptor;
pub mod buffer;
pub mod classify;
pub mod config;
pub mod event;
pub mod janitor;
pub mod pool;
pub mod route;

pub use acceptor::Acceptor;
pub use buffer::{BufLease, DirectBuf, DirectBufferPool};
pub use classify::{QueryClassifier, QueryKind, VerbClassifier};
pub use config::{ProxyConfig, ProxyConfigBuilder};
pub use event::{EventLoopGroup, EventLoopHandle};
pub use janitor::{Janitor, JanitorHandle};
pub use pool::{
    BackendConnection, BackendFactory, ConnState, ConnectionPool, PaddedCounter, PoolVariant,
    RingPool, ScanCasPool,
};
pub use route::Router;

/// Result type for shunt-core operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Error type aggregating every module's failures.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Configuration errors.
    #[error("config error: {0}")]
    Config(#[from] config::ConfigError),

    /// Backend connection establishment errors.
    #[error("factory error: {0}")]
    Factory(#[from] pool::FactoryError),

    /// Event loop setup errors.
    #[error("event loop error: {0}")]
    Event(#[from] event::EventError),

    /// Janitor setup errors.
    #[error("janitor error: {0}")]
    Janitor(#[from] janitor::JanitorError),

    /// Acceptor errors.
    #[error("acceptor error: {0}")]
    Acceptor(#[from] acceptor::AcceptorError),
}
