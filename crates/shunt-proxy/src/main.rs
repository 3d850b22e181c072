//! Shunt: transparent read/write-splitting TCP proxy for SQL backends.

mod signal;

use std::net::{SocketAddr, ToSocketAddrs};
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use shunt_core::{
    Acceptor, BackendFactory, ConnectionPool, DirectBufferPool, EventLoopGroup, Janitor,
    PoolVariant, ProxyConfig, Router, VerbClassifier,
};

/// Transparent read/write-splitting TCP proxy for SQL backends
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Port to listen on for client connections
    #[arg(default_value_t = 3307)]
    listen_port: u16,

    /// Connection pool implementation: "cas" or "ring"
    #[arg(default_value = "cas")]
    pool_type: String,

    /// Backend (master) host
    #[arg(default_value = "127.0.0.1")]
    backend_host: String,

    /// Backend (master) port
    #[arg(default_value_t = 5432)]
    backend_port: u16,

    /// Replica host (defaults to the backend host)
    #[arg(long)]
    replica_host: Option<String>,

    /// Replica port (defaults to the backend port)
    #[arg(long)]
    replica_port: Option<u16>,

    /// Log level
    #[arg(long, default_value = "info")]
    log_level: String,
}

fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                format!("shunt={0},shunt_core={0}", args.log_level).into()
            }),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let pool_variant = match args.pool_type.parse::<PoolVariant>() {
        Ok(variant) => variant,
        Err(e) => {
            warn!(error = %e, "falling back to the cas pool");
            PoolVariant::Cas
        }
    };

    let master_addr = resolve(&args.backend_host, args.backend_port)?;
    let replica_addr = resolve(
        args.replica_host.as_deref().unwrap_or(&args.backend_host),
        args.replica_port.unwrap_or(args.backend_port),
    )?;

    let config = ProxyConfig::builder()
        .listen_port(args.listen_port)
        .pool_variant(pool_variant)
        .master_addr(master_addr)
        .replica_addr(replica_addr)
        .build()
        .context("invalid configuration")?;

    run(&config)
}

fn resolve(host: &str, port: u16) -> Result<SocketAddr> {
    (host, port)
        .to_socket_addrs()
        .with_context(|| format!("failed to resolve {host}:{port}"))?
        .next()
        .ok_or_else(|| anyhow!("no address found for {host}:{port}"))
}

fn run(config: &ProxyConfig) -> Result<()> {
    signal::install().context("failed to install signal handlers")?;

    let buffers = Arc::new(DirectBufferPool::new(
        config.buffer_pool_size,
        config.buffer_capacity,
    ));

    let master_factory = BackendFactory::new(config.master_addr);
    let replica_factory = BackendFactory::new(config.replica_addr);

    let master_pool = config.pool_variant.build(config.pool_capacity);
    let replica_pool = config.pool_variant.build(config.pool_capacity);
    prefill(master_pool.as_ref(), &master_factory, "master");
    prefill(replica_pool.as_ref(), &replica_factory, "replica");

    let router = Arc::new(Router::new(
        Arc::clone(&master_pool),
        Arc::clone(&replica_pool),
        VerbClassifier,
    ));

    let group = EventLoopGroup::new(config.worker_count, buffers, Arc::clone(&router))?;

    let master_janitor = Janitor::new(
        Arc::clone(&master_pool),
        master_factory,
        config.max_idle,
        config.janitor_interval,
        "master",
    )
    .spawn()?;
    let replica_janitor = Janitor::new(
        Arc::clone(&replica_pool),
        replica_factory,
        config.max_idle,
        config.janitor_interval,
        "replica",
    )
    .spawn()?;

    let acceptor = Acceptor::bind(config.listen_port)?;
    info!(
        port = config.listen_port,
        pool = %config.pool_variant,
        workers = config.worker_count,
        master = %config.master_addr,
        replica = %config.replica_addr,
        "shunt listening"
    );

    let outcome = acceptor.run(&group, &signal::RUNNING);

    info!("shutting down");
    master_janitor.shutdown_and_join();
    replica_janitor.shutdown_and_join();
    group.shutdown();
    info!("shutdown complete");

    outcome.map_err(Into::into)
}

/// Fills a pool to capacity at startup. Failures are non-fatal: the proxy
/// comes up degraded and the janitor keeps retrying the backend.
fn prefill(pool: &dyn ConnectionPool, factory: &BackendFactory, name: &str) {
    for _ in 0..pool.capacity() {
        match factory.create() {
            Ok(conn) => {
                if !pool.offer(Arc::new(conn)) {
                    break;
                }
            }
            Err(e) => {
                warn!(pool = name, error = %e, "failed to open backend connection; janitor will retry");
                break;
            }
        }
    }
    info!(
        pool = name,
        size = pool.size(),
        capacity = pool.capacity(),
        "pool initialized"
    );
}
