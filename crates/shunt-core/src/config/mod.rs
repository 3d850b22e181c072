//! Proxy configuration.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

use crate::pool::PoolVariant;

/// Errors produced while validating a configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// A field failed validation.
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Everything the proxy needs to start.
#[derive(Debug, Clone)]
pub struct ProxyConfig {
    /// Port the acceptor listens on.
    pub listen_port: u16,
    /// Which connection pool implementation to run.
    pub pool_variant: PoolVariant,
    /// Endpoint of the write (master) backend.
    pub master_addr: SocketAddr,
    /// Endpoint of the read (replica) backend.
    pub replica_addr: SocketAddr,
    /// Number of event-loop worker threads.
    pub worker_count: usize,
    /// Number of buffers in the shared read-buffer pool.
    pub buffer_pool_size: usize,
    /// Capacity of each pooled buffer in bytes.
    pub buffer_capacity: usize,
    /// Connections per backend pool.
    pub pool_capacity: usize,
    /// Age after which an idle connection is recycled.
    pub max_idle: Duration,
    /// Time between janitor sweeps.
    pub janitor_interval: Duration,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        let backend = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 5432);
        Self {
            listen_port: 3307,
            pool_variant: PoolVariant::Cas,
            master_addr: backend,
            replica_addr: backend,
            worker_count: num_cpus::get(),
            buffer_pool_size: 16_384,
            buffer_capacity: 8_192,
            pool_capacity: 128,
            max_idle: Duration::from_secs(300),
            janitor_interval: Duration::from_secs(30),
        }
    }
}

impl ProxyConfig {
    /// Creates a new configuration builder.
    #[must_use]
    pub fn builder() -> ProxyConfigBuilder {
        ProxyConfigBuilder::default()
    }

    /// Validates the configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if any field is out of range.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.worker_count == 0 {
            return Err(ConfigError::Invalid("worker_count must be > 0".to_string()));
        }
        if self.buffer_pool_size == 0 {
            return Err(ConfigError::Invalid(
                "buffer_pool_size must be > 0".to_string(),
            ));
        }
        if self.buffer_capacity == 0 {
            return Err(ConfigError::Invalid(
                "buffer_capacity must be > 0".to_string(),
            ));
        }
        if self.pool_capacity == 0 {
            return Err(ConfigError::Invalid("pool_capacity must be > 0".to_string()));
        }
        if self.janitor_interval.is_zero() {
            return Err(ConfigError::Invalid(
                "janitor_interval must be > 0".to_string(),
            ));
        }
        Ok(())
    }
}

/// Builder for [`ProxyConfig`].
#[derive(Debug, Default)]
pub struct ProxyConfigBuilder {
    listen_port: Option<u16>,
    pool_variant: Option<PoolVariant>,
    master_addr: Option<SocketAddr>,
    replica_addr: Option<SocketAddr>,
    worker_count: Option<usize>,
    buffer_pool_size: Option<usize>,
    buffer_capacity: Option<usize>,
    pool_capacity: Option<usize>,
    max_idle: Option<Duration>,
    janitor_interval: Option<Duration>,
}

impl ProxyConfigBuilder {
    /// Sets the listen port.
    #[must_use]
    pub fn listen_port(mut self, port: u16) -> Self {
        self.listen_port = Some(port);
        self
    }

    /// Sets the pool variant.
    #[must_use]
    pub fn pool_variant(mut self, variant: PoolVariant) -> Self {
        self.pool_variant = Some(variant);
        self
    }

    /// Sets the master endpoint.
    #[must_use]
    pub fn master_addr(mut self, addr: SocketAddr) -> Self {
        self.master_addr = Some(addr);
        self
    }

    /// Sets the replica endpoint.
    #[must_use]
    pub fn replica_addr(mut self, addr: SocketAddr) -> Self {
        self.replica_addr = Some(addr);
        self
    }

    /// Sets the worker thread count.
    #[must_use]
    pub fn worker_count(mut self, count: usize) -> Self {
        self.worker_count = Some(count);
        self
    }

    /// Sets the buffer pool size.
    #[must_use]
    pub fn buffer_pool_size(mut self, size: usize) -> Self {
        self.buffer_pool_size = Some(size);
        self
    }

    /// Sets the per-buffer capacity.
    #[must_use]
    pub fn buffer_capacity(mut self, capacity: usize) -> Self {
        self.buffer_capacity = Some(capacity);
        self
    }

    /// Sets the per-pool connection capacity.
    #[must_use]
    pub fn pool_capacity(mut self, capacity: usize) -> Self {
        self.pool_capacity = Some(capacity);
        self
    }

    /// Sets the idle age limit.
    #[must_use]
    pub fn max_idle(mut self, max_idle: Duration) -> Self {
        self.max_idle = Some(max_idle);
        self
    }

    /// Sets the janitor sweep interval.
    #[must_use]
    pub fn janitor_interval(mut self, interval: Duration) -> Self {
        self.janitor_interval = Some(interval);
        self
    }

    /// Finishes the build, validating the result.
    ///
    /// # Errors
    ///
    /// Returns an error if the assembled configuration is invalid.
    pub fn build(self) -> Result<ProxyConfig, ConfigError> {
        let defaults = ProxyConfig::default();
        let config = ProxyConfig {
            listen_port: self.listen_port.unwrap_or(defaults.listen_port),
            pool_variant: self.pool_variant.unwrap_or(defaults.pool_variant),
            master_addr: self.master_addr.unwrap_or(defaults.master_addr),
            replica_addr: self.replica_addr.unwrap_or(defaults.replica_addr),
            worker_count: self.worker_count.unwrap_or(defaults.worker_count),
            buffer_pool_size: self.buffer_pool_size.unwrap_or(defaults.buffer_pool_size),
            buffer_capacity: self.buffer_capacity.unwrap_or(defaults.buffer_capacity),
            pool_capacity: self.pool_capacity.unwrap_or(defaults.pool_capacity),
            max_idle: self.max_idle.unwrap_or(defaults.max_idle),
            janitor_interval: self.janitor_interval.unwrap_or(defaults.janitor_interval),
        };
        config.validate()?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ProxyConfig::default();
        assert_eq!(config.listen_port, 3307);
        assert_eq!(config.pool_variant, PoolVariant::Cas);
        assert_eq!(config.buffer_pool_size, 16_384);
        assert_eq!(config.buffer_capacity, 8_192);
        assert_eq!(config.pool_capacity, 128);
        assert_eq!(config.max_idle, Duration::from_secs(300));
        assert_eq!(config.janitor_interval, Duration::from_secs(30));
        assert!(config.worker_count > 0);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_builder_overrides() {
        let config = ProxyConfig::builder()
            .listen_port(9000)
            .pool_variant(PoolVariant::Ring)
            .worker_count(2)
            .pool_capacity(8)
            .build()
            .unwrap();
        assert_eq!(config.listen_port, 9000);
        assert_eq!(config.pool_variant, PoolVariant::Ring);
        assert_eq!(config.worker_count, 2);
        assert_eq!(config.pool_capacity, 8);
    }

    #[test]
    fn test_zero_fields_are_rejected() {
        assert!(ProxyConfig::builder().worker_count(0).build().is_err());
        assert!(ProxyConfig::builder().buffer_pool_size(0).build().is_err());
        assert!(ProxyConfig::builder().pool_capacity(0).build().is_err());
        assert!(ProxyConfig::builder()
            .janitor_interval(Duration::ZERO)
            .build()
            .is_err());
    }
}
