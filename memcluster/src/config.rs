use std::time::Duration;

use crate::connection::TcpSettings;
use crate::errors::{invalid_config, CacheResult};
use crate::ring::DEFAULT_VIRTUAL_NODES;

/// Configuration of a [`crate::CacheClient`].
///
/// All options are validated when the client is built.
#[derive(Clone, Debug)]
pub struct ClientConfig {
    pub(crate) pool_size: usize,
    pub(crate) min_idle: usize,
    pub(crate) max_waiting: Option<usize>,
    pub(crate) connection_timeout: Duration,
    pub(crate) checkout_timeout: Duration,
    pub(crate) request_timeout: Duration,
    pub(crate) io_timeout: Option<Duration>,
    pub(crate) retries: usize,
    pub(crate) refresh_interval: Duration,
    pub(crate) virtual_nodes: usize,
    pub(crate) removal_grace: u32,
    pub(crate) node_failure_limit: u32,
    pub(crate) dead_retry_delay: Duration,
    pub(crate) idle_timeout: Duration,
    pub(crate) maintenance_interval: Duration,
    pub(crate) max_value_size: usize,
    pub(crate) namespace: Option<String>,
    pub(crate) discovery_retries: usize,
    pub(crate) tcp_settings: TcpSettings,
}

impl ClientConfig {
    const DEFAULT_POOL_SIZE: usize = 10;
    const DEFAULT_CONNECTION_TIMEOUT: Duration = Duration::from_secs(1);
    const DEFAULT_CHECKOUT_TIMEOUT: Duration = Duration::from_secs(1);
    const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(2);
    const DEFAULT_RETRIES: usize = 2;
    const DEFAULT_REFRESH_INTERVAL: Duration = Duration::from_secs(60);
    const DEFAULT_REMOVAL_GRACE: u32 = 3;
    const DEFAULT_NODE_FAILURE_LIMIT: u32 = 2;
    const DEFAULT_DEAD_RETRY_DELAY: Duration = Duration::from_secs(30);
    const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(300);
    const DEFAULT_MAINTENANCE_INTERVAL: Duration = Duration::from_secs(10);
    const DEFAULT_MAX_VALUE_SIZE: usize = 1024 * 1024;
    const DEFAULT_DISCOVERY_RETRIES: usize = 3;

    /// Creates a configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the maximum number of connections per node, default is 10.
    pub fn set_pool_size(mut self, pool_size: usize) -> Self {
        self.pool_size = pool_size;
        self
    }

    /// Sets how many idle connections per node are kept open regardless of
    /// the idle timeout, default is 0.
    pub fn set_min_idle(mut self, min_idle: usize) -> Self {
        self.min_idle = min_idle;
        self
    }

    /// Bounds the number of callers waiting for a connection to one node.
    ///
    /// Callers beyond the bound fail with [`crate::ErrorKind::PoolExhausted`].
    /// Unbounded by default.
    pub fn set_max_waiting(mut self, max_waiting: usize) -> Self {
        self.max_waiting = Some(max_waiting);
        self
    }

    /// Sets the time allowed for establishing a connection, default is 1 second.
    pub fn set_connection_timeout(mut self, timeout: Duration) -> Self {
        self.connection_timeout = timeout;
        self
    }

    /// Sets how long a request waits for a free pooled connection, default
    /// is 1 second.
    pub fn set_checkout_timeout(mut self, timeout: Duration) -> Self {
        self.checkout_timeout = timeout;
        self
    }

    /// Sets the deadline of a whole operation including retries, default is
    /// 2 seconds.
    pub fn set_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Sets how long a single attempt waits for a node to answer.
    ///
    /// A node that does not answer in time counts as failed and the request
    /// is retried. Defaults to the request timeout divided by the number of
    /// attempts.
    pub fn set_io_timeout(mut self, timeout: Duration) -> Self {
        self.io_timeout = Some(timeout);
        self
    }

    /// Sets the number of attempts per operation, default is 2.
    pub fn set_retries(mut self, retries: usize) -> Self {
        self.retries = retries;
        self
    }

    /// Sets how often the discovery source is queried, default is 60 seconds.
    pub fn set_refresh_interval(mut self, interval: Duration) -> Self {
        self.refresh_interval = interval;
        self
    }

    /// Sets the number of ring positions per node, default is 160.
    pub fn set_virtual_nodes(mut self, virtual_nodes: usize) -> Self {
        self.virtual_nodes = virtual_nodes;
        self
    }

    /// Sets after how many consecutive refreshes without a node it is
    /// removed, default is 3.
    pub fn set_removal_grace(mut self, refreshes: u32) -> Self {
        self.removal_grace = refreshes;
        self
    }

    /// Sets after how many consecutive transport failures a node is taken
    /// out of the ring, default is 2.
    pub fn set_node_failure_limit(mut self, failures: u32) -> Self {
        self.node_failure_limit = failures;
        self
    }

    /// Sets how long a dead node stays out of the ring before a refresh
    /// may bring it back, default is 30 seconds.
    pub fn set_dead_retry_delay(mut self, delay: Duration) -> Self {
        self.dead_retry_delay = delay;
        self
    }

    /// Sets how long a connection may stay idle before it is closed,
    /// default is 5 minutes.
    pub fn set_idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = timeout;
        self
    }

    /// Sets how often pools close idle connections and top up to
    /// `min_idle`, default is 10 seconds.
    pub fn set_maintenance_interval(mut self, interval: Duration) -> Self {
        self.maintenance_interval = interval;
        self
    }

    /// Sets the largest value accepted by `set`, default is 1 MiB.
    pub fn set_max_value_size(mut self, size: usize) -> Self {
        self.max_value_size = size;
        self
    }

    /// Prefixes every key with `<namespace>:`.
    pub fn set_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = Some(namespace.into());
        self
    }

    /// Sets how many times a failed discovery is retried with backoff
    /// before the refresh gives up until the next interval, default is 3.
    pub fn set_discovery_retries(mut self, retries: usize) -> Self {
        self.discovery_retries = retries;
        self
    }

    /// Sets the socket options of TCP connections.
    pub fn set_tcp_settings(mut self, settings: TcpSettings) -> Self {
        self.tcp_settings = settings;
        self
    }

    /// Returns the maximum number of connections per node.
    pub fn pool_size(&self) -> usize {
        self.pool_size
    }

    /// Returns the deadline of a whole operation.
    pub fn request_timeout(&self) -> Duration {
        self.request_timeout
    }

    /// Returns how long a single attempt waits for an answer.
    pub fn io_timeout(&self) -> Duration {
        self.io_timeout.unwrap_or_else(|| {
            let attempts = u32::try_from(self.retries.max(1)).unwrap_or(u32::MAX);
            self.request_timeout / attempts
        })
    }

    /// Returns the number of attempts per operation.
    pub fn retries(&self) -> usize {
        self.retries
    }

    /// Returns the key namespace, if any.
    pub fn namespace(&self) -> Option<&str> {
        self.namespace.as_deref()
    }

    pub(crate) fn validate(&self) -> CacheResult<()> {
        if self.pool_size == 0 {
            return Err(invalid_config("Pool size must be at least 1"));
        }
        if self.min_idle > self.pool_size {
            return Err(invalid_config("Minimum idle connections exceed the pool size"));
        }
        if self.retries == 0 {
            return Err(invalid_config("At least one attempt per request is required"));
        }
        if self.virtual_nodes == 0 {
            return Err(invalid_config("At least one virtual node per node is required"));
        }
        if self.removal_grace == 0 {
            return Err(invalid_config("Removal grace must be at least one refresh"));
        }
        if self.node_failure_limit == 0 {
            return Err(invalid_config("Node failure limit must be at least 1"));
        }
        if self.max_value_size == 0 {
            return Err(invalid_config("Maximum value size must be positive"));
        }
        for timeout in [
            self.connection_timeout,
            self.checkout_timeout,
            self.request_timeout,
            self.io_timeout(),
            self.refresh_interval,
            self.maintenance_interval,
        ] {
            if timeout.is_zero() {
                return Err(invalid_config("Timeouts and intervals must be positive"));
            }
        }
        if let Some(namespace) = &self.namespace {
            crate::cmd::validate_key(namespace)
                .map_err(|_| invalid_config("Namespace is not a valid key prefix"))?;
        }
        Ok(())
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            pool_size: Self::DEFAULT_POOL_SIZE,
            min_idle: 0,
            max_waiting: None,
            connection_timeout: Self::DEFAULT_CONNECTION_TIMEOUT,
            checkout_timeout: Self::DEFAULT_CHECKOUT_TIMEOUT,
            request_timeout: Self::DEFAULT_REQUEST_TIMEOUT,
            io_timeout: None,
            retries: Self::DEFAULT_RETRIES,
            refresh_interval: Self::DEFAULT_REFRESH_INTERVAL,
            virtual_nodes: DEFAULT_VIRTUAL_NODES,
            removal_grace: Self::DEFAULT_REMOVAL_GRACE,
            node_failure_limit: Self::DEFAULT_NODE_FAILURE_LIMIT,
            dead_retry_delay: Self::DEFAULT_DEAD_RETRY_DELAY,
            idle_timeout: Self::DEFAULT_IDLE_TIMEOUT,
            maintenance_interval: Self::DEFAULT_MAINTENANCE_INTERVAL,
            max_value_size: Self::DEFAULT_MAX_VALUE_SIZE,
            namespace: None,
            discovery_retries: Self::DEFAULT_DISCOVERY_RETRIES,
            tcp_settings: TcpSettings::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ErrorKind;

    #[test]
    fn defaults_are_valid() {
        let config = ClientConfig::new();
        assert!(config.validate().is_ok());
        assert_eq!(config.pool_size(), 10);
        assert_eq!(config.retries(), 2);
        assert_eq!(config.virtual_nodes, 160);
        assert_eq!(config.io_timeout(), Duration::from_secs(1));
    }

    #[test]
    fn io_timeout_follows_request_timeout() {
        let config = ClientConfig::new()
            .set_request_timeout(Duration::from_millis(900))
            .set_retries(3);
        assert_eq!(config.io_timeout(), Duration::from_millis(300));
        let config = config.set_io_timeout(Duration::from_secs(5));
        assert_eq!(config.io_timeout(), Duration::from_secs(5));
    }

    #[test]
    fn rejects_unusable_values() {
        let configs = [
            ClientConfig::new().set_pool_size(0),
            ClientConfig::new().set_pool_size(2).set_min_idle(3),
            ClientConfig::new().set_retries(0),
            ClientConfig::new().set_virtual_nodes(0),
            ClientConfig::new().set_removal_grace(0),
            ClientConfig::new().set_node_failure_limit(0),
            ClientConfig::new().set_request_timeout(Duration::ZERO),
            ClientConfig::new().set_io_timeout(Duration::ZERO),
            ClientConfig::new().set_max_value_size(0),
            ClientConfig::new().set_namespace("has space"),
        ];
        for config in configs {
            let err = config.validate().unwrap_err();
            assert_eq!(err.kind(), ErrorKind::InvalidClientConfig, "{config:?}");
        }
    }
}
