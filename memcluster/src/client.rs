use std::fmt;
use std::future::Future;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use log::{debug, warn};
use tokio_util::sync::CancellationToken;

use crate::cmd::{encode_ttl, validate_key, Request};
use crate::config::ClientConfig;
use crate::connection::{Connect, IntoNodeAddr, NodeAddr, TcpConnector};
use crate::discovery::{ConfigEndpoint, DiscoverySource, StaticNodes};
use crate::errors::{parse_error, CacheError, CacheResult, ErrorKind, RetryMethod};
use crate::events::{default_sink, ClusterEvent, EventSink, SharedSink};
use crate::parser::Response;
use crate::pool::ConnectionPool;
use crate::registry::{NodeRegistry, NodeSet};
use crate::ring::KeyRouter;

/// Used to configure and build a [`CacheClient`].
pub struct ClientBuilder {
    source: Box<dyn DiscoverySource>,
    config: ClientConfig,
    sink: Option<Arc<dyn EventSink>>,
}

impl ClientBuilder {
    /// Creates a builder discovering nodes through `source`.
    pub fn new<S: DiscoverySource>(source: S) -> ClientBuilder {
        ClientBuilder {
            source: Box::new(source),
            config: ClientConfig::default(),
            sink: None,
        }
    }

    /// Sets the client configuration.
    pub fn config(mut self, config: ClientConfig) -> ClientBuilder {
        self.config = config;
        self
    }

    /// Sends events to `sink` instead of the `log` facade.
    pub fn event_sink(mut self, sink: Arc<dyn EventSink>) -> ClientBuilder {
        self.sink = Some(sink);
        self
    }

    /// Builds a client talking to the nodes over TCP or unix sockets.
    ///
    /// Validates the configuration and runs the first discovery. Fails with
    /// [`ErrorKind::DiscoveryError`] if no node list could be obtained.
    pub async fn build(self) -> CacheResult<CacheClient> {
        let connector = TcpConnector::new(self.config.tcp_settings.clone());
        self.build_with_connector(connector).await
    }

    /// Like [`ClientBuilder::build`], opening connections through `connector`.
    pub async fn build_with_connector<C: Connect>(
        self,
        connector: C,
    ) -> CacheResult<CacheClient<C>> {
        let ClientBuilder {
            source,
            config,
            sink,
        } = self;
        config.validate()?;
        let sink: SharedSink = sink.unwrap_or_else(default_sink);

        let registry = Arc::new(NodeRegistry::with_event_sink(
            source,
            &config,
            Arc::clone(&sink),
        ));
        registry.refresh_with_retry().await?;
        if registry.resolve().is_empty() {
            warn!("discovery reported an empty cluster");
        }

        let router = Arc::new(KeyRouter::new(config.virtual_nodes));
        let pools = Arc::new(ConnectionPool::with_event_sink(
            connector,
            &config,
            Arc::clone(&sink),
        ));
        {
            let router = Arc::clone(&router);
            let pools = Arc::downgrade(&pools);
            registry.subscribe(move |nodes: &NodeSet| {
                router.rebuild(nodes.healthy().cloned());
                if let Some(pools) = pools.upgrade() {
                    pools.retain(nodes.healthy());
                }
            });
        }

        let cancel = CancellationToken::new();
        registry.spawn_refresh(config.refresh_interval, cancel.child_token());
        pools.spawn_maintenance(config.maintenance_interval, cancel.child_token());
        debug!(
            "cache client ready with {} nodes",
            registry.resolve().healthy().count()
        );

        Ok(CacheClient {
            inner: Arc::new(ClientInner {
                registry,
                router,
                pools,
                config,
                sink,
                cancel,
                closed: AtomicBool::new(false),
            }),
        })
    }
}

struct ClientInner<C: Connect> {
    registry: Arc<NodeRegistry>,
    router: Arc<KeyRouter>,
    pools: Arc<ConnectionPool<C>>,
    config: ClientConfig,
    sink: SharedSink,
    cancel: CancellationToken,
    closed: AtomicBool,
}

impl<C: Connect> Drop for ClientInner<C> {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// A cluster-aware cache client.
///
/// Keys are spread over the discovered nodes by consistent hashing; every
/// node gets its own bounded connection pool. Cloning is cheap and clones
/// share nodes, pools and background tasks. The background tasks stop with
/// [`CacheClient::shutdown`] or when the last clone is dropped.
///
/// ```rust,no_run
/// # async fn run() -> memcluster::CacheResult<()> {
/// use std::time::Duration;
///
/// let client = memcluster::CacheClient::from_config_endpoint(
///     "mycluster.cfg.use1.cache.amazonaws.com:11211",
///     memcluster::ClientConfig::new(),
/// )
/// .await?;
/// client.set("greeting", "hello", Duration::from_secs(60)).await?;
/// assert_eq!(client.get("greeting").await?.as_deref(), Some(&b"hello"[..]));
/// # Ok(()) }
/// ```
pub struct CacheClient<C: Connect = TcpConnector> {
    inner: Arc<ClientInner<C>>,
}

impl<C: Connect> Clone for CacheClient<C> {
    fn clone(&self) -> Self {
        CacheClient {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<C: Connect> fmt::Debug for CacheClient<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CacheClient")
            .field("nodes", &self.inner.registry.resolve())
            .field("config", &self.inner.config)
            .finish()
    }
}

impl CacheClient {
    /// Creates a builder discovering nodes through `source`.
    pub fn builder<S: DiscoverySource>(source: S) -> ClientBuilder {
        ClientBuilder::new(source)
    }

    /// Connects to the cluster behind an ElastiCache style configuration
    /// endpoint.
    pub async fn from_config_endpoint<T: IntoNodeAddr>(
        endpoint: T,
        config: ClientConfig,
    ) -> CacheResult<CacheClient> {
        let source = ConfigEndpoint::new(endpoint, config.connection_timeout)?;
        ClientBuilder::new(source).config(config).build().await
    }

    /// Connects to a fixed list of nodes.
    pub async fn from_nodes<T: IntoNodeAddr>(
        nodes: Vec<T>,
        config: ClientConfig,
    ) -> CacheResult<CacheClient> {
        let source = StaticNodes::new(nodes)?;
        ClientBuilder::new(source).config(config).build().await
    }
}

impl<C: Connect> CacheClient<C> {
    /// Stores `value` under `key`, expiring after `ttl`.
    ///
    /// A zero `ttl` stores the value without expiration.
    pub async fn set(&self, key: &str, value: impl Into<Bytes>, ttl: Duration) -> CacheResult<()> {
        let request = Request::Set {
            key: self.full_key(key)?,
            flags: 0,
            exptime: encode_ttl(ttl),
            value: self.checked_value(value.into())?,
        };
        match self.execute(request).await? {
            Response::Stored => Ok(()),
            other => Err(unexpected(other)),
        }
    }

    /// Stores `value` under `key` only if the key holds no value.
    ///
    /// Returns false if the key already existed.
    pub async fn add(&self, key: &str, value: impl Into<Bytes>, ttl: Duration) -> CacheResult<bool> {
        let request = Request::Add {
            key: self.full_key(key)?,
            flags: 0,
            exptime: encode_ttl(ttl),
            value: self.checked_value(value.into())?,
        };
        match self.execute(request).await? {
            Response::Stored => Ok(true),
            Response::NotStored => Ok(false),
            other => Err(unexpected(other)),
        }
    }

    /// Returns the value stored under `key`, or `None` on a miss.
    pub async fn get(&self, key: &str) -> CacheResult<Option<Bytes>> {
        let request = Request::Get {
            key: self.full_key(key)?,
        };
        match self.execute(request).await? {
            Response::Value(item) => Ok(Some(item.data)),
            Response::Miss => Ok(None),
            other => Err(unexpected(other)),
        }
    }

    /// Removes `key`. Removing a missing key succeeds.
    pub async fn delete(&self, key: &str) -> CacheResult<()> {
        let request = Request::Delete {
            key: self.full_key(key)?,
        };
        match self.execute(request).await? {
            Response::Deleted | Response::NotFound => Ok(()),
            other => Err(unexpected(other)),
        }
    }

    /// Updates the expiration of `key`. Returns false if the key is missing.
    pub async fn touch(&self, key: &str, ttl: Duration) -> CacheResult<bool> {
        let request = Request::Touch {
            key: self.full_key(key)?,
            exptime: encode_ttl(ttl),
        };
        match self.execute(request).await? {
            Response::Touched => Ok(true),
            Response::NotFound => Ok(false),
            other => Err(unexpected(other)),
        }
    }

    /// Returns the value of `key`, computing and storing it on a miss.
    ///
    /// `compute` runs at most once per call and only on a miss. Its error is
    /// returned unchanged and nothing is stored.
    pub async fn fetch<F, Fut, E>(&self, key: &str, ttl: Duration, compute: F) -> Result<Bytes, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Bytes, E>>,
        E: From<CacheError>,
    {
        if let Some(value) = self.get(key).await? {
            return Ok(value);
        }
        let value = compute().await?;
        self.set(key, value.clone(), ttl).await?;
        Ok(value)
    }

    /// Asks `node` for its server version.
    pub async fn version(&self, node: &NodeAddr) -> CacheResult<String> {
        self.ensure_open()?;
        let request = Request::Version;
        let response = tokio::time::timeout(
            self.inner.config.request_timeout,
            self.attempt(node, &request),
        )
        .await??;
        match response.into_result()? {
            Response::Version(version) => Ok(version),
            other => Err(unexpected(other)),
        }
    }

    /// Returns the node `key` is currently routed to.
    pub fn route(&self, key: &str) -> CacheResult<Option<NodeAddr>> {
        Ok(self.inner.router.route(&self.full_key(key)?))
    }

    /// Returns the current node snapshot.
    pub fn nodes(&self) -> Arc<NodeSet> {
        self.inner.registry.resolve()
    }

    /// Queries the discovery source right away instead of waiting for the
    /// next refresh.
    pub async fn refresh(&self) -> CacheResult<()> {
        self.ensure_open()?;
        self.inner.registry.refresh().await
    }

    /// Returns the configuration the client was built with.
    pub fn config(&self) -> &ClientConfig {
        &self.inner.config
    }

    /// Stops the background tasks and closes every pooled connection.
    ///
    /// Operations started afterwards fail with
    /// [`ErrorKind::NodeUnavailable`], on every clone.
    pub fn shutdown(&self) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        debug!("shutting down cache client");
        self.inner.cancel.cancel();
        self.inner.pools.close();
    }

    async fn execute(&self, request: Request) -> CacheResult<Response> {
        self.ensure_open()?;
        let result = match tokio::time::timeout(
            self.inner.config.request_timeout,
            self.execute_with_retries(&request),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(CacheError::from((
                ErrorKind::Timeout,
                "Request timed out",
                request.name().to_string(),
            ))),
        };
        if let Err(err) = &result {
            self.inner.sink.on_event(&ClusterEvent::RequestFailed {
                command: request.name(),
                error: err.to_string(),
            });
        }
        result
    }

    async fn execute_with_retries(&self, request: &Request) -> CacheResult<Response> {
        let key = request.key().unwrap_or_default();
        let retries = self.inner.config.retries;
        let mut last_error = None;

        for attempt in 1..=retries {
            let Some(node) = self.inner.router.route(key) else {
                break;
            };
            let err = match self.attempt(&node, request).await {
                Ok(response) => {
                    self.inner.registry.report_success(&node);
                    return response.into_result();
                }
                Err(err) if err.retry_method() == RetryMethod::Reconnect => {
                    self.inner.registry.report_failure(&node);
                    err
                }
                // the pool was closed because the node left the ring while
                // this request waited on it, so route the key again
                Err(err) if err.kind() == ErrorKind::NodeUnavailable && !self.is_closed() => err,
                Err(err) => return Err(err),
            };
            if attempt < retries {
                self.inner.sink.on_event(&ClusterEvent::RequestRetried {
                    node,
                    attempt,
                    error: err.to_string(),
                });
            }
            last_error = Some(err);
        }

        Err(match last_error {
            Some(err) if err.is_timeout() => CacheError::from((
                ErrorKind::Timeout,
                "All attempts timed out",
                err.to_string(),
            )),
            Some(err) => CacheError::from((
                ErrorKind::NodeUnavailable,
                "All attempts failed",
                err.to_string(),
            )),
            None => CacheError::from((ErrorKind::NodeUnavailable, "No cache node available")),
        })
    }

    /// Sends `request` to `node` over a pooled connection.
    ///
    /// The connection goes back to the pool only after a well-formed
    /// response; any other outcome closes it. A node that does not answer
    /// within the I/O timeout fails the attempt like a broken connection.
    async fn attempt(&self, node: &NodeAddr, request: &Request) -> CacheResult<Response> {
        let mut conn = self
            .inner
            .pools
            .checkout(node, self.inner.config.checkout_timeout)
            .await?;
        let sent = tokio::time::timeout(self.inner.config.io_timeout(), conn.send(request)).await;
        let response = match sent {
            Ok(Ok(response)) => response,
            Ok(Err(err)) => {
                conn.invalidate();
                return Err(err);
            }
            Err(_) => {
                conn.invalidate();
                return Err(io::Error::new(
                    io::ErrorKind::TimedOut,
                    format!("{node} did not answer {}", request.name()),
                )
                .into());
            }
        };
        if let (Request::Get { key }, Response::Value(item)) = (request, &response) {
            if item.key != *key {
                conn.invalidate();
                return Err(parse_error("Response for another key", item.key.clone()));
            }
        }
        conn.checkin();
        Ok(response)
    }

    fn full_key(&self, key: &str) -> CacheResult<String> {
        let key = match &self.inner.config.namespace {
            Some(namespace) => format!("{namespace}:{key}"),
            None => key.to_string(),
        };
        validate_key(&key)?;
        Ok(key)
    }

    fn checked_value(&self, value: Bytes) -> CacheResult<Bytes> {
        if value.len() > self.inner.config.max_value_size {
            return Err(CacheError::from((
                ErrorKind::ClientError,
                "Value too large",
                format!(
                    "{} bytes, limit is {}",
                    value.len(),
                    self.inner.config.max_value_size
                ),
            )));
        }
        Ok(value)
    }

    fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    fn ensure_open(&self) -> CacheResult<()> {
        if self.is_closed() {
            return Err(CacheError::from((
                ErrorKind::NodeUnavailable,
                "Client was shut down",
            )));
        }
        Ok(())
    }
}

fn unexpected(response: Response) -> CacheError {
    parse_error("Unexpected response", format!("{response:?}"))
}
