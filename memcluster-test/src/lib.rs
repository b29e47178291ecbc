//! Testing support
//!
//! This crate provides `MockCluster`, an in-memory set of cache nodes that
//! implements `memcluster::Connect`, and `MockDiscovery`, a discovery source
//! whose node list is changed by the test. Together they exercise the whole
//! request path of a `CacheClient` without sockets:
//!
//! ```rust
//! use std::time::Duration;
//! use memcluster::{CacheClient, NodeAddr};
//! use memcluster_test::{MockCluster, MockDiscovery};
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> memcluster::CacheResult<()> {
//! let nodes = vec![NodeAddr::tcp("a", 11211), NodeAddr::tcp("b", 11211)];
//! let cluster = MockCluster::new(nodes.clone());
//! let client = CacheClient::builder(MockDiscovery::new(nodes))
//!     .build_with_connector(cluster.clone())
//!     .await?;
//!
//! client.set("key", "value", Duration::from_secs(10)).await?;
//! assert_eq!(client.get("key").await?.as_deref(), Some(&b"value"[..]));
//! # Ok(()) }
//! ```
//!
//! The `server` module starts real TCP servers for tests that need sockets.

pub mod server;

use std::collections::HashMap;
use std::io;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use futures::FutureExt;
use tokio::time::Instant;

use memcluster::{
    parse_response, CacheFuture, ClusterConfig, Connect, DiscoverySource, Item, NodeAddr,
    Request, Response, Transport,
};

/// Relative expirations above this many seconds are absolute timestamps.
const RELATIVE_EXPIRATION_LIMIT: u32 = 60 * 60 * 24 * 30;

struct StoredValue {
    data: Bytes,
    flags: u32,
    expires_at: Option<Instant>,
}

impl StoredValue {
    fn is_live(&self) -> bool {
        self.expires_at.map_or(true, |at| Instant::now() < at)
    }
}

/// Storage of a single node, following the memcached semantics for the
/// commands the client sends.
#[derive(Default)]
pub struct MockStore {
    values: HashMap<String, StoredValue>,
}

fn expiration(exptime: u32) -> Option<Instant> {
    match exptime {
        0 => None,
        secs if secs <= RELATIVE_EXPIRATION_LIMIT => {
            Some(Instant::now() + Duration::from_secs(u64::from(secs)))
        }
        timestamp => {
            let now = SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_secs())
                .unwrap_or_default();
            let remaining = u64::from(timestamp).saturating_sub(now);
            Some(Instant::now() + Duration::from_secs(remaining))
        }
    }
}

impl MockStore {
    /// Applies `request` and returns the server's answer.
    pub fn handle(&mut self, request: &Request) -> Response {
        self.values.retain(|_, value| value.is_live());
        match request {
            Request::Set {
                key,
                flags,
                exptime,
                value,
            } => {
                self.insert(key, *flags, *exptime, value.clone());
                Response::Stored
            }
            Request::Add {
                key,
                flags,
                exptime,
                value,
            } => {
                if self.values.contains_key(key) {
                    return Response::NotStored;
                }
                self.insert(key, *flags, *exptime, value.clone());
                Response::Stored
            }
            Request::Get { key } => match self.values.get(key) {
                Some(value) => Response::Value(Item {
                    key: key.clone(),
                    flags: value.flags,
                    data: value.data.clone(),
                }),
                None => Response::Miss,
            },
            Request::Delete { key } => match self.values.remove(key) {
                Some(_) => Response::Deleted,
                None => Response::NotFound,
            },
            Request::Touch { key, exptime } => match self.values.get_mut(key) {
                Some(value) => {
                    value.expires_at = expiration(*exptime);
                    Response::Touched
                }
                None => Response::NotFound,
            },
            Request::Version => Response::Version("1.6.0-mock".to_string()),
        }
    }

    /// Returns the live value of `key`.
    pub fn get(&self, key: &str) -> Option<Bytes> {
        self.values
            .get(key)
            .filter(|value| value.is_live())
            .map(|value| value.data.clone())
    }

    /// Returns the live keys, sorted.
    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self
            .values
            .iter()
            .filter(|(_, value)| value.is_live())
            .map(|(key, _)| key.clone())
            .collect();
        keys.sort();
        keys
    }

    fn insert(&mut self, key: &str, flags: u32, exptime: u32, data: Bytes) {
        self.values.insert(
            key.to_string(),
            StoredValue {
                data,
                flags,
                expires_at: expiration(exptime),
            },
        );
    }
}

/// How a mock node answers requests.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub enum NodeBehavior {
    /// Serve requests from the in-memory store.
    #[default]
    Serve,
    /// Refuse new connections and break existing ones.
    Down,
    /// Answer every request with a malformed line.
    Garbage,
    /// Answer every request with `SERVER_ERROR <message>`.
    ServerError(String),
    /// Never answer.
    Hang,
}

#[derive(Default)]
struct MockNode {
    store: MockStore,
    behavior: NodeBehavior,
    // bumped whenever the node goes down, breaking older connections
    epoch: u64,
    latency: Duration,
    connects: usize,
    requests: usize,
}

#[derive(Default)]
struct ClusterState {
    nodes: HashMap<NodeAddr, MockNode>,
}

/// An in-memory cluster of cache nodes.
///
/// Clones share the same nodes, so a test keeps one clone to inspect and
/// steer the nodes while the client owns another.
#[derive(Clone, Default)]
pub struct MockCluster {
    state: Arc<Mutex<ClusterState>>,
}

impl MockCluster {
    /// Creates a cluster made of `nodes`. Connecting anywhere else is
    /// refused.
    pub fn new<I: IntoIterator<Item = NodeAddr>>(nodes: I) -> MockCluster {
        let cluster = MockCluster::default();
        for node in nodes {
            cluster.add_node(node);
        }
        cluster
    }

    /// Starts an empty node at `addr`.
    pub fn add_node(&self, addr: NodeAddr) {
        self.lock().nodes.entry(addr).or_default();
    }

    /// Changes how the node at `addr` answers.
    pub fn set_behavior(&self, addr: &NodeAddr, behavior: NodeBehavior) {
        self.with_node(addr, |node| {
            if behavior == NodeBehavior::Down && node.behavior != NodeBehavior::Down {
                node.epoch += 1;
            }
            node.behavior = behavior;
        });
    }

    /// Takes the node at `addr` down or brings it back up.
    pub fn set_down(&self, addr: &NodeAddr, down: bool) {
        let behavior = if down {
            NodeBehavior::Down
        } else {
            NodeBehavior::Serve
        };
        self.set_behavior(addr, behavior);
    }

    /// Delays every answer of the node at `addr`.
    pub fn set_latency(&self, addr: &NodeAddr, latency: Duration) {
        self.with_node(addr, |node| node.latency = latency);
    }

    /// Number of connections opened to `addr`.
    pub fn connects(&self, addr: &NodeAddr) -> usize {
        self.lock().nodes.get(addr).map_or(0, |node| node.connects)
    }

    /// Number of requests `addr` received.
    pub fn requests(&self, addr: &NodeAddr) -> usize {
        self.lock().nodes.get(addr).map_or(0, |node| node.requests)
    }

    /// Total number of requests received by all nodes.
    pub fn total_requests(&self) -> usize {
        self.lock().nodes.values().map(|node| node.requests).sum()
    }

    /// Live keys stored on `addr`.
    pub fn keys(&self, addr: &NodeAddr) -> Vec<String> {
        self.lock()
            .nodes
            .get(addr)
            .map(|node| node.store.keys())
            .unwrap_or_default()
    }

    /// The node holding a live value for `key`, if any.
    pub fn owner(&self, key: &str) -> Option<NodeAddr> {
        self.lock()
            .nodes
            .iter()
            .find(|(_, node)| node.store.get(key).is_some())
            .map(|(addr, _)| addr.clone())
    }

    fn with_node<T>(&self, addr: &NodeAddr, f: impl FnOnce(&mut MockNode) -> T) -> T {
        f(self.lock().nodes.entry(addr.clone()).or_default())
    }

    fn lock(&self) -> MutexGuard<'_, ClusterState> {
        self.state.lock().unwrap()
    }
}

impl Connect for MockCluster {
    type Connection = MockConnection;

    fn connect<'a>(
        &'a self,
        addr: &'a NodeAddr,
        _timeout: Duration,
    ) -> CacheFuture<'a, MockConnection> {
        async move {
            let mut state = self.lock();
            let node = match state.nodes.get_mut(addr) {
                Some(node) if node.behavior != NodeBehavior::Down => node,
                _ => return Err(io::Error::from(io::ErrorKind::ConnectionRefused).into()),
            };
            node.connects += 1;
            Ok(MockConnection {
                cluster: self.clone(),
                addr: addr.clone(),
                epoch: node.epoch,
            })
        }
        .boxed()
    }
}

/// A connection to a node of a [`MockCluster`].
pub struct MockConnection {
    cluster: MockCluster,
    addr: NodeAddr,
    epoch: u64,
}

impl MockConnection {
    fn answer(&self, request: &Request) -> memcluster::CacheResult<Option<Response>> {
        let mut state = self.cluster.lock();
        let Some(node) = state.nodes.get_mut(&self.addr) else {
            return Err(io::Error::from(io::ErrorKind::ConnectionReset).into());
        };
        if node.behavior == NodeBehavior::Down || node.epoch != self.epoch {
            return Err(io::Error::from(io::ErrorKind::ConnectionReset).into());
        }
        node.requests += 1;
        match &node.behavior {
            NodeBehavior::Garbage => parse_response(b"GARBAGE\r\n").map(Some),
            NodeBehavior::ServerError(message) => {
                Ok(Some(Response::ServerError(message.clone())))
            }
            NodeBehavior::Hang => Ok(None),
            _ => Ok(Some(node.store.handle(request))),
        }
    }
}

impl Transport for MockConnection {
    fn send<'a>(&'a mut self, request: &'a Request) -> CacheFuture<'a, Response> {
        async move {
            let latency = self
                .cluster
                .lock()
                .nodes
                .get(&self.addr)
                .map_or(Duration::ZERO, |node| node.latency);
            if !latency.is_zero() {
                tokio::time::sleep(latency).await;
            }
            match self.answer(request)? {
                Some(response) => Ok(response),
                None => futures::future::pending().await,
            }
        }
        .boxed()
    }
}

#[derive(Default)]
struct DiscoveryState {
    version: u64,
    nodes: Vec<NodeAddr>,
    failing: bool,
    calls: usize,
}

/// A discovery source reporting whatever node list the test sets.
#[derive(Clone, Default)]
pub struct MockDiscovery {
    state: Arc<Mutex<DiscoveryState>>,
}

impl MockDiscovery {
    /// Creates a source reporting `nodes`.
    pub fn new(nodes: Vec<NodeAddr>) -> MockDiscovery {
        let discovery = MockDiscovery::default();
        discovery.set_nodes(nodes);
        discovery
    }

    /// Replaces the reported nodes and bumps the configuration version.
    pub fn set_nodes(&self, nodes: Vec<NodeAddr>) {
        let mut state = self.state.lock().unwrap();
        state.version += 1;
        state.nodes = nodes;
    }

    /// Makes every query fail until reset.
    pub fn set_failing(&self, failing: bool) {
        self.state.lock().unwrap().failing = failing;
    }

    /// Number of queries received.
    pub fn calls(&self) -> usize {
        self.state.lock().unwrap().calls
    }
}

impl DiscoverySource for MockDiscovery {
    fn discover(&self) -> CacheFuture<'_, ClusterConfig> {
        let result = {
            let mut state = self.state.lock().unwrap();
            state.calls += 1;
            if state.failing {
                Err(io::Error::from(io::ErrorKind::ConnectionRefused).into())
            } else {
                Ok(ClusterConfig {
                    version: state.version,
                    nodes: state.nodes.clone(),
                })
            }
        };
        async move { result }.boxed()
    }
}
