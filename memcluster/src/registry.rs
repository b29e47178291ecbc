//! Cluster membership and node health.
//!
//! The registry owns the authoritative node set. Readers get immutable
//! [`NodeSet`] snapshots without locking; refreshes and health reports
//! publish a new snapshot and hand it to every subscriber.

use std::collections::btree_map::Entry;
use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use arc_swap::ArcSwap;
use backon::{ExponentialBuilder, Retryable};
use log::{debug, trace, warn};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::config::ClientConfig;
use crate::connection::NodeAddr;
use crate::discovery::{ClusterConfig, DiscoverySource};
use crate::errors::{CacheError, CacheResult, ErrorKind};
use crate::events::{default_sink, ClusterEvent, EventSink, SharedSink};

const MIN_DISCOVERY_BACKOFF: Duration = Duration::from_millis(100);
const MAX_DISCOVERY_BACKOFF: Duration = Duration::from_secs(5);

/// Health of a node as seen by this client.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum NodeStatus {
    /// Serving requests normally.
    Healthy,
    /// The last request failed; the node stays routable.
    Suspect,
    /// Too many requests failed in a row; the node is out of the ring.
    Dead,
}

impl NodeStatus {
    /// Returns true if keys may be routed to a node with this status.
    pub fn is_routable(self) -> bool {
        self != NodeStatus::Dead
    }
}

/// A known cluster node.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Node {
    /// Address of the node.
    pub addr: NodeAddr,
    /// Current health.
    pub status: NodeStatus,
    /// When discovery last reported the node.
    pub last_seen: Instant,
}

/// An immutable snapshot of the known nodes, sorted by address.
#[derive(Clone, Debug, Default)]
pub struct NodeSet {
    version: u64,
    nodes: Vec<Node>,
}

impl NodeSet {
    /// Configuration version reported by the discovery source.
    pub fn version(&self) -> u64 {
        self.version
    }

    /// All known nodes, including dead ones.
    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    /// Addresses of the nodes keys may be routed to.
    pub fn healthy(&self) -> impl Iterator<Item = &NodeAddr> + '_ {
        self.nodes
            .iter()
            .filter(|node| node.status.is_routable())
            .map(|node| &node.addr)
    }

    /// Looks up a node by address.
    pub fn get(&self, addr: &NodeAddr) -> Option<&Node> {
        self.nodes
            .binary_search_by(|node| node.addr.cmp(addr))
            .ok()
            .map(|index| &self.nodes[index])
    }

    /// Returns true if `addr` is a known node.
    pub fn contains(&self, addr: &NodeAddr) -> bool {
        self.get(addr).is_some()
    }

    /// Number of known nodes.
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Returns true if no node is known.
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

struct NodeState {
    status: NodeStatus,
    last_seen: Instant,
    missed: u32,
    failures: u32,
    dead_since: Option<Instant>,
}

impl NodeState {
    fn new(now: Instant) -> Self {
        Self {
            status: NodeStatus::Healthy,
            last_seen: now,
            missed: 0,
            failures: 0,
            dead_since: None,
        }
    }

    fn revive(&mut self) {
        self.status = NodeStatus::Healthy;
        self.failures = 0;
        self.dead_since = None;
    }
}

type Subscriber = Box<dyn Fn(&NodeSet) + Send + Sync>;

#[derive(Default)]
struct State {
    version: u64,
    nodes: BTreeMap<NodeAddr, NodeState>,
    subscribers: Vec<Subscriber>,
}

#[derive(Clone, Copy)]
struct Settings {
    removal_grace: u32,
    node_failure_limit: u32,
    dead_retry_delay: Duration,
    discovery_retries: usize,
}

/// Tracks the nodes of a cluster.
pub struct NodeRegistry {
    source: Box<dyn DiscoverySource>,
    snapshot: ArcSwap<NodeSet>,
    // Never held across an await point.
    state: Mutex<State>,
    refresh_lock: tokio::sync::Mutex<()>,
    settings: Settings,
    sink: SharedSink,
}

impl fmt::Debug for NodeRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NodeRegistry")
            .field("nodes", &self.snapshot.load())
            .finish_non_exhaustive()
    }
}

impl NodeRegistry {
    /// Creates an empty registry fed by `source`; call
    /// [`NodeRegistry::refresh`] to populate it.
    pub fn new<S: DiscoverySource>(source: S, config: &ClientConfig) -> NodeRegistry {
        Self::with_event_sink(source, config, default_sink())
    }

    /// Like [`NodeRegistry::new`], reporting membership changes to `sink`.
    pub fn with_event_sink<S: DiscoverySource>(
        source: S,
        config: &ClientConfig,
        sink: Arc<dyn EventSink>,
    ) -> NodeRegistry {
        NodeRegistry {
            source: Box::new(source),
            snapshot: ArcSwap::from_pointee(NodeSet::default()),
            state: Mutex::new(State::default()),
            refresh_lock: tokio::sync::Mutex::new(()),
            settings: Settings {
                removal_grace: config.removal_grace,
                node_failure_limit: config.node_failure_limit,
                dead_retry_delay: config.dead_retry_delay,
                discovery_retries: config.discovery_retries,
            },
            sink,
        }
    }

    /// Returns the current snapshot. Never blocks.
    pub fn resolve(&self) -> Arc<NodeSet> {
        self.snapshot.load_full()
    }

    /// Queries the discovery source once and applies the result.
    ///
    /// Concurrent refreshes run one after another. On failure the known
    /// nodes are kept untouched.
    pub async fn refresh(&self) -> CacheResult<()> {
        let _guard = self.refresh_lock.lock().await;
        match self.source.discover().await {
            Ok(config) => {
                self.apply(config);
                Ok(())
            }
            Err(err) => {
                self.sink.on_event(&ClusterEvent::DiscoveryFailed {
                    error: err.to_string(),
                });
                if err.kind() == ErrorKind::DiscoveryError {
                    Err(err)
                } else {
                    Err(CacheError::from((
                        ErrorKind::DiscoveryError,
                        "Cluster discovery failed",
                        err.to_string(),
                    )))
                }
            }
        }
    }

    /// Registers `callback`, calling it with the current snapshot right away
    /// and again with every snapshot published later.
    ///
    /// Callbacks run while the registry holds its internal lock, so they
    /// must not call back into the registry apart from [`NodeRegistry::resolve`].
    pub fn subscribe<F>(&self, callback: F)
    where
        F: Fn(&NodeSet) + Send + Sync + 'static,
    {
        let mut state = self.lock();
        callback(&self.snapshot.load());
        state.subscribers.push(Box::new(callback));
    }

    /// Records a transport failure of a request sent to `addr`.
    pub fn report_failure(&self, addr: &NodeAddr) {
        let mut events = Vec::new();
        {
            let mut state = self.lock();
            let Some(node) = state.nodes.get_mut(addr) else {
                return;
            };
            node.failures = node.failures.saturating_add(1);
            let status = if node.failures >= self.settings.node_failure_limit {
                NodeStatus::Dead
            } else {
                NodeStatus::Suspect
            };
            if node.status == status || node.status == NodeStatus::Dead {
                return;
            }
            trace!("node {addr} is now {status:?} after {} failures", node.failures);
            node.status = status;
            if status == NodeStatus::Dead {
                node.dead_since = Some(Instant::now());
                events.push(ClusterEvent::NodeMarkedDead(addr.clone()));
            }
            self.publish(&state);
        }
        self.emit(events);
    }

    /// Records a successful request sent to `addr`.
    pub fn report_success(&self, addr: &NodeAddr) {
        let healthy = self
            .snapshot
            .load()
            .get(addr)
            .map_or(true, |node| node.status == NodeStatus::Healthy);
        if healthy {
            return;
        }

        let mut events = Vec::new();
        {
            let mut state = self.lock();
            let Some(node) = state.nodes.get_mut(addr) else {
                return;
            };
            if node.status == NodeStatus::Dead {
                events.push(ClusterEvent::NodeRecovered(addr.clone()));
            }
            node.revive();
            self.publish(&state);
        }
        self.emit(events);
    }

    /// Like [`NodeRegistry::refresh`], retrying failures with exponential
    /// backoff up to the configured number of discovery retries.
    pub async fn refresh_with_retry(&self) -> CacheResult<()> {
        let backoff = ExponentialBuilder::default()
            .with_min_delay(MIN_DISCOVERY_BACKOFF)
            .with_max_delay(MAX_DISCOVERY_BACKOFF)
            .with_max_times(self.settings.discovery_retries)
            .with_jitter();
        (|| self.refresh())
            .retry(backoff)
            .sleep(tokio::time::sleep)
            .notify(|err: &CacheError, delay: Duration| {
                debug!("retrying discovery in {delay:?}: {err}");
            })
            .await
    }

    /// Spawns a task refreshing the registry every `interval` until `cancel`
    /// fires or the registry is dropped.
    ///
    /// Failed refreshes are retried with backoff; once the retries run out
    /// the task waits for the next interval.
    pub fn spawn_refresh(
        self: &Arc<Self>,
        interval: Duration,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let registry = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut timer = tokio::time::interval_at(Instant::now() + interval, interval);
            timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = timer.tick() => {}
                }
                let Some(registry) = registry.upgrade() else {
                    break;
                };
                let result = tokio::select! {
                    _ = cancel.cancelled() => break,
                    result = registry.refresh_with_retry() => result,
                };
                if let Err(err) = result {
                    warn!("giving up on discovery until the next interval: {err}");
                }
            }
            debug!("node registry refresh task stopped");
        })
    }

    fn apply(&self, config: ClusterConfig) {
        let now = Instant::now();
        let Settings {
            removal_grace,
            dead_retry_delay,
            ..
        } = self.settings;
        let mut events = Vec::new();
        {
            let mut state = self.lock();
            let mut changed = state.version != config.version;
            state.version = config.version;

            for addr in &config.nodes {
                match state.nodes.entry(addr.clone()) {
                    Entry::Vacant(entry) => {
                        entry.insert(NodeState::new(now));
                        events.push(ClusterEvent::NodeAdded(addr.clone()));
                        changed = true;
                    }
                    Entry::Occupied(mut entry) => {
                        let node = entry.get_mut();
                        node.last_seen = now;
                        node.missed = 0;
                        let retry_due = node
                            .dead_since
                            .map_or(false, |since| now.duration_since(since) >= dead_retry_delay);
                        if node.status == NodeStatus::Dead && retry_due {
                            node.revive();
                            events.push(ClusterEvent::NodeRecovered(addr.clone()));
                            changed = true;
                        }
                    }
                }
            }

            let reported: HashSet<&NodeAddr> = config.nodes.iter().collect();
            state.nodes.retain(|addr, node| {
                if reported.contains(addr) {
                    return true;
                }
                node.missed += 1;
                if node.missed < removal_grace {
                    trace!("node {addr} missing from discovery ({} times)", node.missed);
                    return true;
                }
                events.push(ClusterEvent::NodeRemoved(addr.clone()));
                changed = true;
                false
            });

            if changed {
                self.publish(&state);
            }
        }
        self.emit(events);
    }

    fn publish(&self, state: &State) {
        let snapshot = Arc::new(NodeSet {
            version: state.version,
            nodes: state
                .nodes
                .iter()
                .map(|(addr, node)| Node {
                    addr: addr.clone(),
                    status: node.status,
                    last_seen: node.last_seen,
                })
                .collect(),
        });
        self.snapshot.store(snapshot.clone());
        for subscriber in &state.subscribers {
            subscriber(&snapshot);
        }
    }

    fn emit(&self, events: Vec<ClusterEvent>) {
        for event in &events {
            self.sink.on_event(event);
        }
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        // the state stays consistent even if a subscriber panicked
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::CacheFuture;
    use futures_util::FutureExt;

    struct Fixed(Vec<NodeAddr>);

    impl DiscoverySource for Fixed {
        fn discover(&self) -> CacheFuture<'_, ClusterConfig> {
            let nodes = self.0.clone();
            async move { Ok(ClusterConfig { version: 1, nodes }) }.boxed()
        }
    }

    fn addr(name: &str) -> NodeAddr {
        NodeAddr::tcp(name, 11211)
    }

    #[tokio::test]
    async fn failures_demote_and_success_restores() {
        let config = ClientConfig::new().set_node_failure_limit(2);
        let registry = NodeRegistry::new(Fixed(vec![addr("a"), addr("b")]), &config);
        registry.refresh().await.unwrap();

        registry.report_failure(&addr("a"));
        assert_eq!(
            registry.resolve().get(&addr("a")).unwrap().status,
            NodeStatus::Suspect
        );
        assert_eq!(registry.resolve().healthy().count(), 2);

        registry.report_failure(&addr("a"));
        let snapshot = registry.resolve();
        assert_eq!(snapshot.get(&addr("a")).unwrap().status, NodeStatus::Dead);
        assert_eq!(snapshot.healthy().collect::<Vec<_>>(), vec![&addr("b")]);

        registry.report_success(&addr("a"));
        assert_eq!(
            registry.resolve().get(&addr("a")).unwrap().status,
            NodeStatus::Healthy
        );
    }

    #[tokio::test]
    async fn unknown_nodes_are_ignored() {
        let registry = NodeRegistry::new(Fixed(vec![addr("a")]), &ClientConfig::new());
        registry.refresh().await.unwrap();
        let before = registry.resolve();
        registry.report_failure(&addr("zzz"));
        registry.report_success(&addr("zzz"));
        assert!(Arc::ptr_eq(&before, &registry.resolve()));
    }

    #[tokio::test(start_paused = true)]
    async fn dead_nodes_come_back_after_the_retry_delay() {
        let config = ClientConfig::new()
            .set_node_failure_limit(1)
            .set_dead_retry_delay(Duration::from_secs(30));
        let registry = NodeRegistry::new(Fixed(vec![addr("a")]), &config);
        registry.refresh().await.unwrap();
        registry.report_failure(&addr("a"));
        assert_eq!(registry.resolve().healthy().count(), 0);

        tokio::time::advance(Duration::from_secs(10)).await;
        registry.refresh().await.unwrap();
        assert_eq!(registry.resolve().healthy().count(), 0);

        tokio::time::advance(Duration::from_secs(20)).await;
        registry.refresh().await.unwrap();
        assert_eq!(registry.resolve().healthy().count(), 1);
    }

    #[tokio::test]
    async fn unchanged_refreshes_keep_the_snapshot() {
        let registry = NodeRegistry::new(Fixed(vec![addr("a")]), &ClientConfig::new());
        registry.refresh().await.unwrap();
        let before = registry.resolve();
        registry.refresh().await.unwrap();
        assert!(Arc::ptr_eq(&before, &registry.resolve()));
    }
}
