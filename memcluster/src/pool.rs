//! Bounded per-node connection pools.
//!
//! Each node gets a [`NodePool`] holding at most `pool_size` connections.
//! Callers that find every connection busy queue on a FIFO semaphore until
//! one is returned or their timeout runs out. The pools of all nodes live in
//! a copy-on-write map, so the per-node idle list is the only lock taken on
//! the request path.

use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use arc_swap::{ArcSwap, ArcSwapOption};
use log::{debug, trace};
use tokio::sync::{OwnedSemaphorePermit, Semaphore, TryAcquireError};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::cmd::Request;
use crate::config::ClientConfig;
use crate::connection::{Connect, NodeAddr, Transport};
use crate::errors::{CacheError, CacheResult, ErrorKind};
use crate::events::{default_sink, CloseReason, ClusterEvent, EventSink, SharedSink};
use crate::parser::Response;

#[derive(Clone, Copy, Debug)]
struct PoolSettings {
    pool_size: usize,
    min_idle: usize,
    max_waiting: Option<usize>,
    connection_timeout: Duration,
    idle_timeout: Duration,
}

impl From<&ClientConfig> for PoolSettings {
    fn from(config: &ClientConfig) -> Self {
        PoolSettings {
            pool_size: config.pool_size,
            min_idle: config.min_idle,
            max_waiting: config.max_waiting,
            connection_timeout: config.connection_timeout,
            idle_timeout: config.idle_timeout,
        }
    }
}

/// Counters describing a node pool at one point in time.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PoolStatus {
    /// Connections waiting in the idle list.
    pub idle: usize,
    /// Connections currently checked out.
    pub in_use: usize,
    /// Callers queued for a connection.
    pub waiting: usize,
}

struct IdleConnection<T> {
    conn: T,
    id: u64,
    created_at: Instant,
    idle_since: Instant,
}

/// The connections of a single node.
pub struct NodePool<C: Connect> {
    addr: NodeAddr,
    connector: Arc<C>,
    idle: Mutex<VecDeque<IdleConnection<C::Connection>>>,
    permits: Arc<Semaphore>,
    waiting: AtomicUsize,
    next_id: AtomicU64,
    closed: AtomicBool,
    settings: PoolSettings,
    sink: SharedSink,
}

impl<C: Connect> fmt::Debug for NodePool<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NodePool")
            .field("addr", &self.addr)
            .field("status", &self.status())
            .finish()
    }
}

struct WaitingGuard<'a>(&'a AtomicUsize);

impl Drop for WaitingGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::Relaxed);
    }
}

impl<C: Connect> NodePool<C> {
    fn new(addr: NodeAddr, connector: Arc<C>, settings: PoolSettings, sink: SharedSink) -> Self {
        NodePool {
            addr,
            connector,
            idle: Mutex::new(VecDeque::with_capacity(settings.pool_size)),
            permits: Arc::new(Semaphore::new(settings.pool_size)),
            waiting: AtomicUsize::new(0),
            next_id: AtomicU64::new(1),
            closed: AtomicBool::new(false),
            settings,
            sink,
        }
    }

    /// The node this pool connects to.
    pub fn addr(&self) -> &NodeAddr {
        &self.addr
    }

    /// Returns the current counters.
    pub fn status(&self) -> PoolStatus {
        let idle = self.idle_list().len();
        PoolStatus {
            idle,
            in_use: self.settings.pool_size - self.permits.available_permits(),
            waiting: self.waiting.load(Ordering::Relaxed),
        }
    }

    /// Takes a connection out of the pool, opening a new one when no idle
    /// connection is available.
    ///
    /// Waits at most `timeout` for a busy pool to free a connection. Failing
    /// to connect is returned as is.
    pub async fn checkout(self: &Arc<Self>, timeout: Duration) -> CacheResult<PooledConnection<C>> {
        let permit = self.acquire(timeout).await?;

        loop {
            let next = self.idle_list().pop_front();
            match next {
                Some(idle) if idle.idle_since.elapsed() >= self.settings.idle_timeout => {
                    self.closed_event(idle.id, CloseReason::Idle);
                }
                Some(idle) => {
                    trace!("reusing connection {} to {}", idle.id, self.addr);
                    return Ok(PooledConnection {
                        pool: Arc::clone(self),
                        conn: Some(idle.conn),
                        id: idle.id,
                        created_at: idle.created_at,
                        last_used_at: idle.idle_since,
                        _permit: permit,
                    });
                }
                None => break,
            }
        }

        let conn = self
            .connector
            .connect(&self.addr, self.settings.connection_timeout)
            .await?;
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.sink.on_event(&ClusterEvent::ConnectionCreated {
            node: self.addr.clone(),
            id,
        });
        let now = Instant::now();
        Ok(PooledConnection {
            pool: Arc::clone(self),
            conn: Some(conn),
            id,
            created_at: now,
            last_used_at: now,
            _permit: permit,
        })
    }

    async fn acquire(&self, timeout: Duration) -> CacheResult<OwnedSemaphorePermit> {
        match Arc::clone(&self.permits).try_acquire_owned() {
            Ok(permit) => return Ok(permit),
            Err(TryAcquireError::Closed) => return Err(self.closed_error()),
            Err(TryAcquireError::NoPermits) => {}
        }

        let queued = self.waiting.fetch_add(1, Ordering::Relaxed);
        let _waiting = WaitingGuard(&self.waiting);
        if self.settings.max_waiting.is_some_and(|max| queued >= max) {
            return Err(CacheError::from((
                ErrorKind::PoolExhausted,
                "Too many callers waiting for a connection",
                self.addr.to_string(),
            )));
        }

        match tokio::time::timeout(timeout, Arc::clone(&self.permits).acquire_owned()).await {
            Ok(Ok(permit)) => Ok(permit),
            Ok(Err(_)) => Err(self.closed_error()),
            Err(_) => Err(CacheError::from((
                ErrorKind::Timeout,
                "Timed out waiting for a pooled connection",
                self.addr.to_string(),
            ))),
        }
    }

    /// Returns a healthy connection to the idle list.
    pub fn checkin(&self, mut conn: PooledConnection<C>) {
        debug_assert!(std::ptr::eq(self, &*conn.pool));
        let Some(inner) = conn.conn.take() else {
            return;
        };
        if self.closed.load(Ordering::Acquire) {
            self.closed_event(conn.id, CloseReason::PoolClosed);
            return;
        }
        self.idle_list().push_back(IdleConnection {
            conn: inner,
            id: conn.id,
            created_at: conn.created_at,
            idle_since: Instant::now(),
        });
        // the permit is released when `conn` goes out of scope, after the
        // connection is back in the idle list
    }

    /// Closes a connection that must not be reused.
    pub fn invalidate(&self, mut conn: PooledConnection<C>) {
        debug_assert!(std::ptr::eq(self, &*conn.pool));
        if conn.conn.take().is_some() {
            self.closed_event(conn.id, CloseReason::Invalidated);
        }
    }

    /// Closes connections idle for longer than the idle timeout, keeping at
    /// least `min_idle`, then opens connections until `min_idle` are idle.
    pub async fn maintain(self: &Arc<Self>) {
        let expired: Vec<u64> = {
            let mut idle = self.idle_list();
            let mut expired = Vec::new();
            while idle.len() > self.settings.min_idle {
                match idle.front() {
                    Some(front) if front.idle_since.elapsed() >= self.settings.idle_timeout => {
                        if let Some(conn) = idle.pop_front() {
                            expired.push(conn.id);
                        }
                    }
                    _ => break,
                }
            }
            expired
        };
        for id in expired {
            self.closed_event(id, CloseReason::Idle);
        }

        while !self.closed.load(Ordering::Acquire)
            && self.idle_list().len() < self.settings.min_idle
        {
            let Ok(permit) = Arc::clone(&self.permits).try_acquire_owned() else {
                break;
            };
            match self
                .connector
                .connect(&self.addr, self.settings.connection_timeout)
                .await
            {
                Ok(conn) => {
                    let id = self.next_id.fetch_add(1, Ordering::Relaxed);
                    self.sink.on_event(&ClusterEvent::ConnectionCreated {
                        node: self.addr.clone(),
                        id,
                    });
                    let now = Instant::now();
                    self.idle_list().push_back(IdleConnection {
                        conn,
                        id,
                        created_at: now,
                        idle_since: now,
                    });
                }
                Err(err) => {
                    debug!("could not open idle connection to {}: {err}", self.addr);
                    break;
                }
            }
            drop(permit);
        }
    }

    /// Closes every idle connection and fails all current and future waiters.
    ///
    /// Connections checked out at this point are closed when they come back.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.permits.close();
        let idle: Vec<_> = self.idle_list().drain(..).collect();
        for conn in idle {
            self.closed_event(conn.id, CloseReason::PoolClosed);
        }
    }

    // connections of a pool nobody keeps are closed on checkin
    fn detach(&self) {
        self.closed.store(true, Ordering::Release);
    }

    fn closed_event(&self, id: u64, reason: CloseReason) {
        self.sink.on_event(&ClusterEvent::ConnectionClosed {
            node: self.addr.clone(),
            id,
            reason,
        });
    }

    fn closed_error(&self) -> CacheError {
        CacheError::from((
            ErrorKind::NodeUnavailable,
            "Node left the cluster",
            self.addr.to_string(),
        ))
    }

    fn idle_list(&self) -> MutexGuard<'_, VecDeque<IdleConnection<C::Connection>>> {
        self.idle.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// A connection checked out of a [`NodePool`].
///
/// Give it back with [`NodePool::checkin`] once a request succeeded. A handle
/// dropped any other way closes its connection, so a request cancelled
/// half-way never leaves a desynchronized connection in the pool.
pub struct PooledConnection<C: Connect> {
    pool: Arc<NodePool<C>>,
    conn: Option<C::Connection>,
    id: u64,
    created_at: Instant,
    last_used_at: Instant,
    _permit: OwnedSemaphorePermit,
}

impl<C: Connect> PooledConnection<C> {
    /// The node this connection belongs to.
    pub fn node(&self) -> &NodeAddr {
        &self.pool.addr
    }

    /// Pool-unique id of the underlying connection.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// When the underlying connection was opened.
    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    /// When the underlying connection last carried a request.
    pub fn last_used_at(&self) -> Instant {
        self.last_used_at
    }

    /// Sends one request over the connection.
    pub async fn send(&mut self, request: &Request) -> CacheResult<Response> {
        let conn = self
            .conn
            .as_mut()
            .ok_or_else(|| io::Error::from(io::ErrorKind::NotConnected))?;
        let response = conn.send(request).await;
        self.last_used_at = Instant::now();
        response
    }

    /// Returns the connection to its pool.
    pub fn checkin(self) {
        let pool = Arc::clone(&self.pool);
        pool.checkin(self);
    }

    /// Closes the connection.
    pub fn invalidate(self) {
        let pool = Arc::clone(&self.pool);
        pool.invalidate(self);
    }
}

impl<C: Connect> fmt::Debug for PooledConnection<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PooledConnection")
            .field("node", &self.pool.addr)
            .field("id", &self.id)
            .finish()
    }
}

impl<C: Connect> Drop for PooledConnection<C> {
    fn drop(&mut self) {
        if self.conn.take().is_some() {
            self.pool.closed_event(self.id, CloseReason::Dropped);
        }
    }
}

/// The pools of every node in the cluster.
pub struct ConnectionPool<C: Connect> {
    connector: Arc<C>,
    pools: ArcSwap<HashMap<NodeAddr, Arc<NodePool<C>>>>,
    // unset until the first `retain`; every address is a member until then
    members: ArcSwapOption<HashSet<NodeAddr>>,
    settings: PoolSettings,
    sink: SharedSink,
}

impl<C: Connect> fmt::Debug for ConnectionPool<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("nodes", &self.nodes())
            .finish_non_exhaustive()
    }
}

impl<C: Connect> ConnectionPool<C> {
    /// Creates an empty pool set opening connections through `connector`.
    pub fn new(connector: C, config: &ClientConfig) -> Self {
        Self::with_event_sink(connector, config, default_sink())
    }

    /// Like [`ConnectionPool::new`], reporting connection events to `sink`.
    pub fn with_event_sink(connector: C, config: &ClientConfig, sink: Arc<dyn EventSink>) -> Self {
        ConnectionPool {
            connector: Arc::new(connector),
            pools: ArcSwap::from_pointee(HashMap::new()),
            members: ArcSwapOption::empty(),
            settings: PoolSettings::from(config),
            sink,
        }
    }

    /// Returns the pool of `addr`, creating it on first use.
    ///
    /// Addresses outside the membership last passed to
    /// [`ConnectionPool::retain`] get a throwaway pool that is not kept and
    /// closes its connections once they are returned.
    pub fn pool_for(&self, addr: &NodeAddr) -> Arc<NodePool<C>> {
        if let Some(pool) = self.pools.load().get(addr) {
            return Arc::clone(pool);
        }
        let created = Arc::new(NodePool::new(
            addr.clone(),
            Arc::clone(&self.connector),
            self.settings,
            Arc::clone(&self.sink),
        ));
        let mut cached = false;
        let previous = self.pools.rcu(|pools| {
            cached = false;
            if pools.contains_key(addr) || !self.is_member(addr) {
                return Arc::clone(pools);
            }
            cached = true;
            let mut pools = HashMap::clone(pools);
            pools.insert(addr.clone(), Arc::clone(&created));
            Arc::new(pools)
        });
        // a concurrent caller may have won the race
        if let Some(pool) = previous.get(addr) {
            return Arc::clone(pool);
        }
        if !cached {
            debug!("{addr} is not a cluster member, its pool is not kept");
            created.detach();
        }
        created
    }

    fn is_member(&self, addr: &NodeAddr) -> bool {
        self.members
            .load()
            .as_ref()
            .map_or(true, |members| members.contains(addr))
    }

    /// Checks out a connection to `addr`.
    pub async fn checkout(
        &self,
        addr: &NodeAddr,
        timeout: Duration,
    ) -> CacheResult<PooledConnection<C>> {
        self.pool_for(addr).checkout(timeout).await
    }

    /// Makes `nodes` the membership and closes the pools of everything else.
    pub fn retain<'a, I>(&self, nodes: I)
    where
        I: IntoIterator<Item = &'a NodeAddr>,
    {
        let keep: HashSet<NodeAddr> = nodes.into_iter().cloned().collect();
        let keep = Arc::new(keep);
        // published first so `pool_for` stops caching departed nodes before
        // their pools are dropped from the map
        self.members.store(Some(Arc::clone(&keep)));
        if self.pools.load().keys().all(|addr| keep.contains(addr)) {
            return;
        }
        let previous = self.pools.rcu(|pools| {
            let mut pools = HashMap::clone(pools);
            pools.retain(|addr, _| keep.contains(addr));
            pools
        });
        for (addr, pool) in previous.iter() {
            if !keep.contains(addr) {
                debug!("closing connection pool of {addr}");
                pool.close();
            }
        }
    }

    /// Addresses that currently have a pool.
    pub fn nodes(&self) -> Vec<NodeAddr> {
        self.pools.load().keys().cloned().collect()
    }

    /// Runs [`NodePool::maintain`] on every node.
    pub async fn maintain(&self) {
        let pools = self.pools.load_full();
        for pool in pools.values() {
            pool.maintain().await;
        }
    }

    /// Closes every pool.
    pub fn close(&self) {
        self.members.store(Some(Arc::new(HashSet::new())));
        let pools = self.pools.swap(Arc::new(HashMap::new()));
        for pool in pools.values() {
            pool.close();
        }
    }

    /// Spawns a task calling [`ConnectionPool::maintain`] every `interval`
    /// until `cancel` fires or the pool is dropped.
    pub fn spawn_maintenance(
        self: &Arc<Self>,
        interval: Duration,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let pool = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut timer = tokio::time::interval_at(Instant::now() + interval, interval);
            timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = timer.tick() => {}
                }
                let Some(pool) = pool.upgrade() else {
                    break;
                };
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = pool.maintain() => {}
                }
            }
            debug!("connection pool maintenance task stopped");
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::CacheFuture;
    use futures_util::FutureExt;

    #[derive(Default)]
    struct Counting {
        connects: AtomicUsize,
        refuse: AtomicBool,
    }

    struct Echo;

    impl Transport for Echo {
        fn send<'a>(&'a mut self, _request: &'a Request) -> CacheFuture<'a, Response> {
            async { Ok(Response::Stored) }.boxed()
        }
    }

    impl Connect for Counting {
        type Connection = Echo;

        fn connect<'a>(
            &'a self,
            _addr: &'a NodeAddr,
            _timeout: Duration,
        ) -> CacheFuture<'a, Echo> {
            async move {
                if self.refuse.load(Ordering::SeqCst) {
                    return Err(io::Error::from(io::ErrorKind::ConnectionRefused).into());
                }
                self.connects.fetch_add(1, Ordering::SeqCst);
                Ok(Echo)
            }
            .boxed()
        }
    }

    fn pool(config: &ClientConfig) -> Arc<NodePool<Counting>> {
        let pools = ConnectionPool::new(Counting::default(), config);
        pools.pool_for(&NodeAddr::tcp("a", 11211))
    }

    #[tokio::test]
    async fn idle_connections_are_reused_in_order() {
        let pool = pool(&ClientConfig::new().set_pool_size(2));
        let first = pool.checkout(Duration::from_secs(1)).await.unwrap();
        let second = pool.checkout(Duration::from_secs(1)).await.unwrap();
        let (first_id, second_id) = (first.id(), second.id());
        assert_ne!(first_id, second_id);
        first.checkin();
        second.checkin();

        assert_eq!(pool.checkout(Duration::from_secs(1)).await.unwrap().id(), first_id);
        assert_eq!(pool.connector.connects.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn dropped_handles_release_their_slot() {
        let pool = pool(&ClientConfig::new().set_pool_size(1));
        let conn = pool.checkout(Duration::from_secs(1)).await.unwrap();
        assert_eq!(pool.status().in_use, 1);
        drop(conn);
        assert_eq!(pool.status(), PoolStatus::default());
        pool.checkout(Duration::from_secs(1)).await.unwrap();
        assert_eq!(pool.connector.connects.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn connect_failures_are_returned() {
        let pool = pool(&ClientConfig::new());
        pool.connector.refuse.store(true, Ordering::SeqCst);
        let err = pool.checkout(Duration::from_secs(1)).await.unwrap_err();
        assert!(err.is_connection_refusal());
        assert_eq!(pool.status().in_use, 0);
    }

    #[tokio::test]
    async fn closed_pools_reject_checkouts() {
        let pool = pool(&ClientConfig::new());
        let conn = pool.checkout(Duration::from_secs(1)).await.unwrap();
        pool.close();
        conn.checkin();
        assert_eq!(pool.status().idle, 0);
        let err = pool.checkout(Duration::from_secs(1)).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NodeUnavailable);
    }
}
