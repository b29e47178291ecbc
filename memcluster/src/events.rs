//! Structured events emitted by the registry, the pools and the client.
//!
//! Every component receives an [`EventSink`] at construction. The default
//! [`LogSink`] forwards events to the `log` facade.

use std::fmt;
use std::sync::Arc;

use log::{debug, info, warn};

use crate::connection::NodeAddr;

/// Why a pooled connection was closed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CloseReason {
    /// The connection failed or was invalidated by its holder.
    Invalidated,
    /// The connection stayed idle longer than the idle timeout.
    Idle,
    /// The handle was dropped without being checked in.
    Dropped,
    /// The node left the cluster and its pool was discarded.
    PoolClosed,
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            CloseReason::Invalidated => "invalidated",
            CloseReason::Idle => "idle",
            CloseReason::Dropped => "dropped",
            CloseReason::PoolClosed => "pool closed",
        })
    }
}

/// An observable event.
#[derive(Clone, Debug, PartialEq, Eq)]
#[non_exhaustive]
pub enum ClusterEvent {
    /// Discovery reported a node that was not known before.
    NodeAdded(NodeAddr),
    /// A node was absent from discovery for long enough to be dropped.
    NodeRemoved(NodeAddr),
    /// A node failed too many requests in a row and left the ring.
    NodeMarkedDead(NodeAddr),
    /// A dead node was brought back into the ring.
    NodeRecovered(NodeAddr),
    /// Querying the discovery source failed; the previous node set is kept.
    DiscoveryFailed {
        /// Rendered error.
        error: String,
    },
    /// The pool opened a new connection.
    ConnectionCreated {
        /// Owning node.
        node: NodeAddr,
        /// Pool-unique connection id.
        id: u64,
    },
    /// The pool closed a connection.
    ConnectionClosed {
        /// Owning node.
        node: NodeAddr,
        /// Pool-unique connection id.
        id: u64,
        /// Why it was closed.
        reason: CloseReason,
    },
    /// A request failed on a node and will be attempted again.
    RequestRetried {
        /// The node that failed.
        node: NodeAddr,
        /// The attempt that failed, starting at 1.
        attempt: usize,
        /// Rendered error.
        error: String,
    },
    /// A request failed and the error is returned to the caller.
    RequestFailed {
        /// The command name.
        command: &'static str,
        /// Rendered error.
        error: String,
    },
}

/// Receives [`ClusterEvent`]s.
pub trait EventSink: Send + Sync {
    /// Called synchronously from the component emitting `event`.
    fn on_event(&self, event: &ClusterEvent);
}

/// Forwards events to the `log` facade.
#[derive(Clone, Copy, Debug, Default)]
pub struct LogSink;

impl EventSink for LogSink {
    fn on_event(&self, event: &ClusterEvent) {
        match event {
            ClusterEvent::NodeAdded(node) => info!("node added: {node}"),
            ClusterEvent::NodeRemoved(node) => info!("node removed: {node}"),
            ClusterEvent::NodeMarkedDead(node) => warn!("node marked dead: {node}"),
            ClusterEvent::NodeRecovered(node) => info!("node recovered: {node}"),
            ClusterEvent::DiscoveryFailed { error } => warn!("discovery failed: {error}"),
            ClusterEvent::ConnectionCreated { node, id } => {
                debug!("connection {id} to {node} created")
            }
            ClusterEvent::ConnectionClosed { node, id, reason } => {
                debug!("connection {id} to {node} closed ({reason})")
            }
            ClusterEvent::RequestRetried {
                node,
                attempt,
                error,
            } => warn!("attempt {attempt} on {node} failed, retrying: {error}"),
            ClusterEvent::RequestFailed { command, error } => {
                warn!("{command} failed: {error}")
            }
        }
    }
}

pub(crate) type SharedSink = Arc<dyn EventSink>;

pub(crate) fn default_sink() -> SharedSink {
    Arc::new(LogSink)
}
