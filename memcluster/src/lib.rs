//! memcluster is a cluster-aware client for memcached style caches.
//!
//! It discovers the nodes of a cluster, keeps a bounded pool of connections
//! per node and spreads keys over the nodes by consistent hashing.
//!
//! # Basic Operation
//!
//! A client is built from a discovery source. The most common one is the
//! configuration endpoint of an ElastiCache cluster, which answers
//! `config get cluster` with the current node list:
//!
//! ```rust,no_run
//! use std::time::Duration;
//!
//! # async fn run() -> memcluster::CacheResult<()> {
//! let config = memcluster::ClientConfig::new()
//!     .set_pool_size(4)
//!     .set_request_timeout(Duration::from_millis(500));
//! let client = memcluster::CacheClient::from_config_endpoint(
//!     "mycluster.cfg.use1.cache.amazonaws.com",
//!     config,
//! )
//! .await?;
//!
//! client.set("user:42", "alice", Duration::from_secs(300)).await?;
//! let name = client.get("user:42").await?;
//! # Ok(()) }
//! ```
//!
//! A fixed node list works the same way through
//! [`CacheClient::from_nodes`]. Node addresses are either `host:port` pairs
//! or absolute unix socket paths, and both may be mixed in one cluster.
//!
//! ## Fetching
//!
//! [`CacheClient::fetch`] reads a key and only on a miss computes, stores
//! and returns the value:
//!
//! ```rust,no_run
//! # use std::time::Duration;
//! # async fn run(client: memcluster::CacheClient) -> memcluster::CacheResult<()> {
//! let report = client
//!     .fetch("report:today", Duration::from_secs(60), || async {
//!         Ok::<_, memcluster::CacheError>(bytes::Bytes::from("expensive"))
//!     })
//!     .await?;
//! # Ok(()) }
//! ```
//!
//! # Failure handling
//!
//! Every operation is bounded by the request timeout. Transport failures
//! are retried up to the configured number of attempts; a node failing
//! repeatedly is taken out of the ring until discovery lists it again after
//! the dead retry delay. Malformed responses and server errors are returned
//! right away. A miss is `Ok(None)`, never an error.
//!
//! # Observability
//!
//! Membership changes, connection churn and failed requests are reported
//! as [`events::ClusterEvent`]s. By default they go to the `log` facade; a
//! custom [`events::EventSink`] can be passed to [`ClientBuilder::event_sink`].

#![deny(non_camel_case_types)]
#![warn(missing_docs)]
#![cfg_attr(docsrs, warn(rustdoc::broken_intra_doc_links))]

// public api
pub use crate::client::{CacheClient, ClientBuilder};
pub use crate::cmd::{encode_ttl, validate_key, Request, MAX_KEY_LENGTH};
pub use crate::config::ClientConfig;
pub use crate::connection::{
    socket2, CacheFuture, Connect, IntoNodeAddr, MemcacheConnection, NodeAddr, TcpConnector,
    TcpSettings, Transport, DEFAULT_PORT,
};
pub use crate::discovery::{ClusterConfig, ConfigEndpoint, DiscoverySource, StaticNodes};
pub use crate::parser::{parse_response, Item, MemcacheCodec, Response};
pub use crate::pool::{ConnectionPool, NodePool, PoolStatus, PooledConnection};
pub use crate::registry::{Node, NodeRegistry, NodeSet, NodeStatus};
pub use crate::ring::{key_hash, HashRing, KeyRouter, RingEntry, DEFAULT_VIRTUAL_NODES};

// preserve grouping and order
#[rustfmt::skip]
pub use crate::errors::{
    // error kinds
    ErrorKind,
    RetryMethod,

    // error and result types
    CacheError,
    CacheResult,
};

pub mod discovery;
pub mod events;

mod client;
mod cmd;
mod config;
mod connection;
mod errors;
mod parser;
mod pool;
mod registry;
mod ring;
