//! Transports to individual cache nodes.
//!
//! The pool never talks to sockets directly: it asks a [`Connect`]
//! implementation for a [`Transport`], which makes the whole request path
//! testable against in-memory nodes.

mod addr;
mod tcp;

use std::io;
use std::time::Duration;

use futures_util::future::BoxFuture;
use futures_util::{FutureExt, SinkExt, StreamExt};
use log::trace;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
#[cfg(unix)]
use tokio::net::UnixStream;
use tokio_util::codec::Framed;

pub use addr::{IntoNodeAddr, NodeAddr, DEFAULT_PORT};
pub use tcp::{socket2, TcpSettings};

use crate::cmd::Request;
use crate::errors::CacheResult;
use crate::parser::{MemcacheCodec, Response};

/// Library generic future type.
pub type CacheFuture<'a, T> = BoxFuture<'a, CacheResult<T>>;

/// An established connection able to exchange one request for one response.
pub trait Transport: Send + 'static {
    /// Sends `request` and waits for its response.
    ///
    /// Any error leaves the transport in an unknown state; callers must not
    /// reuse it afterwards.
    fn send<'a>(&'a mut self, request: &'a Request) -> CacheFuture<'a, Response>;
}

/// Establishes transports to cache nodes.
pub trait Connect: Send + Sync + 'static {
    /// The transport produced by this connector.
    type Connection: Transport;

    /// Connects to `addr`, giving up after `timeout`.
    fn connect<'a>(
        &'a self,
        addr: &'a NodeAddr,
        timeout: Duration,
    ) -> CacheFuture<'a, Self::Connection>;
}

/// Connects over TCP or unix sockets using the memcached text protocol.
#[derive(Clone, Debug, Default)]
pub struct TcpConnector {
    settings: TcpSettings,
}

impl TcpConnector {
    /// Creates a connector applying `settings` to every TCP socket it opens.
    pub fn new(settings: TcpSettings) -> Self {
        Self { settings }
    }

    async fn connect_inner(&self, addr: &NodeAddr) -> io::Result<MemcacheConnection> {
        match addr {
            NodeAddr::HostPort(host, port) => {
                let stream = TcpStream::connect((host.as_str(), *port)).await?;
                self.settings.apply(&stream)?;
                Ok(MemcacheConnection::Tcp(Framed::new(
                    stream,
                    MemcacheCodec::new(),
                )))
            }
            #[cfg(unix)]
            NodeAddr::Socket(path) => {
                let stream = UnixStream::connect(path).await?;
                Ok(MemcacheConnection::Unix(Framed::new(
                    stream,
                    MemcacheCodec::new(),
                )))
            }
            #[cfg(not(unix))]
            NodeAddr::Socket(_) => Err(io::Error::new(
                io::ErrorKind::Unsupported,
                "unix sockets are not supported on this platform",
            )),
        }
    }
}

impl Connect for TcpConnector {
    type Connection = MemcacheConnection;

    fn connect<'a>(
        &'a self,
        addr: &'a NodeAddr,
        timeout: Duration,
    ) -> CacheFuture<'a, Self::Connection> {
        async move {
            trace!("connecting to {addr}");
            match tokio::time::timeout(timeout, self.connect_inner(addr)).await {
                Ok(conn) => Ok(conn?),
                Err(_) => Err(io::Error::new(
                    io::ErrorKind::TimedOut,
                    format!("connecting to {addr} timed out"),
                )
                .into()),
            }
        }
        .boxed()
    }
}

/// A framed connection to a single node.
pub enum MemcacheConnection {
    /// A TCP stream.
    Tcp(Framed<TcpStream, MemcacheCodec>),
    /// A unix socket stream.
    #[cfg(unix)]
    Unix(Framed<UnixStream, MemcacheCodec>),
}

async fn round_trip<S>(
    framed: &mut Framed<S, MemcacheCodec>,
    request: &Request,
) -> CacheResult<Response>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    framed.send(request).await?;
    match framed.next().await {
        Some(response) => response,
        None => Err(io::Error::from(io::ErrorKind::UnexpectedEof).into()),
    }
}

impl Transport for MemcacheConnection {
    fn send<'a>(&'a mut self, request: &'a Request) -> CacheFuture<'a, Response> {
        match self {
            MemcacheConnection::Tcp(framed) => round_trip(framed, request).boxed(),
            #[cfg(unix)]
            MemcacheConnection::Unix(framed) => round_trip(framed, request).boxed(),
        }
    }
}
