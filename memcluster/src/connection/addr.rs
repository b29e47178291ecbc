use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use crate::errors::{CacheError, CacheResult, ErrorKind};

/// The port memcached listens on when an address does not name one.
pub const DEFAULT_PORT: u16 = 11211;

/// Defines the address of a cache node.
///
/// Discovery responses may mix both variants; the pool and the ring treat
/// them uniformly.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum NodeAddr {
    /// Format for this is `(host, port)`.
    HostPort(String, u16),
    /// Format for this is the path to the unix socket.
    Socket(PathBuf),
}

impl NodeAddr {
    /// Creates a `host:port` address.
    pub fn tcp(host: impl Into<String>, port: u16) -> NodeAddr {
        NodeAddr::HostPort(host.into(), port)
    }

    /// Creates a unix socket address.
    pub fn socket(path: impl AsRef<Path>) -> NodeAddr {
        NodeAddr::Socket(path.as_ref().to_path_buf())
    }

    /// Checks if this address is supported.
    ///
    /// Unix sockets are only available on unix platforms.
    pub fn is_supported(&self) -> bool {
        match *self {
            NodeAddr::HostPort(_, _) => true,
            NodeAddr::Socket(_) => cfg!(unix),
        }
    }
}

impl fmt::Display for NodeAddr {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        // Ring positions are derived from this representation.
        match *self {
            NodeAddr::HostPort(ref host, port) => write!(f, "{host}:{port}"),
            NodeAddr::Socket(ref path) => write!(f, "{}", path.display()),
        }
    }
}

fn invalid_addr(detail: &str) -> CacheError {
    CacheError::from((
        ErrorKind::InvalidClientConfig,
        "Invalid node address",
        detail.to_string(),
    ))
}

fn parse_host_port(input: &str) -> CacheResult<NodeAddr> {
    // `[::1]:11211` and bare `[::1]`
    if let Some(rest) = input.strip_prefix('[') {
        let (host, tail) = rest.split_once(']').ok_or_else(|| invalid_addr(input))?;
        let port = match tail.strip_prefix(':') {
            Some(port) => port.parse().map_err(|_| invalid_addr(input))?,
            None if tail.is_empty() => DEFAULT_PORT,
            None => return Err(invalid_addr(input)),
        };
        return Ok(NodeAddr::tcp(host, port));
    }

    match input.rsplit_once(':') {
        Some((host, port)) if !host.is_empty() && !host.contains(':') => {
            let port = port.parse().map_err(|_| invalid_addr(input))?;
            Ok(NodeAddr::tcp(host, port))
        }
        None if !input.is_empty() => Ok(NodeAddr::tcp(input, DEFAULT_PORT)),
        _ => Err(invalid_addr(input)),
    }
}

fn parse_url(input: &str) -> CacheResult<NodeAddr> {
    let url = url::Url::parse(input).map_err(|_| invalid_addr(input))?;
    match url.scheme() {
        "memcache" | "memcached" | "tcp" => {
            let host = match url.host() {
                Some(url::Host::Domain(domain)) => domain.to_string(),
                Some(url::Host::Ipv4(ip)) => ip.to_string(),
                Some(url::Host::Ipv6(ip)) => ip.to_string(),
                None => return Err(invalid_addr(input)),
            };
            Ok(NodeAddr::tcp(host, url.port().unwrap_or(DEFAULT_PORT)))
        }
        "unix" => {
            let path = url.to_file_path().map_err(|_| invalid_addr(input))?;
            Ok(NodeAddr::Socket(path))
        }
        _ => Err(invalid_addr(input)),
    }
}

impl FromStr for NodeAddr {
    type Err = CacheError;

    fn from_str(input: &str) -> CacheResult<NodeAddr> {
        let input = input.trim();
        if input.starts_with('/') {
            Ok(NodeAddr::socket(input))
        } else if input.contains("://") {
            parse_url(input)
        } else {
            parse_host_port(input)
        }
    }
}

/// Converts an object into a node address.
///
/// Implemented for strings (`host:port`, `host`, `/path/to.sock`,
/// `memcache://host:port`, `unix:///path/to.sock`) and for address tuples.
pub trait IntoNodeAddr: Sized {
    /// Converts the object into a node address.
    fn into_node_addr(self) -> CacheResult<NodeAddr>;
}

impl IntoNodeAddr for NodeAddr {
    fn into_node_addr(self) -> CacheResult<NodeAddr> {
        Ok(self)
    }
}

impl IntoNodeAddr for &str {
    fn into_node_addr(self) -> CacheResult<NodeAddr> {
        self.parse()
    }
}

impl IntoNodeAddr for String {
    fn into_node_addr(self) -> CacheResult<NodeAddr> {
        self.parse()
    }
}

impl<T> IntoNodeAddr for (T, u16)
where
    T: Into<String>,
{
    fn into_node_addr(self) -> CacheResult<NodeAddr> {
        Ok(NodeAddr::tcp(self.0, self.1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("127.0.0.1:11212", NodeAddr::tcp("127.0.0.1", 11212))]
    #[case("cache.local", NodeAddr::tcp("cache.local", DEFAULT_PORT))]
    #[case("[::1]:11300", NodeAddr::tcp("::1", 11300))]
    #[case("[::1]", NodeAddr::tcp("::1", DEFAULT_PORT))]
    #[case("/var/tmp/cache-0.sock", NodeAddr::socket("/var/tmp/cache-0.sock"))]
    #[case("memcache://cache.local:11299", NodeAddr::tcp("cache.local", 11299))]
    #[case("memcache://10.0.0.1", NodeAddr::tcp("10.0.0.1", DEFAULT_PORT))]
    #[case("unix:///var/tmp/cache-1.sock", NodeAddr::socket("/var/tmp/cache-1.sock"))]
    fn parses_supported_forms(#[case] input: &str, #[case] expected: NodeAddr) {
        assert_eq!(input.into_node_addr().unwrap(), expected);
    }

    #[rstest]
    #[case("")]
    #[case(":11211")]
    #[case("host:notaport")]
    #[case("redis://host:6379")]
    #[case("[::1")]
    fn rejects_malformed_addresses(#[case] input: &str) {
        let err = input.into_node_addr().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidClientConfig);
    }

    #[test]
    fn display_round_trips() {
        for addr in [
            NodeAddr::tcp("10.1.2.3", 11211),
            NodeAddr::socket("/tmp/node.sock"),
        ] {
            assert_eq!(addr.to_string().parse::<NodeAddr>().unwrap(), addr);
        }
    }
}
