//! Sources of cluster membership.
//!
//! ElastiCache style clusters expose a configuration endpoint answering
//! `config get cluster` with the current node list:
//!
//! ```text
//! CONFIG cluster 0 147
//! 12
//! node1.cache.amazonaws.com|10.0.0.1|11211 node2.cache.amazonaws.com|10.0.0.2|11211
//!
//! END
//! ```
//!
//! Local proxies in front of a cluster advertise unix sockets the same way,
//! as `/path/to/node.sock||` entries.

use std::io;
use std::time::Duration;

use futures_util::FutureExt;
use log::trace;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
#[cfg(unix)]
use tokio::net::UnixStream;

use crate::connection::{CacheFuture, IntoNodeAddr, NodeAddr};
use crate::errors::{parse_error, CacheError, CacheResult, ErrorKind};

const CONFIG_COMMAND: &[u8] = b"config get cluster\r\n";

/// Upper bound for a configuration response.
const MAX_RESPONSE_SIZE: usize = 64 * 1024;

/// The membership reported by a discovery source.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ClusterConfig {
    /// Configuration version, bumped by the cluster on every change.
    pub version: u64,
    /// Node addresses in the order they were reported, without duplicates.
    pub nodes: Vec<NodeAddr>,
}

/// Produces the current node list of a cluster.
pub trait DiscoverySource: Send + Sync + 'static {
    /// Queries the source once.
    fn discover(&self) -> CacheFuture<'_, ClusterConfig>;
}

impl<T: DiscoverySource + ?Sized> DiscoverySource for Box<T> {
    fn discover(&self) -> CacheFuture<'_, ClusterConfig> {
        (**self).discover()
    }
}

impl<T: DiscoverySource + ?Sized> DiscoverySource for std::sync::Arc<T> {
    fn discover(&self) -> CacheFuture<'_, ClusterConfig> {
        (**self).discover()
    }
}

/// A fixed node list.
#[derive(Clone, Debug)]
pub struct StaticNodes {
    nodes: Vec<NodeAddr>,
}

impl StaticNodes {
    /// Creates a source that always reports `nodes`.
    pub fn new<T: IntoNodeAddr>(nodes: Vec<T>) -> CacheResult<StaticNodes> {
        let nodes = nodes
            .into_iter()
            .map(IntoNodeAddr::into_node_addr)
            .collect::<CacheResult<Vec<_>>>()?;
        Ok(StaticNodes { nodes })
    }
}

impl DiscoverySource for StaticNodes {
    fn discover(&self) -> CacheFuture<'_, ClusterConfig> {
        let config = ClusterConfig {
            version: 0,
            nodes: dedup(self.nodes.clone()),
        };
        async move { Ok(config) }.boxed()
    }
}

/// Queries an ElastiCache style configuration endpoint.
#[derive(Clone, Debug)]
pub struct ConfigEndpoint {
    addr: NodeAddr,
    timeout: Duration,
}

impl ConfigEndpoint {
    /// Creates a source querying `endpoint`; the port defaults to 11211.
    pub fn new<T: IntoNodeAddr>(endpoint: T, timeout: Duration) -> CacheResult<ConfigEndpoint> {
        Ok(ConfigEndpoint {
            addr: endpoint.into_node_addr()?,
            timeout,
        })
    }

    /// The endpoint address.
    pub fn addr(&self) -> &NodeAddr {
        &self.addr
    }

    async fn query(&self) -> CacheResult<ClusterConfig> {
        trace!("querying configuration endpoint {}", self.addr);
        let raw = match &self.addr {
            NodeAddr::HostPort(host, port) => {
                query_stream(TcpStream::connect((host.as_str(), *port)).await?).await?
            }
            #[cfg(unix)]
            NodeAddr::Socket(path) => query_stream(UnixStream::connect(path).await?).await?,
            #[cfg(not(unix))]
            NodeAddr::Socket(_) => {
                return Err(io::Error::from(io::ErrorKind::Unsupported).into());
            }
        };
        parse_cluster_config(&raw)
    }
}

impl DiscoverySource for ConfigEndpoint {
    fn discover(&self) -> CacheFuture<'_, ClusterConfig> {
        async move {
            match tokio::time::timeout(self.timeout, self.query()).await {
                Ok(result) => result,
                Err(_) => Err(CacheError::from((
                    ErrorKind::Timeout,
                    "Configuration endpoint timed out",
                    self.addr.to_string(),
                ))),
            }
        }
        .boxed()
    }
}

async fn query_stream<S>(stream: S) -> CacheResult<String>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut stream = BufReader::new(stream);
    stream.write_all(CONFIG_COMMAND).await?;
    stream.flush().await?;

    let mut raw = String::new();
    loop {
        let start = raw.len();
        if stream.read_line(&mut raw).await? == 0 {
            return Err(io::Error::from(io::ErrorKind::UnexpectedEof).into());
        }
        let line = raw[start..].trim_end();
        if line == "END" || line == "ERROR" {
            return Ok(raw);
        }
        if raw.len() > MAX_RESPONSE_SIZE {
            return Err(parse_error(
                "Configuration response too large",
                format!("{} bytes", raw.len()),
            ));
        }
    }
}

/// Parses the answer to `config get cluster`.
///
/// The first line is the `CONFIG cluster <flags> <length>` header, the
/// second the configuration version and the third the node list. Input
/// without the header is read as a bare node list.
pub fn parse_cluster_config(raw: &str) -> CacheResult<ClusterConfig> {
    let mut lines = raw.lines().map(str::trim);
    let Some(first) = lines.next() else {
        return Ok(ClusterConfig::default());
    };

    if first == "ERROR" || first.starts_with("CLIENT_ERROR") || first.starts_with("SERVER_ERROR")
    {
        return Err(CacheError::from((
            ErrorKind::DiscoveryError,
            "Endpoint does not serve the cluster configuration",
            first.to_string(),
        )));
    }

    if !first.starts_with("CONFIG ") {
        return Ok(ClusterConfig {
            version: 0,
            nodes: parse_node_list(raw)?,
        });
    }

    let version = match lines.next() {
        Some(line) if line != "END" => line
            .parse()
            .map_err(|_| parse_error("Malformed configuration version", line))?,
        _ => 0,
    };
    let nodes = match lines.next() {
        Some(line) if line != "END" => parse_node_list(line)?,
        _ => Vec::new(),
    };
    Ok(ClusterConfig { version, nodes })
}

/// Parses a node list blob.
///
/// Entries are separated by whitespace or commas. Each entry is one of
/// `hostname|ip|port`, `/socket/path||`, `/socket/path` or `host:port`.
pub fn parse_node_list(blob: &str) -> CacheResult<Vec<NodeAddr>> {
    let nodes = blob
        .split(|c: char| c.is_whitespace() || c == ',')
        .filter(|entry| !entry.is_empty())
        .map(parse_node_entry)
        .collect::<CacheResult<Vec<_>>>()?;
    Ok(dedup(nodes))
}

fn parse_node_entry(entry: &str) -> CacheResult<NodeAddr> {
    if !entry.contains('|') {
        return entry
            .parse()
            .map_err(|_| parse_error("Malformed node entry", entry));
    }

    let fields: Vec<&str> = entry.split('|').collect();
    if fields[0].starts_with('/') && fields[1..].iter().all(|field| field.is_empty()) {
        return Ok(NodeAddr::socket(fields[0]));
    }

    let [host, ip, port] = fields[..] else {
        return Err(parse_error("Malformed node entry", entry));
    };
    let host = if host.is_empty() { ip } else { host };
    if host.is_empty() {
        return Err(parse_error("Node entry has no host", entry));
    }
    let port = port
        .parse()
        .map_err(|_| parse_error("Malformed port in node entry", entry))?;
    Ok(NodeAddr::tcp(host, port))
}

fn dedup(nodes: Vec<NodeAddr>) -> Vec<NodeAddr> {
    let mut seen = std::collections::HashSet::new();
    nodes
        .into_iter()
        .filter(|node| seen.insert(node.clone()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn parses_elasticache_response() {
        let raw = "CONFIG cluster 0 90\r\n\
                   12\n\
                   node1.example.com|10.0.0.1|11211 node2.example.com|10.0.0.2|11212\n\
                   \r\n\
                   END\r\n";
        let config = parse_cluster_config(raw).unwrap();
        assert_eq!(config.version, 12);
        assert_eq!(
            config.nodes,
            vec![
                NodeAddr::tcp("node1.example.com", 11211),
                NodeAddr::tcp("node2.example.com", 11212),
            ]
        );
    }

    #[test]
    fn parses_socket_entries_from_local_proxies() {
        let raw = "CONFIG cluster 0 60\r\n1\n/var/tmp/proxy-0.sock|| /var/tmp/proxy-1.sock||\n\r\nEND\r\n";
        let config = parse_cluster_config(raw).unwrap();
        assert_eq!(
            config.nodes,
            vec![
                NodeAddr::socket("/var/tmp/proxy-0.sock"),
                NodeAddr::socket("/var/tmp/proxy-1.sock"),
            ]
        );
    }

    #[rstest]
    #[case("", vec![])]
    #[case("   \n", vec![])]
    #[case("a:1,", vec![NodeAddr::tcp("a", 1)])]
    #[case("a:1, b:2 ,", vec![NodeAddr::tcp("a", 1), NodeAddr::tcp("b", 2)])]
    #[case("a:1 a:1", vec![NodeAddr::tcp("a", 1)])]
    #[case("|10.0.0.9|11211", vec![NodeAddr::tcp("10.0.0.9", 11211)])]
    #[case(
        "/tmp/a.sock|| localhost|127.0.0.1|11220 b:11221 /tmp/c.sock",
        vec![
            NodeAddr::socket("/tmp/a.sock"),
            NodeAddr::tcp("localhost", 11220),
            NodeAddr::tcp("b", 11221),
            NodeAddr::socket("/tmp/c.sock"),
        ]
    )]
    fn parses_node_lists(#[case] blob: &str, #[case] expected: Vec<NodeAddr>) {
        assert_eq!(parse_node_list(blob).unwrap(), expected);
    }

    #[rstest]
    #[case("host|10.0.0.1|port")]
    #[case("host|10.0.0.1|70000")]
    #[case("||11211")]
    #[case("host|11211")]
    #[case("host:abc")]
    fn rejects_malformed_entries(#[case] blob: &str) {
        assert_eq!(
            parse_node_list(blob).unwrap_err().kind(),
            ErrorKind::ParseError
        );
    }

    #[test]
    fn header_without_nodes_is_an_empty_cluster() {
        let config = parse_cluster_config("CONFIG cluster 0 2\r\n3\n\r\nEND\r\n").unwrap();
        assert_eq!(config.version, 3);
        assert!(config.nodes.is_empty());

        let config = parse_cluster_config("CONFIG cluster 0 0\r\nEND\r\n").unwrap();
        assert_eq!(config, ClusterConfig::default());
    }

    #[test]
    fn plain_memcached_is_not_a_configuration_endpoint() {
        let err = parse_cluster_config("ERROR\r\n").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::DiscoveryError);
    }

    #[tokio::test]
    async fn static_nodes_report_their_list() {
        let source = StaticNodes::new(vec!["a:1", "/tmp/b.sock", "a:1"]).unwrap();
        let config = source.discover().await.unwrap();
        assert_eq!(
            config.nodes,
            vec![NodeAddr::tcp("a", 1), NodeAddr::socket("/tmp/b.sock")]
        );
    }
}
