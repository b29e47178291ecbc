//! Small in-process TCP servers for tests that need real sockets.

use std::io;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use log::{debug, trace};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;

use memcluster::{NodeAddr, Request, Response};

use crate::MockStore;

async fn bind() -> io::Result<(TcpListener, SocketAddr)> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    Ok((listener, addr))
}

fn node_addr(addr: SocketAddr) -> NodeAddr {
    NodeAddr::tcp(addr.ip().to_string(), addr.port())
}

/// An ElastiCache style configuration endpoint answering
/// `config get cluster`.
pub struct ConfigServer {
    addr: SocketAddr,
    state: Arc<Mutex<(u64, Vec<NodeAddr>)>>,
    handle: JoinHandle<()>,
}

impl ConfigServer {
    /// Starts an endpoint reporting `nodes` on a random local port.
    pub async fn start(nodes: Vec<NodeAddr>) -> io::Result<ConfigServer> {
        let (listener, addr) = bind().await?;
        let state = Arc::new(Mutex::new((1, nodes)));
        let shared = Arc::clone(&state);
        let handle = tokio::spawn(async move {
            while let Ok((stream, peer)) = listener.accept().await {
                trace!("configuration request from {peer}");
                let state = Arc::clone(&shared);
                tokio::spawn(async move {
                    if let Err(err) = serve_config(stream, state).await {
                        debug!("configuration connection failed: {err}");
                    }
                });
            }
        });
        Ok(ConfigServer {
            addr,
            state,
            handle,
        })
    }

    /// Address of the endpoint.
    pub fn addr(&self) -> NodeAddr {
        node_addr(self.addr)
    }

    /// Replaces the reported nodes and bumps the configuration version.
    pub fn set_nodes(&self, nodes: Vec<NodeAddr>) {
        let mut state = self.state.lock().unwrap();
        state.0 += 1;
        state.1 = nodes;
    }
}

impl Drop for ConfigServer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

/// Renders the answer to `config get cluster`.
pub fn config_response(version: u64, nodes: &[NodeAddr]) -> String {
    let entries: Vec<String> = nodes
        .iter()
        .map(|node| match node {
            NodeAddr::HostPort(host, port) => format!("{host}|{host}|{port}"),
            NodeAddr::Socket(path) => format!("{}||", path.display()),
        })
        .collect();
    let body = format!("{version}\n{}\n", entries.join(" "));
    format!("CONFIG cluster 0 {}\r\n{body}\r\nEND\r\n", body.len())
}

async fn serve_config(stream: TcpStream, state: Arc<Mutex<(u64, Vec<NodeAddr>)>>) -> io::Result<()> {
    let mut stream = BufReader::new(stream);
    let mut line = String::new();
    loop {
        line.clear();
        if stream.read_line(&mut line).await? == 0 {
            return Ok(());
        }
        let reply = if line.trim_end() == "config get cluster" {
            let (version, nodes) = state.lock().unwrap().clone();
            config_response(version, &nodes)
        } else {
            "ERROR\r\n".to_string()
        };
        stream.write_all(reply.as_bytes()).await?;
    }
}

/// A memcached server speaking the text protocol, backed by a [`MockStore`].
pub struct MemcachedServer {
    addr: SocketAddr,
    store: Arc<Mutex<MockStore>>,
    handle: JoinHandle<()>,
}

impl MemcachedServer {
    /// Starts a server on a random local port.
    pub async fn start() -> io::Result<MemcachedServer> {
        let (listener, addr) = bind().await?;
        let store = Arc::new(Mutex::new(MockStore::default()));
        let shared = Arc::clone(&store);
        let handle = tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let store = Arc::clone(&shared);
                tokio::spawn(async move {
                    if let Err(err) = serve_memcached(stream, store).await {
                        debug!("memcached connection failed: {err}");
                    }
                });
            }
        });
        Ok(MemcachedServer {
            addr,
            store,
            handle,
        })
    }

    /// Address of the server.
    pub fn addr(&self) -> NodeAddr {
        node_addr(self.addr)
    }

    /// Live keys stored on the server.
    pub fn keys(&self) -> Vec<String> {
        self.store.lock().unwrap().keys()
    }
}

impl Drop for MemcachedServer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

fn parse_request(line: &str) -> Result<(Request, usize), &'static str> {
    let parts: Vec<&str> = line.split_whitespace().collect();
    let number = |index: usize| -> Result<u32, &'static str> {
        parts
            .get(index)
            .and_then(|part| part.parse().ok())
            .ok_or("bad command line format")
    };
    let key = || -> Result<String, &'static str> {
        parts
            .get(1)
            .map(|key| key.to_string())
            .ok_or("bad command line format")
    };
    match parts.first().copied() {
        Some(command @ ("set" | "add")) => {
            let (key, flags, exptime, len) = (key()?, number(2)?, number(3)?, number(4)?);
            let request = if command == "set" {
                Request::Set {
                    key,
                    flags,
                    exptime,
                    value: Bytes::new(),
                }
            } else {
                Request::Add {
                    key,
                    flags,
                    exptime,
                    value: Bytes::new(),
                }
            };
            Ok((request, len as usize))
        }
        Some("get") => Ok((Request::Get { key: key()? }, 0)),
        Some("delete") => Ok((Request::Delete { key: key()? }, 0)),
        Some("touch") => Ok((
            Request::Touch {
                key: key()?,
                exptime: number(2)?,
            },
            0,
        )),
        Some("version") => Ok((Request::Version, 0)),
        _ => Err(""),
    }
}

fn render(response: &Response, out: &mut Vec<u8>) {
    let line = match response {
        Response::Stored => "STORED",
        Response::NotStored => "NOT_STORED",
        Response::Exists => "EXISTS",
        Response::NotFound => "NOT_FOUND",
        Response::Deleted => "DELETED",
        Response::Touched => "TOUCHED",
        Response::Miss => "END",
        Response::Error => "ERROR",
        Response::Value(item) => {
            out.extend_from_slice(
                format!("VALUE {} {} {}\r\n", item.key, item.flags, item.data.len()).as_bytes(),
            );
            out.extend_from_slice(&item.data);
            out.extend_from_slice(b"\r\nEND\r\n");
            return;
        }
        Response::Version(version) => {
            out.extend_from_slice(format!("VERSION {version}\r\n").as_bytes());
            return;
        }
        Response::ClientError(msg) => {
            out.extend_from_slice(format!("CLIENT_ERROR {msg}\r\n").as_bytes());
            return;
        }
        Response::ServerError(msg) => {
            out.extend_from_slice(format!("SERVER_ERROR {msg}\r\n").as_bytes());
            return;
        }
    };
    out.extend_from_slice(line.as_bytes());
    out.extend_from_slice(b"\r\n");
}

async fn serve_memcached(stream: TcpStream, store: Arc<Mutex<MockStore>>) -> io::Result<()> {
    let mut stream = BufReader::new(stream);
    let mut line = String::new();
    let mut out = Vec::new();
    loop {
        line.clear();
        out.clear();
        if stream.read_line(&mut line).await? == 0 {
            return Ok(());
        }
        let response = match parse_request(line.trim_end()) {
            Ok((mut request, len)) => {
                if let Request::Set { value, .. } | Request::Add { value, .. } = &mut request {
                    let mut data = vec![0; len + 2];
                    stream.read_exact(&mut data).await?;
                    data.truncate(len);
                    *value = Bytes::from(data);
                }
                store.lock().unwrap().handle(&request)
            }
            Err("") => Response::Error,
            Err(msg) => Response::ClientError(msg.to_string()),
        };
        render(&response, &mut out);
        stream.write_all(&out).await?;
    }
}
