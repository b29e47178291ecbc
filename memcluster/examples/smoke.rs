//! Writes and reads back a handful of keys through a live cluster.
//!
//! ```text
//! cargo run --example smoke -- my-cluster.cfg.use1.cache.amazonaws.com:11211
//! ```
//!
//! The endpoint can also come from `MEMCLUSTER_ENDPOINT`. Pass `--static`
//! to treat the argument as a comma separated node list instead.

use std::time::Duration;

use memcluster::{CacheClient, CacheResult, ClientConfig};

const KEYS: usize = 20;

#[tokio::main]
async fn main() -> CacheResult<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("debug")).init();

    let mut args: Vec<String> = std::env::args().skip(1).collect();
    let static_nodes = args.iter().any(|arg| arg == "--static");
    args.retain(|arg| arg != "--static");
    let endpoint = args
        .pop()
        .or_else(|| std::env::var("MEMCLUSTER_ENDPOINT").ok())
        .unwrap_or_else(|| "127.0.0.1:11211".to_string());

    let config = ClientConfig::new().set_refresh_interval(Duration::from_secs(10));
    let client = if static_nodes {
        CacheClient::from_nodes(endpoint.split(',').collect::<Vec<_>>(), config).await?
    } else {
        CacheClient::from_config_endpoint(endpoint.as_str(), config).await?
    };
    for node in client.nodes().nodes() {
        println!("node {} ({:?})", node.addr, node.status);
    }

    for i in 0..KEYS {
        let key = format!("smoke:{i}");
        client
            .set(&key, format!("value {i}"), Duration::from_secs(10))
            .await?;
    }

    let mut hits = 0;
    for i in 0..KEYS {
        let key = format!("smoke:{i}");
        let value = client.get(&key).await?;
        let node = client.route(&key)?;
        match (value, node) {
            (Some(value), Some(node)) => {
                hits += 1;
                println!("{key} -> {node}: {}", String::from_utf8_lossy(&value));
            }
            (None, node) => println!("{key} missing (routed to {node:?})"),
            (Some(_), None) => println!("{key} found without a route"),
        }
    }
    println!("{hits}/{KEYS} keys read back");

    client.shutdown();
    Ok(())
}
