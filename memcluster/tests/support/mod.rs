#![allow(dead_code)]

use std::sync::{Arc, Mutex};
use std::time::Duration;

use memcluster::events::{ClusterEvent, EventSink};
use memcluster::{CacheClient, ClientConfig, NodeAddr};
use memcluster_test::{MockCluster, MockDiscovery};

pub fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

pub fn node(name: &str) -> NodeAddr {
    NodeAddr::tcp(name, 11211)
}

pub fn nodes(names: &[&str]) -> Vec<NodeAddr> {
    names.iter().map(|name| node(name)).collect()
}

/// Collects every event for later inspection.
#[derive(Default)]
pub struct RecordingSink {
    events: Mutex<Vec<ClusterEvent>>,
}

impl RecordingSink {
    pub fn events(&self) -> Vec<ClusterEvent> {
        self.events.lock().unwrap().clone()
    }

    pub fn count(&self, predicate: impl Fn(&ClusterEvent) -> bool) -> usize {
        self.events.lock().unwrap().iter().filter(|e| predicate(e)).count()
    }
}

impl EventSink for RecordingSink {
    fn on_event(&self, event: &ClusterEvent) {
        self.events.lock().unwrap().push(event.clone());
    }
}

/// A client wired to an in-memory cluster.
pub struct MockContext {
    pub cluster: MockCluster,
    pub discovery: MockDiscovery,
    pub events: Arc<RecordingSink>,
    pub client: CacheClient<MockCluster>,
}

impl MockContext {
    pub async fn new(names: &[&str]) -> MockContext {
        Self::with_config(names, test_config()).await
    }

    pub async fn with_config(names: &[&str], config: ClientConfig) -> MockContext {
        init_logger();
        let nodes = nodes(names);
        let cluster = MockCluster::new(nodes.clone());
        let discovery = MockDiscovery::new(nodes);
        let events = Arc::new(RecordingSink::default());
        let client = CacheClient::builder(discovery.clone())
            .config(config)
            .event_sink(events.clone())
            .build_with_connector(cluster.clone())
            .await
            .unwrap();
        MockContext {
            cluster,
            discovery,
            events,
            client,
        }
    }
}

/// Short timeouts keep failing tests fast.
pub fn test_config() -> ClientConfig {
    ClientConfig::new()
        .set_pool_size(4)
        .set_checkout_timeout(Duration::from_millis(100))
        .set_request_timeout(Duration::from_millis(500))
        .set_refresh_interval(Duration::from_secs(3600))
        .set_maintenance_interval(Duration::from_secs(3600))
}
