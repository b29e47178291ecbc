mod support;

#[cfg(test)]
mod registry {
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use assert_matches::assert_matches;
    use memcluster::events::ClusterEvent;
    use memcluster::{
        ClientConfig, ErrorKind, KeyRouter, NodeAddr, NodeRegistry, NodeSet, NodeStatus,
        StaticNodes, DEFAULT_VIRTUAL_NODES,
    };
    use memcluster_test::MockDiscovery;
    use tokio_util::sync::CancellationToken;

    use crate::support::*;

    fn registry(
        names: &[&str],
        config: ClientConfig,
    ) -> (MockDiscovery, Arc<RecordingSink>, Arc<NodeRegistry>) {
        init_logger();
        let discovery = MockDiscovery::new(nodes(names));
        let events = Arc::new(RecordingSink::default());
        let registry = NodeRegistry::with_event_sink(discovery.clone(), &config, events.clone());
        (discovery, events, Arc::new(registry))
    }

    fn addrs(set: &NodeSet) -> Vec<NodeAddr> {
        set.nodes().iter().map(|node| node.addr.clone()).collect()
    }

    fn routed_router(registry: &NodeRegistry) -> Arc<KeyRouter> {
        let router = Arc::new(KeyRouter::new(DEFAULT_VIRTUAL_NODES));
        let subscribed = Arc::clone(&router);
        registry.subscribe(move |set| subscribed.rebuild(set.healthy().cloned()));
        router
    }

    #[tokio::test]
    async fn test_refresh_populates_snapshot() {
        let (_, events, registry) = registry(&["b", "a", "c"], ClientConfig::new());
        assert!(registry.resolve().is_empty());

        registry.refresh().await.unwrap();
        let set = registry.resolve();
        assert_eq!(set.version(), 1);
        assert_eq!(addrs(&set), nodes(&["a", "b", "c"]));
        assert!(set.nodes().iter().all(|node| node.status == NodeStatus::Healthy));
        assert_eq!(
            events.count(|e| matches!(e, ClusterEvent::NodeAdded(_))),
            3
        );
    }

    #[tokio::test]
    async fn test_removed_node_only_moves_its_own_keys() {
        let config = ClientConfig::new().set_removal_grace(1);
        let (discovery, events, registry) = registry(&["a", "b", "c"], config);
        registry.refresh().await.unwrap();
        let router = routed_router(&registry);

        let keys: Vec<String> = (0..500).map(|i| format!("user:{i}")).collect();
        let before: Vec<NodeAddr> = keys
            .iter()
            .map(|key| router.route(key).unwrap())
            .collect();
        let owner = router.route("user:42").unwrap();

        discovery.set_nodes(nodes(&["a", "c"]));
        registry.refresh().await.unwrap();
        assert_eq!(addrs(&registry.resolve()), nodes(&["a", "c"]));
        assert!(events.events().contains(&ClusterEvent::NodeRemoved(node("b"))));

        for (key, previous) in keys.iter().zip(&before) {
            let now = router.route(key).unwrap();
            if *previous == node("b") {
                assert_ne!(now, node("b"));
            } else {
                assert_eq!(&now, previous, "{key} moved off a surviving node");
            }
        }
        if owner != node("b") {
            assert_eq!(router.route("user:42"), Some(owner));
        }
    }

    #[tokio::test]
    async fn test_missing_nodes_survive_the_grace_period() {
        let config = ClientConfig::new().set_removal_grace(3);
        let (discovery, events, registry) = registry(&["a", "b"], config);
        registry.refresh().await.unwrap();

        discovery.set_nodes(nodes(&["a"]));
        for _ in 0..2 {
            registry.refresh().await.unwrap();
            assert!(registry.resolve().contains(&node("b")));
        }
        registry.refresh().await.unwrap();
        assert!(!registry.resolve().contains(&node("b")));
        assert_eq!(
            events.count(|e| *e == ClusterEvent::NodeRemoved(node("b"))),
            1
        );
    }

    #[tokio::test]
    async fn test_reappearing_node_resets_grace() {
        let config = ClientConfig::new().set_removal_grace(2);
        let (discovery, _, registry) = registry(&["a", "b"], config);
        registry.refresh().await.unwrap();

        discovery.set_nodes(nodes(&["a"]));
        registry.refresh().await.unwrap();
        discovery.set_nodes(nodes(&["a", "b"]));
        registry.refresh().await.unwrap();
        discovery.set_nodes(nodes(&["a"]));
        registry.refresh().await.unwrap();

        assert!(registry.resolve().contains(&node("b")));
    }

    #[tokio::test]
    async fn test_discovery_failure_keeps_nodes() {
        let (discovery, events, registry) = registry(&["a", "b"], ClientConfig::new());
        registry.refresh().await.unwrap();
        let before = registry.resolve();

        discovery.set_failing(true);
        let result = registry.refresh().await;
        assert_matches!(result, Err(err) if err.kind() == ErrorKind::DiscoveryError);
        assert!(Arc::ptr_eq(&before, &registry.resolve()));
        assert_eq!(
            events.count(|e| matches!(e, ClusterEvent::DiscoveryFailed { .. })),
            1
        );
    }

    #[tokio::test]
    async fn test_subscribers_see_every_change() {
        let (discovery, _, registry) = registry(&["a"], ClientConfig::new().set_removal_grace(1));
        let seen = Arc::new(Mutex::new(Vec::new()));
        let recorder = Arc::clone(&seen);
        registry.subscribe(move |set| recorder.lock().unwrap().push(addrs(set)));
        assert_eq!(*seen.lock().unwrap(), vec![Vec::<NodeAddr>::new()]);

        registry.refresh().await.unwrap();
        // unchanged configuration, nothing published
        registry.refresh().await.unwrap();
        discovery.set_nodes(nodes(&["b"]));
        registry.refresh().await.unwrap();

        assert_eq!(
            *seen.lock().unwrap(),
            vec![vec![], nodes(&["a"]), nodes(&["b"])]
        );
    }

    #[tokio::test]
    async fn test_dead_nodes_leave_the_ring() {
        let config = ClientConfig::new().set_node_failure_limit(2);
        let (_, events, registry) = registry(&["a", "b"], config);
        registry.refresh().await.unwrap();
        let router = routed_router(&registry);

        registry.report_failure(&node("a"));
        assert_eq!(
            registry.resolve().get(&node("a")).map(|n| n.status),
            Some(NodeStatus::Suspect)
        );
        assert_eq!(router.ring().nodes(), nodes(&["a", "b"]));

        registry.report_failure(&node("a"));
        assert_eq!(
            registry.resolve().get(&node("a")).map(|n| n.status),
            Some(NodeStatus::Dead)
        );
        assert_eq!(router.ring().nodes(), nodes(&["b"]));
        assert!(events.events().contains(&ClusterEvent::NodeMarkedDead(node("a"))));

        registry.report_success(&node("a"));
        assert_eq!(router.ring().nodes(), nodes(&["a", "b"]));
        assert!(events.events().contains(&ClusterEvent::NodeRecovered(node("a"))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_background_refresh() {
        let (discovery, _, registry) = registry(&["a"], ClientConfig::new());
        registry.refresh().await.unwrap();

        let cancel = CancellationToken::new();
        let task = registry.spawn_refresh(Duration::from_secs(60), cancel.clone());
        discovery.set_nodes(nodes(&["a", "b"]));

        tokio::time::sleep(Duration::from_secs(59)).await;
        assert_eq!(registry.resolve().len(), 1);
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(addrs(&registry.resolve()), nodes(&["a", "b"]));

        cancel.cancel();
        task.await.unwrap();
        let calls = discovery.calls();
        tokio::time::sleep(Duration::from_secs(600)).await;
        assert_eq!(discovery.calls(), calls);
    }

    #[tokio::test(start_paused = true)]
    async fn test_refresh_retries_with_backoff() {
        let config = ClientConfig::new().set_discovery_retries(2);
        let (discovery, _, registry) = registry(&["a"], config);
        discovery.set_failing(true);

        let result = registry.refresh_with_retry().await;
        assert_matches!(result, Err(err) if err.kind() == ErrorKind::DiscoveryError);
        assert_eq!(discovery.calls(), 3);
        assert!(registry.resolve().is_empty());
    }

    #[tokio::test]
    async fn test_static_nodes() {
        init_logger();
        let source = StaticNodes::new(vec!["b:11211", "a:11211", "b:11211"]).unwrap();
        let registry = NodeRegistry::new(source, &ClientConfig::new());
        registry.refresh().await.unwrap();
        assert_eq!(addrs(&registry.resolve()), nodes(&["a", "b"]));
    }
}
