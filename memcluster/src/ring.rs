//! Consistent hashing of keys onto nodes.

use std::collections::BTreeSet;
use std::sync::Arc;

use arc_swap::ArcSwap;
use log::debug;
use sha1_smol::Sha1;

use crate::connection::NodeAddr;

/// Ring positions per node unless configured otherwise.
pub const DEFAULT_VIRTUAL_NODES: usize = 160;

fn hash_bytes(input: &[u8]) -> u32 {
    let mut hash = Sha1::new();
    hash.update(input);
    let digest = hash.digest().bytes();
    u32::from_be_bytes([digest[0], digest[1], digest[2], digest[3]])
}

/// Returns the ring position of `key`.
pub fn key_hash(key: &[u8]) -> u32 {
    hash_bytes(key)
}

/// One position on the ring.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RingEntry {
    /// Position in hash space.
    pub hash: u32,
    /// Index of the owning node in [`HashRing::nodes`].
    pub node: usize,
}

/// An immutable consistent hashing ring.
#[derive(Clone, Debug, Default)]
pub struct HashRing {
    nodes: Vec<NodeAddr>,
    entries: Vec<RingEntry>,
}

impl HashRing {
    /// Builds a ring with `virtual_nodes` positions per node.
    ///
    /// Duplicate addresses are collapsed. Positions that collide are ordered
    /// by node address.
    pub fn new<I>(nodes: I, virtual_nodes: usize) -> HashRing
    where
        I: IntoIterator<Item = NodeAddr>,
    {
        let nodes: Vec<NodeAddr> = nodes
            .into_iter()
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        let virtual_nodes = virtual_nodes.max(1);

        let mut entries = Vec::with_capacity(nodes.len() * virtual_nodes);
        for (index, node) in nodes.iter().enumerate() {
            let name = node.to_string();
            for point in 0..virtual_nodes {
                entries.push(RingEntry {
                    hash: hash_bytes(format!("{name}:{point}").as_bytes()),
                    node: index,
                });
            }
        }
        // `nodes` is sorted, so comparing indices compares addresses.
        entries.sort_unstable_by_key(|entry| (entry.hash, entry.node));

        HashRing { nodes, entries }
    }

    /// Returns the node owning `key`, or `None` for an empty ring.
    pub fn route(&self, key: &[u8]) -> Option<&NodeAddr> {
        self.route_hash(key_hash(key))
    }

    /// Returns the node owning ring position `hash`.
    pub fn route_hash(&self, hash: u32) -> Option<&NodeAddr> {
        let first = self.entries.first()?;
        let index = self.entries.partition_point(|entry| entry.hash < hash);
        let entry = self.entries.get(index).unwrap_or(first);
        Some(&self.nodes[entry.node])
    }

    /// The nodes on the ring, sorted by address.
    pub fn nodes(&self) -> &[NodeAddr] {
        &self.nodes
    }

    /// The sorted ring positions.
    pub fn entries(&self) -> &[RingEntry] {
        &self.entries
    }

    /// Returns true if no node is on the ring.
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

/// Routes keys to nodes over a ring that can be swapped atomically.
///
/// Readers load the current ring without locking; [`KeyRouter::rebuild`]
/// publishes a fully built replacement.
pub struct KeyRouter {
    ring: ArcSwap<HashRing>,
    virtual_nodes: usize,
}

impl KeyRouter {
    /// Creates a router over an empty ring.
    pub fn new(virtual_nodes: usize) -> KeyRouter {
        KeyRouter {
            ring: ArcSwap::from_pointee(HashRing::default()),
            virtual_nodes,
        }
    }

    /// Returns the node owning `key`.
    pub fn route(&self, key: &str) -> Option<NodeAddr> {
        self.ring.load().route(key.as_bytes()).cloned()
    }

    /// Replaces the ring with one built from `nodes`.
    ///
    /// The ring is left untouched if the node set did not change.
    pub fn rebuild<I>(&self, nodes: I)
    where
        I: IntoIterator<Item = NodeAddr>,
    {
        let ring = HashRing::new(nodes, self.virtual_nodes);
        if ring.nodes() == self.ring.load().nodes() {
            return;
        }
        debug!("rebuilt hash ring with {} nodes", ring.nodes().len());
        self.ring.store(Arc::new(ring));
    }

    /// Returns the current ring.
    pub fn ring(&self) -> Arc<HashRing> {
        self.ring.load_full()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn nodes(names: &[&str]) -> Vec<NodeAddr> {
        names.iter().map(|name| NodeAddr::tcp(*name, 11211)).collect()
    }

    fn keys() -> impl Iterator<Item = String> {
        (0..2000).map(|i| format!("key{i}"))
    }

    #[test]
    fn empty_ring_routes_nowhere() {
        let ring = HashRing::new(vec![], DEFAULT_VIRTUAL_NODES);
        assert!(ring.is_empty());
        assert_eq!(ring.route(b"anything"), None);
    }

    #[test]
    fn single_node_owns_every_key() {
        let ring = HashRing::new(nodes(&["a"]), 4);
        for key in keys().take(50) {
            assert_eq!(ring.route(key.as_bytes()), Some(&NodeAddr::tcp("a", 11211)));
        }
    }

    #[test]
    fn routing_is_deterministic() {
        let first = HashRing::new(nodes(&["a", "b", "c"]), DEFAULT_VIRTUAL_NODES);
        let second = HashRing::new(nodes(&["c", "a", "b", "a"]), DEFAULT_VIRTUAL_NODES);
        assert_eq!(first.entries(), second.entries());
        for key in keys() {
            assert_eq!(first.route(key.as_bytes()), first.route(key.as_bytes()));
            assert_eq!(first.route(key.as_bytes()), second.route(key.as_bytes()));
        }
    }

    #[test]
    fn removing_a_node_only_moves_its_keys() {
        let before = HashRing::new(nodes(&["a", "b", "c"]), DEFAULT_VIRTUAL_NODES);
        let after = HashRing::new(nodes(&["a", "c"]), DEFAULT_VIRTUAL_NODES);
        let removed = NodeAddr::tcp("b", 11211);

        let mut moved = 0;
        for key in keys() {
            let old = before.route(key.as_bytes()).unwrap();
            let new = after.route(key.as_bytes()).unwrap();
            if *old == removed {
                assert_ne!(*new, removed);
                moved += 1;
            } else {
                assert_eq!(old, new, "{key} moved although its node stayed");
            }
        }
        assert!(moved > 0);
    }

    #[test]
    fn adding_a_node_only_moves_keys_to_it() {
        let before = HashRing::new(nodes(&["a", "b"]), DEFAULT_VIRTUAL_NODES);
        let after = HashRing::new(nodes(&["a", "b", "c"]), DEFAULT_VIRTUAL_NODES);
        let added = NodeAddr::tcp("c", 11211);
        for key in keys() {
            let old = before.route(key.as_bytes()).unwrap();
            let new = after.route(key.as_bytes()).unwrap();
            assert!(old == new || *new == added);
        }
    }

    #[test]
    fn virtual_nodes_spread_keys() {
        let ring = HashRing::new(nodes(&["a", "b", "c", "d"]), DEFAULT_VIRTUAL_NODES);
        let mut counts = std::collections::HashMap::new();
        for key in keys() {
            *counts.entry(ring.route(key.as_bytes()).unwrap().clone()).or_insert(0) += 1;
        }
        assert_eq!(counts.len(), 4);
        // 500 expected per node
        assert!(counts.values().all(|count| *count > 250), "{counts:?}");
    }

    #[test]
    fn lookups_wrap_around() {
        let ring = HashRing::new(nodes(&["a", "b"]), 8);
        let first = ring.entries().first().unwrap();
        let expected = &ring.nodes()[first.node];
        assert_eq!(ring.route_hash(u32::MAX), Some(expected));
        if ring.entries().last().unwrap().hash < u32::MAX {
            assert_eq!(ring.route_hash(ring.entries().last().unwrap().hash + 1), Some(expected));
        }
    }

    #[test]
    fn collisions_prefer_the_lower_address() {
        let a = NodeAddr::tcp("a", 11211);
        let b = NodeAddr::tcp("b", 11211);
        let ring = HashRing {
            nodes: vec![a.clone(), b],
            entries: vec![RingEntry { hash: 10, node: 0 }, RingEntry { hash: 10, node: 1 }],
        };
        assert_eq!(ring.route_hash(5), Some(&a));
        assert_eq!(ring.route_hash(10), Some(&a));
    }

    #[test]
    fn router_swaps_rings() {
        let router = KeyRouter::new(DEFAULT_VIRTUAL_NODES);
        assert_eq!(router.route("user:42"), None);

        router.rebuild(nodes(&["a", "b", "c"]));
        let owner = router.route("user:42").unwrap();
        let ring = router.ring();

        router.rebuild(nodes(&["c", "b", "a"]));
        assert!(Arc::ptr_eq(&ring, &router.ring()));
        assert_eq!(router.route("user:42"), Some(owner));

        router.rebuild(vec![]);
        assert_eq!(router.route("user:42"), None);
    }
}
