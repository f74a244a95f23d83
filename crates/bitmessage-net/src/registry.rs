//! Node registry: known peers per stream (spec.md §2's "Node registry"
//! component).

use crate::peer::{KnownNode, NetworkAddress};
use parking_lot::RwLock;
use std::collections::HashMap;

/// Port over the set of known peer addresses, partitioned by stream. A real
/// deployment backs this with a persistent store; persistence itself is an
/// external concern here.
pub trait NodeRegistry: Send + Sync {
    /// Record or refresh a peer seen on `stream`.
    fn record(&self, stream: u32, address: NetworkAddress, last_seen: i64);

    /// Up to `limit` known peers for `stream`, most recently seen first.
    fn known_for_stream(&self, stream: u32, limit: usize) -> Vec<KnownNode>;

    /// Total number of distinct peers tracked across all streams.
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// In-memory [`NodeRegistry`], suitable for tests and as the default
/// registry when no persistent store is configured.
#[derive(Default)]
pub struct InMemoryNodeRegistry {
    by_stream: RwLock<HashMap<u32, Vec<KnownNode>>>,
}

impl InMemoryNodeRegistry {
    pub fn new() -> Self {
        Self::default()
    }
}

impl NodeRegistry for InMemoryNodeRegistry {
    fn record(&self, stream: u32, address: NetworkAddress, last_seen: i64) {
        let mut by_stream = self.by_stream.write();
        let nodes = by_stream.entry(stream).or_default();
        if let Some(existing) = nodes.iter_mut().find(|n| n.address == address) {
            existing.last_seen = existing.last_seen.max(last_seen);
        } else {
            nodes.push(KnownNode::new(address, last_seen));
        }
    }

    fn known_for_stream(&self, stream: u32, limit: usize) -> Vec<KnownNode> {
        let by_stream = self.by_stream.read();
        let Some(nodes) = by_stream.get(&stream) else {
            return Vec::new();
        };
        let mut sorted = nodes.clone();
        sorted.sort_by(|a, b| b.last_seen.cmp(&a.last_seen));
        sorted.truncate(limit);
        sorted
    }

    fn len(&self) -> usize {
        self.by_stream.read().values().map(Vec::len).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};

    fn addr(octet: u8) -> NetworkAddress {
        NetworkAddress::new(1, 1, IpAddr::V4(Ipv4Addr::new(198, 51, 100, octet)), 8444)
    }

    #[test]
    fn record_and_query_by_stream() {
        let registry = InMemoryNodeRegistry::new();
        registry.record(1, addr(1), 100);
        registry.record(1, addr(2), 200);
        registry.record(2, addr(3), 50);

        let stream_one = registry.known_for_stream(1, 10);
        assert_eq!(stream_one.len(), 2);
        assert_eq!(stream_one[0].address, addr(2)); // most recently seen first

        assert_eq!(registry.known_for_stream(2, 10).len(), 1);
        assert_eq!(registry.len(), 3);
    }

    #[test]
    fn re_recording_updates_last_seen_instead_of_duplicating() {
        let registry = InMemoryNodeRegistry::new();
        registry.record(1, addr(1), 100);
        registry.record(1, addr(1), 500);

        let nodes = registry.known_for_stream(1, 10);
        assert_eq!(nodes.len(), 1);
        assert_eq!(nodes[0].last_seen, 500);
    }

    #[test]
    fn limit_truncates_results() {
        let registry = InMemoryNodeRegistry::new();
        for i in 0..5 {
            registry.record(1, addr(i), i as i64);
        }
        assert_eq!(registry.known_for_stream(1, 2).len(), 2);
    }
}
