use std::collections::HashMap;
use chrono::Utc;
use shared::types::{Peer, PeerEntry, PeerKey};

/// Live peers of one subscription, keyed by directory key.
#[derive(Default)]
pub struct PeerTable {
    peers: HashMap<PeerKey, PeerEntry>,
}

impl PeerTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or update a peer. Returns true if data changed.
    pub fn insert(&mut self, peer: &Peer) -> bool {
        let now = Utc::now();

        if let Some(existing) = self.peers.get_mut(&peer.key) {
            if existing.address == peer.address && existing.port == peer.port {
                return false;
            }
            existing.address = peer.address;
            existing.port = peer.port;
            existing.last_changed = now;
            return true;
        }

        self.peers.insert(
            peer.key.clone(),
            PeerEntry {
                instance_name: peer.key.name.clone(),
                service_type: peer.key.service_type.clone(),
                address: peer.address,
                port: peer.port,
                first_seen: now,
                last_changed: now,
            },
        );
        true
    }

    /// Remove a peer. Returns true if it was present.
    pub fn remove(&mut self, key: &PeerKey) -> bool {
        self.peers.remove(key).is_some()
    }

    /// All peers, ordered by instance name
    pub fn all(&self) -> Vec<PeerEntry> {
        let mut entries: Vec<PeerEntry> = self.peers.values().cloned().collect();
        entries.sort_by(|a, b| a.instance_name.cmp(&b.instance_name));
        entries
    }

    pub fn by_instance(&self, instance_name: &str) -> Option<PeerEntry> {
        self.peers
            .values()
            .find(|entry| entry.instance_name == instance_name)
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use peer_discovery::testing::peer_key;

    fn test_peer(name: &str, addr: &str) -> Peer {
        Peer::new(peer_key(name, "_peershare._tcp"), addr.parse().unwrap())
    }

    #[test]
    fn test_insert_and_query() {
        let mut table = PeerTable::new();
        let peer = test_peer("nas", "10.0.0.5:9000");

        assert!(table.insert(&peer), "First insert should report change");

        let entry = table.by_instance("nas").unwrap();
        assert_eq!(entry.address, peer.address);
        assert_eq!(entry.port, 9000);
        assert_eq!(entry.service_type, "_peershare._tcp");
    }

    #[test]
    fn test_insert_detects_changes() {
        let mut table = PeerTable::new();
        let peer = test_peer("nas", "10.0.0.5:9000");
        table.insert(&peer);

        assert!(!table.insert(&peer), "Identical insert should not report change");

        let moved = test_peer("nas", "10.0.0.5:9001");
        assert!(table.insert(&moved), "Modified peer should report change");

        let entry = table.by_instance("nas").unwrap();
        assert_eq!(entry.port, 9001);
        assert!(entry.last_changed >= entry.first_seen);
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_remove() {
        let mut table = PeerTable::new();
        let peer = test_peer("nas", "10.0.0.5:9000");
        table.insert(&peer);

        assert!(table.remove(&peer.key));
        assert!(!table.remove(&peer.key), "Second removal is a no-op");
        assert!(table.by_instance("nas").is_none());
    }

    #[test]
    fn test_all_sorted_by_instance() {
        let mut table = PeerTable::new();
        table.insert(&test_peer("b", "10.0.0.2:1"));
        table.insert(&test_peer("c", "10.0.0.3:1"));
        table.insert(&test_peer("a", "10.0.0.1:1"));

        let names: Vec<String> = table.all().into_iter().map(|e| e.instance_name).collect();
        assert_eq!(names, vec!["a", "b", "c"]);
    }
}
