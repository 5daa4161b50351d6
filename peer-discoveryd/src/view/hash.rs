use std::net::IpAddr;
use serde::Serialize;
use sha2::{Sha256, Digest};
use shared::types::PeerEntry;

/// Only fields that identify where a peer is; first_seen/last_changed move
/// without the peer set changing.
#[derive(Serialize)]
struct HashView<'a> {
    instance_name: &'a str,
    service_type: &'a str,
    address: IpAddr,
    port: u16,
}

/// Computes a SHA-256 hash of the peer list.
/// Peers are sorted by instance name for deterministic output.
pub fn compute_hash(peers: &[PeerEntry]) -> String {
    let mut indices: Vec<usize> = (0..peers.len()).collect();
    indices.sort_by(|&a, &b| {
        (&peers[a].instance_name, &peers[a].service_type)
            .cmp(&(&peers[b].instance_name, &peers[b].service_type))
    });

    let views: Vec<HashView<'_>> = indices
        .iter()
        .map(|&i| {
            let p = &peers[i];
            HashView {
                instance_name: &p.instance_name,
                service_type: &p.service_type,
                address: p.address,
                port: p.port,
            }
        })
        .collect();

    let json = serde_json::to_string(&views)
        .expect("Failed to serialize peers for hashing");

    let hash = Sha256::digest(json.as_bytes());
    hex::encode(hash)
}
