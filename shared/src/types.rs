use std::collections::HashMap;
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use chrono::{DateTime, Utc};
use serde::{Serialize, Deserialize};

/// The service instance this node offers on the local network.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceRecord {
    /// Instance key, e.g. "peer-nas"
    pub instance: String,

    /// Service type, e.g. "_peershare._tcp.local."
    pub service_type: String,

    /// Port the application listens on
    pub port: u16,

    /// Opaque key-value metadata, published as TXT records
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

impl ServiceRecord {
    pub fn new(instance: impl Into<String>, service_type: impl Into<String>, port: u16) -> Self {
        Self {
            instance: instance.into(),
            service_type: service_type.into(),
            port,
            metadata: HashMap::new(),
        }
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
}

/// Address family a remote record was seen on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Unspec,
    Inet,
    Inet6,
}

/// Directory identifier of a remote service record.
///
/// Only ever compared as a whole; nothing outside the directory adapter that
/// built it looks at the individual parts.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PeerKey {
    pub interface: String,
    pub protocol: Protocol,
    pub name: String,
    pub service_type: String,
    pub domain: String,
}

impl fmt::Display for PeerKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.name, self.service_type, self.domain)
    }
}

/// A remote node whose record has been resolved to an address.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Peer {
    pub key: PeerKey,
    pub address: IpAddr,
    pub port: u16,
}

impl Peer {
    pub fn new(key: PeerKey, addr: SocketAddr) -> Self {
        Self {
            key,
            address: addr.ip(),
            port: addr.port(),
        }
    }

    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.address, self.port)
    }
}

/// Change to the set of live peers of one subscription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerEvent {
    Added(Peer),
    Removed(PeerKey),
}

impl PeerEvent {
    pub fn key(&self) -> &PeerKey {
        match self {
            PeerEvent::Added(peer) => &peer.key,
            PeerEvent::Removed(key) => key,
        }
    }
}

/// A live peer as exposed by the daemon API.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerEntry {
    /// Instance name, e.g. "peer-nas"
    pub instance_name: String,

    /// Service type the peer was discovered under
    pub service_type: String,

    /// Resolved address
    pub address: IpAddr,

    /// Resolved port
    pub port: u16,

    /// First time this peer was added
    pub first_seen: DateTime<Utc>,

    /// Last time the peer's address changed or it was re-added
    pub last_changed: DateTime<Utc>,
}
