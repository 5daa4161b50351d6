//! The local-network service directory the discovery core drives.
//!
//! Announcer and browser only ever talk to a [`ServiceDirectory`]; the wire
//! protocol behind it (multicast DNS for [`crate::mdns::MdnsDirectory`]) is
//! the adapter's business.

use std::net::SocketAddr;
use async_trait::async_trait;
use tokio::sync::watch;
use shared::types::{PeerKey, ServiceRecord};
use crate::error::Result;

/// A record registered with the directory.
///
/// `id` is unique for the lifetime of the directory; a re-registration of the
/// same record always yields a new id.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Registration {
    pub id: u64,
    pub fullname: String,
}

/// Raw change notification for a watched service type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DirectoryEvent {
    Appeared(PeerKey),
    Removed(PeerKey),
    /// The directory lost its state; every record seen so far is unconfirmed.
    Reset,
}

#[async_trait]
pub trait ServiceDirectory: Send + Sync {
    /// Publish a record. Resolves once the directory has committed it, or
    /// fails with `Collision` if the name is taken.
    async fn register(&self, record: &ServiceRecord) -> Result<Registration>;

    async fn withdraw(&self, registration: &Registration) -> Result<()>;

    /// Watch a service type. Records already present are replayed as
    /// `Appeared`. A closed receiver means the same as `Reset`.
    async fn watch(&self, service_type: &str) -> Result<flume::Receiver<DirectoryEvent>>;

    async fn resolve(&self, key: &PeerKey) -> Result<SocketAddr>;

    /// Restart counter; changes whenever previously registered records were
    /// lost by the directory.
    fn generation(&self) -> watch::Receiver<u64>;
}
