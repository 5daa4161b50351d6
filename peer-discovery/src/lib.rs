//! Announce this node on the local network and discover peers offering the
//! same service.
//!
//! [`Announcer`] keeps one [`ServiceRecord`] registered with a
//! [`ServiceDirectory`]; [`Browser`] turns the directory's raw notifications
//! into an ordered stream of [`PeerEvent`]s. [`mdns::MdnsDirectory`] is the
//! multicast-DNS directory used in production.

pub mod announcer;
pub mod browser;
pub mod config;
pub mod directory;
pub mod error;
pub mod mdns;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use announcer::{AnnouncementHandle, AnnouncementId, Announcer, AnnouncerState};
pub use browser::{Browser, BrowserHandle};
pub use config::{AnnouncerConfig, BrowserConfig, MdnsConfig};
pub use directory::{DirectoryEvent, Registration, ServiceDirectory};
pub use error::{DiscoveryError, Result};
pub use shared::types::{Peer, PeerEvent, PeerKey, ServiceRecord};
