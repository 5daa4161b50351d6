use thiserror::Error;
use crate::announcer::AnnouncerState;

pub type Result<T> = std::result::Result<T, DiscoveryError>;

/// Failures surfaced by the discovery core and its directory adapters.
///
/// None of these is fatal to the process: `Resolution` and
/// `DirectoryUnavailable` drive internal retry and recovery, while
/// `InvalidState`, `InvalidRecord` and `Collision` are returned to the caller.
#[derive(Debug, Clone, Error)]
pub enum DiscoveryError {
    /// The announcer was driven out of order, e.g. `announce` twice.
    #[error("cannot {operation} while announcer is {state:?}")]
    InvalidState {
        operation: &'static str,
        state: AnnouncerState,
    },

    #[error("invalid service record: {0}")]
    InvalidRecord(String),

    /// Another node already holds this instance name.
    #[error("service name {0} is already in use")]
    Collision(String),

    #[error("failed to resolve {key}: {reason}")]
    Resolution { key: String, reason: String },

    #[error("service directory unavailable: {0}")]
    DirectoryUnavailable(String),
}

impl DiscoveryError {
    pub fn resolution(key: impl ToString, reason: impl ToString) -> Self {
        Self::Resolution {
            key: key.to_string(),
            reason: reason.to_string(),
        }
    }

    pub fn unavailable(reason: impl ToString) -> Self {
        Self::DirectoryUnavailable(reason.to_string())
    }
}

impl From<mdns_sd::Error> for DiscoveryError {
    fn from(e: mdns_sd::Error) -> Self {
        Self::DirectoryUnavailable(e.to_string())
    }
}
