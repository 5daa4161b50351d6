//! Advertises this node's service record and keeps it advertised.
//!
//! State machine: `Unregistered → Registering → Active → Withdrawing →
//! Unregistered`. A directory restart moves an active announcement back to
//! `Registering` until the same record has been registered again.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use backoff::backoff::Backoff;
use serde::Serialize;
use tokio::sync::{watch, Mutex};
use tokio_util::sync::CancellationToken;
use shared::types::ServiceRecord;
use crate::config::AnnouncerConfig;
use crate::directory::{Registration, ServiceDirectory};
use crate::error::{DiscoveryError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AnnouncerState {
    Unregistered,
    Registering,
    Active,
    Withdrawing,
}

/// Identifies one `announce` call; never reused within a process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AnnouncementId(u64);

static NEXT_ANNOUNCEMENT: AtomicU64 = AtomicU64::new(1);

struct Announcement {
    id: AnnouncementId,
    record: ServiceRecord,
    /// None while the directory has lost the record and we re-register
    registration: Option<Registration>,
    supervisor: CancellationToken,
}

struct Shared {
    directory: Arc<dyn ServiceDirectory>,
    config: AnnouncerConfig,
    current: Mutex<Option<Announcement>>,
    state_tx: watch::Sender<AnnouncerState>,
}

pub struct Announcer {
    shared: Arc<Shared>,
}

/// Live announcement returned by [`Announcer::announce`].
///
/// Released exactly once: by [`Announcer::withdraw`], or in the background
/// when dropped.
#[must_use = "dropping the handle withdraws the announcement"]
pub struct AnnouncementHandle {
    id: AnnouncementId,
    record: ServiceRecord,
    shared: Arc<Shared>,
    released: bool,
}

impl AnnouncementHandle {
    pub fn id(&self) -> AnnouncementId {
        self.id
    }

    pub fn record(&self) -> &ServiceRecord {
        &self.record
    }
}

impl std::fmt::Debug for AnnouncementHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AnnouncementHandle")
            .field("id", &self.id)
            .field("record", &self.record)
            .finish()
    }
}

impl Drop for AnnouncementHandle {
    fn drop(&mut self) {
        if self.released {
            return;
        }

        let shared = self.shared.clone();
        let id = self.id;
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                tracing::debug!("Announcement handle for {} dropped, withdrawing", self.record.instance);
                runtime.spawn(async move {
                    shared.release(Some(id)).await;
                });
            }
            Err(_) => {
                tracing::warn!(
                    "Announcement for {} dropped outside a runtime; directory record left to expire",
                    self.record.instance
                );
            }
        }
    }
}

/// Puts the state back to `Unregistered` if `announce` is cancelled mid-registration.
struct RegisteringGuard<'a> {
    shared: &'a Shared,
    armed: bool,
}

impl Drop for RegisteringGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.shared.set_state(AnnouncerState::Unregistered);
        }
    }
}

impl Announcer {
    pub fn new(directory: Arc<dyn ServiceDirectory>, config: AnnouncerConfig) -> Self {
        let (state_tx, _) = watch::channel(AnnouncerState::Unregistered);
        Self {
            shared: Arc::new(Shared {
                directory,
                config,
                current: Mutex::new(None),
                state_tx,
            }),
        }
    }

    pub fn state(&self) -> AnnouncerState {
        *self.shared.state_tx.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<AnnouncerState> {
        self.shared.state_tx.subscribe()
    }

    /// The directory registration currently backing the announcement, if any.
    pub async fn registration(&self) -> Option<Registration> {
        self.shared
            .current
            .lock()
            .await
            .as_ref()
            .and_then(|a| a.registration.clone())
    }

    /// Register `record` and keep it registered across directory restarts.
    ///
    /// Only valid from `Unregistered`. A name collision is returned as
    /// [`DiscoveryError::Collision`]; the record is never renamed.
    ///
    /// Cancelling this future while the directory is still registering leaves
    /// the announcer `Unregistered`, but the directory may keep the record
    /// until it expires.
    pub async fn announce(&self, record: ServiceRecord) -> Result<AnnouncementHandle> {
        validate_record(&record)?;

        {
            let current = self.shared.current.lock().await;
            let state = self.state();
            if current.is_some() || state != AnnouncerState::Unregistered {
                return Err(DiscoveryError::InvalidState {
                    operation: "announce",
                    state,
                });
            }
            // Claimed under the lock; later callers see `Registering` and are refused.
            self.shared.set_state(AnnouncerState::Registering);
        }
        let mut guard = RegisteringGuard {
            shared: self.shared.as_ref(),
            armed: true,
        };

        // Subscribe before registering so a restart racing the registration
        // is still observed.
        let mut generation = self.shared.directory.generation();
        generation.borrow_and_update();

        let registration = match self.shared.directory.register(&record).await {
            Ok(registration) => registration,
            Err(e) => {
                if let DiscoveryError::Collision(name) = &e {
                    tracing::warn!("Cannot announce {}: name already in use", name);
                } else {
                    tracing::error!("Failed to announce {}: {}", record.instance, e);
                }
                return Err(e);
            }
        };

        tracing::info!(
            "Announced {} as {} on port {}",
            record.service_type,
            registration.fullname,
            record.port
        );

        let id = AnnouncementId(NEXT_ANNOUNCEMENT.fetch_add(1, Ordering::Relaxed));
        let supervisor = CancellationToken::new();
        {
            let mut current = self.shared.current.lock().await;
            *current = Some(Announcement {
                id,
                record: record.clone(),
                registration: Some(registration),
                supervisor: supervisor.clone(),
            });
            self.shared.set_state(AnnouncerState::Active);
        }
        guard.armed = false;

        tokio::spawn(supervise(self.shared.clone(), id, generation, supervisor));

        Ok(AnnouncementHandle {
            id,
            record,
            shared: self.shared.clone(),
            released: false,
        })
    }

    /// Withdraw the announcement behind `handle`.
    ///
    /// Waits for the directory at most `withdraw_timeout_ms`; a directory that
    /// does not answer in time is logged and the record treated as withdrawn.
    /// A handle whose announcement is already gone is a no-op.
    pub async fn withdraw(&self, mut handle: AnnouncementHandle) {
        handle.released = true;
        self.shared.release(Some(handle.id)).await;
    }

    /// Withdraw whatever is currently announced.
    pub async fn shutdown(&self) {
        self.shared.release(None).await;
    }
}

impl Shared {
    fn set_state(&self, state: AnnouncerState) {
        let previous = self.state_tx.send_replace(state);
        if previous != state {
            tracing::debug!("Announcer {:?} -> {:?}", previous, state);
        }
    }

    async fn release(&self, id: Option<AnnouncementId>) {
        let mut current = self.current.lock().await;
        let announcement = match current.take() {
            Some(a) if id.map_or(true, |id| id == a.id) => a,
            other => {
                *current = other;
                tracing::debug!("Nothing to withdraw");
                return;
            }
        };

        announcement.supervisor.cancel();
        self.set_state(AnnouncerState::Withdrawing);

        if let Some(registration) = announcement.registration {
            self.withdraw_registration(&registration).await;
        }

        self.set_state(AnnouncerState::Unregistered);
    }

    /// Best effort: bounded by `withdraw_timeout_ms`, failures are only logged.
    async fn withdraw_registration(&self, registration: &Registration) {
        let timeout = self.config.withdraw_timeout();
        match tokio::time::timeout(timeout, self.directory.withdraw(registration)).await {
            Ok(Ok(())) => {
                tracing::info!("Withdrew {}", registration.fullname);
            }
            Ok(Err(e)) => {
                tracing::warn!(
                    "Failed to withdraw {}: {}; treating as withdrawn",
                    registration.fullname,
                    e
                );
            }
            Err(_) => {
                tracing::warn!(
                    "Directory did not confirm withdrawal of {} within {:?}; treating as withdrawn",
                    registration.fullname,
                    timeout
                );
            }
        }
    }

    /// Register the record of announcement `id` again after a restart.
    /// Returns false once the announcement is gone and supervision should stop.
    ///
    /// The announcement lock is never held while the directory works, so a
    /// withdraw can always take the announcement and cancel this loop.
    async fn reannounce(&self, id: AnnouncementId, cancel: &CancellationToken) -> bool {
        let record = {
            let mut current = self.current.lock().await;
            let record = match current.as_mut() {
                Some(a) if a.id == id => {
                    a.registration = None;
                    a.record.clone()
                }
                _ => return false,
            };
            self.set_state(AnnouncerState::Registering);
            record
        };

        let mut backoff = self.config.reannounce_backoff();

        loop {
            let result = tokio::select! {
                _ = cancel.cancelled() => return false,
                result = self.directory.register(&record) => result,
            };

            match result {
                Ok(registration) => return self.adopt(id, registration).await,
                Err(DiscoveryError::Collision(name)) => {
                    tracing::error!(
                        "Cannot re-announce {}: name taken by another node; announcement dropped",
                        name
                    );
                    let mut current = self.current.lock().await;
                    if current.as_ref().is_some_and(|a| a.id == id) {
                        *current = None;
                        cancel.cancel();
                        self.set_state(AnnouncerState::Unregistered);
                    }
                    return false;
                }
                Err(e) => {
                    tracing::warn!("Re-announce attempt failed: {}", e);
                }
            }

            let delay = backoff.next_backoff().unwrap_or(backoff.max_interval);
            tokio::select! {
                _ = cancel.cancelled() => return false,
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    /// Attach a fresh registration to announcement `id`. If the announcement
    /// was released while registering, the registration is withdrawn again.
    async fn adopt(&self, id: AnnouncementId, registration: Registration) -> bool {
        {
            let mut current = self.current.lock().await;
            if let Some(announcement) = current.as_mut().filter(|a| a.id == id) {
                tracing::info!(
                    "Re-announced {} (registration {})",
                    registration.fullname,
                    registration.id
                );
                announcement.registration = Some(registration);
                self.set_state(AnnouncerState::Active);
                return true;
            }
        }

        tracing::debug!(
            "Announcement released while re-announcing, withdrawing {}",
            registration.fullname
        );
        self.withdraw_registration(&registration).await;
        false
    }
}

async fn supervise(
    shared: Arc<Shared>,
    id: AnnouncementId,
    mut generation: watch::Receiver<u64>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            changed = generation.changed() => {
                if changed.is_err() {
                    tracing::debug!("Directory generation channel closed, supervision ends");
                    break;
                }
                let restarted = *generation.borrow_and_update();
                tracing::warn!("Service directory restarted (generation {}), re-announcing", restarted);
                if !shared.reannounce(id, &cancel).await {
                    break;
                }
            }
        }
    }
}

fn validate_record(record: &ServiceRecord) -> Result<()> {
    if record.instance.is_empty() {
        return Err(DiscoveryError::InvalidRecord("instance must not be empty".into()));
    }
    if record.service_type.is_empty() {
        return Err(DiscoveryError::InvalidRecord("service type must not be empty".into()));
    }
    if record.port == 0 {
        return Err(DiscoveryError::InvalidRecord("port must not be zero".into()));
    }
    Ok(())
}
