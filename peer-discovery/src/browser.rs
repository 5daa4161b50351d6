//! Turns raw directory notifications for one service type into a
//! de-duplicated stream of [`PeerEvent`]s.
//!
//! Every subscription runs a single task that owns the per-key state, so the
//! appearance/removal bookkeeping needs no locking. Resolutions run
//! concurrently inside that task and are tagged with a ticket; a result whose
//! ticket no longer matches the key's slot (the key was removed, reset, or
//! re-appeared in between) is dropped.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use backoff::backoff::Backoff;
use backoff::future::retry;
use backoff::ExponentialBackoff;
use futures::stream::{FuturesUnordered, Stream, StreamExt};
use futures::Future;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use shared::types::{Peer, PeerEvent, PeerKey};
use crate::config::BrowserConfig;
use crate::directory::{DirectoryEvent, ServiceDirectory};
use crate::error::{DiscoveryError, Result};

pub struct Browser {
    directory: Arc<dyn ServiceDirectory>,
    config: BrowserConfig,
}

impl Browser {
    pub fn new(directory: Arc<dyn ServiceDirectory>, config: BrowserConfig) -> Self {
        Self { directory, config }
    }

    /// Start watching `service_type`.
    ///
    /// Fails only if the directory refuses the initial watch; later
    /// disconnects are recovered inside the subscription.
    pub async fn subscribe(&self, service_type: &str) -> Result<BrowserHandle> {
        if service_type.is_empty() {
            return Err(DiscoveryError::InvalidRecord("service type must not be empty".into()));
        }

        let events = self.directory.watch(service_type).await?;
        tracing::info!("Browsing {}", service_type);

        let (tx, rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        let subscription = Subscription {
            directory: self.directory.clone(),
            config: self.config.clone(),
            service_type: service_type.to_string(),
            events: tx,
            cancel: cancel.clone(),
            slots: HashMap::new(),
            next_ticket: 0,
        };
        let task = tokio::spawn(subscription.run(events));

        Ok(BrowserHandle {
            service_type: service_type.to_string(),
            events: rx,
            cancel,
            task: Some(task),
        })
    }

    pub async fn close(&self, handle: BrowserHandle) {
        handle.close().await;
    }
}

/// Receiving end of a subscription.
///
/// Dropping the handle stops the subscription; [`BrowserHandle::close`]
/// additionally waits until the subscription task has finished.
#[derive(Debug)]
pub struct BrowserHandle {
    service_type: String,
    events: mpsc::UnboundedReceiver<PeerEvent>,
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl BrowserHandle {
    pub fn service_type(&self) -> &str {
        &self.service_type
    }

    /// Next peer event; `None` once the subscription has stopped.
    pub async fn next(&mut self) -> Option<PeerEvent> {
        self.events.recv().await
    }

    /// Cancel every in-flight resolution and stop delivery. No event is
    /// observable once this returns, since the handle is consumed.
    pub async fn close(mut self) {
        self.cancel.cancel();
        self.events.close();
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                tracing::error!("Browser task for {} failed: {}", self.service_type, e);
            }
        }
        tracing::info!("Stopped browsing {}", self.service_type);
    }
}

impl Stream for BrowserHandle {
    type Item = PeerEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<PeerEvent>> {
        self.events.poll_recv(cx)
    }
}

impl Drop for BrowserHandle {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

enum Slot {
    /// Appeared; first resolution in flight
    Pending {
        ticket: u64,
        cancel: CancellationToken,
    },
    /// Delivered as `Added`; `refresh` is a re-resolution after a repeated
    /// appearance
    Live {
        peer: Peer,
        refresh: Option<(u64, CancellationToken)>,
    },
}

struct Resolved {
    key: PeerKey,
    ticket: u64,
    addr: Option<SocketAddr>,
}

type ResolveFuture = Pin<Box<dyn Future<Output = Resolved> + Send>>;

struct Subscription {
    directory: Arc<dyn ServiceDirectory>,
    config: BrowserConfig,
    service_type: String,
    events: mpsc::UnboundedSender<PeerEvent>,
    cancel: CancellationToken,
    slots: HashMap<PeerKey, Slot>,
    next_ticket: u64,
}

impl Subscription {
    async fn run(mut self, initial: flume::Receiver<DirectoryEvent>) {
        let mut backoff = self.config.resubscribe_backoff();
        let mut next_stream = Some(initial);

        loop {
            let events = match next_stream.take() {
                Some(events) => events,
                None => match self.resubscribe(&mut backoff).await {
                    Some(events) => events,
                    None => break,
                },
            };

            let mut resolutions: FuturesUnordered<ResolveFuture> = FuturesUnordered::new();

            loop {
                tokio::select! {
                    // Directory notifications are drained before resolution
                    // results so a queued removal always beats a late result.
                    biased;

                    _ = self.cancel.cancelled() => {
                        tracing::debug!("Subscription to {} cancelled", self.service_type);
                        return;
                    }

                    event = events.recv_async() => {
                        match event {
                            Ok(DirectoryEvent::Appeared(key)) => {
                                if let Some(resolution) = self.on_appeared(key) {
                                    resolutions.push(resolution);
                                }
                            }
                            Ok(DirectoryEvent::Removed(key)) => self.on_removed(&key),
                            Ok(DirectoryEvent::Reset) => {
                                tracing::warn!("Service directory reset while browsing {}", self.service_type);
                                self.on_reset();
                                break;
                            }
                            Err(e) => {
                                tracing::warn!("Lost directory stream for {}: {}", self.service_type, e);
                                self.on_reset();
                                break;
                            }
                        }
                    }

                    Some(resolved) = resolutions.next(), if !resolutions.is_empty() => {
                        self.on_resolved(resolved);
                    }
                }
            }
        }
    }

    async fn resubscribe(
        &self,
        backoff: &mut ExponentialBackoff,
    ) -> Option<flume::Receiver<DirectoryEvent>> {
        loop {
            let delay = backoff.next_backoff().unwrap_or(backoff.max_interval);
            tokio::select! {
                _ = self.cancel.cancelled() => return None,
                _ = tokio::time::sleep(delay) => {}
            }

            let result = tokio::select! {
                _ = self.cancel.cancelled() => return None,
                result = self.directory.watch(&self.service_type) => result,
            };

            match result {
                Ok(events) => {
                    tracing::info!("Re-subscribed to {}", self.service_type);
                    backoff.reset();
                    return Some(events);
                }
                Err(e) => {
                    tracing::warn!("Failed to re-subscribe to {}: {}", self.service_type, e);
                }
            }
        }
    }

    fn on_appeared(&mut self, key: PeerKey) -> Option<ResolveFuture> {
        let ticket = self.next_ticket;
        let token = self.cancel.child_token();

        match self.slots.entry(key.clone()) {
            Entry::Vacant(slot) => {
                tracing::debug!("Peer {} appeared, resolving", key);
                slot.insert(Slot::Pending {
                    ticket,
                    cancel: token.clone(),
                });
            }
            Entry::Occupied(mut slot) => match slot.get_mut() {
                Slot::Pending { .. } | Slot::Live { refresh: Some(_), .. } => {
                    tracing::debug!("Duplicate appearance of {} coalesced", key);
                    return None;
                }
                Slot::Live { refresh, .. } => {
                    tracing::debug!("Live peer {} re-appeared, refreshing address", key);
                    *refresh = Some((ticket, token.clone()));
                }
            },
        }

        self.next_ticket += 1;
        Some(resolve_with_retry(
            self.directory.clone(),
            key,
            ticket,
            token,
            self.config.resolve_attempts,
            self.config.resolve_backoff(),
        ))
    }

    fn on_removed(&mut self, key: &PeerKey) {
        match self.slots.remove(key) {
            Some(Slot::Pending { cancel, .. }) => {
                cancel.cancel();
                tracing::debug!("Peer {} removed before resolution completed", key);
            }
            Some(Slot::Live { peer, refresh }) => {
                if let Some((_, cancel)) = refresh {
                    cancel.cancel();
                }
                tracing::info!("Peer removed: {} ({})", key, peer.socket_addr());
                self.emit(PeerEvent::Removed(peer.key));
            }
            None => {
                tracing::debug!("Removal of unknown peer {} ignored", key);
            }
        }
    }

    fn on_resolved(&mut self, resolved: Resolved) {
        let Resolved { key, ticket, addr } = resolved;

        enum Kind {
            First,
            Refresh,
        }

        let kind = match self.slots.get(&key) {
            Some(Slot::Pending { ticket: t, .. }) if *t == ticket => Kind::First,
            Some(Slot::Live { refresh: Some((t, _)), .. }) if *t == ticket => Kind::Refresh,
            _ => {
                tracing::debug!("Discarding stale resolution of {}", key);
                return;
            }
        };

        let mut emitted = Vec::new();
        match (kind, addr) {
            (Kind::First, Some(addr)) => {
                let peer = Peer::new(key.clone(), addr);
                tracing::info!("Peer added: {} at {}", key, addr);
                self.slots.insert(
                    key,
                    Slot::Live {
                        peer: peer.clone(),
                        refresh: None,
                    },
                );
                emitted.push(PeerEvent::Added(peer));
            }
            (Kind::First, None) => {
                tracing::warn!(
                    "Giving up on {} after {} resolution attempts",
                    key,
                    self.config.resolve_attempts
                );
                self.slots.remove(&key);
            }
            (Kind::Refresh, result) => {
                if let Some(Slot::Live { peer, refresh }) = self.slots.get_mut(&key) {
                    *refresh = None;
                    match result {
                        Some(addr) if addr != peer.socket_addr() => {
                            // Treated as the old record leaving and a new one arriving.
                            tracing::info!("Peer {} moved from {} to {}", key, peer.socket_addr(), addr);
                            *peer = Peer::new(key.clone(), addr);
                            emitted.push(PeerEvent::Removed(key.clone()));
                            emitted.push(PeerEvent::Added(peer.clone()));
                        }
                        Some(_) => {}
                        None => {
                            tracing::debug!("Refresh of {} failed, keeping last known address", key);
                        }
                    }
                }
            }
        }

        for event in emitted {
            self.emit(event);
        }
    }

    /// Connection to the directory is gone: nothing we know can be confirmed.
    fn on_reset(&mut self) {
        let mut removed = 0usize;
        for (key, slot) in std::mem::take(&mut self.slots) {
            match slot {
                Slot::Pending { cancel, .. } => cancel.cancel(),
                Slot::Live { refresh, .. } => {
                    if let Some((_, cancel)) = refresh {
                        cancel.cancel();
                    }
                    self.emit(PeerEvent::Removed(key));
                    removed += 1;
                }
            }
        }
        tracing::info!(
            "Dropped {} live peers of {} pending re-subscription",
            removed,
            self.service_type
        );
    }

    fn emit(&self, event: PeerEvent) {
        if self.events.send(event).is_err() {
            tracing::debug!("Subscriber for {} went away, stopping", self.service_type);
            self.cancel.cancel();
        }
    }
}

fn resolve_with_retry(
    directory: Arc<dyn ServiceDirectory>,
    key: PeerKey,
    ticket: u64,
    cancel: CancellationToken,
    attempts: u32,
    backoff: ExponentialBackoff,
) -> ResolveFuture {
    Box::pin(async move {
        let attempts = attempts.max(1);
        let mut attempt = 0;

        let resolution = retry(backoff, || {
            attempt += 1;
            let current = attempt;
            let directory = directory.clone();
            let key = key.clone();
            async move {
                directory.resolve(&key).await.map_err(|e| {
                    tracing::debug!("Resolution {}/{} of {} failed: {}", current, attempts, key, e);
                    if current < attempts {
                        backoff::Error::transient(e)
                    } else {
                        backoff::Error::permanent(e)
                    }
                })
            }
        });

        let addr = tokio::select! {
            _ = cancel.cancelled() => None,
            result = resolution => result.ok(),
        };

        Resolved { key, ticket, addr }
    })
}
