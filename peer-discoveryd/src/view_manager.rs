use tokio::sync::{mpsc, oneshot, watch};
use tokio_util::sync::CancellationToken;
use anyhow::Result;
use peer_discovery::BrowserHandle;
use shared::types::{Peer, PeerEntry, PeerEvent, PeerKey};
use crate::view::{hash, table::PeerTable};

/// Commands sent to the view task
pub enum ViewCommand {
    Insert(Peer, oneshot::Sender<bool>),
    Remove(PeerKey, oneshot::Sender<bool>),
    GetAll(oneshot::Sender<Vec<PeerEntry>>),
    GetOne(String, oneshot::Sender<Option<PeerEntry>>),
    Shutdown,
}

/// Handle to the in-memory peer view
#[derive(Clone)]
pub struct ViewHandle {
    tx: mpsc::Sender<ViewCommand>,
}

impl ViewHandle {
    /// Spawn the task that owns the peer table
    pub fn spawn(hash_tx: watch::Sender<String>) -> Self {
        let (tx, mut rx) = mpsc::channel::<ViewCommand>(256);

        // Recompute only after mutations
        let recompute_hash = |table: &PeerTable, hash_tx: &watch::Sender<String>| {
            let _ = hash_tx.send(hash::compute_hash(&table.all()));
        };

        tokio::spawn(async move {
            let mut table = PeerTable::new();

            while let Some(cmd) = rx.recv().await {
                match cmd {
                    ViewCommand::Insert(peer, reply) => {
                        let changed = table.insert(&peer);
                        if changed {
                            recompute_hash(&table, &hash_tx);
                        }
                        let _ = reply.send(changed);
                    }
                    ViewCommand::Remove(key, reply) => {
                        let changed = table.remove(&key);
                        if changed {
                            recompute_hash(&table, &hash_tx);
                        }
                        let _ = reply.send(changed);
                    }
                    ViewCommand::GetAll(reply) => {
                        let _ = reply.send(table.all());
                    }
                    ViewCommand::GetOne(instance_name, reply) => {
                        let _ = reply.send(table.by_instance(&instance_name));
                    }
                    ViewCommand::Shutdown => {
                        tracing::info!("Peer view shutting down with {} peers", table.len());
                        break;
                    }
                }
            }
        });

        Self { tx }
    }

    /// Insert or update a peer. Returns true if data changed.
    pub async fn insert(&self, peer: Peer) -> Result<bool> {
        let (reply, rx) = oneshot::channel();
        self.tx.send(ViewCommand::Insert(peer, reply)).await?;
        Ok(rx.await?)
    }

    /// Remove a peer. Returns true if it was present.
    pub async fn remove(&self, key: PeerKey) -> Result<bool> {
        let (reply, rx) = oneshot::channel();
        self.tx.send(ViewCommand::Remove(key, reply)).await?;
        Ok(rx.await?)
    }

    /// Get all live peers
    pub async fn get_all(&self) -> Result<Vec<PeerEntry>> {
        let (reply, rx) = oneshot::channel();
        self.tx.send(ViewCommand::GetAll(reply)).await?;
        Ok(rx.await?)
    }

    /// Get a single peer by instance name
    pub async fn get_one(&self, instance_name: String) -> Result<Option<PeerEntry>> {
        let (reply, rx) = oneshot::channel();
        self.tx.send(ViewCommand::GetOne(instance_name, reply)).await?;
        Ok(rx.await?)
    }

    /// Shutdown the view task
    pub async fn shutdown(&self) -> Result<()> {
        self.tx.send(ViewCommand::Shutdown).await?;
        Ok(())
    }
}

/// View manager event loop - bridges peer events into the view
pub async fn run(
    view: ViewHandle,
    mut peers: BrowserHandle,
    own_instance: String,
    cancel: CancellationToken,
) -> Result<()> {
    loop {
        tokio::select! {
            event = peers.next() => {
                match event {
                    Some(event) if event.key().name == own_instance => {
                        tracing::debug!("Ignoring event for our own announcement {}", event.key());
                    }
                    Some(PeerEvent::Added(peer)) => {
                        if let Err(e) = view.insert(peer).await {
                            tracing::error!("Failed to add peer to view: {}", e);
                        }
                    }
                    Some(PeerEvent::Removed(key)) => {
                        if let Err(e) = view.remove(key).await {
                            tracing::error!("Failed to remove peer from view: {}", e);
                        }
                    }
                    None => {
                        tracing::warn!("Peer event stream ended");
                        break;
                    }
                }
            }
            _ = cancel.cancelled() => {
                tracing::info!("View manager shutting down");
                break;
            }
        }
    }

    peers.close().await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;
    use peer_discovery::testing::{peer_key, FakeDirectory};
    use peer_discovery::{Browser, BrowserConfig};

    async fn wait_for_peers(view: &ViewHandle, count: usize) -> Vec<PeerEntry> {
        for _ in 0..200 {
            let peers = view.get_all().await.unwrap();
            if peers.len() == count {
                return peers;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("view never reached {} peers", count);
    }

    #[tokio::test]
    async fn test_view_tracks_hash() {
        let (hash_tx, mut hash_rx) = watch::channel(hash::compute_hash(&[]));
        let initial = hash_rx.borrow_and_update().clone();
        let view = ViewHandle::spawn(hash_tx);
        let peer = Peer::new(peer_key("nas", "t"), "10.0.0.5:9000".parse().unwrap());

        assert!(view.insert(peer.clone()).await.unwrap());
        assert!(hash_rx.has_changed().unwrap());
        let with_peer = hash_rx.borrow_and_update().clone();
        assert_ne!(initial, with_peer);

        assert!(!view.insert(peer.clone()).await.unwrap());
        assert!(!hash_rx.has_changed().unwrap());

        assert!(view.remove(peer.key.clone()).await.unwrap());
        assert_eq!(*hash_rx.borrow_and_update(), initial);

        view.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_run_bridges_browser_into_view() {
        let directory = Arc::new(FakeDirectory::new());
        let config = BrowserConfig {
            resolve_backoff_ms: 1,
            resubscribe_delay_ms: 5,
            ..BrowserConfig::default()
        };
        let browser = Browser::new(directory.clone(), config);
        let subscription = browser.subscribe("t").await.unwrap();

        let (hash_tx, _hash_rx) = watch::channel(String::new());
        let view = ViewHandle::spawn(hash_tx);
        let cancel = CancellationToken::new();
        let task = tokio::spawn(run(view.clone(), subscription, "me".to_string(), cancel.clone()));

        directory.add_peer(&peer_key("me", "t"), "10.0.0.1:9000".parse().unwrap());
        directory.add_peer(&peer_key("nas", "t"), "10.0.0.5:9000".parse().unwrap());

        let peers = wait_for_peers(&view, 1).await;
        assert_eq!(peers[0].instance_name, "nas");

        directory.remove_peer(&peer_key("nas", "t"));
        wait_for_peers(&view, 0).await;

        let found = view.get_one("nas".to_string()).await.unwrap();
        assert!(found.is_none());

        cancel.cancel();
        task.await.unwrap().unwrap();
    }
}
