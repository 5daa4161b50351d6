//! [`ServiceDirectory`] backed by the `mdns-sd` daemon.

mod advertise;
mod browse;

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use async_trait::async_trait;
use mdns_sd::{DaemonStatus, IfKind, ServiceDaemon};
use parking_lot::{Mutex, RwLock};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use shared::types::{PeerKey, ServiceRecord};
use crate::config::MdnsConfig;
use crate::directory::{DirectoryEvent, Registration, ServiceDirectory};
use crate::error::{DiscoveryError, Result};
use self::browse::{PumpExit, ResolvedCache, TypeBrowse};

struct Inner {
    config: MdnsConfig,
    daemon: RwLock<ServiceDaemon>,
    cache: Arc<ResolvedCache>,
    /// One running browse per service type
    browses: Mutex<HashMap<String, Arc<TypeBrowse>>>,
    generation: watch::Sender<u64>,
    next_registration: AtomicU64,
}

pub struct MdnsDirectory {
    inner: Arc<Inner>,
    cancel: CancellationToken,
}

fn create_daemon(config: &MdnsConfig) -> Result<ServiceDaemon> {
    let daemon = ServiceDaemon::new()?;

    if let Some(interface) = &config.interface {
        daemon.disable_interface(IfKind::All)?;
        daemon.enable_interface(interface.as_str())?;
    }

    Ok(daemon)
}

impl MdnsDirectory {
    /// Create the mDNS daemon and start its health check. Must be called
    /// from within a tokio runtime.
    pub fn start(config: MdnsConfig) -> Result<Self> {
        let daemon = create_daemon(&config)?;
        let (generation, _) = watch::channel(0);

        let inner = Arc::new(Inner {
            config,
            daemon: RwLock::new(daemon),
            cache: Arc::new(ResolvedCache::default()),
            browses: Mutex::new(HashMap::new()),
            generation,
            next_registration: AtomicU64::new(1),
        });

        let cancel = CancellationToken::new();
        tokio::spawn(run_health_check(inner.clone(), cancel.clone()));

        tracing::info!(
            "mDNS directory started on {}",
            inner.config.interface.as_deref().unwrap_or("all interfaces")
        );

        Ok(Self { inner, cancel })
    }

    /// Stop the health check and shut the mDNS daemon down.
    pub fn shutdown(&self) -> Result<()> {
        self.cancel.cancel();
        self.inner.daemon().shutdown()?;
        tracing::info!("mDNS directory stopped");
        Ok(())
    }
}

impl Drop for MdnsDirectory {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

impl Inner {
    fn daemon(&self) -> ServiceDaemon {
        self.daemon.read().clone()
    }

    fn interface_label(&self) -> String {
        self.config
            .interface
            .clone()
            .unwrap_or_else(|| "any".to_string())
    }

    /// Join the browse of `ty_domain`, starting one if none is running.
    fn attach(
        self: &Arc<Self>,
        ty_domain: &str,
        cancel: &CancellationToken,
    ) -> Result<(Arc<TypeBrowse>, flume::Receiver<DirectoryEvent>)> {
        let mut browses = self.browses.lock();
        if let Some(browse) = browses.get(ty_domain) {
            if let Some(events) = browse.attach() {
                return Ok((browse.clone(), events));
            }
        }

        let daemon = self.daemon();
        let generation = self.generation.subscribe();
        let receiver = daemon.browse(ty_domain)?;
        let (browse, events) = TypeBrowse::with_watcher(ty_domain, &self.interface_label());
        browses.insert(ty_domain.to_string(), browse.clone());
        tracing::debug!("Started mDNS browse of {}", ty_domain);

        tokio::spawn(run_browse(
            self.clone(),
            daemon,
            browse.clone(),
            receiver,
            generation,
            cancel.child_token(),
        ));

        Ok((browse, events))
    }

    async fn is_healthy(&self) -> bool {
        let status = match self.daemon().status() {
            Ok(status) => status,
            Err(e) => {
                tracing::warn!("mDNS daemon did not accept status request: {}", e);
                return false;
            }
        };

        matches!(
            tokio::time::timeout(self.config.health_interval(), status.recv_async()).await,
            Ok(Ok(DaemonStatus::Running))
        )
    }

    /// Replace a dead daemon. Everything registered or browsed on it is lost,
    /// which the generation bump tells announcers and watchers.
    fn restart_daemon(&self) {
        match create_daemon(&self.config) {
            Ok(daemon) => {
                let old = std::mem::replace(&mut *self.daemon.write(), daemon);
                if let Err(e) = old.shutdown() {
                    tracing::debug!("Old mDNS daemon did not shut down cleanly: {}", e);
                }
                self.cache.clear();
                self.browses.lock().clear();
                self.generation.send_modify(|g| *g += 1);
                tracing::warn!("Restarted mDNS daemon (generation {})", *self.generation.borrow());
            }
            Err(e) => {
                tracing::error!("Failed to restart mDNS daemon: {}", e);
            }
        }
    }
}

async fn run_browse(
    inner: Arc<Inner>,
    daemon: ServiceDaemon,
    browse: Arc<TypeBrowse>,
    receiver: flume::Receiver<mdns_sd::ServiceEvent>,
    generation: watch::Receiver<u64>,
    cancel: CancellationToken,
) {
    let exit = browse::pump_events(browse.clone(), receiver, inner.cache.clone(), generation, cancel).await;

    // A newer browse of the same type owns the daemon's querier now; leave it alone.
    let mut browses = inner.browses.lock();
    let ty_domain = browse.ty_domain();
    if !browses.get(ty_domain).is_some_and(|b| Arc::ptr_eq(b, &browse)) {
        return;
    }
    browses.remove(ty_domain);

    if exit == PumpExit::Idle {
        tracing::debug!("Stopping mDNS browse of {}", ty_domain);
        if let Err(e) = daemon.stop_browse(ty_domain) {
            tracing::debug!("Failed to stop browsing {}: {}", ty_domain, e);
        }
    }
}

async fn run_health_check(inner: Arc<Inner>, cancel: CancellationToken) {
    let mut interval = tokio::time::interval(inner.config.health_interval());
    // The first tick completes immediately; the daemon was just created.
    interval.tick().await;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = interval.tick() => {
                if !inner.is_healthy().await {
                    tracing::warn!("mDNS daemon is not running");
                    inner.restart_daemon();
                }
            }
        }
    }
}

#[async_trait]
impl ServiceDirectory for MdnsDirectory {
    async fn register(&self, record: &ServiceRecord) -> Result<Registration> {
        let info = advertise::build_service_info(record, &self.inner.config)?;
        let (browse, probe) = self.inner.attach(&record.service_type, &self.cancel)?;
        let daemon = self.inner.daemon();
        let fullname =
            advertise::register_service(&daemon, &browse, probe, info, &self.inner.config).await?;

        Ok(Registration {
            id: self.inner.next_registration.fetch_add(1, Ordering::Relaxed),
            fullname,
        })
    }

    async fn withdraw(&self, registration: &Registration) -> Result<()> {
        advertise::unregister_service(&self.inner.daemon(), &registration.fullname).await?;
        for browse in self.inner.browses.lock().values() {
            browse.forget(&registration.fullname);
        }
        Ok(())
    }

    async fn watch(&self, service_type: &str) -> Result<flume::Receiver<DirectoryEvent>> {
        let (_, events) = self.inner.attach(service_type, &self.cancel)?;
        Ok(events)
    }

    async fn resolve(&self, key: &PeerKey) -> Result<SocketAddr> {
        let fullname = browse::fullname(key);
        let timeout = self.inner.config.resolve_timeout();

        self.inner
            .cache
            .wait_for(&fullname, timeout)
            .await
            .ok_or_else(|| {
                DiscoveryError::resolution(key, format!("no resolved record within {timeout:?}"))
            })
    }

    fn generation(&self) -> watch::Receiver<u64> {
        self.inner.generation.subscribe()
    }
}
