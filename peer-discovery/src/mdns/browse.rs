use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use mdns_sd::{ServiceEvent, ServiceInfo};
use parking_lot::Mutex;
use tokio::sync::{watch, Notify};
use tokio_util::sync::CancellationToken;
use shared::types::{PeerKey, Protocol};
use crate::directory::DirectoryEvent;

/// Latest resolved `ServiceInfo` per full instance name.
#[derive(Default)]
pub(super) struct ResolvedCache {
    entries: Mutex<HashMap<String, ServiceInfo>>,
    updated: Notify,
}

impl ResolvedCache {
    pub(super) fn insert(&self, info: ServiceInfo) {
        self.entries.lock().insert(info.get_fullname().to_string(), info);
        self.updated.notify_waiters();
    }

    fn remove(&self, fullname: &str) {
        self.entries.lock().remove(fullname);
    }

    pub(super) fn clear(&self) {
        self.entries.lock().clear();
    }

    pub(super) fn lookup(&self, fullname: &str) -> Option<SocketAddr> {
        self.entries.lock().get(fullname).and_then(resolved_addr)
    }

    /// Wait until `fullname` has a resolved address, at most `timeout`.
    pub(super) async fn wait_for(&self, fullname: &str, timeout: Duration) -> Option<SocketAddr> {
        let deadline = tokio::time::Instant::now() + timeout;

        loop {
            // Register interest before checking, so an update in between is not missed.
            let updated = self.updated.notified();
            if let Some(addr) = self.lookup(fullname) {
                return Some(addr);
            }
            if tokio::time::timeout_at(deadline, updated).await.is_err() {
                return None;
            }
        }
    }
}

/// Split "_peershare._tcp.local." into ("_peershare._tcp", "local.").
pub(super) fn split_type_domain(ty_domain: &str) -> (String, String) {
    for proto in ["._tcp.", "._udp."] {
        if let Some(idx) = ty_domain.find(proto) {
            let end = idx + proto.len() - 1;
            return (ty_domain[..end].to_string(), ty_domain[end + 1..].to_string());
        }
    }
    (ty_domain.trim_end_matches('.').to_string(), String::new())
}

pub(super) fn peer_key(fullname: &str, ty_domain: &str, interface: &str) -> PeerKey {
    let name = fullname
        .strip_suffix(ty_domain)
        .map(|n| n.trim_end_matches('.'))
        .unwrap_or(fullname);
    let (service_type, domain) = split_type_domain(ty_domain);

    PeerKey {
        interface: interface.to_string(),
        protocol: Protocol::Unspec,
        name: name.to_string(),
        service_type,
        domain,
    }
}

pub(super) fn fullname(key: &PeerKey) -> String {
    format!("{}.{}.{}", key.name, key.service_type, key.domain)
}

/// Pick one address deterministically; IPv4 sorts before IPv6.
pub(super) fn resolved_addr(info: &ServiceInfo) -> Option<SocketAddr> {
    info.get_addresses()
        .iter()
        .min()
        .map(|ip| SocketAddr::new(*ip, info.get_port()))
}

#[derive(Default)]
struct BrowseState {
    watchers: Vec<flume::Sender<DirectoryEvent>>,
    /// Instances currently on the network, by full name
    present: HashMap<String, PeerKey>,
    closed: bool,
}

/// The single mdns-sd browse of one service type.
///
/// mdns-sd keeps one listener per type, so every watcher of the type shares
/// this browse. A watcher attaching late is replayed what is present.
pub(super) struct TypeBrowse {
    ty_domain: String,
    interface: String,
    state: Mutex<BrowseState>,
}

impl TypeBrowse {
    /// A new browse together with its first watcher.
    pub(super) fn with_watcher(
        ty_domain: &str,
        interface: &str,
    ) -> (Arc<Self>, flume::Receiver<DirectoryEvent>) {
        let (tx, rx) = flume::unbounded();
        let browse = Arc::new(Self {
            ty_domain: ty_domain.to_string(),
            interface: interface.to_string(),
            state: Mutex::new(BrowseState {
                watchers: vec![tx],
                ..BrowseState::default()
            }),
        });
        (browse, rx)
    }

    pub(super) fn ty_domain(&self) -> &str {
        &self.ty_domain
    }

    /// Add a watcher; `None` once the browse has stopped.
    pub(super) fn attach(&self) -> Option<flume::Receiver<DirectoryEvent>> {
        let mut state = self.state.lock();
        if state.closed {
            return None;
        }

        let (tx, rx) = flume::unbounded();
        for key in state.present.values() {
            let _ = tx.send(DirectoryEvent::Appeared(key.clone()));
        }
        state.watchers.push(tx);
        Some(rx)
    }

    pub(super) fn is_present(&self, fullname: &str) -> bool {
        self.state.lock().present.contains_key(fullname)
    }

    /// Drop a name we withdrew ourselves, ahead of the network's goodbye.
    pub(super) fn forget(&self, fullname: &str) {
        self.state.lock().present.remove(fullname);
    }

    /// Record and deliver one event. Returns false, and closes the browse,
    /// once no watcher is left.
    fn publish(&self, fullname: &str, event: DirectoryEvent) -> bool {
        let mut state = self.state.lock();
        match &event {
            DirectoryEvent::Appeared(key) => {
                state.present.insert(fullname.to_string(), key.clone());
            }
            DirectoryEvent::Removed(_) => {
                state.present.remove(fullname);
            }
            DirectoryEvent::Reset => {}
        }

        state.watchers.retain(|tx| tx.send(event.clone()).is_ok());
        if state.watchers.is_empty() {
            state.closed = true;
            return false;
        }
        true
    }

    fn close_with_reset(&self) {
        let mut state = self.state.lock();
        state.closed = true;
        state.present.clear();
        for tx in state.watchers.drain(..) {
            let _ = tx.send(DirectoryEvent::Reset);
        }
    }
}

/// Why a browse stopped forwarding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum PumpExit {
    /// Every watcher went away; the querier can be stopped.
    Idle,
    /// The search ended underneath us; watchers were sent `Reset`.
    Reset,
}

/// Forward one mdns-sd browse receiver to the watchers of `browse` until
/// they are all gone or the browse can no longer be trusted.
pub(super) async fn pump_events(
    browse: Arc<TypeBrowse>,
    receiver: flume::Receiver<ServiceEvent>,
    cache: Arc<ResolvedCache>,
    mut generation: watch::Receiver<u64>,
    cancel: CancellationToken,
) -> PumpExit {
    let ty_domain = browse.ty_domain.clone();
    tracing::debug!("Forwarding mDNS events for {}", ty_domain);

    loop {
        let (fullname, event) = tokio::select! {
            _ = cancel.cancelled() => break,

            changed = generation.changed() => {
                if changed.is_ok() {
                    tracing::debug!("mDNS daemon replaced, resetting watch of {}", ty_domain);
                }
                break;
            }

            event = receiver.recv_async() => match event {
                Ok(ServiceEvent::ServiceFound(_ty, fullname)) => {
                    tracing::debug!("Service found: {}", fullname);
                    let key = peer_key(&fullname, &ty_domain, &browse.interface);
                    (fullname, DirectoryEvent::Appeared(key))
                }
                Ok(ServiceEvent::ServiceResolved(info)) => {
                    let fullname = info.get_fullname().to_string();
                    tracing::debug!("Service resolved: {}", fullname);
                    cache.insert(info);
                    let key = peer_key(&fullname, &ty_domain, &browse.interface);
                    (fullname, DirectoryEvent::Appeared(key))
                }
                Ok(ServiceEvent::ServiceRemoved(_ty, fullname)) => {
                    tracing::debug!("Service removed: {}", fullname);
                    cache.remove(&fullname);
                    let key = peer_key(&fullname, &ty_domain, &browse.interface);
                    (fullname, DirectoryEvent::Removed(key))
                }
                Ok(ServiceEvent::SearchStopped(_)) => {
                    tracing::debug!("Search for {} stopped", ty_domain);
                    break;
                }
                Ok(_) => continue,
                Err(e) => {
                    tracing::warn!("mDNS receiver for {} disconnected: {}", ty_domain, e);
                    break;
                }
            },
        };

        if !browse.publish(&fullname, event) {
            tracing::debug!("No watchers left for {}", ty_domain);
            return PumpExit::Idle;
        }
    }

    browse.close_with_reset();
    PumpExit::Reset
}

#[cfg(test)]
mod tests {
    use super::*;

    const TY: &str = "_peershare._tcp.local.";

    fn info(instance: &str, addr: &str) -> ServiceInfo {
        ServiceInfo::new(
            TY,
            instance,
            &format!("{instance}.local."),
            addr,
            9000,
            None::<HashMap<String, String>>,
        )
        .unwrap()
    }

    struct Pump {
        browse: Arc<TypeBrowse>,
        watcher: flume::Receiver<DirectoryEvent>,
        events: flume::Sender<ServiceEvent>,
        cache: Arc<ResolvedCache>,
        generation: watch::Sender<u64>,
        task: tokio::task::JoinHandle<PumpExit>,
    }

    fn start_pump() -> Pump {
        let (browse, watcher) = TypeBrowse::with_watcher(TY, "eth0");
        let (events, receiver) = flume::unbounded();
        let cache = Arc::new(ResolvedCache::default());
        let (generation, generation_rx) = watch::channel(0);
        let task = tokio::spawn(pump_events(
            browse.clone(),
            receiver,
            cache.clone(),
            generation_rx,
            CancellationToken::new(),
        ));
        Pump {
            browse,
            watcher,
            events,
            cache,
            generation,
            task,
        }
    }

    async fn next(watcher: &flume::Receiver<DirectoryEvent>) -> DirectoryEvent {
        tokio::time::timeout(Duration::from_secs(2), watcher.recv_async())
            .await
            .expect("timed out waiting for directory event")
            .expect("watch stream closed")
    }

    #[test]
    fn test_split_type_domain() {
        assert_eq!(
            split_type_domain("_peershare._tcp.local."),
            ("_peershare._tcp".to_string(), "local.".to_string())
        );
        assert_eq!(
            split_type_domain("_sync._udp.local."),
            ("_sync._udp".to_string(), "local.".to_string())
        );
    }

    #[test]
    fn test_peer_key_round_trips_fullname() {
        let key = peer_key("nas._peershare._tcp.local.", TY, "eth0");

        assert_eq!(key.name, "nas");
        assert_eq!(key.interface, "eth0");
        assert_eq!(fullname(&key), "nas._peershare._tcp.local.");
        assert_eq!(key.to_string(), "nas._peershare._tcp.local.");
    }

    #[test]
    fn test_peer_key_with_dotted_instance() {
        let key = peer_key("my.box._peershare._tcp.local.", TY, "any");
        assert_eq!(key.name, "my.box");
        assert_eq!(fullname(&key), "my.box._peershare._tcp.local.");
    }

    #[test]
    fn test_resolved_addr_prefers_ipv4() {
        let info = info("nas", "fd00::1,10.0.0.5");
        assert_eq!(resolved_addr(&info), Some("10.0.0.5:9000".parse().unwrap()));
    }

    #[test]
    fn test_cache_lookup() {
        let cache = ResolvedCache::default();

        cache.insert(info("nas", "10.0.0.5"));
        assert_eq!(
            cache.lookup("nas._peershare._tcp.local."),
            Some("10.0.0.5:9000".parse().unwrap())
        );

        cache.remove("nas._peershare._tcp.local.");
        assert_eq!(cache.lookup("nas._peershare._tcp.local."), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_for_wakes_on_late_insert() {
        let cache = Arc::new(ResolvedCache::default());

        let waiter = tokio::spawn({
            let cache = cache.clone();
            async move {
                cache
                    .wait_for("nas._peershare._tcp.local.", Duration::from_secs(3))
                    .await
            }
        });

        tokio::time::sleep(Duration::from_secs(1)).await;
        cache.insert(info("nas", "10.0.0.5"));

        assert_eq!(waiter.await.unwrap(), Some("10.0.0.5:9000".parse().unwrap()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_for_times_out() {
        let cache = ResolvedCache::default();
        let started = tokio::time::Instant::now();

        let addr = cache
            .wait_for("nas._peershare._tcp.local.", Duration::from_secs(3))
            .await;

        assert_eq!(addr, None);
        assert!(started.elapsed() >= Duration::from_secs(3));
    }

    #[tokio::test]
    async fn test_pump_maps_found_resolved_and_removed() {
        let pump = start_pump();
        let fullname = "nas._peershare._tcp.local.".to_string();
        let key = peer_key(&fullname, TY, "eth0");

        pump.events
            .send(ServiceEvent::ServiceFound(TY.to_string(), fullname.clone()))
            .unwrap();
        assert_eq!(next(&pump.watcher).await, DirectoryEvent::Appeared(key.clone()));
        assert!(pump.browse.is_present(&fullname));

        pump.events
            .send(ServiceEvent::ServiceResolved(info("nas", "10.0.0.5")))
            .unwrap();
        assert_eq!(next(&pump.watcher).await, DirectoryEvent::Appeared(key.clone()));
        assert_eq!(pump.cache.lookup(&fullname), Some("10.0.0.5:9000".parse().unwrap()));

        pump.events
            .send(ServiceEvent::ServiceRemoved(TY.to_string(), fullname.clone()))
            .unwrap();
        assert_eq!(next(&pump.watcher).await, DirectoryEvent::Removed(key));
        assert!(!pump.browse.is_present(&fullname));
        assert_eq!(pump.cache.lookup(&fullname), None);
    }

    #[tokio::test]
    async fn test_pump_replays_present_to_late_watcher() {
        let pump = start_pump();
        let fullname = "nas._peershare._tcp.local.".to_string();

        pump.events
            .send(ServiceEvent::ServiceFound(TY.to_string(), fullname.clone()))
            .unwrap();
        next(&pump.watcher).await;

        let late = pump.browse.attach().unwrap();
        assert_eq!(
            next(&late).await,
            DirectoryEvent::Appeared(peer_key(&fullname, TY, "eth0"))
        );
    }

    #[tokio::test]
    async fn test_pump_resets_when_search_stops() {
        let pump = start_pump();

        pump.events.send(ServiceEvent::SearchStopped(TY.to_string())).unwrap();

        assert_eq!(next(&pump.watcher).await, DirectoryEvent::Reset);
        assert_eq!(pump.task.await.unwrap(), PumpExit::Reset);
        assert!(pump.browse.attach().is_none());
    }

    #[tokio::test]
    async fn test_pump_resets_when_receiver_disconnects() {
        let pump = start_pump();

        drop(pump.events);

        assert_eq!(next(&pump.watcher).await, DirectoryEvent::Reset);
        assert_eq!(pump.task.await.unwrap(), PumpExit::Reset);
    }

    #[tokio::test]
    async fn test_pump_resets_on_generation_change() {
        let pump = start_pump();

        pump.generation.send_modify(|g| *g += 1);

        assert_eq!(next(&pump.watcher).await, DirectoryEvent::Reset);
        assert_eq!(pump.task.await.unwrap(), PumpExit::Reset);
    }

    #[tokio::test]
    async fn test_pump_goes_idle_without_watchers() {
        let pump = start_pump();
        let second = pump.browse.attach().unwrap();

        drop(pump.watcher);
        pump.events
            .send(ServiceEvent::ServiceFound(TY.to_string(), "a._peershare._tcp.local.".into()))
            .unwrap();
        // One watcher left, so the browse keeps running.
        next(&second).await;

        drop(second);
        pump.events
            .send(ServiceEvent::ServiceFound(TY.to_string(), "b._peershare._tcp.local.".into()))
            .unwrap();

        assert_eq!(pump.task.await.unwrap(), PumpExit::Idle);
        assert!(pump.browse.attach().is_none());
    }
}
