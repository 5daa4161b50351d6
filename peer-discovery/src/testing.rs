//! Scripted in-memory [`ServiceDirectory`] for exercising the announcer and
//! browser without a network.

use std::collections::{HashMap, HashSet, VecDeque};
use std::net::SocketAddr;
use std::time::Duration;
use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::{oneshot, watch};
use shared::types::{PeerKey, Protocol, ServiceRecord};
use crate::directory::{DirectoryEvent, Registration, ServiceDirectory};
use crate::error::{DiscoveryError, Result};

/// Build a key the way the fake expects: service type `ty`, domain "local".
pub fn peer_key(name: &str, ty: &str) -> PeerKey {
    PeerKey {
        interface: "eth0".to_string(),
        protocol: Protocol::Inet,
        name: name.to_string(),
        service_type: ty.to_string(),
        domain: "local".to_string(),
    }
}

enum Outcome {
    Ready(SocketAddr),
    Fail,
    Held(oneshot::Receiver<SocketAddr>),
}

/// Completes a resolution previously held with [`FakeDirectory::hold_resolution`].
pub struct ResolutionGate {
    tx: oneshot::Sender<SocketAddr>,
}

impl ResolutionGate {
    pub fn complete(self, addr: SocketAddr) {
        let _ = self.tx.send(addr);
    }

    /// Fail the held resolution.
    pub fn fail(self) {
        drop(self.tx);
    }

    /// True once the resolver stopped waiting, e.g. because it was cancelled.
    pub fn is_abandoned(&self) -> bool {
        self.tx.is_closed()
    }
}

#[derive(Default)]
struct FakeState {
    next_id: u64,
    registrations: HashMap<u64, ServiceRecord>,
    register_calls: usize,
    register_failures: usize,
    register_stalls: usize,
    collisions: HashSet<String>,
    withdraw_delay: Option<Duration>,
    watchers: Vec<(String, flume::Sender<DirectoryEvent>)>,
    watch_calls: usize,
    watch_failures: usize,
    present: Vec<PeerKey>,
    addresses: HashMap<PeerKey, SocketAddr>,
    scripted: HashMap<PeerKey, VecDeque<Outcome>>,
    resolve_calls: HashMap<PeerKey, usize>,
}

impl FakeState {
    fn notify(&mut self, ty: &str, event: DirectoryEvent) {
        self.watchers.retain(|(_, tx)| !tx.is_disconnected());
        for (watched, tx) in &self.watchers {
            if watched == ty {
                let _ = tx.send(event.clone());
            }
        }
    }
}

pub struct FakeDirectory {
    state: Mutex<FakeState>,
    generation: watch::Sender<u64>,
}

impl Default for FakeDirectory {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeDirectory {
    pub fn new() -> Self {
        let (generation, _) = watch::channel(0);
        Self {
            state: Mutex::new(FakeState::default()),
            generation,
        }
    }

    /// A peer that is present and resolves to `addr`.
    pub fn add_peer(&self, key: &PeerKey, addr: SocketAddr) {
        let mut state = self.state.lock();
        state.addresses.insert(key.clone(), addr);
        if !state.present.contains(key) {
            state.present.push(key.clone());
        }
        state.notify(&key.service_type, DirectoryEvent::Appeared(key.clone()));
    }

    /// Emit an appearance without changing what the key resolves to.
    pub fn appear(&self, key: &PeerKey) {
        let mut state = self.state.lock();
        if !state.present.contains(key) {
            state.present.push(key.clone());
        }
        state.notify(&key.service_type, DirectoryEvent::Appeared(key.clone()));
    }

    pub fn remove_peer(&self, key: &PeerKey) {
        let mut state = self.state.lock();
        state.present.retain(|k| k != key);
        state.addresses.remove(key);
        state.notify(&key.service_type, DirectoryEvent::Removed(key.clone()));
    }

    /// Change the address a key resolves to, without emitting anything.
    pub fn set_address(&self, key: &PeerKey, addr: SocketAddr) {
        self.state.lock().addresses.insert(key.clone(), addr);
    }

    /// The next `times` resolutions of `key` fail.
    pub fn fail_resolution(&self, key: &PeerKey, times: usize) {
        let mut state = self.state.lock();
        let queue = state.scripted.entry(key.clone()).or_default();
        for _ in 0..times {
            queue.push_back(Outcome::Fail);
        }
    }

    /// The next resolution of `key` blocks until the gate is completed.
    pub fn hold_resolution(&self, key: &PeerKey) -> ResolutionGate {
        let (tx, rx) = oneshot::channel();
        let mut state = self.state.lock();
        state.scripted.entry(key.clone()).or_default().push_back(Outcome::Held(rx));
        ResolutionGate { tx }
    }

    pub fn resolve_calls(&self, key: &PeerKey) -> usize {
        self.state.lock().resolve_calls.get(key).copied().unwrap_or(0)
    }

    /// Simulate a directory restart: watchers see `Reset`, registrations are
    /// lost and the generation advances. Present peers stay present and are
    /// replayed to the next watcher.
    pub fn restart(&self) {
        {
            let mut state = self.state.lock();
            for (_, tx) in state.watchers.drain(..) {
                let _ = tx.send(DirectoryEvent::Reset);
            }
            state.registrations.clear();
        }
        self.generation.send_modify(|g| *g += 1);
    }

    /// Close every watch stream without a `Reset` event.
    pub fn disconnect_watchers(&self) {
        self.state.lock().watchers.clear();
    }

    pub fn collide(&self, instance: &str) {
        self.state.lock().collisions.insert(instance.to_string());
    }

    pub fn clear_collision(&self, instance: &str) {
        self.state.lock().collisions.remove(instance);
    }

    pub fn fail_next_registers(&self, times: usize) {
        self.state.lock().register_failures = times;
    }

    /// The next `times` registrations never complete.
    pub fn stall_next_registers(&self, times: usize) {
        self.state.lock().register_stalls = times;
    }

    pub fn fail_next_watches(&self, times: usize) {
        self.state.lock().watch_failures = times;
    }

    pub fn delay_withdraw(&self, delay: Duration) {
        self.state.lock().withdraw_delay = Some(delay);
    }

    pub fn registrations(&self) -> Vec<(u64, ServiceRecord)> {
        let state = self.state.lock();
        let mut regs: Vec<_> = state
            .registrations
            .iter()
            .map(|(id, record)| (*id, record.clone()))
            .collect();
        regs.sort_by_key(|(id, _)| *id);
        regs
    }

    pub fn register_calls(&self) -> usize {
        self.state.lock().register_calls
    }

    pub fn watch_calls(&self) -> usize {
        self.state.lock().watch_calls
    }
}

#[async_trait]
impl ServiceDirectory for FakeDirectory {
    async fn register(&self, record: &ServiceRecord) -> Result<Registration> {
        let stall = {
            let mut state = self.state.lock();
            state.register_calls += 1;
            if state.register_stalls > 0 {
                state.register_stalls -= 1;
                true
            } else {
                false
            }
        };
        if stall {
            std::future::pending::<()>().await;
        }

        let mut state = self.state.lock();

        if state.register_failures > 0 {
            state.register_failures -= 1;
            return Err(DiscoveryError::unavailable("fake directory refused registration"));
        }

        let fullname = format!("{}.{}", record.instance, record.service_type);
        if state.collisions.contains(&record.instance) {
            return Err(DiscoveryError::Collision(fullname));
        }

        state.next_id += 1;
        let id = state.next_id;
        state.registrations.insert(id, record.clone());
        Ok(Registration { id, fullname })
    }

    async fn withdraw(&self, registration: &Registration) -> Result<()> {
        let delay = self.state.lock().withdraw_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        self.state.lock().registrations.remove(&registration.id);
        Ok(())
    }

    async fn watch(&self, service_type: &str) -> Result<flume::Receiver<DirectoryEvent>> {
        let mut state = self.state.lock();
        state.watch_calls += 1;

        if state.watch_failures > 0 {
            state.watch_failures -= 1;
            return Err(DiscoveryError::unavailable("fake directory refused watch"));
        }

        let (tx, rx) = flume::unbounded();
        for key in state.present.iter().filter(|k| k.service_type == service_type) {
            let _ = tx.send(DirectoryEvent::Appeared(key.clone()));
        }
        state.watchers.push((service_type.to_string(), tx));
        Ok(rx)
    }

    async fn resolve(&self, key: &PeerKey) -> Result<SocketAddr> {
        let outcome = {
            let mut state = self.state.lock();
            *state.resolve_calls.entry(key.clone()).or_default() += 1;
            let next = state.scripted.get_mut(key).and_then(|q| q.pop_front());
            match next {
                Some(outcome) => outcome,
                None => match state.addresses.get(key) {
                    Some(addr) => Outcome::Ready(*addr),
                    None => Outcome::Fail,
                },
            }
        };

        match outcome {
            Outcome::Ready(addr) => Ok(addr),
            Outcome::Fail => Err(DiscoveryError::resolution(key, "record unavailable")),
            Outcome::Held(rx) => rx
                .await
                .map_err(|_| DiscoveryError::resolution(key, "held resolution failed")),
        }
    }

    fn generation(&self) -> watch::Receiver<u64> {
        self.generation.subscribe()
    }
}
