use std::time::Duration;
use tokio::time::Instant;
use mdns_sd::{ServiceDaemon, ServiceInfo, UnregisterStatus};
use shared::types::ServiceRecord;
use crate::config::MdnsConfig;
use crate::directory::DirectoryEvent;
use crate::error::{DiscoveryError, Result};
use super::browse::TypeBrowse;

fn local_hostname() -> Result<String> {
    let hostname = hostname::get()
        .map_err(|e| DiscoveryError::unavailable(format!("failed to get system hostname: {e}")))?
        .to_string_lossy()
        .to_string();
    Ok(format!("{}.local.", hostname.trim_end_matches('.')))
}

pub(super) fn build_service_info(record: &ServiceRecord, config: &MdnsConfig) -> Result<ServiceInfo> {
    let hostname = local_hostname()?;
    let address = config.address.clone().unwrap_or_default();

    let info = ServiceInfo::new(
        &record.service_type,
        &record.instance,
        &hostname,
        address.as_str(),
        record.port,
        record.metadata.clone(),
    )
    .map_err(|e| DiscoveryError::InvalidRecord(e.to_string()))?;

    // Without a configured address, publish whatever the enabled interfaces have.
    Ok(if address.is_empty() {
        info.enable_addr_auto()
    } else {
        info
    })
}

/// Listen on the shared browse of our own type for `window` and fail if
/// another node already answers for `fullname`.
///
/// `probe` must be attached to `browse` before the window starts, so
/// instances already known are replayed into it.
pub(super) async fn ensure_unclaimed(
    browse: &TypeBrowse,
    probe: flume::Receiver<DirectoryEvent>,
    fullname: &str,
    window: Duration,
) -> Result<()> {
    let deadline = Instant::now() + window;

    loop {
        if browse.is_present(fullname) {
            tracing::warn!("{} is already announced by another node", fullname);
            return Err(DiscoveryError::Collision(fullname.to_string()));
        }

        match tokio::time::timeout_at(deadline, probe.recv_async()).await {
            Err(_) => return Ok(()),
            Ok(Ok(DirectoryEvent::Reset)) | Ok(Err(_)) => {
                return Err(DiscoveryError::unavailable(format!(
                    "browse of {} stopped while probing for {fullname}",
                    browse.ty_domain()
                )));
            }
            Ok(Ok(_)) => {}
        }
    }
}

/// Probe for a conflicting instance, then register `info`.
///
/// mdns-sd would otherwise publish a duplicate name silently; a name already
/// answered for on the network is reported as a collision and never renamed.
pub(super) async fn register_service(
    daemon: &ServiceDaemon,
    browse: &TypeBrowse,
    probe: flume::Receiver<DirectoryEvent>,
    info: ServiceInfo,
    config: &MdnsConfig,
) -> Result<String> {
    let fullname = info.get_fullname().to_string();

    ensure_unclaimed(browse, probe, &fullname, config.probe_window()).await?;
    daemon.register(info)?;

    tracing::info!("Registered mDNS service {}", fullname);
    Ok(fullname)
}

pub(super) async fn unregister_service(daemon: &ServiceDaemon, fullname: &str) -> Result<()> {
    let status = daemon.unregister(fullname)?;

    match status.recv_async().await {
        Ok(UnregisterStatus::OK) => {
            tracing::info!("Unregistered {}", fullname);
            Ok(())
        }
        Ok(UnregisterStatus::NotFound) => {
            tracing::debug!("{} was not registered with the mDNS daemon", fullname);
            Ok(())
        }
        Err(e) => Err(DiscoveryError::unavailable(format!(
            "no unregister confirmation for {fullname}: {e}"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use mdns_sd::ServiceEvent;
    use tokio::sync::watch;
    use tokio_util::sync::CancellationToken;
    use super::super::browse::{pump_events, ResolvedCache};

    const TY: &str = "_peershare._tcp.local.";
    const OURS: &str = "nas._peershare._tcp.local.";

    fn record() -> ServiceRecord {
        ServiceRecord::new("nas", TY, 9000).with_metadata("version", "1")
    }

    fn start_browse() -> (
        Arc<TypeBrowse>,
        flume::Receiver<DirectoryEvent>,
        flume::Sender<ServiceEvent>,
        watch::Sender<u64>,
    ) {
        let (browse, probe) = TypeBrowse::with_watcher(TY, "eth0");
        let (events, receiver) = flume::unbounded();
        let (generation, generation_rx) = watch::channel(0);
        tokio::spawn(pump_events(
            browse.clone(),
            receiver,
            Arc::new(ResolvedCache::default()),
            generation_rx,
            CancellationToken::new(),
        ));
        (browse, probe, events, generation)
    }

    #[test]
    fn test_service_info_from_record() {
        let config = MdnsConfig {
            address: Some("10.0.0.5".to_string()),
            ..MdnsConfig::default()
        };

        let info = build_service_info(&record(), &config).unwrap();

        assert_eq!(info.get_fullname(), OURS);
        assert_eq!(info.get_port(), 9000);
        assert_eq!(info.get_property_val_str("version"), Some("1"));
        assert!(info.get_addresses().contains(&"10.0.0.5".parse().unwrap()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_unclaimed_name_passes_after_window() {
        let (browse, probe, events, _generation) = start_browse();

        events
            .send(ServiceEvent::ServiceFound(TY.to_string(), "other._peershare._tcp.local.".into()))
            .unwrap();

        let started = Instant::now();
        ensure_unclaimed(&browse, probe, OURS, Duration::from_millis(1500))
            .await
            .unwrap();
        assert!(started.elapsed() >= Duration::from_millis(1500));
    }

    #[tokio::test(start_paused = true)]
    async fn test_name_answered_during_window_is_collision() {
        let (browse, probe, events, _generation) = start_browse();

        let probing = tokio::spawn({
            let browse = browse.clone();
            async move { ensure_unclaimed(&browse, probe, OURS, Duration::from_millis(1500)).await }
        });

        tokio::time::sleep(Duration::from_millis(200)).await;
        events
            .send(ServiceEvent::ServiceFound(TY.to_string(), OURS.to_string()))
            .unwrap();

        let err = probing.await.unwrap().unwrap_err();
        assert!(matches!(err, DiscoveryError::Collision(name) if name == OURS));
    }

    #[tokio::test]
    async fn test_name_already_known_is_collision() {
        let (browse, first, events, _generation) = start_browse();
        events
            .send(ServiceEvent::ServiceFound(TY.to_string(), OURS.to_string()))
            .unwrap();
        first.recv_async().await.unwrap();

        let probe = browse.attach().unwrap();
        let err = ensure_unclaimed(&browse, probe, OURS, Duration::from_secs(5))
            .await
            .unwrap_err();
        assert!(matches!(err, DiscoveryError::Collision(_)));

        // Once withdrawn by us, the name is free again.
        browse.forget(OURS);
        assert!(!browse.is_present(OURS));
    }

    #[tokio::test]
    async fn test_probe_fails_when_browse_resets() {
        let (browse, probe, _events, generation) = start_browse();

        generation.send_modify(|g| *g += 1);

        let err = ensure_unclaimed(&browse, probe, OURS, Duration::from_secs(5))
            .await
            .unwrap_err();
        assert!(matches!(err, DiscoveryError::DirectoryUnavailable(_)));
    }
}
