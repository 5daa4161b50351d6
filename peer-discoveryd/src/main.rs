mod api;
mod config;
mod view;
mod view_manager;

use std::sync::Arc;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use anyhow::{Context, Result};
use peer_discovery::mdns::MdnsDirectory;
use peer_discovery::{Announcer, Browser};
use crate::config::Config;
use crate::view_manager::ViewHandle;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("peer_discoveryd=info,peer_discovery=info"))
        )
        .init();

    tracing::info!("Starting peer-discoveryd");

    // Load config
    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "/etc/peer-discovery/peerd.toml".to_string());

    let config = Config::load(&config_path)
        .with_context(|| format!("Failed to load config from {}", config_path))?;

    tracing::info!("Loaded config from {}", config_path);

    let record = config.node.record()?;

    // Bind before announcing so a bad listen address never leaves a record behind
    let listener = tokio::net::TcpListener::bind(&config.api.listen)
        .await
        .with_context(|| format!("Failed to bind to {}", config.api.listen))?;

    let directory = Arc::new(
        MdnsDirectory::start(config.mdns.clone())
            .context("Failed to start mDNS directory")?,
    );

    // Peer view and its change digest
    let (hash_tx, hash_rx) = watch::channel(view::hash::compute_hash(&[]));
    let view = ViewHandle::spawn(hash_tx);

    // Announce ourselves
    let announcer = Announcer::new(directory.clone(), config.announcer.clone());
    let announcement = announcer
        .announce(record.clone())
        .await
        .with_context(|| format!("Failed to announce {}", record.instance))?;

    // Browse for peers of the same service type
    let browser = Browser::new(directory.clone(), config.browser.clone());
    let subscription = browser
        .subscribe(&record.service_type)
        .await
        .with_context(|| format!("Failed to browse {}", record.service_type))?;

    // Create cancellation token for graceful shutdown
    let cancel = CancellationToken::new();

    let mgr_cancel = cancel.clone();
    let mgr_view = view.clone();
    let own_instance = record.instance.clone();
    let mgr_handle = tokio::spawn(async move {
        if let Err(e) = view_manager::run(mgr_view, subscription, own_instance, mgr_cancel).await {
            tracing::error!("View manager error: {}", e);
        }
    });

    // Build API router
    let app_state = api::routes::AppState {
        view: view.clone(),
        hash_rx,
        record: Arc::new(record.clone()),
        announcer_state: announcer.subscribe_state(),
    };
    let app = api::routes::router(app_state);

    tracing::info!("API listening on {}", config.api.listen);

    // Run server with graceful shutdown
    let server_cancel = cancel.clone();
    let server_handle = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app)
            .with_graceful_shutdown(async move { server_cancel.cancelled().await })
            .await
        {
            tracing::error!("Server error: {}", e);
        }
    });

    // Wait for shutdown signal
    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for ctrl-c")?;

    tracing::info!("Shutdown signal received");

    // Trigger cancellation
    cancel.cancel();

    // Wait for all tasks to complete
    let _ = tokio::join!(mgr_handle, server_handle);

    // Withdraw our announcement
    announcer.withdraw(announcement).await;

    // Shutdown peer view
    if let Err(e) = view.shutdown().await {
        tracing::error!("Failed to shutdown peer view: {}", e);
    }

    // Shutdown mDNS daemon
    if let Err(e) = directory.shutdown() {
        tracing::error!("Failed to shutdown mDNS daemon: {}", e);
    }

    tracing::info!("Shutdown complete");
    Ok(())
}
