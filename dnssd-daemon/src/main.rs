mod config;
mod store;
mod store_manager;
mod mdns;
mod api;

use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use anyhow::{Context, Result};
use dnssd::Engine;
use crate::store::db::ServiceStore;
use crate::store_manager::StoreHandle;
use crate::config::Config;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("dnssd_daemon=info,dnssd=info"))
        )
        .init();

    tracing::info!("Starting dnssd-daemon");

    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "/etc/dnssd/dnssd.toml".to_string());

    let config = Config::load(&config_path)
        .with_context(|| format!("Failed to load config from {}", config_path))?;

    tracing::info!("Loaded config from {}", config_path);

    let db = ServiceStore::open(&config.store.db_path)?;
    tracing::info!("Opened database at {:?}", config.store.db_path);

    // Nothing from a previous run is known to be alive until seen again.
    let expired = db.mark_all_dead(None)?;
    if expired > 0 {
        tracing::info!("Marked {} services from the previous run dead", expired);
    }

    let initial_services = db.get_all_services()?;
    let initial_hash = store::hash::compute_hash(&initial_services);
    tracing::info!("Initial store hash: {}", initial_hash);

    let (hash_tx, hash_rx) = watch::channel(initial_hash);
    let store_handle = StoreHandle::spawn(db, hash_tx);

    let engine = Engine::open(config.engine.clone())
        .await
        .context("Failed to open the mDNS engine")?;

    let cancel = CancellationToken::new();

    let mut entries = config.publish.clone();
    if config.api.advertise {
        match config.api.port() {
            Some(port) => entries.push(mdns::advertise::api_entry(port)),
            None => tracing::warn!("Not advertising the API, no port in {}", config.api.listen),
        }
    }
    let publish_handles = mdns::advertise::spawn_all(&engine, &entries, &cancel)?;

    let (browser_tx, browser_rx) = mpsc::channel(256);
    let browser_cancel = cancel.clone();
    let browser_engine = engine.clone();
    let browser_config = config.browse.clone();
    let browser_handle = tokio::spawn(async move {
        if let Err(e) = mdns::browser::run_browser(browser_engine, browser_tx, browser_config, browser_cancel).await {
            tracing::error!("Browser error: {:#}", e);
        }
    });

    let mgr_cancel = cancel.clone();
    let mgr_config = config.store.clone();
    let mgr_store = store_handle.clone();
    let mgr_handle = tokio::spawn(async move {
        if let Err(e) = store_manager::run(mgr_store, browser_rx, mgr_config, mgr_cancel).await {
            tracing::error!("Store manager error: {:#}", e);
        }
    });

    let app_state = api::routes::AppState {
        store: store_handle.clone(),
        hash_rx,
        engine: engine.clone(),
    };
    let app = api::routes::router(app_state);

    let listener = tokio::net::TcpListener::bind(&config.api.listen)
        .await
        .with_context(|| format!("Failed to bind to {}", config.api.listen))?;

    tracing::info!("API listening on {}", config.api.listen);

    let server_cancel = cancel.clone();
    let server_handle = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app)
            .with_graceful_shutdown(async move { server_cancel.cancelled().await })
            .await
        {
            tracing::error!("Server error: {}", e);
        }
    });

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for ctrl-c")?;

    tracing::info!("Shutdown signal received");

    cancel.cancel();

    // Publish tasks send their goodbyes before returning.
    let _ = tokio::join!(browser_handle, mgr_handle, server_handle);
    for handle in publish_handles {
        let _ = handle.await;
    }

    if let Err(e) = engine.shutdown().await {
        tracing::error!("Failed to shut down the engine: {}", e);
    }

    if let Err(e) = store_handle.shutdown().await {
        tracing::error!("Failed to shutdown store: {:#}", e);
    }

    tracing::info!("Shutdown complete");
    Ok(())
}
