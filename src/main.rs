//! blockd - brute-force mitigation daemon.
//!
//! Observes authentication failures per source address, blocks sources
//! that cross the policy threshold, and fans block state out to
//! registered webhooks and a local firewall hook.

mod blocker;
mod config;
mod http;
mod storage;

use crate::blocker::{Blocker, Enforcer, IptablesEnforcer, NoopEnforcer, spawn_sweep_task};
use crate::config::{Config, EnforcementMode, StorageBackend};
use crate::storage::{MemoryStorage, SnapshotStorage, Storage};
use anyhow::Context;
use std::future::IntoFuture;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

/// Grace window after the shutdown signal, applied separately to the
/// connection drain and to the final snapshot flush. Expiry forces
/// the phase to end.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(3);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(true)
        .init();

    // Load configuration; a missing file means built-in defaults.
    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "config.toml".to_string());

    let config = if std::path::Path::new(&config_path).exists() {
        Config::load(&config_path).map_err(|e| {
            error!(path = %config_path, error = %e, "Failed to load config");
            e
        })?
    } else {
        info!(path = %config_path, "No config file found, using defaults");
        Config::default()
    };

    info!(
        listen = %config.server.listen,
        attempts = config.policy.attempts,
        period = config.policy.period,
        blocktime = config.policy.blocktime,
        "Starting blockd"
    );

    // Storage backend. A snapshot that exists but cannot be decoded is
    // fatal here; everything later is non-fatal and logged.
    let store: Arc<dyn Storage> = match config.storage.backend {
        StorageBackend::Memory => Arc::new(MemoryStorage::new()),
        StorageBackend::Snapshot => {
            let store = SnapshotStorage::open(&config.storage.path)
                .with_context(|| format!("failed to open snapshot {}", config.storage.path))?;
            info!(path = %config.storage.path, "Snapshot storage opened");
            Arc::new(store)
        }
    };

    let enforcer: Arc<dyn Enforcer> = match config.enforcement.mode {
        EnforcementMode::None => Arc::new(NoopEnforcer),
        EnforcementMode::Iptables => {
            info!(chain = %config.enforcement.chain, "iptables enforcement enabled");
            Arc::new(IptablesEnforcer::new(config.enforcement.chain.clone()))
        }
    };

    let blocker = Arc::new(Blocker::new(
        store.clone(),
        config.policy.to_policy(),
        enforcer,
    ));

    // Re-confirm external state before accepting traffic.
    blocker
        .notify_all()
        .await
        .context("startup reconciliation failed")?;

    let sweep = spawn_sweep_task(
        blocker.clone(),
        Duration::from_secs(config.sweep.interval_secs),
    );
    info!(interval_secs = config.sweep.interval_secs, "Reconciliation sweep started");

    // API key: generate one when enforcement is on and none is set.
    let api_key = if config.server.api_key_enabled {
        let key = config
            .server
            .api_key
            .clone()
            .filter(|k| !k.is_empty())
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        info!(key = %key, "API key enforcement enabled");
        Some(key)
    } else {
        None
    };

    let app = http::router(http::AppState {
        blocker,
        store: store.clone(),
        api_key,
    });

    let listener = tokio::net::TcpListener::bind(config.server.listen)
        .await
        .with_context(|| format!("failed to bind {}", config.server.listen))?;
    info!(addr = %config.server.listen, "API listening");

    // The drain after the signal is bounded: a stuck in-flight request
    // cannot hold the process past the grace window.
    let (signal_tx, signal_rx) = tokio::sync::oneshot::channel();
    let mut server = tokio::spawn(axum::serve(listener, app).with_graceful_shutdown(
        async move {
            shutdown_signal().await;
            let _ = signal_tx.send(());
        },
    ).into_future());

    tokio::select! {
        result = &mut server => {
            result.context("API server task failed")??;
        }
        _ = signal_rx => {
            match tokio::time::timeout(SHUTDOWN_TIMEOUT, &mut server).await {
                Ok(result) => result.context("API server task failed")??,
                Err(_) => {
                    warn!("connection drain exceeded the grace window, forcing shutdown");
                    server.abort();
                }
            }
        }
    }

    // Listener is closed; stop the sweep and flush within the grace
    // window.
    sweep.abort();
    match tokio::time::timeout(SHUTDOWN_TIMEOUT, store.close()).await {
        Ok(Ok(())) => info!("Shutdown complete"),
        Ok(Err(e)) => error!(error = %e, "Final storage flush failed"),
        Err(_) => error!("Final storage flush timed out"),
    }

    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "Failed to listen for shutdown signal");
        return;
    }
    info!("Shutdown signal received");
}
