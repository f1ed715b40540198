//! relayd - daemon entry point.
//!
//! Wires the owned component graph together: configuration, the SQLite
//! store, and the engine with its background loops. The process runs until
//! SIGINT/SIGTERM, then shuts the engine down so an in-flight stream is
//! cancelled cleanly instead of orphaned.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

use relay_config::RelayConfig;
use relay_engine::Engine;
use relay_store::Store;

fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new("info"))
        .unwrap_or_else(|_| EnvFilter::try_new("warn").expect("warn filter is valid"));

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(env_filter)
        .init();
}

fn config_path() -> PathBuf {
    std::env::args_os()
        .nth(1)
        .map(PathBuf::from)
        .or_else(|| std::env::var_os("RELAY_CONFIG").map(PathBuf::from))
        .unwrap_or_else(|| PathBuf::from("relay.toml"))
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let path = config_path();
    let config = RelayConfig::load(&path)
        .with_context(|| format!("loading config from {}", path.display()))?;
    tracing::info!(
        runtime = %config.runtime_url,
        db = %config.db_path.display(),
        "relayd starting"
    );

    let store = Arc::new(
        Store::open(&config.db_path)
            .with_context(|| format!("opening store at {}", config.db_path.display()))?,
    );

    let engine = Engine::start(config, store);

    wait_for_signal().await;

    engine.shutdown();
    // Give the dispatcher a moment to flush and settle the active job.
    tokio::time::sleep(Duration::from_millis(250)).await;
    tracing::info!("relayd stopped");
    Ok(())
}

async fn wait_for_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        let mut term = match signal(SignalKind::terminate()) {
            Ok(term) => term,
            Err(e) => {
                tracing::warn!("Failed to install SIGTERM handler: {e}");
                let _ = tokio::signal::ctrl_c().await;
                return;
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = term.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
