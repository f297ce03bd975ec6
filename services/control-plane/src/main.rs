//! Fleet Server
//!
//! Serves scripts and app manifests to fleet nodes and tracks their
//! liveness and metrics.

use anyhow::{Context, Result};
use fleet_control_plane::{api, config, fleet::FleetFile, state::AppState, sweep::SweepWorker};
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    let config = config::Config::from_env()?;

    // Prefer RUST_LOG, fall back to FLEET_LOG_LEVEL
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_level.clone().into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!(version = env!("CARGO_PKG_VERSION"), "Starting fleet server");

    let fleet = FleetFile::load(&config.fleet_file)?;
    info!(
        fleet_file = %config.fleet_file.display(),
        scripts = fleet.lua_list.len(),
        apps = fleet.app_list.len(),
        "Fleet file loaded"
    );

    let listener = tokio::net::TcpListener::bind(&config.listen_addr)
        .await
        .with_context(|| format!("failed to bind {}", config.listen_addr))?;
    info!(addr = %config.listen_addr, "Listening for connections");

    let state = AppState::new(config, fleet);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let sweep_worker = SweepWorker::new(state.clone());
    let sweep_handle = tokio::spawn({
        let shutdown_rx = shutdown_rx.clone();
        async move {
            sweep_worker.run(shutdown_rx).await;
        }
    });

    let mut server_handle = tokio::spawn(api::serve(listener, state, shutdown_rx));

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
        }
        result = &mut server_handle => {
            match result {
                Ok(Ok(())) => info!("Server exited normally"),
                Ok(Err(e)) => error!(error = %e, "Server error"),
                Err(e) => error!(error = %e, "Server task panicked"),
            }
        }
    }

    let _ = shutdown_tx.send(true);

    info!("Waiting for workers to shut down...");
    let shutdown_timeout = std::time::Duration::from_secs(10);

    if !server_handle.is_finished() {
        if let Err(e) = tokio::time::timeout(shutdown_timeout, server_handle).await {
            warn!(error = %e, "HTTP server did not shut down in time");
        }
    }

    if let Err(e) = tokio::time::timeout(shutdown_timeout, sweep_handle).await {
        warn!(error = %e, "Liveness sweep did not shut down in time");
    }

    info!("Fleet server shutdown complete");
    Ok(())
}
