//! Fleet Node Agent
//!
//! Hosts Lua scripts on a node and keeps them converged to what the fleet
//! server advertises.
//!
//! - `fleet-agent run`: reconcile the node's applications
//! - `fleet-agent agent`: supervise a single top-level script
//! - `fleet-agent test --path <file> --time <secs>`: run a local script once

use std::fs::OpenOptions;
use std::sync::Mutex;

use anyhow::{Context, Result};
use clap::Parser;
use fleet_node_agent::config::{Cli, Command};
use fleet_node_agent::{runner, VERSION};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

fn init_tracing(cli: &Cli) -> Result<()> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level));

    let (file_layer, stdout_layer) = match &cli.log_file {
        Some(path) => {
            if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("failed to create log directory {}", parent.display()))?;
            }
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("failed to open log file {}", path.display()))?;
            (
                Some(
                    tracing_subscriber::fmt::layer()
                        .json()
                        .with_ansi(false)
                        .with_writer(Mutex::new(file)),
                ),
                None,
            )
        }
        None => (None, Some(tracing_subscriber::fmt::layer().json())),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(file_layer)
        .with(stdout_layer)
        .init();
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    info!("Received shutdown signal");
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    if let Command::Version = cli.command {
        println!("fleet-agent {}", VERSION);
        return Ok(());
    }

    init_tracing(&cli)?;
    info!(version = VERSION, "Starting fleet node agent");

    match &cli.command {
        Command::Run => runner::run_fleet(cli.fleet_config()?, shutdown_signal()).await?,
        Command::Agent => runner::run_agent(cli.agent_config()?, shutdown_signal()).await?,
        Command::Test { .. } => runner::run_test(cli.test_config()?, shutdown_signal()).await?,
        Command::Version => {}
    }

    info!("Node agent shutdown complete");
    Ok(())
}
