//! Mode entry points: wire config, identity, client and control loops
//! together, run until `shutdown` resolves, then tear everything down.

use std::future::Future;
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use fleet_proto::DeviceSnapshot;
use tracing::info;

use crate::actors::{
    metric_channel, FleetHandle, FleetSpec, MetricsHandle, SupervisorHandle, SupervisorSpec,
};
use crate::client::{ServerClient, ServerSource};
use crate::config::{AgentConfig, FleetConfig, TestConfig};
use crate::device::{self, SnapshotContext};
use crate::host::{HostEnv, HostOptions};
use crate::identity::NodeIdentity;
use crate::storage::{AppStorage, ScriptStore};
use crate::VERSION;

/// Instance name of the agent-mode script.
pub const AGENT_INSTANCE: &str = "agent";

async fn prepare(working_dir: &Path, channel: Option<&str>) -> Result<(NodeIdentity, DeviceSnapshot)> {
    tokio::fs::create_dir_all(working_dir)
        .await
        .with_context(|| format!("failed to create working directory {}", working_dir.display()))?;

    let identity = NodeIdentity::load_or_create(working_dir).await?;
    let device = device::collect(&SnapshotContext {
        node_id: identity.node_id(),
        working_dir,
        channel,
    });
    Ok((identity, device))
}

/// Supervise the single top-level script.
pub async fn run_agent(config: AgentConfig, shutdown: impl Future<Output = ()>) -> Result<()> {
    let (identity, device) = prepare(&config.working_dir, config.channel.as_deref()).await?;
    info!(
        node_id = %identity.node_id(),
        server_url = %config.server_url,
        script = %config.script_path.display(),
        "Starting agent mode"
    );

    let client = Arc::new(ServerClient::new(&config.server_url)?.with_identity(identity));
    let source = Arc::new(ServerSource::new(Arc::clone(&client), device.clone()));

    let handle = SupervisorHandle::spawn(SupervisorSpec {
        env: HostEnv {
            instance: AGENT_INSTANCE.to_string(),
            app_dir: config.working_dir.clone(),
            working_dir: config.working_dir.clone(),
            device,
            version: VERSION.to_string(),
        },
        options: HostOptions::new(config.stop_grace, client.http()),
        store: ScriptStore::new(&config.script_path),
        source: Some(source),
        check_interval: config.check_interval,
    })
    .await?;

    shutdown.await;
    info!("Stopping agent script");
    handle.stop().await;
    Ok(())
}

/// Reconcile the node's applications and report their metrics.
pub async fn run_fleet(config: FleetConfig, shutdown: impl Future<Output = ()>) -> Result<()> {
    let (identity, device) = prepare(&config.working_dir, config.channel.as_deref()).await?;
    tokio::fs::create_dir_all(&config.apps_dir)
        .await
        .with_context(|| format!("failed to create apps directory {}", config.apps_dir.display()))?;
    info!(
        node_id = %identity.node_id(),
        server_url = %config.server_url,
        apps_dir = %config.apps_dir.display(),
        "Starting fleet mode"
    );

    let client = Arc::new(ServerClient::new(&config.server_url)?.with_identity(identity));
    let source = Arc::new(ServerSource::new(Arc::clone(&client), device.clone()));
    let (metric_tx, metric_rx) = metric_channel();

    let fleet = FleetHandle::spawn(FleetSpec {
        storage: AppStorage::new(&config.apps_dir, &config.appconfigs_filename),
        source: source.clone(),
        options: HostOptions::new(config.stop_grace, client.http()).with_metrics(metric_tx.clone()),
        working_dir: config.working_dir.clone(),
        device,
        version: VERSION.to_string(),
        interval: config.check_interval,
    })
    .await?;

    let metrics = MetricsHandle::spawn(
        source,
        fleet.watch_apps(),
        (metric_tx, metric_rx),
        config.metrics_interval,
    )
    .await?;

    shutdown.await;
    info!("Stopping applications");
    fleet.stop().await;
    metrics.stop().await;
    Ok(())
}

/// Run one local script until `run_for` elapses or `shutdown` resolves.
pub async fn run_test(config: TestConfig, shutdown: impl Future<Output = ()>) -> Result<()> {
    if !tokio::fs::try_exists(&config.script_path).await.unwrap_or(false) {
        anyhow::bail!("script not found: {}", config.script_path.display());
    }

    let instance = config
        .script_path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "test".to_string());
    let device = device::collect(&SnapshotContext {
        node_id: "test",
        working_dir: &config.working_dir,
        channel: None,
    });

    let handle = SupervisorHandle::spawn(SupervisorSpec {
        env: HostEnv {
            instance,
            app_dir: config.working_dir.clone(),
            working_dir: config.working_dir.clone(),
            device,
            version: VERSION.to_string(),
        },
        options: HostOptions::new(config.stop_grace, reqwest::Client::new()),
        store: ScriptStore::new(&config.script_path),
        source: None,
        check_interval: config.run_for,
    })
    .await?;
    info!(
        script = %config.script_path.display(),
        run_for_secs = config.run_for.as_secs(),
        "Running script"
    );

    tokio::select! {
        _ = tokio::time::sleep(config.run_for) => {}
        _ = shutdown => {}
    }

    handle.stop().await;
    info!("Test run finished");
    Ok(())
}
