//! Fleet reconciler - keeps one instance supervisor per application in the
//! accepted manifest.
//!
//! Each pass:
//! 1. Fetch the manifest and drop duplicate names (first wins)
//! 2. Short-circuit when its digest equals the accepted one
//! 3. Fetch, verify and persist every application's script; failures mark
//!    that application degraded and do not stop the pass
//! 4. Plan removals, restarts and creations against the registry
//! 5. Stop removed and changed supervisors, then start new and changed ones
//! 6. Persist the manifest and digest as the new baseline
//!
//! Degraded applications are retried on every pass, including passes that
//! short-circuit, and only the recovered application is restarted.

use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use fleet_proto::{AppDescriptor, DeviceSnapshot};
use fleet_reconcile::{
    dedup_by_key, plan_changes, ManifestDigest, RetryTracker, ScriptContent, DEFAULT_MAX_RETRIES,
    DEFAULT_RETRY_WINDOW,
};
use serde::Serialize;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, error, info, warn};

use super::framework::{spawn_control_loop, ControlLoop, LoopError, LoopHandle};
use super::supervisor::{SupervisorHandle, SupervisorSpec, SupervisorStatus};
use crate::client::ClientError;
use crate::host::{HostEnv, HostOptions};
use crate::storage::{AppStorage, ScriptStore, StorageError};

/// Where the reconciler reads manifests and script bytes from.
#[async_trait]
pub trait ManifestSource: Send + Sync + 'static {
    /// This node's application manifest.
    async fn manifest(&self) -> Result<Vec<AppDescriptor>, ClientError>;

    /// Raw bytes at `url`. Unverified.
    async fn fetch(&self, url: &str) -> Result<Vec<u8>, ClientError>;
}

/// Everything needed to start the reconciler.
#[derive(Clone)]
pub struct FleetSpec {
    pub storage: AppStorage,
    pub source: Arc<dyn ManifestSource>,
    /// Shared by every application host.
    pub options: HostOptions,
    pub working_dir: PathBuf,
    pub device: DeviceSnapshot,
    pub version: String,
    /// Time between reconciliation passes.
    pub interval: Duration,
}

/// One registry entry as seen from outside.
#[derive(Debug, Clone, Serialize)]
pub struct AppStatus {
    pub name: String,
    pub supervisor_id: u64,
    pub status: SupervisorStatus,
    pub degraded: bool,
}

/// What a reconciliation pass did.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileOutcome {
    /// The manifest matched the accepted one.
    pub skipped: bool,
    pub stopped: Vec<String>,
    pub started: Vec<String>,
    pub degraded: Vec<String>,
}

/// Requests answered by the reconciler's loop.
#[derive(Debug)]
pub enum FleetMessage {
    Snapshot(oneshot::Sender<Vec<AppStatus>>),
    ReconcileNow(oneshot::Sender<ReconcileOutcome>),
}

struct AppEntry {
    descriptor: AppDescriptor,
    handle: SupervisorHandle,
}

// =============================================================================
// Fleet Reconciler
// =============================================================================

struct FleetReconciler {
    spec: FleetSpec,
    registry: BTreeMap<String, AppEntry>,
    accepted: Option<ManifestDigest>,
    degraded: BTreeSet<String>,
    retries: RetryTracker,
    apps_tx: watch::Sender<Vec<AppDescriptor>>,
}

impl FleetReconciler {
    /// Dedup by name and drop entries whose paths would escape the apps root.
    fn sanitize(&self, apps: Vec<AppDescriptor>) -> Vec<AppDescriptor> {
        let (kept, dropped) = dedup_by_key(apps, |a| a.app_name.as_str());
        for app in &dropped {
            warn!(app = %app.app_name, "Duplicate app name in manifest, keeping first");
        }

        kept.into_iter()
            .filter(|app| match self.spec.storage.script_path(app) {
                Ok(_) => true,
                Err(e) => {
                    warn!(app = %app.app_name, error = %e, "Ignoring app with unusable paths");
                    false
                }
            })
            .collect()
    }

    fn supervisor_spec(&self, app: &AppDescriptor) -> Result<SupervisorSpec, StorageError> {
        Ok(SupervisorSpec {
            env: HostEnv {
                instance: app.app_name.clone(),
                app_dir: self.spec.storage.app_dir(app)?,
                working_dir: self.spec.working_dir.clone(),
                device: self.spec.device.clone(),
                version: self.spec.version.clone(),
            },
            options: self.spec.options.clone(),
            store: ScriptStore::new(self.spec.storage.script_path(app)?),
            source: None,
            check_interval: self.spec.interval,
        })
    }

    async fn start_app(&mut self, app: &AppDescriptor) -> bool {
        let spec = match self.supervisor_spec(app) {
            Ok(spec) => spec,
            Err(e) => {
                error!(app = %app.app_name, error = %e, "Cannot build supervisor");
                return false;
            }
        };

        match SupervisorHandle::spawn(spec).await {
            Ok(handle) => {
                debug!(app = %app.app_name, supervisor_id = handle.id(), "App supervisor started");
                self.registry.insert(
                    app.app_name.clone(),
                    AppEntry {
                        descriptor: app.clone(),
                        handle,
                    },
                );
                true
            }
            Err(e) => {
                error!(app = %app.app_name, error = %e, "Failed to start app supervisor");
                false
            }
        }
    }

    async fn stop_app(&mut self, name: &str) -> Option<AppDescriptor> {
        let entry = self.registry.remove(name)?;
        entry.handle.stop().await;
        debug!(app = %name, "App supervisor stopped");
        Some(entry.descriptor)
    }

    /// Make sure the app's verified script is on disk. Returns false if it
    /// could not be fetched or verified.
    async fn sync_script(&mut self, app: &AppDescriptor) -> bool {
        match self.spec.storage.load_script(app).await {
            Ok(Some(local)) if local.fingerprint().matches(&app.script_md5) => {
                self.retries.clear(&app.app_name);
                return true;
            }
            Ok(_) => {}
            Err(e) => {
                warn!(app = %app.app_name, error = %e, "Failed to read local script");
            }
        }

        let result = self.fetch_verified(app).await;
        match result {
            Ok(content) => {
                if let Err(e) = self.spec.storage.save_script(app, &content).await {
                    error!(app = %app.app_name, error = %e, "Failed to persist script");
                    self.retries.record_failure(&app.app_name);
                    return false;
                }
                info!(app = %app.app_name, fingerprint = %content.fingerprint(), "Script updated");
                self.retries.clear(&app.app_name);
                true
            }
            Err(reason) => {
                let exhausted = self.retries.record_failure(&app.app_name);
                warn!(app = %app.app_name, error = %reason, exhausted, "App script unavailable");
                false
            }
        }
    }

    async fn fetch_verified(&self, app: &AppDescriptor) -> Result<ScriptContent, String> {
        let bytes = self
            .spec
            .source
            .fetch(&app.script_url)
            .await
            .map_err(|e| e.to_string())?;

        ScriptContent::verified(bytes, &app.script_md5).map_err(|e| {
            error!(app = %app.app_name, url = %app.script_url, error = %e, "Fetched script rejected");
            e.to_string()
        })
    }

    /// Retry degraded apps; restart the ones that recover.
    async fn retry_degraded(&mut self, outcome: &mut ReconcileOutcome) {
        let names: Vec<String> = self.degraded.iter().cloned().collect();

        for name in names {
            if self.retries.is_exhausted(&name) {
                debug!(app = %name, "Retries exhausted for this window");
                continue;
            }
            let Some(app) = self.registry.get(&name).map(|e| e.descriptor.clone()) else {
                self.degraded.remove(&name);
                continue;
            };

            if self.sync_script(&app).await {
                info!(app = %name, "Degraded app recovered, restarting");
                self.degraded.remove(&name);
                self.stop_app(&name).await;
                outcome.stopped.push(name.clone());
                if self.start_app(&app).await {
                    outcome.started.push(name);
                }
            }
        }
    }

    async fn reconcile(&mut self) -> ReconcileOutcome {
        let mut outcome = ReconcileOutcome::default();

        let fetched = match self.spec.source.manifest().await {
            Ok(apps) => apps,
            Err(e) => {
                match &e {
                    ClientError::Decode(_) => error!(error = %e, "Malformed manifest rejected"),
                    _ => warn!(error = %e, "Manifest fetch failed, will retry"),
                }
                outcome.skipped = true;
                outcome.degraded = self.degraded.iter().cloned().collect();
                return outcome;
            }
        };

        let apps = self.sanitize(fetched);
        let digest = match ManifestDigest::of(&apps) {
            Ok(digest) => digest,
            Err(e) => {
                error!(error = %e, "Failed to digest manifest");
                outcome.skipped = true;
                return outcome;
            }
        };

        if self.accepted.as_ref() == Some(&digest) {
            debug!(digest = %digest, "Manifest unchanged");
            outcome.skipped = true;
            self.retry_degraded(&mut outcome).await;
            outcome.degraded = self.degraded.iter().cloned().collect();
            return outcome;
        }

        info!(
            digest = %digest,
            app_count = apps.len(),
            registry_count = self.registry.len(),
            "Applying new manifest"
        );

        let mut degraded = BTreeSet::new();
        for app in &apps {
            if !self.sync_script(app).await {
                degraded.insert(app.app_name.clone());
            }
        }

        let current: BTreeMap<String, AppDescriptor> = self
            .registry
            .iter()
            .map(|(name, entry)| (name.clone(), entry.descriptor.clone()))
            .collect();
        let changes = plan_changes(&current, &apps, |a| a.app_name.as_str());

        // Unchanged apps that were degraded and now have their script.
        let recovered: Vec<AppDescriptor> = apps
            .iter()
            .filter(|a| changes.unchanged.contains(&a.app_name))
            .filter(|a| self.degraded.contains(&a.app_name) && !degraded.contains(&a.app_name))
            .cloned()
            .collect();

        let to_stop: Vec<String> = changes
            .to_stop(|a| a.app_name.as_str())
            .chain(recovered.iter().map(|a| a.app_name.clone()))
            .collect();

        for name in &to_stop {
            if self.stop_app(name).await.is_some() {
                outcome.stopped.push(name.clone());
            }
        }

        for name in &changes.removed {
            let Some(old) = current.get(name) else {
                continue;
            };
            let Ok(dir) = self.spec.storage.app_dir(old) else {
                continue;
            };
            let still_used = apps
                .iter()
                .any(|a| self.spec.storage.app_dir(a).ok().as_ref() == Some(&dir));
            if still_used {
                continue;
            }
            if let Err(e) = self.spec.storage.remove_app(old).await {
                warn!(app = %name, error = %e, "Failed to remove app directory");
            }
        }

        let to_start: Vec<AppDescriptor> = changes
            .to_start()
            .cloned()
            .chain(recovered)
            .collect();
        for app in &to_start {
            if self.start_app(app).await {
                outcome.started.push(app.app_name.clone());
            }
        }

        if let Err(e) = self.spec.storage.save_manifest(&apps, &digest).await {
            error!(error = %e, "Failed to persist accepted manifest");
        }

        info!(
            digest = %digest,
            removed = changes.removed.len(),
            changed = changes.changed.len(),
            added = changes.added.len(),
            degraded = degraded.len(),
            "Manifest applied"
        );

        self.degraded = degraded;
        self.accepted = Some(digest);
        self.apps_tx.send_replace(apps);

        outcome.degraded = self.degraded.iter().cloned().collect();
        outcome
    }

    fn snapshot(&self) -> Vec<AppStatus> {
        self.registry
            .iter()
            .map(|(name, entry)| AppStatus {
                name: name.clone(),
                supervisor_id: entry.handle.id(),
                status: entry.handle.status(),
                degraded: self.degraded.contains(name),
            })
            .collect()
    }
}

#[async_trait]
impl ControlLoop for FleetReconciler {
    type Event = FleetMessage;

    fn name(&self) -> &str {
        "fleet"
    }

    async fn on_start(&mut self) -> Result<(), LoopError> {
        let local = match self.spec.storage.load_manifest().await {
            Ok(apps) => apps,
            Err(e) => {
                warn!(error = %e, "Ignoring unreadable local manifest");
                Vec::new()
            }
        };
        let apps = self.sanitize(local);

        for app in &apps {
            let present = matches!(self.spec.storage.load_script(app).await, Ok(Some(_)));
            if !present {
                self.degraded.insert(app.app_name.clone());
            }
            self.start_app(app).await;
        }

        self.accepted = match self.spec.storage.load_digest().await {
            Ok(Some(digest)) => Some(digest),
            _ if apps.is_empty() => None,
            _ => ManifestDigest::of(&apps).ok(),
        };

        info!(
            app_count = apps.len(),
            degraded = self.degraded.len(),
            "Started apps from local manifest"
        );
        self.apps_tx.send_replace(apps);

        self.reconcile().await;
        Ok(())
    }

    async fn on_event(&mut self, message: FleetMessage) {
        match message {
            FleetMessage::Snapshot(reply) => {
                let _ = reply.send(self.snapshot());
            }
            FleetMessage::ReconcileNow(reply) => {
                let outcome = self.reconcile().await;
                let _ = reply.send(outcome);
            }
        }
    }

    async fn on_tick(&mut self) {
        self.retries.prune();
        self.reconcile().await;
    }

    async fn on_stop(&mut self) {
        let names: Vec<String> = self.registry.keys().cloned().collect();
        for name in names {
            self.stop_app(&name).await;
        }
    }
}

// =============================================================================
// Fleet Handle
// =============================================================================

/// Handle to the running reconciler.
pub struct FleetHandle {
    apps: watch::Receiver<Vec<AppDescriptor>>,
    inner: LoopHandle<FleetMessage>,
}

impl FleetHandle {
    /// Start the reconciler. Returns after local apps have been started and
    /// the first pass against the server has completed.
    pub async fn spawn(spec: FleetSpec) -> Result<Self, LoopError> {
        let (apps_tx, apps_rx) = watch::channel(Vec::new());
        let interval = spec.interval;

        let reconciler = FleetReconciler {
            spec,
            registry: BTreeMap::new(),
            accepted: None,
            degraded: BTreeSet::new(),
            retries: RetryTracker::new(DEFAULT_MAX_RETRIES, DEFAULT_RETRY_WINDOW),
            apps_tx,
        };

        let inner = spawn_control_loop(reconciler, mpsc::channel(16), Some(interval)).await?;
        Ok(Self {
            apps: apps_rx,
            inner,
        })
    }

    /// Registered applications, updated whenever a manifest is accepted.
    pub fn watch_apps(&self) -> watch::Receiver<Vec<AppDescriptor>> {
        self.apps.clone()
    }

    /// Current registry.
    pub async fn snapshot(&self) -> Result<Vec<AppStatus>, LoopError> {
        let (tx, rx) = oneshot::channel();
        self.inner.send(FleetMessage::Snapshot(tx)).await?;
        rx.await.map_err(|_| LoopError::Stopped)
    }

    /// Run a pass now instead of waiting for the next tick.
    pub async fn reconcile_now(&self) -> Result<ReconcileOutcome, LoopError> {
        let (tx, rx) = oneshot::channel();
        self.inner.send(FleetMessage::ReconcileNow(tx)).await?;
        rx.await.map_err(|_| LoopError::Stopped)
    }

    /// Stop every application and wait for their teardown.
    pub async fn stop(self) {
        self.inner.stop().await;
    }
}
