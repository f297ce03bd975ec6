//! Instance supervisor - owns one script host across its reload history.
//!
//! The supervisor:
//! - Loads the locally cached script on start (last known good)
//! - Periodically asks its [`ContentSource`] what content is advertised
//! - Swaps hosts only when the advertised fingerprint differs from what is
//!   loaded and the fetched bytes verify against it
//! - Is the sole consumer of its hosts' bridge events
//!
//! ## Swap Order
//!
//! ```text
//! verify -> persist -> old.stop() -> new host (generation + 1) -> load -> start
//! ```
//!
//! The old host is fully stopped (its `stop` hook has run and its bridges are
//! cleared) before the new one is built, so two hosts for the same instance
//! are never running at once. Events still queued from the old host carry the
//! old generation and are dropped by the new one.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use fleet_proto::ScriptFile;
use fleet_reconcile::{Fingerprint, ScriptContent};
use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

use super::framework::{spawn_control_loop, ControlLoop, LoopError, LoopHandle};
use crate::bridges::{Envelope, EventSink, EVENT_QUEUE_CAPACITY};
use crate::client::ClientError;
use crate::host::{HostEnv, HostOptions, HostState, ScriptHost};
use crate::storage::ScriptStore;

/// Upper bound on how often the supervisor wakes up to check elapsed time.
const CHECK_GRANULARITY: Duration = Duration::from_secs(1);

/// Where a supervisor learns about and fetches new content.
#[async_trait]
pub trait ContentSource: Send + Sync + 'static {
    /// The currently advertised script.
    async fn advertised(&self) -> Result<ScriptFile, ClientError>;

    /// Raw bytes at `url`. Unverified.
    async fn fetch(&self, url: &str) -> Result<Vec<u8>, ClientError>;
}

/// Observable supervisor state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SupervisorStatus {
    pub name: String,
    pub state: HostState,
    /// Fingerprint of the content most recently handed to a host.
    pub fingerprint: Option<String>,
    pub generation: u64,
    pub reloads: u64,
    pub last_reload_at: Option<DateTime<Utc>>,
}

/// Everything needed to start a supervisor.
#[derive(Clone)]
pub struct SupervisorSpec {
    pub env: HostEnv,
    pub options: HostOptions,
    pub store: ScriptStore,
    /// Source for update checks. `None` disables checking.
    pub source: Option<Arc<dyn ContentSource>>,
    pub check_interval: Duration,
}

// =============================================================================
// Instance Supervisor
// =============================================================================

struct InstanceSupervisor {
    spec: SupervisorSpec,
    host: Option<ScriptHost>,
    current: Option<Fingerprint>,
    events_tx: mpsc::Sender<Envelope>,
    generation: u64,
    reloads: u64,
    last_reload_at: Option<DateTime<Utc>>,
    last_check: Option<Instant>,
    status_tx: watch::Sender<SupervisorStatus>,
}

impl InstanceSupervisor {
    /// Build, load and start a fresh host.
    fn start_host(&mut self, content: Option<ScriptContent>) {
        self.generation += 1;
        let sink = EventSink::new(self.events_tx.clone(), self.generation);
        let mut host = ScriptHost::new(self.spec.env.clone(), self.spec.options.clone(), sink);

        match content {
            Some(content) => {
                self.current = Some(content.fingerprint().clone());
                if host.load(&content).is_ok() {
                    if let Err(e) = host.start() {
                        warn!(instance = %self.name(), error = %e, "Script start failed");
                    }
                }
            }
            None => {
                info!(instance = %self.name(), "No local script, instance is idle");
            }
        }

        self.host = Some(host);
        self.publish_status();
    }

    fn stop_host(&mut self) {
        if let Some(mut host) = self.host.take() {
            host.stop();
        }
    }

    fn publish_status(&self) {
        let state = self
            .host
            .as_ref()
            .map(ScriptHost::state)
            .unwrap_or(HostState::Stopped);

        self.status_tx.send_replace(SupervisorStatus {
            name: self.name().to_string(),
            state,
            fingerprint: self.current.as_ref().map(|f| f.to_string()),
            generation: self.generation,
            reloads: self.reloads,
            last_reload_at: self.last_reload_at,
        });
    }

    /// One update check. Every failure leaves the running host untouched.
    async fn check_for_update(&mut self, source: Arc<dyn ContentSource>) {
        let advertised = match source.advertised().await {
            Ok(advertised) => advertised,
            Err(e) => {
                warn!(instance = %self.name(), error = %e, "Update check failed, will retry");
                return;
            }
        };

        if advertised.md5.trim().is_empty() || advertised.url.is_empty() {
            warn!(instance = %self.name(), "Advertised script is missing md5 or url");
            return;
        }

        if let Some(current) = &self.current {
            if current.matches(&advertised.md5) {
                debug!(instance = %self.name(), fingerprint = %current, "Script unchanged");
                return;
            }
        }

        let bytes = match source.fetch(&advertised.url).await {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(instance = %self.name(), url = %advertised.url, error = %e, "Script fetch failed, will retry");
                return;
            }
        };

        let content = match ScriptContent::verified(bytes, &advertised.md5) {
            Ok(content) => content,
            Err(e) => {
                error!(instance = %self.name(), url = %advertised.url, error = %e, "Fetched script rejected");
                return;
            }
        };

        if let Err(e) = self.spec.store.save(&content).await {
            error!(instance = %self.name(), error = %e, "Failed to persist script, keeping current");
            return;
        }

        info!(
            instance = %self.name(),
            from = ?self.current.as_ref().map(Fingerprint::as_str),
            to = %content.fingerprint(),
            "Reloading script"
        );
        self.swap(content);
    }

    fn swap(&mut self, content: ScriptContent) {
        self.stop_host();
        self.reloads += 1;
        self.last_reload_at = Some(Utc::now());
        self.start_host(Some(content));
    }
}

#[async_trait]
impl ControlLoop for InstanceSupervisor {
    type Event = Envelope;

    fn name(&self) -> &str {
        &self.spec.env.instance
    }

    async fn on_start(&mut self) -> Result<(), LoopError> {
        let content = match self.spec.store.load().await {
            Ok(content) => content,
            Err(e) => {
                warn!(instance = %self.name(), error = %e, "Failed to read local script");
                None
            }
        };
        self.start_host(content);
        Ok(())
    }

    async fn on_event(&mut self, envelope: Envelope) {
        if let Some(host) = self.host.as_mut() {
            host.handle_event(envelope);
        }
    }

    async fn on_tick(&mut self) {
        let Some(source) = self.spec.source.clone() else {
            return;
        };

        let due = self
            .last_check
            .map(|at| at.elapsed() >= self.spec.check_interval)
            .unwrap_or(true);
        if !due {
            return;
        }

        self.last_check = Some(Instant::now());
        self.check_for_update(source).await;
    }

    async fn on_stop(&mut self) {
        self.stop_host();
        self.publish_status();
    }
}

// =============================================================================
// Supervisor Handle
// =============================================================================

static SUPERVISOR_ID_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Handle to a running instance supervisor.
pub struct SupervisorHandle {
    id: u64,
    status: watch::Receiver<SupervisorStatus>,
    inner: LoopHandle<Envelope>,
}

impl SupervisorHandle {
    /// Start a supervisor. Returns once the local script has been loaded and
    /// started.
    pub async fn spawn(spec: SupervisorSpec) -> Result<Self, LoopError> {
        let (events_tx, events_rx) = mpsc::channel(EVENT_QUEUE_CAPACITY);
        let (status_tx, status_rx) = watch::channel(SupervisorStatus {
            name: spec.env.instance.clone(),
            state: HostState::Unloaded,
            fingerprint: None,
            generation: 0,
            reloads: 0,
            last_reload_at: None,
        });

        let tick = spec
            .source
            .as_ref()
            .map(|_| spec.check_interval.min(CHECK_GRANULARITY));

        let supervisor = InstanceSupervisor {
            spec,
            host: None,
            current: None,
            events_tx: events_tx.clone(),
            generation: 0,
            reloads: 0,
            last_reload_at: None,
            last_check: None,
            status_tx,
        };

        let inner = spawn_control_loop(supervisor, (events_tx, events_rx), tick).await?;

        Ok(Self {
            id: SUPERVISOR_ID_COUNTER.fetch_add(1, Ordering::Relaxed),
            status: status_rx,
            inner,
        })
    }

    /// Process-unique id of this supervisor.
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn name(&self) -> &str {
        self.inner.name()
    }

    /// Latest published status.
    pub fn status(&self) -> SupervisorStatus {
        self.status.borrow().clone()
    }

    /// A receiver that observes every status change.
    pub fn watch_status(&self) -> watch::Receiver<SupervisorStatus> {
        self.status.clone()
    }

    /// Stop the script and wait until teardown has completed.
    pub async fn stop(self) {
        self.inner.stop().await;
    }
}
