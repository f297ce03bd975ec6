//! Liveness sweep: forgets agents and controllers that stopped polling and
//! purges expired tokens.

use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tracing::{debug, info, instrument};

use crate::registry::SweepReport;
use crate::state::AppState;

pub struct SweepWorker {
    state: AppState,
    interval: Duration,
}

impl SweepWorker {
    pub fn new(state: AppState) -> Self {
        let interval = state.config().sweep_interval;
        Self { state, interval }
    }

    #[instrument(skip(self, shutdown))]
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            interval_secs = self.interval.as_secs(),
            offline_after_secs = self.state.config().offline_after.as_secs(),
            "Starting liveness sweep"
        );

        let mut interval = tokio::time::interval(self.interval);
        interval.tick().await;

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    self.sweep_once(Utc::now()).await;
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("Liveness sweep shutting down");
                        break;
                    }
                }
            }
        }
    }

    pub async fn sweep_once(&self, now: DateTime<Utc>) -> SweepReport {
        let report = self
            .state
            .registry()
            .write()
            .await
            .sweep(now, self.state.config().offline_after);
        let tokens = self.state.tokens().purge_expired(now).await;

        if report.agents > 0 || report.controllers > 0 {
            info!(
                agents = report.agents,
                controllers = report.controllers,
                "Dropped offline nodes"
            );
        }
        if tokens > 0 {
            debug!(tokens, "Purged expired tokens");
        }
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::fleet::FleetFile;
    use fleet_proto::{keys, DeviceSnapshot};

    #[tokio::test]
    async fn test_sweep_once_drops_idle_agents() {
        let state = AppState::new(Config::default(), FleetFile::default());
        let t0 = Utc::now();
        state
            .registry()
            .write()
            .await
            .touch_agent(&DeviceSnapshot::new().with(keys::UUID, "u1"), t0);

        let worker = SweepWorker::new(state.clone());
        assert_eq!(worker.sweep_once(t0).await, SweepReport::default());

        let report = worker.sweep_once(t0 + chrono::Duration::seconds(121)).await;
        assert_eq!(report.agents, 1);
        assert!(state.registry().read().await.agents().is_empty());
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown() {
        let state = AppState::new(Config::default(), FleetFile::default());
        let worker = SweepWorker::new(state);
        let (tx, rx) = watch::channel(false);

        let task = tokio::spawn(async move { worker.run(rx).await });
        tx.send(true).unwrap();

        tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .unwrap()
            .unwrap();
    }
}
