//! Metrics reporter.
//!
//! Scripts publish an opaque metric string with `metric.send`. The reporter
//! keeps the latest value per instance and, on each tick, pushes one record
//! per registered application to the fleet server.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use fleet_proto::{AppDescriptor, AppMetric};
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, warn};

use super::framework::{spawn_control_loop, ControlLoop, LoopError, LoopHandle};
use crate::client::ClientError;
use crate::host::{MetricSink, MetricUpdate};

/// Capacity of the metric queue shared by all application hosts.
pub const METRIC_QUEUE_CAPACITY: usize = 256;

/// Where metric records are sent.
#[async_trait]
pub trait MetricsPublisher: Send + Sync + 'static {
    async fn publish(&self, metrics: &[AppMetric]) -> Result<(), ClientError>;
}

/// Create the metric queue. The sender goes into `HostOptions`, the receiver
/// into [`MetricsHandle::spawn`].
pub fn metric_channel() -> (MetricSink, mpsc::Receiver<MetricUpdate>) {
    mpsc::channel(METRIC_QUEUE_CAPACITY)
}

struct MetricsReporter {
    publisher: Arc<dyn MetricsPublisher>,
    apps: watch::Receiver<Vec<AppDescriptor>>,
    latest: BTreeMap<String, String>,
    consecutive_failures: u32,
}

impl MetricsReporter {
    fn records(&mut self) -> Vec<AppMetric> {
        let apps = self.apps.borrow().clone();
        self.latest
            .retain(|instance, _| apps.iter().any(|a| &a.app_name == instance));

        apps.into_iter()
            .map(|app| {
                let metric = self.latest.get(&app.app_name).cloned().unwrap_or_default();
                AppMetric::new(app, metric)
            })
            .collect()
    }
}

#[async_trait]
impl ControlLoop for MetricsReporter {
    type Event = MetricUpdate;

    fn name(&self) -> &str {
        "metrics"
    }

    async fn on_event(&mut self, update: MetricUpdate) {
        self.latest.insert(update.instance, update.value);
    }

    async fn on_tick(&mut self) {
        let records = self.records();

        match self.publisher.publish(&records).await {
            Ok(()) => {
                self.consecutive_failures = 0;
                debug!(count = records.len(), "Metrics pushed");
            }
            Err(e) => {
                self.consecutive_failures += 1;
                if self.consecutive_failures <= 3 {
                    warn!(error = %e, consecutive_failures = self.consecutive_failures, "Metrics push failed");
                } else {
                    error!(error = %e, consecutive_failures = self.consecutive_failures, "Metrics push failed repeatedly");
                }
            }
        }
    }
}

/// Handle to the running reporter.
pub struct MetricsHandle {
    inner: LoopHandle<MetricUpdate>,
}

impl MetricsHandle {
    pub async fn spawn(
        publisher: Arc<dyn MetricsPublisher>,
        apps: watch::Receiver<Vec<AppDescriptor>>,
        queue: (MetricSink, mpsc::Receiver<MetricUpdate>),
        interval: Duration,
    ) -> Result<Self, LoopError> {
        let reporter = MetricsReporter {
            publisher,
            apps,
            latest: BTreeMap::new(),
            consecutive_failures: 0,
        };
        let inner = spawn_control_loop(reporter, queue, Some(interval)).await?;
        Ok(Self { inner })
    }

    pub async fn stop(self) {
        self.inner.stop().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recording(Mutex<Vec<Vec<AppMetric>>>);

    #[async_trait]
    impl MetricsPublisher for Recording {
        async fn publish(&self, metrics: &[AppMetric]) -> Result<(), ClientError> {
            self.0.lock().unwrap().push(metrics.to_vec());
            Ok(())
        }
    }

    fn app(name: &str) -> AppDescriptor {
        AppDescriptor {
            app_name: name.to_string(),
            app_dir: name.to_string(),
            script_name: "main.lua".to_string(),
            script_md5: String::new(),
            script_url: String::new(),
            tag: String::new(),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_latest_metric_per_registered_app() {
        let publisher = Arc::new(Recording::default());
        let (_apps_tx, apps_rx) = watch::channel(vec![app("a"), app("b")]);
        let (sink, rx) = metric_channel();

        let handle = MetricsHandle::spawn(
            publisher.clone(),
            apps_rx,
            (sink.clone(), rx),
            Duration::from_secs(60),
        )
        .await
        .unwrap();

        for (instance, value) in [("a", "1"), ("a", "2"), ("gone", "x")] {
            sink.send(MetricUpdate {
                instance: instance.to_string(),
                value: value.to_string(),
            })
            .await
            .unwrap();
        }

        tokio::time::sleep(Duration::from_secs(61)).await;
        handle.stop().await;

        let pushes = publisher.0.lock().unwrap().clone();
        assert_eq!(pushes.len(), 1);
        let metrics: Vec<(&str, &str)> = pushes[0]
            .iter()
            .map(|m| (m.descriptor.app_name.as_str(), m.metric.as_str()))
            .collect();
        assert_eq!(metrics, vec![("a", "2"), ("b", "")]);
    }
}
