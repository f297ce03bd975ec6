//! Reusable control loop.
//!
//! Every long-lived loop in the agent (instance supervisors, the fleet
//! reconciler, the metrics reporter) multiplexes the same three inputs:
//! - a cancellation signal, always checked first
//! - an event queue
//! - an optional periodic tick
//!
//! The [`ControlLoop`] trait captures the per-loop behavior; [`spawn_control_loop`]
//! runs it and hands back a [`LoopHandle`] whose `stop` is a synchronous
//! handshake: it returns only after `on_stop` has completed.

use std::fmt::Debug;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tracing::{debug, error, info};

// =============================================================================
// Core Traits
// =============================================================================

/// Marker trait for loop events.
pub trait Message: Send + Debug + 'static {}

impl<T: Send + Debug + 'static> Message for T {}

/// Behavior of one control loop.
///
/// Handlers run one at a time on the loop's task; a loop never observes two
/// of its own handlers concurrently.
#[async_trait]
pub trait ControlLoop: Send + 'static {
    /// The event type this loop consumes.
    type Event: Message;

    /// Loop name for logging.
    fn name(&self) -> &str;

    /// Called once before the loop starts selecting.
    async fn on_start(&mut self) -> Result<(), LoopError> {
        Ok(())
    }

    /// Handle a single event.
    async fn on_event(&mut self, event: Self::Event);

    /// Called on every tick, if the loop was spawned with one.
    async fn on_tick(&mut self) {}

    /// Called once after cancellation, before the loop task exits.
    async fn on_stop(&mut self) {}
}

// =============================================================================
// Errors
// =============================================================================

/// Control loop errors.
#[derive(Debug, Error)]
pub enum LoopError {
    /// `on_start` failed; the loop never ran.
    #[error("startup failed: {0}")]
    Startup(String),

    /// The loop has already exited.
    #[error("control loop stopped")]
    Stopped,
}

// =============================================================================
// Loop Handle
// =============================================================================

/// Handle to a running control loop.
pub struct LoopHandle<E: Message> {
    name: String,
    events: mpsc::Sender<E>,
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl<E: Message> LoopHandle<E> {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Send an event, waiting for queue capacity.
    pub async fn send(&self, event: E) -> Result<(), LoopError> {
        self.events.send(event).await.map_err(|_| LoopError::Stopped)
    }

    /// A producer for this loop's event queue.
    pub fn sender(&self) -> mpsc::Sender<E> {
        self.events.clone()
    }

    pub fn is_running(&self) -> bool {
        !self.task.is_finished()
    }

    /// Cancel the loop and wait until `on_stop` has finished.
    pub async fn stop(self) {
        let _ = self.shutdown.send(true);
        if let Err(e) = self.task.await {
            error!(loop_name = %self.name, error = %e, "Control loop task panicked");
        }
    }
}

/// Spawn `control` on its own task and wait for `on_start` to finish.
///
/// `events` is passed in rather than created here so producers can be wired
/// up before the loop starts.
pub async fn spawn_control_loop<L: ControlLoop>(
    control: L,
    events: (mpsc::Sender<L::Event>, mpsc::Receiver<L::Event>),
    tick: Option<Duration>,
) -> Result<LoopHandle<L::Event>, LoopError> {
    let (events_tx, events_rx) = events;
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let (ready_tx, ready_rx) = oneshot::channel();
    let name = control.name().to_string();

    let task = tokio::spawn(run_control_loop(
        control,
        events_rx,
        tick,
        shutdown_rx,
        Some(ready_tx),
    ));

    match ready_rx.await {
        Ok(Ok(())) => Ok(LoopHandle {
            name,
            events: events_tx,
            shutdown: shutdown_tx,
            task,
        }),
        Ok(Err(e)) => Err(e),
        Err(_) => Err(LoopError::Stopped),
    }
}

/// Run a control loop on the current task until cancelled.
pub async fn run_control_loop<L: ControlLoop>(
    mut control: L,
    mut events: mpsc::Receiver<L::Event>,
    tick: Option<Duration>,
    mut shutdown: watch::Receiver<bool>,
    ready: Option<oneshot::Sender<Result<(), LoopError>>>,
) {
    let name = control.name().to_string();

    if let Err(e) = control.on_start().await {
        error!(loop_name = %name, error = %e, "Control loop failed to start");
        if let Some(ready) = ready {
            let _ = ready.send(Err(e));
        }
        return;
    }
    if let Some(ready) = ready {
        let _ = ready.send(Ok(()));
    }
    debug!(loop_name = %name, "Control loop started");

    let mut ticker = tick.map(|period| {
        let mut interval = tokio::time::interval_at(Instant::now() + period, period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        interval
    });
    let mut events_open = true;
    let mut events_handled: u64 = 0;

    if !*shutdown.borrow() {
        loop {
            tokio::select! {
                biased;

                // Check shutdown first
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!(loop_name = %name, "Control loop received shutdown signal");
                        break;
                    }
                }

                event = events.recv(), if events_open => {
                    match event {
                        Some(event) => {
                            events_handled += 1;
                            control.on_event(event).await;
                        }
                        None => {
                            debug!(loop_name = %name, "Event queue closed");
                            events_open = false;
                        }
                    }
                }

                _ = next_tick(&mut ticker) => {
                    control.on_tick().await;
                }
            }
        }
    }

    control.on_stop().await;
    info!(loop_name = %name, events_handled, "Control loop stopped");
}

async fn next_tick(ticker: &mut Option<Interval>) {
    match ticker {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending::<()>().await,
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[derive(Default)]
    struct Journal(Mutex<Vec<String>>);

    impl Journal {
        fn push(&self, entry: impl Into<String>) {
            self.0.lock().unwrap().push(entry.into());
        }

        fn entries(&self) -> Vec<String> {
            self.0.lock().unwrap().clone()
        }
    }

    struct Recorder {
        journal: Arc<Journal>,
        fail_start: bool,
    }

    #[async_trait]
    impl ControlLoop for Recorder {
        type Event = String;

        fn name(&self) -> &str {
            "recorder"
        }

        async fn on_start(&mut self) -> Result<(), LoopError> {
            if self.fail_start {
                return Err(LoopError::Startup("refused".to_string()));
            }
            self.journal.push("start");
            Ok(())
        }

        async fn on_event(&mut self, event: String) {
            self.journal.push(format!("event {}", event));
        }

        async fn on_tick(&mut self) {
            self.journal.push("tick");
        }

        async fn on_stop(&mut self) {
            self.journal.push("stop");
        }
    }

    #[tokio::test]
    async fn test_events_then_stop_handshake() {
        let journal = Arc::new(Journal::default());
        let recorder = Recorder {
            journal: Arc::clone(&journal),
            fail_start: false,
        };

        let handle = spawn_control_loop(recorder, mpsc::channel(8), None)
            .await
            .unwrap();
        assert_eq!(journal.entries(), vec!["start"]);

        handle.send("a".to_string()).await.unwrap();
        handle.send("b".to_string()).await.unwrap();
        tokio::task::yield_now().await;
        handle.stop().await;

        let entries = journal.entries();
        assert_eq!(entries.first().map(String::as_str), Some("start"));
        assert_eq!(entries.last().map(String::as_str), Some("stop"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_tick_fires_on_interval() {
        let journal = Arc::new(Journal::default());
        let recorder = Recorder {
            journal: Arc::clone(&journal),
            fail_start: false,
        };

        let handle = spawn_control_loop(recorder, mpsc::channel(8), Some(Duration::from_secs(10)))
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_secs(25)).await;
        handle.stop().await;

        let ticks = journal.entries().iter().filter(|e| *e == "tick").count();
        assert_eq!(ticks, 2);
    }

    #[tokio::test]
    async fn test_failed_start_reports_error() {
        let journal = Arc::new(Journal::default());
        let recorder = Recorder {
            journal: Arc::clone(&journal),
            fail_start: true,
        };

        let result = spawn_control_loop(recorder, mpsc::channel(8), None).await;
        assert!(matches!(result, Err(LoopError::Startup(_))));
        assert!(journal.entries().is_empty());
    }
}
