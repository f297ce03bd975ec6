//! Timer bridge: repeating and one-shot wall-clock timers.
//!
//! A repeating timer keeps at most one undrained event in the queue. Fires
//! that happen while an earlier fire is still queued are coalesced, and a
//! fire that finds the queue full is dropped. A one-shot timer fires exactly
//! once and waits for queue capacity, since its tracking entry is only
//! retired when that fire is drained.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, warn};

use super::{lock, next_operation_id, BridgeError, EventSink, ScriptEvent};

const MODULE: &str = "timer";

struct TimerEntry {
    id: u64,
    callback: String,
    once: bool,
    pending: Arc<AtomicBool>,
    task: JoinHandle<()>,
}

/// Timer bridge for one host.
#[derive(Clone)]
pub struct TimerBridge {
    timers: Arc<Mutex<HashMap<String, TimerEntry>>>,
    sink: EventSink,
}

impl TimerBridge {
    pub fn new(sink: EventSink) -> Self {
        Self {
            timers: Arc::new(Mutex::new(HashMap::new())),
            sink,
        }
    }

    /// Schedule `callback` every `period` (or once, after `period`).
    pub fn register(
        &self,
        tag: &str,
        period: Duration,
        callback: &str,
        once: bool,
    ) -> Result<(), BridgeError> {
        if period.is_zero() {
            return Err(BridgeError::InvalidArgument {
                module: MODULE,
                reason: "period must be positive".to_string(),
            });
        }

        let mut timers = lock(&self.timers);
        if timers.contains_key(tag) {
            return Err(BridgeError::DuplicateTag {
                module: MODULE,
                tag: tag.to_string(),
            });
        }

        let id = next_operation_id();
        let pending = Arc::new(AtomicBool::new(false));
        let task = tokio::spawn(run_timer(
            self.sink.clone(),
            tag.to_string(),
            id,
            period,
            once,
            Arc::clone(&pending),
        ));

        timers.insert(
            tag.to_string(),
            TimerEntry {
                id,
                callback: callback.to_string(),
                once,
                pending,
                task,
            },
        );
        debug!(tag, period_ms = period.as_millis() as u64, once, "Timer registered");
        Ok(())
    }

    /// Cancel a timer. Unknown tags are a no-op.
    pub fn cancel(&self, tag: &str) -> bool {
        match lock(&self.timers).remove(tag) {
            Some(entry) => {
                entry.task.abort();
                true
            }
            None => false,
        }
    }

    pub fn has(&self, tag: &str) -> bool {
        lock(&self.timers).contains_key(tag)
    }

    /// Retire a drained fire, returning the callback to invoke.
    ///
    /// Returns `None` when the timer was cancelled or replaced since the fire
    /// was queued.
    pub fn on_drained(&self, tag: &str, id: u64) -> Option<String> {
        let mut timers = lock(&self.timers);
        let entry = timers.get(tag)?;
        if entry.id != id {
            return None;
        }

        entry.pending.store(false, Ordering::Release);
        let callback = entry.callback.clone();
        if entry.once {
            timers.remove(tag);
        }
        Some(callback)
    }

    /// Cancel every timer.
    pub fn clear(&self) {
        for (_, entry) in lock(&self.timers).drain() {
            entry.task.abort();
        }
    }

    pub fn len(&self) -> usize {
        lock(&self.timers).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

async fn run_timer(
    sink: EventSink,
    tag: String,
    id: u64,
    period: Duration,
    once: bool,
    pending: Arc<AtomicBool>,
) {
    let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

    if once {
        interval.tick().await;
        pending.store(true, Ordering::Release);
        if !sink.post(ScriptEvent::Timer { tag: tag.clone(), id }).await {
            debug!(tag = %tag, "Event queue closed, one-shot fire discarded");
        }
        return;
    }

    loop {
        interval.tick().await;

        if pending.swap(true, Ordering::AcqRel) {
            debug!(tag = %tag, "Timer fire coalesced");
        } else {
            match sink.try_post(ScriptEvent::Timer {
                tag: tag.clone(),
                id,
            }) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => {
                    pending.store(false, Ordering::Release);
                    warn!(tag = %tag, "Event queue full, timer fire dropped");
                }
                Err(TrySendError::Closed(_)) => return,
            }
        }
    }
}
