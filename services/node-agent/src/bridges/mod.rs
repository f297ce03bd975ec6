//! Async module bridges.
//!
//! Each bridge runs concurrent work (timers, downloads, child processes) on
//! background tasks and reports completion by posting an [`Envelope`] onto
//! the owning supervisor's event queue. Bridges never touch the Lua VM; the
//! supervisor's control loop is the only consumer of the queue and the only
//! place callbacks run.
//!
//! Every bridge keeps a tracking table of pending operations. An entry is
//! removed when its completion event is drained by the host, or when the
//! script cancels it, and never otherwise.

pub mod downloader;
pub mod process;
pub mod timer;

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use thiserror::Error;
use tokio::sync::mpsc;

pub use downloader::DownloadBridge;
pub use process::{ProcessBridge, ProcessCommand};
pub use timer::TimerBridge;

/// Capacity of a supervisor's event queue.
pub const EVENT_QUEUE_CAPACITY: usize = 64;

// =============================================================================
// Errors
// =============================================================================

/// Errors surfaced synchronously to the calling script.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum BridgeError {
    /// An operation with this tag is already in flight.
    #[error("{module}: tag '{tag}' is already in use")]
    DuplicateTag { module: &'static str, tag: String },

    /// The script passed an unusable argument.
    #[error("{module}: {reason}")]
    InvalidArgument { module: &'static str, reason: String },
}

// =============================================================================
// Events
// =============================================================================

/// Completion event posted by a bridge.
///
/// Events carry the operation id so a completion can only retire the exact
/// tracking entry that produced it, even if the tag was reused since.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScriptEvent {
    Timer {
        tag: String,
        id: u64,
    },
    Download {
        tag: String,
        id: u64,
        file_path: PathBuf,
        md5: Option<String>,
        error: Option<String>,
    },
    Process {
        name: String,
        id: u64,
        code: Option<i32>,
        success: bool,
        error: Option<String>,
    },
}

impl ScriptEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            ScriptEvent::Timer { .. } => "timer",
            ScriptEvent::Download { .. } => "download",
            ScriptEvent::Process { .. } => "process",
        }
    }
}

/// An event stamped with the host generation that produced it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    pub generation: u64,
    pub event: ScriptEvent,
}

/// Producer side of a supervisor's event queue, bound to one host generation.
#[derive(Debug, Clone)]
pub struct EventSink {
    tx: mpsc::Sender<Envelope>,
    generation: u64,
}

impl EventSink {
    pub fn new(tx: mpsc::Sender<Envelope>, generation: u64) -> Self {
        Self { tx, generation }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Post without waiting. Used by timers, which may drop a fire.
    fn try_post(&self, event: ScriptEvent) -> Result<(), mpsc::error::TrySendError<Envelope>> {
        self.tx.try_send(Envelope {
            generation: self.generation,
            event,
        })
    }

    /// Post, waiting for queue capacity. Returns false once the queue is gone.
    async fn post(&self, event: ScriptEvent) -> bool {
        self.tx
            .send(Envelope {
                generation: self.generation,
                event,
            })
            .await
            .is_ok()
    }
}

// =============================================================================
// Bridge Set
// =============================================================================

/// The three bridges owned by one host.
#[derive(Clone)]
pub struct Bridges {
    pub timer: TimerBridge,
    pub downloader: DownloadBridge,
    pub process: ProcessBridge,
}

impl Bridges {
    pub fn new(sink: EventSink, http: reqwest::Client) -> Self {
        Self {
            timer: TimerBridge::new(sink.clone()),
            downloader: DownloadBridge::new(sink.clone(), http),
            process: ProcessBridge::new(sink),
        }
    }

    /// Cancel every pending operation in every bridge.
    pub fn clear(&self) {
        self.timer.clear();
        self.downloader.clear();
        self.process.clear();
    }

    /// Number of tracked operations across all bridges.
    pub fn pending(&self) -> usize {
        self.timer.len() + self.downloader.len() + self.process.len()
    }
}

static NEXT_OPERATION_ID: AtomicU64 = AtomicU64::new(1);

fn next_operation_id() -> u64 {
    NEXT_OPERATION_ID.fetch_add(1, Ordering::Relaxed)
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
