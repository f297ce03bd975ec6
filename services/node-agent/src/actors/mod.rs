//! Control loops of the node agent.
//!
//! ```text
//! FleetHandle (run mode)            SupervisorHandle (agent mode)
//! ├── SupervisorHandle(app)         └── ScriptHost
//! │   └── ScriptHost
//! └── ...
//! MetricsHandle
//! ```
//!
//! Every loop is built on [`framework::spawn_control_loop`]: cancellation
//! first, then its event queue, then an optional tick.

pub mod fleet;
pub mod framework;
pub mod metrics;
pub mod supervisor;

pub use fleet::{AppStatus, FleetHandle, FleetMessage, FleetSpec, ManifestSource, ReconcileOutcome};
pub use framework::{spawn_control_loop, ControlLoop, LoopError, LoopHandle, Message};
pub use metrics::{metric_channel, MetricsHandle, MetricsPublisher};
pub use supervisor::{ContentSource, SupervisorHandle, SupervisorSpec, SupervisorStatus};
