//! Fleet Node Agent Library
//!
//! The node agent hosts Lua scripts and keeps them in sync with the fleet
//! server. It runs in one of two modes:
//!
//! - **agent**: one supervisor for a single top-level script, which it
//!   hot-reloads whenever the server advertises a new fingerprint
//! - **run**: a fleet reconciler that keeps one supervisor per application in
//!   the server's manifest
//!
//! ## Modules
//!
//! - `host`: the Lua VM, its callback table and the script-facing modules
//! - `bridges`: timers, downloads and child processes, reported back as events
//! - `actors`: the control loop, instance supervisor, fleet reconciler and
//!   metrics reporter
//! - `client`: fleet server API
//! - `storage`: scripts and manifests on disk

pub mod actors;
pub mod bridges;
pub mod client;
pub mod config;
pub mod device;
pub mod host;
pub mod identity;
pub mod runner;
pub mod storage;

/// Agent version reported to scripts and the server.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

// Re-export commonly used types
pub use actors::{FleetHandle, SupervisorHandle, SupervisorStatus};
pub use client::{ClientError, ServerClient, ServerSource};
pub use host::{HostError, HostState, ScriptHost};
pub use storage::{AppStorage, ScriptStore};
