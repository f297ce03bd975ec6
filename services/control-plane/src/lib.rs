//! Fleet server library.
//!
//! Publishes the fleet file to nodes: agents poll for their top-level
//! script, controllers log in and fetch their application manifest, and both
//! report liveness and metrics back. All state is held in memory.
//!
//! The crate ships a `fleet-server` binary; the library surface exists for
//! integration testing.

pub mod api;
pub mod config;
pub mod fleet;
pub mod registry;
pub mod state;
pub mod sweep;
pub mod tokens;
