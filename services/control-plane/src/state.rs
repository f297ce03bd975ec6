//! Application state shared across request handlers.

use std::sync::Arc;

use fleet_auth::{KeyedDigest, SignatureVerifier};
use tokio::sync::RwLock;

use crate::config::Config;
use crate::fleet::FleetFile;
use crate::registry::NodeRegistry;
use crate::tokens::TokenStore;

/// Shared application state.
///
/// This is passed to all request handlers via Axum's state extractor.
#[derive(Clone)]
pub struct AppState {
    inner: Arc<AppStateInner>,
}

struct AppStateInner {
    config: Config,
    fleet: FleetFile,
    registry: RwLock<NodeRegistry>,
    tokens: TokenStore,
    verifier: Box<dyn SignatureVerifier>,
}

impl AppState {
    pub fn new(config: Config, fleet: FleetFile) -> Self {
        Self::with_verifier(config, fleet, Box::new(KeyedDigest::verifier()))
    }

    pub fn with_verifier(config: Config, fleet: FleetFile, verifier: Box<dyn SignatureVerifier>) -> Self {
        let tokens = TokenStore::new(config.token_ttl);
        Self {
            inner: Arc::new(AppStateInner {
                config,
                fleet,
                registry: RwLock::new(NodeRegistry::new()),
                tokens,
                verifier,
            }),
        }
    }

    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    pub fn fleet(&self) -> &FleetFile {
        &self.inner.fleet
    }

    pub fn registry(&self) -> &RwLock<NodeRegistry> {
        &self.inner.registry
    }

    pub fn tokens(&self) -> &TokenStore {
        &self.inner.tokens
    }

    pub fn verifier(&self) -> &dyn SignatureVerifier {
        self.inner.verifier.as_ref()
    }
}
