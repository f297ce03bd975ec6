//! Node identity: a stable node id and the node's signing key.
//!
//! Both live under `{workingDir}/.fleet/` and are created on first start.

use std::path::Path;

use anyhow::{Context, Result};
use fleet_auth::{decode_key, encode_key, KeyedDigest, NodeSigner};
use tracing::info;

use crate::storage::{read_optional, write_atomic};

/// Directory holding identity files, relative to the working directory.
pub const IDENTITY_DIR: &str = ".fleet";

const NODE_ID_FILE: &str = "node_id";
const KEY_FILE: &str = "node.key";

/// This node's identity.
#[derive(Debug, Clone)]
pub struct NodeIdentity {
    node_id: String,
    signer: KeyedDigest,
}

impl NodeIdentity {
    /// Load the identity from `working_dir`, creating it if absent.
    pub async fn load_or_create(working_dir: &Path) -> Result<Self> {
        let dir = working_dir.join(IDENTITY_DIR);
        let node_id = load_or_create_node_id(&dir.join(NODE_ID_FILE)).await?;
        let signer = load_or_create_key(&dir.join(KEY_FILE)).await?;
        Ok(Self { node_id, signer })
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    /// Verification key, encoded for the `pub_key` parameter.
    pub fn encoded_key(&self) -> String {
        encode_key(&self.signer.verification_key())
    }

    /// Hex signature over the node id, for the `sign` parameter.
    pub fn login_signature(&self) -> String {
        self.signer.sign(self.node_id.as_bytes())
    }
}

async fn load_or_create_node_id(path: &Path) -> Result<String> {
    if let Some(bytes) = read_optional(path).await? {
        let id = String::from_utf8_lossy(&bytes).trim().to_string();
        if !id.is_empty() {
            return Ok(id);
        }
    }

    let id = uuid::Uuid::new_v4().to_string();
    write_atomic(path, id.as_bytes())
        .await
        .with_context(|| format!("Failed to write node id to {}", path.display()))?;
    info!(node_id = %id, "Created node identity");
    Ok(id)
}

async fn load_or_create_key(path: &Path) -> Result<KeyedDigest> {
    if let Some(bytes) = read_optional(path).await? {
        let encoded = String::from_utf8_lossy(&bytes);
        let key = decode_key(&encoded)
            .with_context(|| format!("Malformed node key at {}", path.display()))?;
        return KeyedDigest::from_key(key)
            .with_context(|| format!("Unusable node key at {}", path.display()));
    }

    let signer = KeyedDigest::generate();
    write_atomic(path, encode_key(signer.key_bytes()).as_bytes())
        .await
        .with_context(|| format!("Failed to write node key to {}", path.display()))?;
    Ok(signer)
}
