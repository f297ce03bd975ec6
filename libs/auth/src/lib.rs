//! # fleet-auth
//!
//! Node identity primitives shared by the agent and the server.
//!
//! The sign/verify capability is opaque to both sides: the agent holds a
//! [`NodeSigner`], the server holds a [`SignatureVerifier`], and the only
//! things on the wire are a URL-safe base64 verification key and a hex
//! signature over the node id.
//!
//! ## Modules
//!
//! - `signer`: signing and verification traits plus the keyed-digest scheme
//! - `token`: bearer token generation and storage hashing

mod signer;
mod token;

use thiserror::Error;

pub use signer::{
    decode_key, encode_key, KeyedDigest, NodeSigner, SignatureVerifier, MIN_KEY_BYTES,
};
pub use token::{generate_node_token, hash_token, NODE_TOKEN_PREFIX, TOKEN_BYTES};

/// Authentication errors.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum AuthError {
    /// The verification key is not valid URL-safe base64.
    #[error("verification key is not valid base64")]
    KeyEncoding,

    /// The key decoded but is not acceptable to the scheme.
    #[error("verification key rejected: {0}")]
    KeyRejected(String),

    /// The signature is not valid hex.
    #[error("signature is not valid hex")]
    SignatureEncoding,

    /// The signature does not match the message under the key.
    #[error("signature verification failed")]
    BadSignature,
}
