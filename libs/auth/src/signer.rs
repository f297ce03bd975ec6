//! Sign/verify capability for node login.
//!
//! The agent signs its node id; the server checks that signature against the
//! key the node registered. Both sides see keys only as bytes, so the scheme
//! can be swapped without touching the login protocol.

use base64::{
    engine::general_purpose::{URL_SAFE, URL_SAFE_NO_PAD},
    Engine as _,
};
use rand::Rng;
use sha2::{Digest, Sha256};

use crate::AuthError;

/// Minimum accepted key length in bytes.
pub const MIN_KEY_BYTES: usize = 16;

/// Signing half, held by the node.
pub trait NodeSigner: Send + Sync {
    /// Key material the server needs to verify this signer.
    fn verification_key(&self) -> Vec<u8>;

    /// Sign a message, returning a lowercase hex signature.
    fn sign(&self, message: &[u8]) -> String;
}

/// Verifying half, held by the server.
pub trait SignatureVerifier: Send + Sync {
    /// Reject keys the scheme cannot use.
    fn check_key(&self, key: &[u8]) -> Result<(), AuthError>;

    /// Verify a hex signature over `message` under `key`.
    fn verify(&self, key: &[u8], message: &[u8], signature_hex: &str) -> Result<(), AuthError>;
}

/// Keyed-digest scheme: `sha256(key || message)`.
///
/// The verification key is the signing key, so registration must happen over
/// a channel the operator trusts.
#[derive(Clone)]
pub struct KeyedDigest {
    key: Vec<u8>,
}

impl KeyedDigest {
    /// Generate a fresh 32-byte key.
    pub fn generate() -> Self {
        let mut key = vec![0u8; 32];
        rand::rng().fill(key.as_mut_slice());
        Self { key }
    }

    /// Wrap existing key material.
    pub fn from_key(key: Vec<u8>) -> Result<Self, AuthError> {
        Verifier.check_key(&key)?;
        Ok(Self { key })
    }

    /// The verifier matching this scheme.
    pub fn verifier() -> impl SignatureVerifier {
        Verifier
    }

    /// Raw key bytes, for persisting.
    pub fn key_bytes(&self) -> &[u8] {
        &self.key
    }
}

impl std::fmt::Debug for KeyedDigest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyedDigest")
            .field("key", &"<redacted>")
            .finish()
    }
}

impl NodeSigner for KeyedDigest {
    fn verification_key(&self) -> Vec<u8> {
        self.key.clone()
    }

    fn sign(&self, message: &[u8]) -> String {
        hex::encode(digest(&self.key, message))
    }
}

struct Verifier;

impl SignatureVerifier for Verifier {
    fn check_key(&self, key: &[u8]) -> Result<(), AuthError> {
        if key.len() < MIN_KEY_BYTES {
            return Err(AuthError::KeyRejected(format!(
                "key is {} bytes, need at least {}",
                key.len(),
                MIN_KEY_BYTES
            )));
        }
        Ok(())
    }

    fn verify(&self, key: &[u8], message: &[u8], signature_hex: &str) -> Result<(), AuthError> {
        self.check_key(key)?;
        let signature = hex::decode(signature_hex.trim()).map_err(|_| AuthError::SignatureEncoding)?;
        let expected = digest(key, message);

        if signature.len() != expected.len() {
            return Err(AuthError::BadSignature);
        }
        let diff = signature
            .iter()
            .zip(expected.iter())
            .fold(0u8, |acc, (a, b)| acc | (a ^ b));
        if diff != 0 {
            return Err(AuthError::BadSignature);
        }
        Ok(())
    }
}

fn digest(key: &[u8], message: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(key);
    hasher.update(message);
    hasher.finalize().into()
}

/// Encode key material for the `pub_key` query parameter.
pub fn encode_key(key: &[u8]) -> String {
    URL_SAFE_NO_PAD.encode(key)
}

/// Decode a `pub_key` parameter. Padded and unpadded forms are both accepted.
pub fn decode_key(encoded: &str) -> Result<Vec<u8>, AuthError> {
    let trimmed = encoded.trim();
    if trimmed.is_empty() {
        return Err(AuthError::KeyEncoding);
    }
    URL_SAFE_NO_PAD
        .decode(trimmed.trim_end_matches('='))
        .or_else(|_| URL_SAFE.decode(trimmed))
        .map_err(|_| AuthError::KeyEncoding)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn test_sign_then_verify() {
        let signer = KeyedDigest::generate();
        let signature = signer.sign(b"node-1");

        let verifier = KeyedDigest::verifier();
        assert_eq!(
            verifier.verify(&signer.verification_key(), b"node-1", &signature),
            Ok(())
        );
    }

    #[test]
    fn test_signature_bound_to_message() {
        let signer = KeyedDigest::generate();
        let signature = signer.sign(b"node-1");

        let verifier = KeyedDigest::verifier();
        assert_eq!(
            verifier.verify(&signer.verification_key(), b"node-2", &signature),
            Err(AuthError::BadSignature)
        );
    }

    #[test]
    fn test_signature_bound_to_key() {
        let signer = KeyedDigest::generate();
        let other = KeyedDigest::generate();
        let signature = signer.sign(b"node-1");

        let verifier = KeyedDigest::verifier();
        assert_eq!(
            verifier.verify(&other.verification_key(), b"node-1", &signature),
            Err(AuthError::BadSignature)
        );
    }

    #[rstest]
    #[case("zz-not-hex", AuthError::SignatureEncoding)]
    #[case("abcd", AuthError::BadSignature)]
    fn test_malformed_signatures(#[case] signature: &str, #[case] expected: AuthError) {
        let signer = KeyedDigest::generate();
        let verifier = KeyedDigest::verifier();
        assert_eq!(
            verifier.verify(&signer.verification_key(), b"node-1", signature),
            Err(expected)
        );
    }

    #[test]
    fn test_short_key_rejected() {
        assert!(matches!(
            KeyedDigest::from_key(vec![1, 2, 3]),
            Err(AuthError::KeyRejected(_))
        ));
    }

    #[rstest]
    #[case(false)]
    #[case(true)]
    fn test_key_encoding_round_trip(#[case] padded: bool) {
        let key = KeyedDigest::generate().verification_key();
        let encoded = if padded {
            URL_SAFE.encode(&key)
        } else {
            encode_key(&key)
        };
        assert_eq!(decode_key(&encoded), Ok(key));
    }

    #[rstest]
    #[case("")]
    #[case("not base64 !!")]
    fn test_bad_key_encoding(#[case] encoded: &str) {
        assert_eq!(decode_key(encoded), Err(AuthError::KeyEncoding));
    }
}
