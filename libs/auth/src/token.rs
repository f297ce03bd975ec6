//! Bearer token generation and hashing.
//!
//! Token format: `fnt_<32 random bytes, URL-safe base64>`. Servers store only
//! the SHA-256 hex of a token, never the token itself.

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use rand::Rng;
use sha2::{Digest, Sha256};

/// Prefix carried by every node bearer token.
pub const NODE_TOKEN_PREFIX: &str = "fnt_";

/// Token bytes (32 bytes = 256 bits of entropy).
pub const TOKEN_BYTES: usize = 32;

/// Generate a new node bearer token.
pub fn generate_node_token() -> String {
    let mut bytes = [0u8; TOKEN_BYTES];
    rand::rng().fill(&mut bytes);
    let encoded = URL_SAFE_NO_PAD.encode(bytes);
    format!("{}{}", NODE_TOKEN_PREFIX, encoded)
}

/// Hash a token for storage using SHA-256.
/// The hash is returned as a hex string.
pub fn hash_token(token: &str) -> String {
    let digest = Sha256::digest(token.as_bytes());
    format!("{:x}", digest)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_token_format() {
        let token = generate_node_token();
        assert!(token.starts_with(NODE_TOKEN_PREFIX));
        // 32 bytes -> 43 chars without padding
        assert_eq!(token.len(), NODE_TOKEN_PREFIX.len() + 43);
    }

    #[test]
    fn test_tokens_are_unique() {
        assert_ne!(generate_node_token(), generate_node_token());
    }

    #[test]
    fn test_hash_is_stable_hex() {
        let hash = hash_token("fnt_abc");
        assert_eq!(hash, hash_token("fnt_abc"));
        assert_eq!(hash.len(), 64);
        assert!(hash.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(hash, hash_token("fnt_abd"));
    }
}
