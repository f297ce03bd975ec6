//! Bearer tokens issued at login.
//!
//! Only the SHA-256 of each token is kept; the raw value is returned to the
//! node once and never stored.

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use fleet_auth::{generate_node_token, hash_token};
use tokio::sync::RwLock;

#[derive(Debug, Clone, PartialEq, Eq)]
struct TokenRecord {
    node_id: String,
    expires_at: DateTime<Utc>,
}

#[derive(Debug)]
pub struct TokenStore {
    ttl: chrono::Duration,
    tokens: RwLock<HashMap<String, TokenRecord>>,
}

impl TokenStore {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl: chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::MAX),
            tokens: RwLock::new(HashMap::new()),
        }
    }

    /// Issue a token bound to `node_id`, returning the raw token.
    pub async fn issue(&self, node_id: &str, now: DateTime<Utc>) -> String {
        let token = generate_node_token();
        let record = TokenRecord {
            node_id: node_id.to_string(),
            expires_at: now.checked_add_signed(self.ttl).unwrap_or(DateTime::<Utc>::MAX_UTC),
        };
        self.tokens.write().await.insert(hash_token(&token), record);
        token
    }

    /// Node id the token was issued to, if it is known and unexpired.
    pub async fn validate(&self, token: &str, now: DateTime<Utc>) -> Option<String> {
        let hash = hash_token(token);
        let tokens = self.tokens.read().await;
        tokens
            .get(&hash)
            .filter(|record| record.expires_at > now)
            .map(|record| record.node_id.clone())
    }

    /// Drop every token issued to `node_id`.
    pub async fn revoke_node(&self, node_id: &str) -> usize {
        let mut tokens = self.tokens.write().await;
        let before = tokens.len();
        tokens.retain(|_, record| record.node_id != node_id);
        before - tokens.len()
    }

    pub async fn purge_expired(&self, now: DateTime<Utc>) -> usize {
        let mut tokens = self.tokens.write().await;
        let before = tokens.len();
        tokens.retain(|_, record| record.expires_at > now);
        before - tokens.len()
    }

    pub async fn len(&self) -> usize {
        self.tokens.read().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_issued_token_validates_until_expiry() {
        let store = TokenStore::new(Duration::from_secs(60));
        let now = Utc::now();
        let token = store.issue("node-1", now).await;

        assert!(token.starts_with("fnt_"));
        assert_eq!(store.validate(&token, now).await.as_deref(), Some("node-1"));

        let later = now + chrono::Duration::seconds(61);
        assert_eq!(store.validate(&token, later).await, None);
        assert_eq!(store.purge_expired(later).await, 1);
        assert_eq!(store.len().await, 0);
    }

    #[tokio::test]
    async fn test_unknown_token_rejected() {
        let store = TokenStore::new(Duration::from_secs(60));
        store.issue("node-1", Utc::now()).await;

        assert_eq!(store.validate("fnt_forged", Utc::now()).await, None);
    }

    #[tokio::test]
    async fn test_revoke_node_keeps_other_nodes() {
        let store = TokenStore::new(Duration::from_secs(60));
        let now = Utc::now();
        let first = store.issue("node-1", now).await;
        store.issue("node-1", now).await;
        let other = store.issue("node-2", now).await;

        assert_eq!(store.revoke_node("node-1").await, 2);
        assert_eq!(store.validate(&first, now).await, None);
        assert_eq!(store.validate(&other, now).await.as_deref(), Some("node-2"));
    }
}
