//! Reconciliation primitives for script fleets.
//!
//! This library provides the pure, side-effect free pieces of the agent's
//! convergence logic:
//!
//! - **Content fingerprints**: MD5 digests over script bytes, the form the
//!   fleet server advertises.
//! - **Script content**: immutable bytes that are only trusted once their
//!   fingerprint matches what the distributor advertised.
//! - **Manifest digests**: a digest over a whole manifest, used to skip
//!   reconciliation when nothing changed.
//! - **Change planning**: the remove/create delta between a running registry
//!   and a freshly accepted manifest.
//!
//! # Invariants
//!
//! - Decisions are deterministic given the same inputs
//! - Planning the same manifest against its own result yields no changes
//! - Unverified content can never be turned into a `ScriptContent` through
//!   the remote path

use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use md5::Md5;
use serde::Serialize;
use sha2::{Digest, Sha256};
use thiserror::Error;

/// Reconciliation errors.
#[derive(Debug, Error)]
pub enum ReconcileError {
    /// Fetched content does not hash to the advertised fingerprint.
    #[error("fingerprint mismatch: advertised {expected}, got {actual}")]
    FingerprintMismatch { expected: String, actual: String },

    /// A manifest could not be serialized for digesting.
    #[error("manifest serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
}

// =============================================================================
// Fingerprints
// =============================================================================

/// Content fingerprint: lowercase hex MD5 over the bytes.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Fingerprint(String);

impl Fingerprint {
    /// Compute the fingerprint of a byte buffer.
    pub fn of(bytes: &[u8]) -> Self {
        let digest = Md5::digest(bytes);
        Self(hex::encode(digest))
    }

    /// Wrap an advertised fingerprint, normalizing case and whitespace.
    pub fn advertised(value: &str) -> Self {
        Self(value.trim().to_ascii_lowercase())
    }

    /// Compare against an advertised fingerprint string.
    pub fn matches(&self, advertised: &str) -> bool {
        self.0 == advertised.trim().to_ascii_lowercase()
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Immutable script bytes plus their fingerprint.
///
/// New content supersedes old content; a `ScriptContent` is never mutated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScriptContent {
    bytes: Arc<[u8]>,
    fingerprint: Fingerprint,
}

impl ScriptContent {
    /// Content read from local storage. Local content was verified when it
    /// was written, so it is trusted as-is.
    pub fn from_local(bytes: impl Into<Vec<u8>>) -> Self {
        let bytes: Vec<u8> = bytes.into();
        let fingerprint = Fingerprint::of(&bytes);
        Self {
            bytes: bytes.into(),
            fingerprint,
        }
    }

    /// Content fetched from a distributor, accepted only if it hashes to the
    /// advertised fingerprint.
    pub fn verified(bytes: impl Into<Vec<u8>>, advertised: &str) -> Result<Self, ReconcileError> {
        let content = Self::from_local(bytes);
        if !content.fingerprint.matches(advertised) {
            return Err(ReconcileError::FingerprintMismatch {
                expected: advertised.to_string(),
                actual: content.fingerprint.to_string(),
            });
        }
        Ok(content)
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn fingerprint(&self) -> &Fingerprint {
        &self.fingerprint
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

// =============================================================================
// Manifest Digest
// =============================================================================

/// Digest over a whole manifest, for change detection.
///
/// The manifest is serialized to canonical JSON (sorted keys, no extra
/// whitespace) so that field ordering never produces a spurious change.
/// Element order is significant: a reordered manifest is a different manifest.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ManifestDigest(String);

impl ManifestDigest {
    /// Compute the digest of any serializable manifest.
    pub fn of<T: Serialize + ?Sized>(manifest: &T) -> Result<Self, ReconcileError> {
        let value = serde_json::to_value(manifest)?;
        Ok(Self::from_json(&value))
    }

    /// Compute the digest from canonical JSON.
    pub fn from_json(json: &serde_json::Value) -> Self {
        let canonical = canonical_json(json);
        let mut hasher = Sha256::new();
        hasher.update(canonical.as_bytes());
        let result = hasher.finalize();
        Self(format!("sha256:{}", hex::encode(&result[..16]))) // First 16 bytes (128 bits)
    }

    /// Rebuild a digest from its persisted string form.
    pub fn from_persisted(value: &str) -> Self {
        Self(value.trim().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ManifestDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Produce canonical JSON (sorted keys, no extra whitespace).
fn canonical_json(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::Object(map) => {
            let mut pairs: Vec<_> = map.iter().collect();
            pairs.sort_by_key(|(k, _)| *k);
            let inner: Vec<String> = pairs
                .iter()
                .map(|(k, v)| format!("\"{}\":{}", escape_json_string(k), canonical_json(v)))
                .collect();
            format!("{{{}}}", inner.join(","))
        }
        serde_json::Value::Array(arr) => {
            let inner: Vec<String> = arr.iter().map(canonical_json).collect();
            format!("[{}]", inner.join(","))
        }
        serde_json::Value::String(s) => format!("\"{}\"", escape_json_string(s)),
        serde_json::Value::Number(n) => n.to_string(),
        serde_json::Value::Bool(b) => b.to_string(),
        serde_json::Value::Null => "null".to_string(),
    }
}

fn escape_json_string(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            c if c.is_control() => {
                out.push_str(&format!("\\u{:04x}", c as u32));
            }
            c => out.push(c),
        }
    }
    out
}

// =============================================================================
// Manifest Filtering
// =============================================================================

/// Remove entries whose key was already seen. The first occurrence wins and
/// relative order is preserved.
///
/// Returns `(kept, dropped)`.
pub fn dedup_by_key<T, F>(items: Vec<T>, key: F) -> (Vec<T>, Vec<T>)
where
    F: Fn(&T) -> &str,
{
    let mut seen = HashSet::new();
    let mut kept = Vec::with_capacity(items.len());
    let mut dropped = Vec::new();

    for item in items {
        if seen.insert(key(&item).to_string()) {
            kept.push(item);
        } else {
            dropped.push(item);
        }
    }

    (kept, dropped)
}

// =============================================================================
// Change Planning
// =============================================================================

/// Delta between a running registry and a desired manifest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeSet<T> {
    /// Keys present now but absent from the manifest.
    pub removed: Vec<String>,

    /// Entries present in both whose contents differ (stop, then recreate).
    pub changed: Vec<T>,

    /// Entries absent now but present in the manifest.
    pub added: Vec<T>,

    /// Keys present in both with identical contents. Left untouched.
    pub unchanged: Vec<String>,
}

impl<T> ChangeSet<T> {
    /// True when applying this change set would not touch the registry.
    pub fn is_empty(&self) -> bool {
        self.removed.is_empty() && self.changed.is_empty() && self.added.is_empty()
    }

    /// Keys whose current entry must be stopped, in apply order.
    pub fn to_stop<'a>(&'a self, key: impl Fn(&T) -> &str + 'a) -> impl Iterator<Item = String> + 'a {
        self.removed
            .iter()
            .cloned()
            .chain(self.changed.iter().map(move |t| key(t).to_string()))
    }

    /// Entries that must be started, in manifest order.
    pub fn to_start(&self) -> impl Iterator<Item = &T> {
        self.changed.iter().chain(self.added.iter())
    }
}

/// Compute the delta between `current` and `desired`.
///
/// `desired` is expected to be de-duplicated already; a duplicated key is
/// planned by its first occurrence.
pub fn plan_changes<T, F>(current: &BTreeMap<String, T>, desired: &[T], key: F) -> ChangeSet<T>
where
    T: Clone + PartialEq,
    F: Fn(&T) -> &str,
{
    let mut desired_keys = HashSet::new();
    let mut changed = Vec::new();
    let mut added = Vec::new();
    let mut unchanged = Vec::new();

    for entry in desired {
        let k = key(entry);
        if !desired_keys.insert(k.to_string()) {
            continue;
        }

        match current.get(k) {
            Some(existing) if existing == entry => unchanged.push(k.to_string()),
            Some(_) => changed.push(entry.clone()),
            None => added.push(entry.clone()),
        }
    }

    let removed = current
        .keys()
        .filter(|k| !desired_keys.contains(k.as_str()))
        .cloned()
        .collect();

    ChangeSet {
        removed,
        changed,
        added,
        unchanged,
    }
}

// =============================================================================
// Retry Tracking
// =============================================================================

/// Retry tracker for failed operations.
#[derive(Debug, Clone)]
pub struct RetryTracker {
    /// Maximum retries per resource.
    max_retries: u32,

    /// Retry window duration.
    window: Duration,

    /// Tracked failures: resource_key -> (count, first_failure_time).
    failures: BTreeMap<String, (u32, Instant)>,
}

impl RetryTracker {
    /// Create a new retry tracker.
    pub fn new(max_retries: u32, window: Duration) -> Self {
        Self {
            max_retries,
            window,
            failures: BTreeMap::new(),
        }
    }

    /// Record a failure for a resource.
    ///
    /// Returns true if retries are exhausted.
    pub fn record_failure(&mut self, resource_key: &str) -> bool {
        let now = Instant::now();

        let (count, first) = self
            .failures
            .entry(resource_key.to_string())
            .or_insert((0, now));

        // Reset if outside window
        if now.duration_since(*first) > self.window {
            *count = 0;
            *first = now;
        }

        *count += 1;
        *count > self.max_retries
    }

    /// Check if retries are exhausted for a resource.
    pub fn is_exhausted(&self, resource_key: &str) -> bool {
        let Some((count, first)) = self.failures.get(resource_key) else {
            return false;
        };

        let now = Instant::now();
        if now.duration_since(*first) > self.window {
            return false;
        }

        *count > self.max_retries
    }

    /// Clear failure tracking for a resource (on success).
    pub fn clear(&mut self, resource_key: &str) {
        self.failures.remove(resource_key);
    }

    /// Prune expired entries.
    pub fn prune(&mut self) {
        let now = Instant::now();
        self.failures
            .retain(|_, (_, first)| now.duration_since(*first) <= self.window);
    }
}

/// Default interval between update checks.
pub const DEFAULT_CHECK_INTERVAL: Duration = Duration::from_secs(60);

/// Default retry limit for a degraded application within one window.
pub const DEFAULT_MAX_RETRIES: u32 = 5;

/// Default retry window.
pub const DEFAULT_RETRY_WINDOW: Duration = Duration::from_secs(10 * 60); // 10 minutes
