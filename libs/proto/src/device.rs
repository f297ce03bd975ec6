//! Device snapshot bag.
//!
//! The snapshot is produced by the node's inventory collector and consumed
//! opaquely: the agent attaches it to manifest requests as query parameters
//! and exposes it read-only to scripts; the server reads a handful of keys
//! for targeting.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Well-known snapshot keys, spelled the way the server reads them.
pub mod keys {
    pub const UUID: &str = "uuid";
    pub const HOSTNAME: &str = "hostname";
    pub const OS: &str = "os";
    pub const PLATFORM: &str = "platform";
    pub const PLATFORM_VERSION: &str = "platformVersion";
    pub const ARCH: &str = "arch";
    pub const BOOT_TIME: &str = "bootTime";
    pub const MACS: &str = "macs";
    pub const CPU_MODULE_NAME: &str = "cpuModuleName";
    pub const CPU_CORES: &str = "cpuCores";
    pub const CPU_MHZ: &str = "cpuMhz";
    pub const CPU_USAGE: &str = "cpuUsage";
    pub const TOTAL_MEMORY: &str = "totalmemory";
    pub const USED_MEMORY: &str = "usedMemory";
    pub const AVAILABLE_MEMORY: &str = "availableMemory";
    pub const TOTAL_DISK: &str = "totalDisk";
    pub const FREE_DISK: &str = "freeDisk";
    pub const NET_IN_RATE: &str = "netIRate";
    pub const NET_OUT_RATE: &str = "netORate";
    pub const WORKING_DIR: &str = "workingDir";
    pub const CHANNEL: &str = "channel";
    pub const VERSION: &str = "version";
}

/// Read-only key/value description of a node.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeviceSnapshot(BTreeMap<String, String>);

impl DeviceSnapshot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style insert.
    pub fn with(mut self, key: impl Into<String>, value: impl ToString) -> Self {
        self.insert(key, value);
        self
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl ToString) {
        self.0.insert(key.into(), value.to_string());
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    /// Parse a numeric entry; missing or malformed values read as `None`.
    pub fn get_parsed<T: std::str::FromStr>(&self, key: &str) -> Option<T> {
        self.get(key).and_then(|v| v.parse().ok())
    }

    pub fn uuid(&self) -> Option<&str> {
        self.get(keys::UUID).filter(|v| !v.is_empty())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Pairs suitable for `reqwest::RequestBuilder::query`.
    pub fn query_pairs(&self) -> Vec<(&str, &str)> {
        self.iter().collect()
    }
}

impl From<BTreeMap<String, String>> for DeviceSnapshot {
    fn from(map: BTreeMap<String, String>) -> Self {
        Self(map)
    }
}

impl FromIterator<(String, String)> for DeviceSnapshot {
    fn from_iter<I: IntoIterator<Item = (String, String)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}
