//! The fleet file: published scripts, applications, and the rules that pick
//! which of them a node receives.
//!
//! ```json
//! {
//!   "luaList": [{"name": "agent-linux", "version": "1.2.0", "md5": "...", "url": "...", "os": "linux"}],
//!   "appList": [{"name": "probe", "appDir": "probe", "scriptName": "main.lua",
//!                "scriptMD5": "...", "scriptURL": "...", "reqResources": ["small-linux"]}],
//!   "resources": {"small-linux": {"os": "linux", "minCPU": 2, "minMemoryMB": 1024, "minDiskGB": 10}},
//!   "testNodes": {"<uuid>": {"luaScript": "agent-canary", "apps": ["probe"]}},
//!   "channelApps": {"edge": ["probe"]}
//! }
//! ```

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use fleet_proto::{keys, AppDescriptor, DeviceSnapshot, ScriptFile};
use serde::{Deserialize, Serialize};
use thiserror::Error;

const BYTES_PER_MB: u64 = 1024 * 1024;
const BYTES_PER_GB: u64 = 1024 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum FleetFileError {
    #[error("failed to read fleet file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("malformed fleet file {path}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FleetFile {
    #[serde(default)]
    pub lua_list: Vec<ScriptFile>,

    #[serde(default)]
    pub app_list: Vec<FleetApp>,

    #[serde(default)]
    pub resources: HashMap<String, Resource>,

    /// Per-uuid overrides used to canary scripts and apps on chosen nodes.
    #[serde(default)]
    pub test_nodes: HashMap<String, TestNode>,

    #[serde(default)]
    pub channel_apps: HashMap<String, Vec<String>>,
}

/// An application as published in the fleet file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FleetApp {
    #[serde(alias = "appName")]
    pub name: String,

    #[serde(default)]
    pub app_dir: String,

    pub script_name: String,

    #[serde(default)]
    pub app_version: String,

    #[serde(rename = "scriptMD5")]
    pub script_md5: String,

    #[serde(rename = "scriptURL")]
    pub script_url: String,

    /// Names of [`Resource`] profiles; any one satisfied selects the app.
    #[serde(default)]
    pub req_resources: Vec<String>,

    #[serde(default)]
    pub tag: String,
}

impl FleetApp {
    pub fn descriptor(&self) -> AppDescriptor {
        AppDescriptor {
            app_name: self.name.clone(),
            app_dir: self.app_dir.clone(),
            script_name: self.script_name.clone(),
            script_md5: self.script_md5.clone(),
            script_url: self.script_url.clone(),
            tag: self.tag.clone(),
        }
    }
}

/// Minimum hardware profile an app can require.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resource {
    #[serde(default)]
    pub name: String,

    #[serde(default)]
    pub os: String,

    #[serde(rename = "minCPU", default)]
    pub min_cpu: u64,

    #[serde(rename = "minMemoryMB", default)]
    pub min_memory_mb: u64,

    #[serde(rename = "minDiskGB", default)]
    pub min_disk_gb: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TestNode {
    #[serde(default)]
    pub lua_script: String,

    #[serde(default)]
    pub apps: Vec<String>,
}

/// Hardware a node reports in its device query.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NodeCapacity<'a> {
    pub os: &'a str,
    pub cpu_cores: u64,
    pub memory_mb: u64,
    pub disk_gb: u64,
}

impl<'a> NodeCapacity<'a> {
    /// Missing or unparsable values count as zero.
    pub fn of(device: &'a DeviceSnapshot) -> Self {
        let number = |key: &str| device.get_parsed::<u64>(key).unwrap_or(0);
        Self {
            os: device.get(keys::OS).unwrap_or_default(),
            cpu_cores: number(keys::CPU_CORES),
            memory_mb: number(keys::TOTAL_MEMORY) / BYTES_PER_MB,
            disk_gb: number(keys::TOTAL_DISK) / BYTES_PER_GB,
        }
    }
}

enum Selection<'a> {
    Named(&'a [String]),
    Resources(NodeCapacity<'a>),
}

impl Resource {
    pub fn satisfied_by(&self, node: &NodeCapacity<'_>) -> bool {
        self.os == node.os
            && node.cpu_cores >= self.min_cpu
            && node.memory_mb >= self.min_memory_mb
            && node.disk_gb >= self.min_disk_gb
    }
}

impl FleetFile {
    pub fn load(path: &Path) -> Result<Self, FleetFileError> {
        let raw = std::fs::read(path).map_err(|source| FleetFileError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_slice(&raw).map_err(|source| FleetFileError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    fn test_node(&self, device: &DeviceSnapshot) -> Option<&TestNode> {
        device.uuid().and_then(|uuid| self.test_nodes.get(uuid))
    }

    /// Script advertised to an agent.
    ///
    /// A test node with a `luaScript` gets that script by name and nothing
    /// else; every other node gets the first script for its OS.
    pub fn script_for(&self, device: &DeviceSnapshot) -> Option<&ScriptFile> {
        let pinned = self
            .test_node(device)
            .map(|node| node.lua_script.as_str())
            .filter(|name| !name.is_empty());

        match pinned {
            Some(name) => self.lua_list.iter().find(|f| f.name == name),
            None => {
                let os = device.get(keys::OS).unwrap_or_default();
                self.lua_list.iter().find(|f| f.os == os)
            }
        }
    }

    /// Application manifest for a controller, in fleet file order.
    ///
    /// Test-node app lists win over the node's channel, and the channel
    /// wins over resource matching.
    pub fn apps_for(&self, device: &DeviceSnapshot) -> Vec<AppDescriptor> {
        let rule = self.selection_rule(device);
        self.app_list
            .iter()
            .filter(|app| match &rule {
                Selection::Named(names) => names.contains(&app.name),
                Selection::Resources(node) => self.fits(app, node),
            })
            .map(FleetApp::descriptor)
            .collect()
    }

    fn selection_rule<'a>(&'a self, device: &'a DeviceSnapshot) -> Selection<'a> {
        if let Some(node) = self.test_node(device).filter(|node| !node.apps.is_empty()) {
            return Selection::Named(&node.apps);
        }
        match device.get(keys::CHANNEL).filter(|c| !c.is_empty()) {
            Some(channel) => Selection::Named(
                self.channel_apps
                    .get(channel)
                    .map(Vec::as_slice)
                    .unwrap_or_default(),
            ),
            None => Selection::Resources(NodeCapacity::of(device)),
        }
    }

    fn fits(&self, app: &FleetApp, node: &NodeCapacity<'_>) -> bool {
        app.req_resources
            .iter()
            .filter_map(|name| self.resources.get(name))
            .any(|resource| resource.satisfied_by(node))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn fleet() -> FleetFile {
        serde_json::from_value(serde_json::json!({
            "luaList": [
                {"name": "agent-linux", "version": "1", "md5": "aa", "url": "http://s/linux.lua", "os": "linux"},
                {"name": "agent-windows", "version": "1", "md5": "bb", "url": "http://s/win.lua", "os": "windows"},
                {"name": "agent-canary", "version": "2", "md5": "cc", "url": "http://s/canary.lua", "os": "linux"}
            ],
            "appList": [
                {"name": "small", "appDir": "small", "scriptName": "main.lua",
                 "scriptMD5": "11", "scriptURL": "http://s/small.lua", "reqResources": ["small-linux"]},
                {"name": "large", "appDir": "large", "scriptName": "main.lua",
                 "scriptMD5": "22", "scriptURL": "http://s/large.lua", "reqResources": ["missing", "large-linux"]},
                {"name": "edge", "appDir": "edge", "scriptName": "main.lua",
                 "scriptMD5": "33", "scriptURL": "http://s/edge.lua"}
            ],
            "resources": {
                "small-linux": {"os": "linux", "minCPU": 2, "minMemoryMB": 1024, "minDiskGB": 10},
                "large-linux": {"os": "linux", "minCPU": 8, "minMemoryMB": 16384, "minDiskGB": 100}
            },
            "testNodes": {
                "canary-1": {"luaScript": "agent-canary", "apps": ["large"]},
                "canary-2": {"luaScript": "", "apps": []}
            },
            "channelApps": {"cdn": ["edge", "small"]}
        }))
        .unwrap()
    }

    fn device(os: &str, cores: u64, memory_mb: u64, disk_gb: u64) -> DeviceSnapshot {
        DeviceSnapshot::new()
            .with(keys::OS, os)
            .with(keys::CPU_CORES, cores)
            .with(keys::TOTAL_MEMORY, memory_mb * BYTES_PER_MB)
            .with(keys::TOTAL_DISK, disk_gb * BYTES_PER_GB)
    }

    fn names(apps: &[AppDescriptor]) -> Vec<&str> {
        apps.iter().map(|a| a.app_name.as_str()).collect()
    }

    #[rstest]
    #[case::by_os("linux", None, Some("agent-linux"))]
    #[case::other_os("windows", None, Some("agent-windows"))]
    #[case::unknown_os("plan9", None, None)]
    #[case::pinned("windows", Some("canary-1"), Some("agent-canary"))]
    #[case::empty_pin_falls_back("linux", Some("canary-2"), Some("agent-linux"))]
    fn test_script_selection(
        #[case] os: &str,
        #[case] uuid: Option<&str>,
        #[case] expected: Option<&str>,
    ) {
        let mut device = DeviceSnapshot::new().with(keys::OS, os);
        if let Some(uuid) = uuid {
            device.insert(keys::UUID, uuid);
        }

        let fleet = fleet();
        let chosen = fleet.script_for(&device).map(|f| f.name.as_str());
        assert_eq!(chosen, expected);
    }

    #[rstest]
    #[case::too_small(device("linux", 1, 4096, 50), vec![])]
    #[case::small(device("linux", 2, 1024, 10), vec!["small"])]
    #[case::large(device("linux", 16, 32768, 500), vec!["small", "large"])]
    #[case::wrong_os(device("windows", 16, 32768, 500), vec![])]
    fn test_apps_selected_by_resources(#[case] device: DeviceSnapshot, #[case] expected: Vec<&str>) {
        assert_eq!(names(&fleet().apps_for(&device)), expected);
    }

    #[test]
    fn test_channel_overrides_resources() {
        let device = device("linux", 16, 32768, 500).with(keys::CHANNEL, "cdn");
        assert_eq!(names(&fleet().apps_for(&device)), vec!["small", "edge"]);

        let unknown = device.with(keys::CHANNEL, "nowhere");
        assert!(fleet().apps_for(&unknown).is_empty());
    }

    #[test]
    fn test_test_node_apps_override_channel() {
        let device = device("windows", 1, 1, 1)
            .with(keys::CHANNEL, "cdn")
            .with(keys::UUID, "canary-1");
        assert_eq!(names(&fleet().apps_for(&device)), vec!["large"]);
    }

    #[test]
    fn test_descriptor_uses_wire_names() {
        let apps = fleet().apps_for(&DeviceSnapshot::new().with(keys::CHANNEL, "cdn"));
        let json = serde_json::to_value(&apps[0]).unwrap();

        assert_eq!(json["appName"], "small");
        assert_eq!(json["scriptMD5"], "11");
        assert!(json.get("reqResources").is_none());
    }

    #[test]
    fn test_load_reports_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fleet.json");
        std::fs::write(&path, "{ not json").unwrap();

        let err = FleetFile::load(&path).unwrap_err();
        assert!(matches!(err, FleetFileError::Parse { .. }));
        assert!(err.to_string().contains("fleet.json"));

        assert!(matches!(
            FleetFile::load(&dir.path().join("absent.json")),
            Err(FleetFileError::Read { .. })
        ));
    }
}
