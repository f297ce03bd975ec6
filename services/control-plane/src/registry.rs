//! In-memory view of the fleet: live agents and controllers, registered
//! node keys, and the app metrics each node last pushed.

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use fleet_proto::{AppMetric, DeviceSnapshot};
use serde::Serialize;

/// A node polling for its top-level script.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentRecord {
    pub uuid: String,
    pub device: DeviceSnapshot,
    pub last_seen: DateTime<Utc>,
}

/// A node running the fleet reconciler.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ControllerRecord {
    pub node_id: String,
    pub device: DeviceSnapshot,
    /// App names last handed to this controller.
    pub apps: Vec<String>,
    pub last_seen: DateTime<Utc>,
}

#[derive(Debug, Clone)]
struct RegisteredNode {
    key: Vec<u8>,
    registered_at: DateTime<Utc>,
    last_activity: Option<DateTime<Utc>>,
    metrics: Vec<AppMetric>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeState {
    Online,
    Offline,
}

/// A registered node as shown on `/api/nodelist`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeView {
    pub node_id: String,
    pub state: NodeState,
    pub registered_at: DateTime<Utc>,
    pub last_activity: Option<DateTime<Utc>>,
    pub apps: Vec<AppMetric>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Registration {
    Created,
    Unchanged,
    KeyReplaced,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub agents: usize,
    pub controllers: usize,
}

#[derive(Debug, Default)]
pub struct NodeRegistry {
    agents: BTreeMap<String, AgentRecord>,
    controllers: BTreeMap<String, ControllerRecord>,
    nodes: BTreeMap<String, RegisteredNode>,
}

impl NodeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an agent poll. Snapshots without a uuid are not tracked.
    pub fn touch_agent(&mut self, device: &DeviceSnapshot, now: DateTime<Utc>) -> bool {
        let Some(uuid) = device.uuid().filter(|u| !u.is_empty()) else {
            return false;
        };
        self.agents.insert(
            uuid.to_string(),
            AgentRecord {
                uuid: uuid.to_string(),
                device: device.clone(),
                last_seen: now,
            },
        );
        true
    }

    pub fn touch_controller(
        &mut self,
        node_id: &str,
        device: &DeviceSnapshot,
        apps: Vec<String>,
        now: DateTime<Utc>,
    ) {
        self.controllers.insert(
            node_id.to_string(),
            ControllerRecord {
                node_id: node_id.to_string(),
                device: device.clone(),
                apps,
                last_seen: now,
            },
        );
        self.mark_active(node_id, now);
    }

    pub fn register(&mut self, node_id: &str, key: Vec<u8>, now: DateTime<Utc>) -> Registration {
        match self.nodes.get_mut(node_id) {
            Some(node) if node.key == key => Registration::Unchanged,
            Some(node) => {
                node.key = key;
                node.registered_at = now;
                Registration::KeyReplaced
            }
            None => {
                self.nodes.insert(
                    node_id.to_string(),
                    RegisteredNode {
                        key,
                        registered_at: now,
                        last_activity: None,
                        metrics: Vec::new(),
                    },
                );
                Registration::Created
            }
        }
    }

    pub fn key_of(&self, node_id: &str) -> Option<&[u8]> {
        self.nodes.get(node_id).map(|node| node.key.as_slice())
    }

    /// Refresh liveness. Returns false for an unregistered node.
    pub fn mark_active(&mut self, node_id: &str, now: DateTime<Utc>) -> bool {
        if let Some(controller) = self.controllers.get_mut(node_id) {
            controller.last_seen = now;
        }
        match self.nodes.get_mut(node_id) {
            Some(node) => {
                node.last_activity = Some(now);
                true
            }
            None => false,
        }
    }

    /// Replace the node's app metrics. Returns false for an unregistered node.
    pub fn record_metrics(&mut self, node_id: &str, metrics: Vec<AppMetric>, now: DateTime<Utc>) -> bool {
        if !self.mark_active(node_id, now) {
            return false;
        }
        if let Some(node) = self.nodes.get_mut(node_id) {
            node.metrics = metrics;
        }
        true
    }

    pub fn agents(&self) -> Vec<AgentRecord> {
        self.agents.values().cloned().collect()
    }

    pub fn controllers(&self) -> Vec<ControllerRecord> {
        self.controllers.values().cloned().collect()
    }

    /// Registered nodes; a node is online if it was active within `offline_after`.
    pub fn nodes(&self, now: DateTime<Utc>, offline_after: Duration) -> Vec<NodeView> {
        self.nodes
            .iter()
            .map(|(node_id, node)| NodeView {
                node_id: node_id.clone(),
                state: match node.last_activity {
                    Some(at) if !is_stale(at, now, offline_after) => NodeState::Online,
                    _ => NodeState::Offline,
                },
                registered_at: node.registered_at,
                last_activity: node.last_activity,
                apps: node.metrics.clone(),
            })
            .collect()
    }

    /// Drop agents and controllers not seen within `offline_after`.
    ///
    /// Registered keys and metrics survive so returning nodes can log in.
    pub fn sweep(&mut self, now: DateTime<Utc>, offline_after: Duration) -> SweepReport {
        let agents = self.agents.len();
        let controllers = self.controllers.len();
        self.agents
            .retain(|_, agent| !is_stale(agent.last_seen, now, offline_after));
        self.controllers
            .retain(|_, controller| !is_stale(controller.last_seen, now, offline_after));
        SweepReport {
            agents: agents - self.agents.len(),
            controllers: controllers - self.controllers.len(),
        }
    }
}

fn is_stale(seen: DateTime<Utc>, now: DateTime<Utc>, offline_after: Duration) -> bool {
    (now - seen).to_std().is_ok_and(|idle| idle > offline_after)
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleet_proto::{keys, AppDescriptor};

    const OFFLINE: Duration = Duration::from_secs(120);

    fn secs(n: i64) -> chrono::Duration {
        chrono::Duration::seconds(n)
    }

    fn metric(app: &str, value: &str) -> AppMetric {
        AppMetric::new(
            AppDescriptor {
                app_name: app.to_string(),
                app_dir: app.to_string(),
                script_name: "main.lua".to_string(),
                script_md5: "00".to_string(),
                script_url: "http://s/main.lua".to_string(),
                tag: String::new(),
            },
            value,
        )
    }

    #[test]
    fn test_register_same_key_is_no_op() {
        let mut registry = NodeRegistry::new();
        let t0 = Utc::now();

        assert_eq!(registry.register("n1", vec![1; 32], t0), Registration::Created);
        assert_eq!(registry.register("n1", vec![1; 32], t0 + secs(5)), Registration::Unchanged);
        assert_eq!(registry.nodes(t0, OFFLINE)[0].registered_at, t0);

        assert_eq!(registry.register("n1", vec![2; 32], t0 + secs(9)), Registration::KeyReplaced);
        assert_eq!(registry.key_of("n1"), Some(&[2u8; 32][..]));
    }

    #[test]
    fn test_agents_without_uuid_are_ignored() {
        let mut registry = NodeRegistry::new();
        let now = Utc::now();

        assert!(!registry.touch_agent(&DeviceSnapshot::new().with(keys::OS, "linux"), now));
        assert!(registry.touch_agent(&DeviceSnapshot::new().with(keys::UUID, "u1"), now));
        assert!(registry.touch_agent(&DeviceSnapshot::new().with(keys::UUID, "u1"), now));
        assert_eq!(registry.agents().len(), 1);
    }

    #[test]
    fn test_sweep_drops_idle_liveness_but_keeps_keys() {
        let mut registry = NodeRegistry::new();
        let t0 = Utc::now();
        registry.register("n1", vec![1; 32], t0);
        registry.touch_agent(&DeviceSnapshot::new().with(keys::UUID, "old"), t0);
        registry.touch_agent(&DeviceSnapshot::new().with(keys::UUID, "fresh"), t0 + secs(100));
        registry.touch_controller("n1", &DeviceSnapshot::new(), vec!["a".to_string()], t0);

        let report = registry.sweep(t0 + secs(150), OFFLINE);

        assert_eq!(report, SweepReport { agents: 1, controllers: 1 });
        assert_eq!(registry.agents()[0].uuid, "fresh");
        assert!(registry.controllers().is_empty());
        assert!(registry.key_of("n1").is_some());
    }

    #[test]
    fn test_metrics_require_registration() {
        let mut registry = NodeRegistry::new();
        let t0 = Utc::now();

        assert!(!registry.record_metrics("ghost", vec![metric("a", "1")], t0));

        registry.register("n1", vec![1; 32], t0);
        assert!(registry.record_metrics("n1", vec![metric("a", "1")], t0));
        assert!(registry.record_metrics("n1", vec![metric("a", "2")], t0 + secs(1)));

        let nodes = registry.nodes(t0 + secs(2), OFFLINE);
        assert_eq!(nodes[0].state, NodeState::Online);
        assert_eq!(nodes[0].apps, vec![metric("a", "2")]);

        let later = registry.nodes(t0 + secs(600), OFFLINE);
        assert_eq!(later[0].state, NodeState::Offline);
    }

    #[test]
    fn test_controller_touch_marks_node_active() {
        let mut registry = NodeRegistry::new();
        let t0 = Utc::now();
        registry.register("n1", vec![1; 32], t0);

        assert_eq!(registry.nodes(t0, OFFLINE)[0].state, NodeState::Offline);
        registry.touch_controller("n1", &DeviceSnapshot::new(), Vec::new(), t0);
        assert_eq!(registry.nodes(t0, OFFLINE)[0].state, NodeState::Online);
    }
}
