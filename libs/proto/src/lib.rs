//! # fleet-proto
//!
//! Wire contracts exchanged between the node agent and the fleet server.
//!
//! All types serialize with the exact JSON field names the server speaks
//! (`appName`, `scriptMD5`, `scriptURL`, ...), so an agent built from this
//! crate interoperates with existing fleet servers.

mod device;

use serde::{Deserialize, Serialize};

pub use device::{keys, DeviceSnapshot};

/// Query parameter carrying the node id on registration and login.
pub const NODE_ID_PARAM: &str = "node_id";

/// Query parameter carrying the URL-safe base64 verification key.
pub const PUB_KEY_PARAM: &str = "pub_key";

/// Query parameter carrying the hex signature over the node id.
pub const SIGN_PARAM: &str = "sign";

/// One application in a fleet manifest.
///
/// `app_name` is the fleet-unique key. Two descriptors are considered the
/// same application configuration only if every field matches.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppDescriptor {
    pub app_name: String,

    /// Directory relative to the agent's apps root.
    #[serde(default)]
    pub app_dir: String,

    pub script_name: String,

    #[serde(rename = "scriptMD5")]
    pub script_md5: String,

    #[serde(rename = "scriptURL")]
    pub script_url: String,

    #[serde(default)]
    pub tag: String,
}

/// Advertised script for a single-script (agent mode) node.
///
/// Agents only rely on `md5` and `url`; the remaining fields are what the
/// server publishes for operators.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScriptFile {
    #[serde(default)]
    pub name: String,

    #[serde(default)]
    pub version: String,

    pub md5: String,

    pub url: String,

    #[serde(default)]
    pub os: String,

    #[serde(default)]
    pub tag: String,
}

/// Metrics record pushed by the agent for each registered application.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppMetric {
    #[serde(flatten)]
    pub descriptor: AppDescriptor,

    /// Opaque string produced by the application's script.
    #[serde(default)]
    pub metric: String,
}

impl AppMetric {
    pub fn new(descriptor: AppDescriptor, metric: impl Into<String>) -> Self {
        Self {
            descriptor,
            metric: metric.into(),
        }
    }
}

/// Error body returned by the fleet server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub code: String,
    pub message: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn descriptor() -> AppDescriptor {
        AppDescriptor {
            app_name: "probe".to_string(),
            app_dir: "probe".to_string(),
            script_name: "probe.lua".to_string(),
            script_md5: "0cc175b9c0f1b6a831c399e269772661".to_string(),
            script_url: "http://fleet.local/scripts/probe.lua".to_string(),
            tag: String::new(),
        }
    }

    #[test]
    fn test_descriptor_uses_server_field_names() {
        let json = serde_json::to_value(descriptor()).unwrap();

        assert_eq!(json["appName"], "probe");
        assert_eq!(json["appDir"], "probe");
        assert_eq!(json["scriptName"], "probe.lua");
        assert_eq!(json["scriptMD5"], "0cc175b9c0f1b6a831c399e269772661");
        assert_eq!(json["scriptURL"], "http://fleet.local/scripts/probe.lua");
        assert_eq!(json["tag"], "");
    }

    #[test]
    fn test_descriptor_optional_fields_default() {
        let json = r#"{"appName":"a","scriptName":"a.lua","scriptMD5":"x","scriptURL":"u"}"#;
        let parsed: AppDescriptor = serde_json::from_str(json).unwrap();

        assert_eq!(parsed.app_dir, "");
        assert_eq!(parsed.tag, "");
    }

    #[test]
    fn test_script_file_ignores_operator_fields() {
        let json = r#"{"md5":"abc","url":"http://x/agent.lua"}"#;
        let parsed: ScriptFile = serde_json::from_str(json).unwrap();

        assert_eq!(parsed.md5, "abc");
        assert_eq!(parsed.url, "http://x/agent.lua");
        assert!(parsed.name.is_empty());
    }

    #[test]
    fn test_app_metric_flattens_descriptor() {
        let metric = AppMetric::new(descriptor(), r#"{"status":"ok"}"#);
        let json = serde_json::to_value(&metric).unwrap();

        assert_eq!(json["appName"], "probe");
        assert_eq!(json["metric"], r#"{"status":"ok"}"#);

        let back: AppMetric = serde_json::from_value(json).unwrap();
        assert_eq!(back, metric);
    }
}
