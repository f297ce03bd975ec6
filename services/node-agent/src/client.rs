//! Fleet server client for the node agent.
//!
//! Provides methods for communicating with the fleet server:
//! - Fetching the advertised agent script and the application manifest
//! - Fetching script bytes
//! - Pushing application metrics
//! - Registering and logging in to obtain a bearer token

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use fleet_proto::{AppDescriptor, AppMetric, DeviceSnapshot, ScriptFile, NODE_ID_PARAM, PUB_KEY_PARAM, SIGN_PARAM};
use reqwest::{RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::actors::fleet::ManifestSource;
use crate::actors::metrics::MetricsPublisher;
use crate::actors::supervisor::ContentSource;
use crate::identity::NodeIdentity;

/// Per-request timeout.
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Client errors.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("server returned {status}: {body}")]
    Status { status: u16, body: String },

    #[error("malformed response: {0}")]
    Decode(String),

    #[error("node identity required for authenticated calls")]
    MissingIdentity,
}

impl ClientError {
    pub fn is_unauthorized(&self) -> bool {
        matches!(self, ClientError::Status { status, .. } if *status == StatusCode::UNAUTHORIZED.as_u16())
    }
}

/// Fleet server API client.
pub struct ServerClient {
    http: reqwest::Client,
    base_url: String,
    identity: Option<NodeIdentity>,
    token: RwLock<Option<String>>,
}

impl ServerClient {
    /// Create a new client for `base_url`.
    pub fn new(base_url: &str) -> Result<Self, ClientError> {
        let http = reqwest::Client::builder().timeout(REQUEST_TIMEOUT).build()?;

        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            identity: None,
            token: RwLock::new(None),
        })
    }

    /// Attach the node identity used for authenticated calls.
    pub fn with_identity(mut self, identity: NodeIdentity) -> Self {
        self.identity = Some(identity);
        self
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// The underlying HTTP client, shared with script downloads.
    pub fn http(&self) -> reqwest::Client {
        self.http.clone()
    }

    /// Fetch the script advertised for this node (agent mode).
    pub async fn fetch_script_file(&self, device: &DeviceSnapshot) -> Result<ScriptFile, ClientError> {
        debug!(url = %self.base_url, "Fetching advertised script");
        let response = self
            .http
            .get(&self.base_url)
            .query(&device.query_pairs())
            .send()
            .await?;
        decode(check_status(response, "fetch script file").await?).await
    }

    /// Fetch this node's application manifest (fleet mode).
    pub async fn fetch_app_manifest(&self, device: &DeviceSnapshot) -> Result<Vec<AppDescriptor>, ClientError> {
        let url = format!("{}/config/apps", self.base_url);
        let request = self.http.get(&url).query(&device.query_pairs());
        let apps: Vec<AppDescriptor> = decode(self.send_authed(request, "fetch app manifest").await?).await?;
        debug!(app_count = apps.len(), "Fetched app manifest");
        Ok(apps)
    }

    /// Fetch raw script bytes. The caller verifies them.
    pub async fn fetch_script(&self, url: &str) -> Result<Vec<u8>, ClientError> {
        let response = self.http.get(url).send().await?;
        let response = check_status(response, "fetch script").await?;
        Ok(response.bytes().await?.to_vec())
    }

    /// Push application metrics for node `uuid`.
    pub async fn push_metrics(&self, uuid: &str, metrics: &[AppMetric]) -> Result<(), ClientError> {
        let url = format!("{}/push/metrics", self.base_url);
        let request = self.http.post(&url).query(&[("uuid", uuid)]).json(metrics);
        self.send_authed(request, "push metrics").await?;
        debug!(count = metrics.len(), "Pushed metrics");
        Ok(())
    }

    /// Refresh this node's liveness on the server.
    pub async fn keepalive(&self) -> Result<(), ClientError> {
        let url = format!("{}/node/keepalive", self.base_url);
        self.send_authed(self.http.get(&url), "keepalive").await?;
        Ok(())
    }

    /// Register this node's verification key.
    pub async fn register(&self) -> Result<(), ClientError> {
        let identity = self.identity.as_ref().ok_or(ClientError::MissingIdentity)?;
        let url = format!("{}/node/regist", self.base_url);
        let response = self
            .http
            .get(&url)
            .query(&[
                (NODE_ID_PARAM, identity.node_id().to_string()),
                (PUB_KEY_PARAM, identity.encoded_key()),
            ])
            .send()
            .await?;
        check_status(response, "register").await?;
        Ok(())
    }

    /// Log in, returning a fresh bearer token.
    pub async fn login(&self) -> Result<String, ClientError> {
        let identity = self.identity.as_ref().ok_or(ClientError::MissingIdentity)?;
        let url = format!("{}/node/login", self.base_url);
        let response = self
            .http
            .get(&url)
            .query(&[
                (NODE_ID_PARAM, identity.node_id().to_string()),
                (SIGN_PARAM, identity.login_signature()),
            ])
            .send()
            .await?;
        let token = check_status(response, "login").await?.text().await?;
        let token = token.trim().to_string();
        if token.is_empty() {
            return Err(ClientError::Decode("empty token".to_string()));
        }
        Ok(token)
    }

    /// Cached token, or register and log in to get one.
    async fn ensure_token(&self) -> Result<String, ClientError> {
        if let Some(token) = self.token.read().await.as_ref() {
            return Ok(token.clone());
        }

        let mut slot = self.token.write().await;
        if let Some(token) = slot.as_ref() {
            return Ok(token.clone());
        }

        self.register().await?;
        let token = self.login().await?;
        info!("Logged in to fleet server");
        *slot = Some(token.clone());
        Ok(token)
    }

    async fn send_authed(&self, request: RequestBuilder, what: &str) -> Result<Response, ClientError> {
        let token = self.ensure_token().await?;
        let response = request.bearer_auth(token).send().await?;
        let result = check_status(response, what).await;

        if let Err(e) = &result {
            if e.is_unauthorized() {
                warn!(operation = what, "Token rejected, will log in again");
                *self.token.write().await = None;
            }
        }
        result
    }
}

async fn check_status(response: Response, what: &str) -> Result<Response, ClientError> {
    if response.status().is_success() {
        return Ok(response);
    }

    let status = response.status();
    let body = response.text().await.unwrap_or_default();
    warn!(operation = what, status = %status, body = %body, "Fleet server request failed");
    Err(ClientError::Status {
        status: status.as_u16(),
        body,
    })
}

async fn decode<T: DeserializeOwned>(response: Response) -> Result<T, ClientError> {
    let bytes = response.bytes().await?;
    serde_json::from_slice(&bytes).map_err(|e| ClientError::Decode(e.to_string()))
}

// =============================================================================
// Server-backed sources
// =============================================================================

/// Binds a client to this node's device snapshot.
#[derive(Clone)]
pub struct ServerSource {
    client: Arc<ServerClient>,
    device: DeviceSnapshot,
}

impl ServerSource {
    pub fn new(client: Arc<ServerClient>, device: DeviceSnapshot) -> Self {
        Self { client, device }
    }
}

#[async_trait]
impl ContentSource for ServerSource {
    async fn advertised(&self) -> Result<ScriptFile, ClientError> {
        self.client.fetch_script_file(&self.device).await
    }

    async fn fetch(&self, url: &str) -> Result<Vec<u8>, ClientError> {
        self.client.fetch_script(url).await
    }
}

#[async_trait]
impl ManifestSource for ServerSource {
    async fn manifest(&self) -> Result<Vec<AppDescriptor>, ClientError> {
        self.client.fetch_app_manifest(&self.device).await
    }

    async fn fetch(&self, url: &str) -> Result<Vec<u8>, ClientError> {
        self.client.fetch_script(url).await
    }
}

#[async_trait]
impl MetricsPublisher for ServerSource {
    async fn publish(&self, metrics: &[AppMetric]) -> Result<(), ClientError> {
        if metrics.is_empty() {
            return self.client.keepalive().await;
        }
        let uuid = self.device.uuid().unwrap_or_default();
        self.client.push_metrics(uuid, metrics).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    async fn identity() -> (tempfile::TempDir, NodeIdentity) {
        let dir = tempfile::tempdir().unwrap();
        let identity = NodeIdentity::load_or_create(dir.path()).await.unwrap();
        (dir, identity)
    }

    #[tokio::test]
    async fn test_fetch_script_file_sends_device_query() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/update/lua"))
            .and(query_param("os", "linux"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "md5": "abc",
                "url": "http://x/agent.lua"
            })))
            .mount(&server)
            .await;

        let client = ServerClient::new(&format!("{}/update/lua", server.uri())).unwrap();
        let device = DeviceSnapshot::new().with("os", "linux");
        let file = client.fetch_script_file(&device).await.unwrap();

        assert_eq!(file.md5, "abc");
        assert_eq!(file.url, "http://x/agent.lua");
    }

    #[tokio::test]
    async fn test_malformed_manifest_is_decode_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/update/lua"))
            .respond_with(ResponseTemplate::new(200).set_body_string("not json"))
            .mount(&server)
            .await;

        let client = ServerClient::new(&format!("{}/update/lua", server.uri())).unwrap();
        let err = client
            .fetch_script_file(&DeviceSnapshot::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ClientError::Decode(_)));
    }

    #[tokio::test]
    async fn test_authed_call_logs_in_once_and_reuses_token() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/node/regist"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/node/login"))
            .respond_with(ResponseTemplate::new(200).set_body_string("fnt_token"))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/config/apps"))
            .and(header("authorization", "Bearer fnt_token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!([])))
            .expect(2)
            .mount(&server)
            .await;

        let (_dir, identity) = identity().await;
        let client = ServerClient::new(&server.uri()).unwrap().with_identity(identity);
        let device = DeviceSnapshot::new();

        assert!(client.fetch_app_manifest(&device).await.unwrap().is_empty());
        assert!(client.fetch_app_manifest(&device).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_unauthorized_clears_token() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/node/regist"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/node/login"))
            .respond_with(ResponseTemplate::new(200).set_body_string("fnt_token"))
            .expect(2)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/node/keepalive"))
            .respond_with(ResponseTemplate::new(401))
            .mount(&server)
            .await;

        let (_dir, identity) = identity().await;
        let client = ServerClient::new(&server.uri()).unwrap().with_identity(identity);

        assert!(client.keepalive().await.unwrap_err().is_unauthorized());
        assert!(client.keepalive().await.unwrap_err().is_unauthorized());
    }

    #[tokio::test]
    async fn test_authed_call_without_identity_fails() {
        let client = ServerClient::new("http://127.0.0.1:9").unwrap();
        let err = client.keepalive().await.unwrap_err();
        assert!(matches!(err, ClientError::MissingIdentity));
    }
}
