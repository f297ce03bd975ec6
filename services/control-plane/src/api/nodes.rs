//! Node identity, liveness and metrics.

use axum::{
    body::Bytes,
    extract::{Query, State},
    http::{header::CONTENT_TYPE, StatusCode},
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use chrono::Utc;
use fleet_auth::{decode_key, AuthError};
use fleet_proto::AppMetric;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::auth::AuthenticatedNode;
use super::error::ApiError;
use crate::registry::{AgentRecord, ControllerRecord, NodeView, Registration};
use crate::state::AppState;

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/node/regist", get(register))
        .route("/node/login", get(login))
        .route("/node/keepalive", get(keepalive))
        .route("/push/metrics", get(push_metrics).post(push_metrics))
        .route("/agent/list", get(agent_list))
        .route("/controller/list", get(controller_list))
        .route("/api/nodelist", get(node_list))
}

#[derive(Debug, Deserialize)]
struct RegisterQuery {
    #[serde(default)]
    node_id: String,
    #[serde(default)]
    pub_key: String,
}

async fn register(
    State(state): State<AppState>,
    Query(query): Query<RegisterQuery>,
) -> Result<StatusCode, ApiError> {
    let node_id = query.node_id.trim();
    if node_id.is_empty() {
        return Err(ApiError::bad_request("missing_node_id", "node_id is required"));
    }

    let key = decode_key(&query.pub_key)
        .map_err(|e| ApiError::bad_request("invalid_pub_key", e.to_string()))?;
    state
        .verifier()
        .check_key(&key)
        .map_err(|e| ApiError::bad_request("invalid_pub_key", e.to_string()))?;

    let outcome = state.registry().write().await.register(node_id, key, Utc::now());
    match outcome {
        Registration::Created => info!(node_id, "Registered node"),
        Registration::KeyReplaced => {
            let revoked = state.tokens().revoke_node(node_id).await;
            warn!(node_id, revoked_tokens = revoked, "Node key replaced");
        }
        Registration::Unchanged => {}
    }
    Ok(StatusCode::OK)
}

#[derive(Debug, Deserialize)]
struct LoginQuery {
    #[serde(default)]
    node_id: String,
    #[serde(default)]
    sign: String,
}

/// Responds with the raw token as the body.
async fn login(
    State(state): State<AppState>,
    Query(query): Query<LoginQuery>,
) -> Result<String, ApiError> {
    let node_id = query.node_id.trim();
    if node_id.is_empty() || query.sign.is_empty() {
        return Err(ApiError::bad_request(
            "missing_parameter",
            "node_id and sign are required",
        ));
    }

    let key = state
        .registry()
        .read()
        .await
        .key_of(node_id)
        .map(<[u8]>::to_vec)
        .ok_or_else(|| ApiError::not_found("unknown_node", format!("node {node_id} is not registered")))?;

    state
        .verifier()
        .verify(&key, node_id.as_bytes(), &query.sign)
        .map_err(|e| match e {
            AuthError::SignatureEncoding => ApiError::bad_request("invalid_signature", e.to_string()),
            _ => {
                warn!(node_id, "Login rejected: bad signature");
                ApiError::unauthorized("bad_signature", e.to_string())
            }
        })?;

    let now = Utc::now();
    let token = state.tokens().issue(node_id, now).await;
    state.registry().write().await.mark_active(node_id, now);
    info!(node_id, "Node logged in");
    Ok(token)
}

async fn keepalive(State(state): State<AppState>, node: AuthenticatedNode) -> StatusCode {
    state.registry().write().await.mark_active(&node.node_id, Utc::now());
    StatusCode::OK
}

async fn push_metrics(
    State(state): State<AppState>,
    node: AuthenticatedNode,
    body: Bytes,
) -> Result<StatusCode, ApiError> {
    if body.is_empty() {
        return Err(ApiError::bad_request("empty_body", "metrics body is required"));
    }
    let metrics: Vec<AppMetric> = serde_json::from_slice(&body)
        .map_err(|e| ApiError::bad_request("invalid_metrics", e.to_string()))?;

    let count = metrics.len();
    state
        .registry()
        .write()
        .await
        .record_metrics(&node.node_id, metrics, Utc::now());
    debug!(node_id = %node.node_id, count, "Stored app metrics");
    Ok(StatusCode::OK)
}

#[derive(Debug, Serialize)]
struct AgentList {
    total: usize,
    agents: Vec<AgentRecord>,
}

#[derive(Debug, Serialize)]
struct ControllerList {
    total: usize,
    controllers: Vec<ControllerRecord>,
}

fn pretty_json<T: Serialize>(value: &T) -> Result<impl IntoResponse, ApiError> {
    let body = serde_json::to_string_pretty(value)
        .map_err(|e| ApiError::internal("serialization_failed", e.to_string()))?;
    Ok(([(CONTENT_TYPE, "application/json")], body))
}

async fn agent_list(State(state): State<AppState>) -> Result<impl IntoResponse, ApiError> {
    let agents = state.registry().read().await.agents();
    pretty_json(&AgentList {
        total: agents.len(),
        agents,
    })
}

async fn controller_list(State(state): State<AppState>) -> Result<impl IntoResponse, ApiError> {
    let controllers = state.registry().read().await.controllers();
    pretty_json(&ControllerList {
        total: controllers.len(),
        controllers,
    })
}

#[derive(Debug, Deserialize)]
struct NodeListQuery {
    node_id: Option<String>,
}

#[derive(Debug, Serialize)]
struct NodeList {
    total: usize,
    nodes: Vec<NodeView>,
}

async fn node_list(
    State(state): State<AppState>,
    Query(query): Query<NodeListQuery>,
) -> Json<NodeList> {
    let mut nodes = state
        .registry()
        .read()
        .await
        .nodes(Utc::now(), state.config().offline_after);
    if let Some(node_id) = query.node_id.filter(|id| !id.is_empty()) {
        nodes.retain(|node| node.node_id == node_id);
    }

    Json(NodeList {
        total: nodes.len(),
        nodes,
    })
}
