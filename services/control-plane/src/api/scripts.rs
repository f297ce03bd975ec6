//! Script and manifest distribution.

use std::collections::BTreeMap;

use axum::{
    extract::{Query, State},
    routing::get,
    Json, Router,
};
use chrono::Utc;
use fleet_proto::{keys, AppDescriptor, DeviceSnapshot, ScriptFile};
use tracing::{debug, info};

use super::auth::AuthenticatedNode;
use super::error::ApiError;
use crate::state::AppState;

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/update/lua", get(advertised_script))
        .route("/config/lua", get(advertised_script))
        .route("/config/apps", get(app_manifest))
}

async fn advertised_script(
    State(state): State<AppState>,
    Query(query): Query<BTreeMap<String, String>>,
) -> Result<Json<ScriptFile>, ApiError> {
    let device = DeviceSnapshot::from(query);
    state.registry().write().await.touch_agent(&device, Utc::now());

    let os = device.get(keys::OS).unwrap_or_default();
    let script = state.fleet().script_for(&device).cloned().ok_or_else(|| {
        ApiError::bad_request("no_script", format!("can not find a script for os '{os}'"))
    })?;

    debug!(
        uuid = device.uuid().unwrap_or_default(),
        os,
        script = %script.name,
        md5 = %script.md5,
        "Advertising script"
    );
    Ok(Json(script))
}

async fn app_manifest(
    State(state): State<AppState>,
    node: AuthenticatedNode,
    Query(query): Query<BTreeMap<String, String>>,
) -> Json<Vec<AppDescriptor>> {
    let device = DeviceSnapshot::from(query);
    let apps = state.fleet().apps_for(&device);
    let names: Vec<String> = apps.iter().map(|a| a.app_name.clone()).collect();

    info!(
        node_id = %node.node_id,
        os = device.get(keys::OS).unwrap_or_default(),
        channel = device.get(keys::CHANNEL).unwrap_or_default(),
        apps = ?names,
        "Serving app manifest"
    );

    state
        .registry()
        .write()
        .await
        .touch_controller(&node.node_id, &device, names, Utc::now());

    Json(apps)
}
