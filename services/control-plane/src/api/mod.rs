//! HTTP API handlers and routing.

mod auth;
pub mod error;
mod health;
mod nodes;
mod scripts;

use axum::{
    http::{header, HeaderName, Method},
    Router,
};
use tokio::{net::TcpListener, sync::watch};
use tower::ServiceBuilder;
use tower_http::{
    cors::{Any, CorsLayer},
    request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer},
    trace::TraceLayer,
};
use tracing::info;

use crate::state::AppState;

pub use auth::AuthenticatedNode;

const REQUEST_ID_HEADER: HeaderName = HeaderName::from_static("x-request-id");

/// Create the main API router with all routes and middleware.
pub fn create_router(state: AppState) -> Router {
    // Dashboards read the listings cross-origin.
    let cors = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST])
        .allow_headers([header::CONTENT_TYPE, header::AUTHORIZATION])
        .allow_origin(Any);

    let middleware = ServiceBuilder::new()
        .layer(SetRequestIdLayer::new(REQUEST_ID_HEADER, MakeRequestUuid))
        .layer(TraceLayer::new_for_http())
        .layer(PropagateRequestIdLayer::new(REQUEST_ID_HEADER))
        .layer(cors);

    Router::new()
        .merge(health::routes())
        .merge(scripts::routes())
        .merge(nodes::routes())
        .layer(middleware)
        .with_state(state)
}

/// Serve the API on `listener` until `shutdown` flips to true.
pub async fn serve(
    listener: TcpListener,
    state: AppState,
    mut shutdown: watch::Receiver<bool>,
) -> std::io::Result<()> {
    axum::serve(listener, create_router(state))
        .with_graceful_shutdown(async move {
            loop {
                if *shutdown.borrow() {
                    break;
                }
                if shutdown.changed().await.is_err() {
                    break;
                }
            }
            info!("HTTP server shutting down");
        })
        .await
}
