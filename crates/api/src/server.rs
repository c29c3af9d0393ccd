use crate::{events, logs};
use axum::{routing::get, Router};
use courier_fabric::ConnectionFabric;
use courier_store::Store;
use std::{net::SocketAddr, sync::Arc};
use tracing::info;

/// Shared state of the API handlers.
pub struct ApiState {
    pub store: Store,
    pub fabric: Arc<ConnectionFabric>,
}

pub fn router(state: Arc<ApiState>) -> Router {
    Router::new()
        .route("/v1/logs/:contract/tx/:hash", get(logs::get_single))
        .route("/v1/logs/:contract/:topic", get(logs::get))
        .route("/v1/logs/:contract/:topic/all", get(logs::get_all))
        .route("/v1/logs/:contract/:topic/new", get(logs::get_new))
        .route("/v1/logs/:contract/:topic/new/all", get(logs::get_all_new))
        .route("/v1/events/:contract/:topic", get(events::handle_connection))
        .with_state(state)
}

/// Serve the API until the listener fails; the only fatal error in the
/// engine.
pub async fn serve(addr: SocketAddr, state: Arc<ApiState>) -> eyre::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, "api server listening");

    axum::serve(listener, router(state)).await?;

    Ok(())
}
