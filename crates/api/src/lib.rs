mod auth;
pub mod routes;

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{middleware, Router};
use serde::Serialize;
use tokio::sync::watch;
use tower_http::cors::{Any, CorsLayer};
use tracing::info;

use common::{Error, ExecutionParams, LiveCell, PositionSync, Result, TradingMode};
use store::SqliteStore;

/// Static settings echoed by `/api/summary`.
#[derive(Debug, Clone, Serialize)]
pub struct DashboardConfig {
    pub symbol: String,
    pub interval: String,
    pub mode: TradingMode,
    pub position_sync: PositionSync,
    pub execution: ExecutionParams,
}

/// Shared application state injected into every route handler.
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<SqliteStore>,
    pub live: LiveCell,
    pub config: Arc<DashboardConfig>,
    pub dashboard_token: String,
}

pub fn router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_headers(Any)
        .allow_methods(Any);

    let protected = routes::summary_router().route_layer(middleware::from_fn_with_state(
        state.clone(),
        auth::require_auth,
    ));

    Router::new()
        .merge(protected)
        .merge(routes::health_router())
        .with_state(state)
        .layer(cors)
}

/// Run the dashboard until `shutdown` flips to true.
pub async fn serve(state: AppState, port: u16, mut shutdown: watch::Receiver<bool>) -> Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = tokio::net::TcpListener::bind(addr).await?;

    info!(%addr, "Dashboard API listening");
    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move {
            let _ = shutdown.changed().await;
        })
        .await
        .map_err(|e| Error::Other(format!("Dashboard server failed: {e}")))
}
