use axum::{extract::State, routing::get, Json, Router};
use serde_json::{json, Value};

use crate::AppState;

pub fn health_router() -> Router<AppState> {
    Router::new().route("/healthz", get(healthz))
}

/// Health check endpoint, no auth required.
async fn healthz(State(state): State<AppState>) -> Json<Value> {
    let last_update = state.live.latest().await.map(|s| s.updated_at);
    Json(json!({
        "status": "ok",
        "symbol": state.config.symbol,
        "mode": state.config.mode.to_string(),
        "last_update": last_update,
    }))
}
