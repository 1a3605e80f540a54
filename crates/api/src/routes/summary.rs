use axum::{extract::State, http::StatusCode, routing::get, Json, Router};
use serde_json::{json, Value};
use tracing::warn;

use common::StateStore;

use crate::AppState;

const RECENT_SIGNALS: i64 = 20;
const RECENT_TRADES: i64 = 20;
const RECENT_ERRORS: i64 = 10;

pub fn summary_router() -> Router<AppState> {
    Router::new().route("/api/summary", get(get_summary))
}

async fn get_summary(State(state): State<AppState>) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    let store = &state.store;
    let internal = |e: common::Error| {
        warn!(error = %e, "Summary query failed");
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({ "error": e.to_string() })),
        )
    };

    let strategy = store.load_latest_strategy_state().await.map_err(internal)?;
    let signals = store.recent_signals(RECENT_SIGNALS).await.map_err(internal)?;
    let trades = store.recent_trades(RECENT_TRADES).await.map_err(internal)?;
    let errors = store.recent_errors(RECENT_ERRORS).await.map_err(internal)?;

    Ok(Json(json!({
        "config": state.config.as_ref(),
        "live": state.live.latest().await,
        "strategy": strategy,
        "signals": signals,
        "trades": trades,
        "errors": errors,
    })))
}
