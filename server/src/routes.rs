use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};
use serde_json::{json, Value};

use crate::state::AppState;
use crate::ws;

/// Build the axum Router: the WebSocket endpoint plus liveness/readiness.
pub fn build_router(state: AppState) -> Router {
    let ws_path = state.ws_path.clone();
    Router::new()
        .route(&ws_path, get(ws::handler::ws_upgrade))
        .route("/health", get(health))
        .route("/ready", get(ready))
        .with_state(state)
}

/// GET /health — process liveness.
async fn health() -> Json<Value> {
    Json(json!({"status": "ok"}))
}

/// GET /ready — readiness plus a registry snapshot.
async fn ready(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "status": "ready",
        "stats": state.hub.stats(),
    }))
}
