//! Liveness endpoint.
//!
//! `GET /health` is the one route excluded from the API-key middleware, so
//! a load balancer or process supervisor can poll it without credentials.

use axum::{extract::State, Json};
use serde_json::{json, Value};

use crate::AppState;

/// `GET /health` — `{status, sessions, uptime}`.
pub async fn health(State(state): State<AppState>) -> Json<Value> {
    let uptime = state.start_time.elapsed().as_secs();
    let sessions = state.sessions.session_count().await;
    Json(json!({
        "status": "ok",
        "sessions": sessions,
        "uptime": uptime,
    }))
}
