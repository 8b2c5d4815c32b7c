//! Health-check endpoint.

use axum::{extract::State, Json};
use serde_json::{json, Value};

use crate::AppState;

/// `GET /api/health` — liveness probe.
///
/// Returns status, uptime, version, and assistant session counts. Suitable
/// for desktop-shell startup checks and load-balancer probes.
pub async fn health(State(state): State<AppState>) -> Json<Value> {
    let uptime = state.start_time.elapsed().as_secs();
    let conversations = state.assistant.session_count().await;
    let live = state.assistant.live_count().await;
    let watching = state.subagents.is_running().await;

    Json(json!({
        "status": "ok",
        "uptime_secs": uptime,
        "version": env!("CARGO_PKG_VERSION"),
        "conversations": conversations,
        "live_assistant_processes": live,
        "subagent_watch_active": watching,
    }))
}
