use crate::api::AppState;
use axum::{extract::State, Json};
use chrono::{SecondsFormat, Utc};
use serde::Serialize;
use std::sync::Arc;

#[derive(Serialize)]
pub struct StatusResponse {
    status: String,
    mode: String,
    time: String,
    active_pools: usize,
    uptime_seconds: u64,
}

/// Liveness only; no database is contacted.
pub async fn status(State(state): State<Arc<AppState>>) -> Json<StatusResponse> {
    Json(StatusResponse {
        status: "running".to_string(),
        mode: state.config.mode.clone(),
        time: Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
        active_pools: state.active_pools(),
        uptime_seconds: state.start_time.elapsed().as_secs(),
    })
}
