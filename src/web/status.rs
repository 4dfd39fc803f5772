//! Health handler.

use axum::extract::State;
use axum::response::Json;
use serde::Serialize;
use tracing::trace;
use ts_rs::TS;

use crate::state::AppState;

#[derive(Serialize, TS)]
#[serde(rename_all = "camelCase")]
#[ts(export)]
pub struct HealthResponse {
    status: String,
    timestamp: String,
    version: String,
    commit: String,
    #[ts(type = "number")]
    uptime_secs: u64,
}

/// Health check endpoint
pub(super) async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    trace!("health check requested");
    Json(HealthResponse {
        status: "healthy".to_owned(),
        timestamp: chrono::Utc::now().to_rfc3339(),
        version: env!("CARGO_PKG_VERSION").to_owned(),
        commit: env!("GIT_COMMIT_SHORT").to_owned(),
        uptime_secs: state.started_at.elapsed().as_secs(),
    })
}
