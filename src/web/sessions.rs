//! Session lifecycle and presence handlers.

use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::Json;
use serde_json::json;

use crate::presence::{HeartbeatAck, HeartbeatRequest, PresenceSnapshot, SessionRecord, StartSessionRequest};
use crate::state::AppState;
use crate::web::error::ApiError;
use crate::web::middleware::client_ip::ClientIp;
use crate::web::middleware::request_id::{record_session, record_user};

fn body<T>(payload: Result<Json<T>, JsonRejection>) -> Result<T, ApiError> {
    payload
        .map(|Json(value)| value)
        .map_err(|rejection| ApiError::invalid(rejection.body_text()))
}

/// `POST /api/sessions/start`
pub(super) async fn start_session(
    State(state): State<AppState>,
    client_ip: ClientIp,
    payload: Result<Json<StartSessionRequest>, JsonRejection>,
) -> Result<Json<SessionRecord>, ApiError> {
    let request = body(payload)?;

    let Some(user_id) = request.user_id else {
        return Err(ApiError::invalid("userId is required")
            .with_details(json!({ "field": "userId" })));
    };
    if request.device_id.trim().is_empty() {
        return Err(ApiError::invalid("deviceId must not be empty")
            .with_details(json!({ "field": "deviceId" })));
    }

    record_user(user_id);

    let tracker = &state.tracker;
    let session = tracker
        .start_session(
            user_id,
            &request.device_id,
            &request.device_name,
            client_ip.to_string_opt(),
        )
        .await?;
    record_session(session.id);

    Ok(Json(session.to_record(tracker.now(), tracker.thresholds())))
}

/// `POST /api/sessions/heartbeat`
pub(super) async fn heartbeat(
    State(state): State<AppState>,
    payload: Result<Json<HeartbeatRequest>, JsonRejection>,
) -> Result<Json<HeartbeatAck>, ApiError> {
    let request = body(payload)?;
    record_session(request.session_id);
    let ack = state.tracker.heartbeat(request.session_id).await?;
    Ok(Json(ack))
}

/// `POST /api/sessions/{id}/end`
pub(super) async fn end_session(
    State(state): State<AppState>,
    Path(session_id): Path<i64>,
) -> Result<StatusCode, ApiError> {
    record_session(session_id);
    state.tracker.end_session(session_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// `GET /api/sessions/active`
pub(super) async fn active_sessions(
    State(state): State<AppState>,
) -> Result<Json<Vec<PresenceSnapshot>>, ApiError> {
    Ok(Json(state.tracker.active_presence().await?))
}
