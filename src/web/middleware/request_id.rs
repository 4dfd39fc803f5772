//! Per-request tracing span, keyed by request ID and enriched with the
//! session and user a handler resolved.
//!
//! An incoming `X-Request-Id` is reused; otherwise a ULID is generated. The
//! resolved ID is echoed back in the `X-Request-Id` response header.

use axum::extract::Request;
use axum::http::{HeaderValue, StatusCode};
use axum::middleware::Next;
use axum::response::Response;
use std::time::Instant;
use tracing::field::Empty;
use tracing::{Instrument, Span};

static REQUEST_ID: &str = "x-request-id";

pub async fn request_span(request: Request, next: Next) -> Response {
    let req_id = request
        .headers()
        .get(REQUEST_ID)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty() && v.len() <= 128)
        .map(String::from)
        .unwrap_or_else(|| ulid::Ulid::new().to_string());

    let span = tracing::info_span!(
        "request",
        req_id = %req_id,
        method = %request.method(),
        path = %request.uri().path(),
        session_id = Empty,
        user_id = Empty
    );
    let start = Instant::now();

    let mut response = next.run(request).instrument(span.clone()).await;

    let duration_ms = start.elapsed().as_millis() as u64;
    span.in_scope(|| log_response(response.status(), duration_ms));

    if let Ok(value) = HeaderValue::from_str(&req_id) {
        response.headers_mut().insert(REQUEST_ID, value);
    }
    response
}

/// Attach the session a handler is working on to the request span.
pub fn record_session(session_id: i64) {
    Span::current().record("session_id", session_id);
}

/// Attach the acting user to the request span.
pub fn record_user(user_id: i64) {
    Span::current().record("user_id", user_id);
}

fn log_response(status: StatusCode, duration_ms: u64) {
    let status = status.as_u16();
    match status {
        200..=399 => tracing::debug!(status, duration_ms, "Response"),
        // 404 on heartbeat is the normal "start a new session" signal.
        404 => tracing::debug!(status, duration_ms, "Response"),
        400..=499 => tracing::info!(status, duration_ms, "Response"),
        _ => tracing::warn!(status, duration_ms, "Response"),
    }
}
