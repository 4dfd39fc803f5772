//! Web API router construction.

use axum::Router;
use axum::http::{HeaderValue, header};
use axum::response::Response;
use axum::routing::{get, post};
use std::time::Duration;
use tower_http::compression::CompressionLayer;
use tower_http::cors::{Any, CorsLayer};
use tower_http::timeout::TimeoutLayer;

use crate::state::AppState;
use crate::web::middleware::request_id::request_span;
use crate::web::{sessions, status};

/// Presence data changes with every heartbeat; never let a proxy cache it.
const NO_STORE: &str = "private, no-store, must-revalidate";

/// Creates the web server router
pub fn create_router(app_state: AppState) -> Router {
    let api_router = Router::new()
        .route("/health", get(status::health))
        .route("/sessions/start", post(sessions::start_session))
        .route("/sessions/heartbeat", post(sessions::heartbeat))
        .route("/sessions/{id}/end", post(sessions::end_session))
        .route("/sessions/active", get(sessions::active_sessions))
        .layer(axum::middleware::map_response(
            |mut resp: Response| async move {
                resp.headers_mut()
                    .insert(header::CACHE_CONTROL, HeaderValue::from_static(NO_STORE));
                resp
            },
        ))
        .with_state(app_state);

    Router::new().nest("/api", api_router).layer((
        // Outermost: per-request ID span + severity-proportional response logging.
        axum::middleware::from_fn(request_span),
        CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any),
        CompressionLayer::new()
            .zstd(true)
            .br(true)
            .gzip(true)
            .quality(tower_http::CompressionLevel::Fastest),
        TimeoutLayer::new(Duration::from_secs(30)),
    ))
}
