//! JSON error responses for the HTTP API.

use crate::presence::PresenceError;
use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;
use serde_json::Value;
use tracing::error;
use ts_rs::TS;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, TS)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[ts(export)]
pub enum ApiErrorCode {
    NotFound,
    InvalidRequest,
    InternalError,
}

impl ApiErrorCode {
    fn status(self) -> StatusCode {
        match self {
            ApiErrorCode::NotFound => StatusCode::NOT_FOUND,
            ApiErrorCode::InvalidRequest => StatusCode::BAD_REQUEST,
            ApiErrorCode::InternalError => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

/// Error body: `{"code": "...", "message": "...", "details": ...}`.
#[derive(Debug, Clone, Serialize, TS)]
#[ts(export)]
pub struct ApiError {
    pub code: ApiErrorCode,
    pub message: String,
    #[ts(type = "unknown")]
    pub details: Option<Value>,
}

impl ApiError {
    pub fn new(code: ApiErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            details: None,
        }
    }

    pub fn with_details(mut self, details: Value) -> Self {
        self.details = Some(details);
        self
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(ApiErrorCode::NotFound, message)
    }

    pub fn invalid(message: impl Into<String>) -> Self {
        Self::new(ApiErrorCode::InvalidRequest, message)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.code.status(), Json(self)).into_response()
    }
}

/// Log a storage failure and hide its details from the client.
pub fn storage_error(context: &str, err: anyhow::Error) -> ApiError {
    error!(error = ?err, "{context} failed");
    ApiError::new(
        ApiErrorCode::InternalError,
        format!("{context} failed"),
    )
}

impl From<PresenceError> for ApiError {
    fn from(err: PresenceError) -> Self {
        match err {
            PresenceError::NotFound(id) => ApiError::not_found(format!("session {id} not found"))
                .with_details(serde_json::json!({ "sessionId": id })),
            PresenceError::Storage(e) => storage_error("Session storage", e),
        }
    }
}
