//! HTTP implementation of the session-lifecycle calls.

use crate::client::api::{ApiClient, ApiClientError};
use crate::heartbeat::PresenceApi;
use crate::presence::{HeartbeatAck, HeartbeatRequest, SessionRecord, StartSessionRequest};
use async_trait::async_trait;

#[derive(Debug, Clone)]
pub struct HttpPresenceApi {
    api: ApiClient,
}

impl HttpPresenceApi {
    pub fn new(api: ApiClient) -> Self {
        Self { api }
    }
}

#[async_trait]
impl PresenceApi for HttpPresenceApi {
    async fn start_session(
        &self,
        request: &StartSessionRequest,
    ) -> Result<SessionRecord, ApiClientError> {
        self.api.post_json("/api/sessions/start", request).await
    }

    async fn heartbeat(&self, session_id: i64) -> Result<HeartbeatAck, ApiClientError> {
        self.api
            .post_json("/api/sessions/heartbeat", &HeartbeatRequest { session_id })
            .await
    }

    async fn end_session(&self, session_id: i64) -> Result<(), ApiClientError> {
        self.api
            .post_empty(&format!("/api/sessions/{session_id}/end"))
            .await
    }
}
