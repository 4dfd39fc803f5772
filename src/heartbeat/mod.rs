//! Client-side session keeper.
//!
//! The driver opens a session for this device, heartbeats on a fixed cadence
//! and reacts to what the server says: a 404 means the server no longer knows
//! the session (ended, superseded or lost), so a new one is started; a
//! non-zero `pendingSync` means server-side data moved, so the configured
//! cache prefixes are invalidated and the next read refetches. Transient
//! failures are logged and retried at the next tick.

use crate::cache::RequestCoalescer;
use crate::client::ApiClientError;
use crate::presence::{HeartbeatAck, SessionRecord, StartSessionRequest};
use crate::utils::fmt_duration;
use async_trait::async_trait;
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use tokio::time;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Session-lifecycle calls the driver needs from the backend.
#[async_trait]
pub trait PresenceApi: Send + Sync {
    async fn start_session(
        &self,
        request: &StartSessionRequest,
    ) -> Result<SessionRecord, ApiClientError>;

    async fn heartbeat(&self, session_id: i64) -> Result<HeartbeatAck, ApiClientError>;

    async fn end_session(&self, session_id: i64) -> Result<(), ApiClientError>;
}

#[derive(Debug, Clone)]
pub struct HeartbeatConfig {
    pub interval: Duration,
    /// Upper bound of random delay added to each interval.
    pub jitter: Duration,
    /// Cache key prefixes dropped when the server reports pending sync work.
    pub invalidate_on_sync: Vec<String>,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(15),
            jitter: Duration::ZERO,
            invalidate_on_sync: Vec::new(),
        }
    }
}

pub struct HeartbeatDriver {
    api: Arc<dyn PresenceApi>,
    device: StartSessionRequest,
    cache: Option<RequestCoalescer>,
    config: HeartbeatConfig,
}

impl HeartbeatDriver {
    pub fn new(api: Arc<dyn PresenceApi>, device: StartSessionRequest, config: HeartbeatConfig) -> Self {
        Self {
            api,
            device,
            cache: None,
            config,
        }
    }

    /// Invalidate this cache's sync prefixes when the server reports a backlog.
    pub fn with_cache(mut self, cache: RequestCoalescer) -> Self {
        self.cache = Some(cache);
        self
    }

    /// Run until `cancel` fires, then end the current session.
    pub async fn run(&self, cancel: CancellationToken) {
        info!(
            device_id = %self.device.device_id,
            interval = fmt_duration(self.config.interval),
            "Heartbeat driver started"
        );

        let mut session_id = None;
        loop {
            session_id = tokio::select! {
                _ = cancel.cancelled() => break,
                next = self.tick(session_id) => next,
            };

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = time::sleep(self.next_delay()) => {}
            }
        }

        if let Some(id) = session_id {
            match self.api.end_session(id).await {
                Ok(()) => info!(session_id = id, "Session ended on shutdown"),
                Err(e) => warn!(session_id = id, error = %e, "Failed to end session on shutdown"),
            }
        }
        info!("Heartbeat driver stopped");
    }

    /// One step of the lifecycle. Takes the current session (if any) and
    /// returns the session to use next time.
    pub async fn tick(&self, session_id: Option<i64>) -> Option<i64> {
        let Some(id) = session_id else {
            return self.start().await;
        };

        match self.api.heartbeat(id).await {
            Ok(ack) => {
                debug!(session_id = id, pending_sync = ack.pending_sync, "Heartbeat acknowledged");
                if ack.pending_sync > 0 {
                    self.invalidate_synced();
                }
                Some(id)
            }
            Err(e) if e.is_not_found() => {
                warn!(session_id = id, "Server lost the session, starting a new one");
                self.start().await
            }
            Err(e) => {
                warn!(session_id = id, error = %e, "Heartbeat failed, will retry");
                Some(id)
            }
        }
    }

    async fn start(&self) -> Option<i64> {
        match self.api.start_session(&self.device).await {
            Ok(record) => {
                info!(session_id = record.id, status = ?record.status, "Session started");
                Some(record.id)
            }
            Err(e) => {
                warn!(error = %e, "Failed to start session, will retry");
                None
            }
        }
    }

    fn invalidate_synced(&self) {
        let Some(cache) = &self.cache else {
            return;
        };
        for prefix in &self.config.invalidate_on_sync {
            let removed = cache.invalidate(prefix);
            debug!(prefix = %prefix, removed, "Invalidated cache after sync notice");
        }
    }

    fn next_delay(&self) -> Duration {
        let jitter_ms = u64::try_from(self.config.jitter.as_millis()).unwrap_or(u64::MAX);
        if jitter_ms == 0 {
            return self.config.interval;
        }
        self.config.interval + Duration::from_millis(rand::rng().random_range(0..=jitter_ms))
    }
}
