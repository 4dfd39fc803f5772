//! Session records and the liveness rules derived from them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use ts_rs::TS;

/// Liveness of one session, judged at read time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, TS)]
#[serde(rename_all = "lowercase")]
#[ts(export)]
pub enum SessionStatus {
    Online,
    Away,
    Disconnected,
    /// Ended explicitly or superseded by a newer session on the same device.
    Offline,
}

impl SessionStatus {
    /// Sort rank for presence listings: online users first.
    pub(crate) fn rank(self) -> u8 {
        match self {
            SessionStatus::Online => 0,
            SessionStatus::Away => 1,
            SessionStatus::Disconnected => 2,
            SessionStatus::Offline => 3,
        }
    }
}

/// Heartbeat-age cutoffs. `online_within` must be shorter than `away_within`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PresenceThresholds {
    pub online_within: Duration,
    pub away_within: Duration,
}

impl Default for PresenceThresholds {
    fn default() -> Self {
        Self {
            online_within: Duration::from_secs(30),
            away_within: Duration::from_secs(5 * 60),
        }
    }
}

impl PresenceThresholds {
    /// Classify a heartbeat that is `age` old. Boundaries are inclusive.
    pub fn classify(&self, age: Duration) -> SessionStatus {
        if age <= self.online_within {
            SessionStatus::Online
        } else if age <= self.away_within {
            SessionStatus::Away
        } else {
            SessionStatus::Disconnected
        }
    }
}

/// A device session as persisted. Status is not stored; see [`Session::status_at`].
#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct Session {
    pub id: i64,
    pub user_id: i64,
    pub device_id: String,
    pub device_name: String,
    pub ip_address: Option<String>,
    pub started_at: DateTime<Utc>,
    pub last_heartbeat_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
}

impl Session {
    pub fn is_active(&self) -> bool {
        self.ended_at.is_none()
    }

    /// Derive the session's status as of `now`.
    ///
    /// Heartbeats stamped slightly in the future (clock skew between writers)
    /// count as age zero.
    pub fn status_at(&self, now: DateTime<Utc>, thresholds: &PresenceThresholds) -> SessionStatus {
        if self.ended_at.is_some() {
            return SessionStatus::Offline;
        }
        let age = (now - self.last_heartbeat_at).to_std().unwrap_or(Duration::ZERO);
        thresholds.classify(age)
    }

    pub fn to_record(&self, now: DateTime<Utc>, thresholds: &PresenceThresholds) -> SessionRecord {
        SessionRecord {
            id: self.id,
            user_id: self.user_id,
            device_id: self.device_id.clone(),
            device_name: self.device_name.clone(),
            ip_address: self.ip_address.clone(),
            started_at: self.started_at,
            last_heartbeat_at: self.last_heartbeat_at,
            ended_at: self.ended_at,
            status: self.status_at(now, thresholds),
        }
    }
}

/// Fields supplied when a session is created; the store assigns the id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewSession {
    pub user_id: i64,
    pub device_id: String,
    pub device_name: String,
    pub ip_address: Option<String>,
    pub started_at: DateTime<Utc>,
}

/// Display attributes for a user in presence listings.
#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct UserProfile {
    pub id: i64,
    pub name: String,
    pub role: String,
}

/// Full session as returned over the wire, with its derived status.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TS)]
#[serde(rename_all = "camelCase")]
#[ts(export)]
pub struct SessionRecord {
    #[ts(type = "number")]
    pub id: i64,
    #[ts(type = "number")]
    pub user_id: i64,
    pub device_id: String,
    pub device_name: String,
    pub ip_address: Option<String>,
    pub started_at: DateTime<Utc>,
    pub last_heartbeat_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub status: SessionStatus,
}

/// Body of `POST /api/sessions/start`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TS)]
#[serde(rename_all = "camelCase")]
#[ts(export)]
pub struct StartSessionRequest {
    pub device_id: String,
    pub device_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[ts(type = "number | null")]
    pub user_id: Option<i64>,
}

/// Body of `POST /api/sessions/heartbeat`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, TS)]
#[serde(rename_all = "camelCase")]
#[ts(export)]
pub struct HeartbeatRequest {
    #[ts(type = "number")]
    pub session_id: i64,
}

/// Result of a successful heartbeat.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TS)]
#[serde(rename_all = "camelCase")]
#[ts(export)]
pub struct HeartbeatAck {
    pub success: bool,
    pub server_time: DateTime<Utc>,
    #[ts(type = "number")]
    pub pending_sync: u64,
}

/// One user's aggregated presence across all of their active sessions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TS)]
#[serde(rename_all = "camelCase")]
#[ts(export)]
pub struct PresenceSnapshot {
    #[ts(type = "number")]
    pub user_id: i64,
    pub user_name: String,
    pub user_role: String,
    pub status: SessionStatus,
    pub last_seen: DateTime<Utc>,
    pub device_name: String,
}
