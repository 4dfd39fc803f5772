//! Storage seams for the presence tracker, plus an in-memory implementation.
//!
//! The tracker only needs a conventional entity-store contract. Postgres lives
//! in [`crate::presence::postgres`]; [`MemorySessionStore`] backs development
//! runs without `DATABASE_URL` and the test suite.

use crate::presence::models::{NewSession, Session, UserProfile};
use anyhow::{Result, bail};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};

#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Persist a new session and return it with its assigned id.
    async fn insert(&self, session: NewSession) -> Result<Session>;

    async fn find_by_id(&self, id: i64) -> Result<Option<Session>>;

    /// The session on this device that has not ended yet, if any.
    async fn find_active_by_user_and_device(
        &self,
        user_id: i64,
        device_id: &str,
    ) -> Result<Option<Session>>;

    /// Every session that has not ended.
    async fn list_active(&self) -> Result<Vec<Session>>;

    /// Set `last_heartbeat_at` on a session that has not ended. Returns the
    /// updated session, or `None` when the id is unknown or already ended.
    async fn touch_heartbeat(&self, id: i64, at: DateTime<Utc>) -> Result<Option<Session>>;

    /// Set `ended_at` on a session that has not ended. Returns `false` when
    /// the id is unknown or already ended.
    async fn end(&self, id: i64, at: DateTime<Utc>) -> Result<bool>;
}

/// Resolves user ids to display attributes for presence listings.
#[async_trait]
pub trait UserDirectory: Send + Sync {
    /// Profiles for the given ids. Unknown ids are simply absent.
    async fn profiles(&self, user_ids: &[i64]) -> Result<HashMap<i64, UserProfile>>;
}

/// Application backlog reported with each heartbeat, e.g. unprocessed inbound items.
#[async_trait]
pub trait SyncBacklog: Send + Sync {
    async fn pending_for(&self, user_id: i64) -> Result<u64>;
}

/// In-process store. Clone-cheap; clones share the same data.
#[derive(Debug, Clone, Default)]
pub struct MemorySessionStore {
    sessions: Arc<DashMap<i64, Session>>,
    next_id: Arc<AtomicI64>,
    users: Arc<DashMap<i64, UserProfile>>,
    backlog: Arc<DashMap<i64, u64>>,
}

impl MemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_user(&self, id: i64, name: &str, role: &str) {
        self.users.insert(
            id,
            UserProfile {
                id,
                name: name.to_owned(),
                role: role.to_owned(),
            },
        );
    }

    pub fn set_pending(&self, user_id: i64, pending: u64) {
        self.backlog.insert(user_id, pending);
    }
}

#[async_trait]
impl SessionStore for MemorySessionStore {
    async fn insert(&self, new: NewSession) -> Result<Session> {
        // Mirror the database's partial unique index on active (user, device).
        if let Some(existing) = self.sessions.iter().find(|s| {
            s.is_active() && s.user_id == new.user_id && s.device_id == new.device_id
        }) {
            bail!(
                "active session {} already exists for user {} on device {}",
                existing.id,
                new.user_id,
                new.device_id
            );
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let session = Session {
            id,
            user_id: new.user_id,
            device_id: new.device_id,
            device_name: new.device_name,
            ip_address: new.ip_address,
            started_at: new.started_at,
            last_heartbeat_at: new.started_at,
            ended_at: None,
        };
        self.sessions.insert(id, session.clone());
        Ok(session)
    }

    async fn find_by_id(&self, id: i64) -> Result<Option<Session>> {
        Ok(self.sessions.get(&id).map(|s| s.clone()))
    }

    async fn find_active_by_user_and_device(
        &self,
        user_id: i64,
        device_id: &str,
    ) -> Result<Option<Session>> {
        Ok(self
            .sessions
            .iter()
            .find(|s| s.is_active() && s.user_id == user_id && s.device_id == device_id)
            .map(|s| s.clone()))
    }

    async fn list_active(&self) -> Result<Vec<Session>> {
        let mut active: Vec<Session> = self
            .sessions
            .iter()
            .filter(|s| s.is_active())
            .map(|s| s.clone())
            .collect();
        active.sort_by_key(|s| s.id);
        Ok(active)
    }

    async fn touch_heartbeat(&self, id: i64, at: DateTime<Utc>) -> Result<Option<Session>> {
        // Check and write under the entry's shard lock.
        Ok(self
            .sessions
            .get_mut(&id)
            .filter(|stored| stored.is_active())
            .map(|mut stored| {
                stored.last_heartbeat_at = at;
                stored.clone()
            }))
    }

    async fn end(&self, id: i64, at: DateTime<Utc>) -> Result<bool> {
        match self.sessions.get_mut(&id) {
            Some(mut stored) if stored.is_active() => {
                stored.ended_at = Some(at);
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

#[async_trait]
impl UserDirectory for MemorySessionStore {
    async fn profiles(&self, user_ids: &[i64]) -> Result<HashMap<i64, UserProfile>> {
        Ok(user_ids
            .iter()
            .filter_map(|id| self.users.get(id).map(|u| (*id, u.clone())))
            .collect())
    }
}

#[async_trait]
impl SyncBacklog for MemorySessionStore {
    async fn pending_for(&self, user_id: i64) -> Result<u64> {
        Ok(self.backlog.get(&user_id).map(|n| *n).unwrap_or(0))
    }
}

/// Backlog source for deployments without a sync queue.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoBacklog;

#[async_trait]
impl SyncBacklog for NoBacklog {
    async fn pending_for(&self, _user_id: i64) -> Result<u64> {
        Ok(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_session(user_id: i64, device_id: &str) -> NewSession {
        NewSession {
            user_id,
            device_id: device_id.to_owned(),
            device_name: format!("{device_id} workstation"),
            ip_address: Some("10.0.0.5".into()),
            started_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn insert_assigns_increasing_ids() {
        let store = MemorySessionStore::new();
        let a = store.insert(new_session(1, "pc")).await.unwrap();
        let b = store.insert(new_session(2, "pc")).await.unwrap();

        assert_eq!(a.id, 1);
        assert_eq!(b.id, 2);
        assert_eq!(a.last_heartbeat_at, a.started_at);
    }

    #[tokio::test]
    async fn rejects_second_active_session_on_device() {
        let store = MemorySessionStore::new();
        store.insert(new_session(1, "pc")).await.unwrap();

        assert!(store.insert(new_session(1, "pc")).await.is_err());
    }

    #[tokio::test]
    async fn ended_sessions_drop_out_of_active_queries() {
        let store = MemorySessionStore::new();
        let session = store.insert(new_session(1, "pc")).await.unwrap();
        assert!(store.end(session.id, Utc::now()).await.unwrap());

        assert!(store.list_active().await.unwrap().is_empty());
        assert!(
            store
                .find_active_by_user_and_device(1, "pc")
                .await
                .unwrap()
                .is_none()
        );
        assert!(store.find_by_id(session.id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn ended_session_cannot_be_touched_or_ended_again() {
        let store = MemorySessionStore::new();
        let session = store.insert(new_session(1, "pc")).await.unwrap();
        let ended_at = Utc::now();
        assert!(store.end(session.id, ended_at).await.unwrap());

        let later = ended_at + chrono::Duration::seconds(30);
        assert!(store.touch_heartbeat(session.id, later).await.unwrap().is_none());
        assert!(!store.end(session.id, later).await.unwrap());

        let stored = store.find_by_id(session.id).await.unwrap().unwrap();
        assert_eq!(stored.ended_at, Some(ended_at));
        assert_eq!(stored.last_heartbeat_at, session.last_heartbeat_at);
    }

    #[tokio::test]
    async fn touch_and_end_unknown_session_report_absence() {
        let store = MemorySessionStore::new();

        assert!(store.touch_heartbeat(404, Utc::now()).await.unwrap().is_none());
        assert!(!store.end(404, Utc::now()).await.unwrap());
    }

    #[tokio::test]
    async fn touch_updates_only_the_heartbeat() {
        let store = MemorySessionStore::new();
        let session = store.insert(new_session(1, "pc")).await.unwrap();
        let at = session.started_at + chrono::Duration::seconds(15);

        let touched = store.touch_heartbeat(session.id, at).await.unwrap().unwrap();
        assert_eq!(touched.last_heartbeat_at, at);
        assert!(touched.is_active());
    }

    #[tokio::test]
    async fn backlog_defaults_to_zero() {
        let store = MemorySessionStore::new();
        store.set_pending(3, 12);

        assert_eq!(store.pending_for(3).await.unwrap(), 12);
        assert_eq!(store.pending_for(4).await.unwrap(), 0);
        assert_eq!(NoBacklog.pending_for(3).await.unwrap(), 0);
    }
}
