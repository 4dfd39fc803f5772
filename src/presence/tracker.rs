//! Multi-device session lifecycle and the aggregated "who is online" view.
//!
//! Session status is never stored. Only `last_heartbeat_at` and `ended_at` are
//! persisted; status is derived from them whenever a session is read, so
//! listing presence is a pure query.

use crate::clock::Clock;
use crate::presence::errors::PresenceError;
use crate::presence::models::{
    HeartbeatAck, NewSession, PresenceSnapshot, PresenceThresholds, Session, UserProfile,
};
use crate::presence::store::{SessionStore, SyncBacklog, UserDirectory};
use crate::utils::warn_if_slow;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::cmp::Reverse;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, instrument, warn};

const SLOW_QUERY_THRESHOLD: Duration = Duration::from_millis(500);

type DeviceKey = (i64, String);

pub struct PresenceTracker {
    sessions: Arc<dyn SessionStore>,
    users: Arc<dyn UserDirectory>,
    backlog: Arc<dyn SyncBacklog>,
    clock: Arc<dyn Clock>,
    thresholds: PresenceThresholds,
    /// Serializes supersede-then-insert per (user, device). Entries are
    /// removed once no start is pending for the device.
    device_locks: DashMap<DeviceKey, Arc<Mutex<()>>>,
}

impl PresenceTracker {
    pub fn new(
        sessions: Arc<dyn SessionStore>,
        users: Arc<dyn UserDirectory>,
        backlog: Arc<dyn SyncBacklog>,
        clock: Arc<dyn Clock>,
        thresholds: PresenceThresholds,
    ) -> Self {
        Self {
            sessions,
            users,
            backlog,
            clock,
            thresholds,
            device_locks: DashMap::new(),
        }
    }

    pub fn thresholds(&self) -> &PresenceThresholds {
        &self.thresholds
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    /// Open a session on a device, ending any session still active there.
    #[instrument(skip(self, device_name, ip_address))]
    pub async fn start_session(
        &self,
        user_id: i64,
        device_id: &str,
        device_name: &str,
        ip_address: Option<String>,
    ) -> Result<Session, PresenceError> {
        let key = (user_id, device_id.to_owned());
        let lock = self
            .device_locks
            .entry(key.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();

        let result = {
            let _guard = lock.lock().await;
            self.supersede_and_insert(user_id, device_id, device_name, ip_address)
                .await
        };

        // Map entry plus our clone: nobody else is waiting on this device.
        self.device_locks
            .remove_if(&key, |_, held| Arc::strong_count(held) <= 2);
        result
    }

    async fn supersede_and_insert(
        &self,
        user_id: i64,
        device_id: &str,
        device_name: &str,
        ip_address: Option<String>,
    ) -> Result<Session, PresenceError> {
        let now = self.clock.now();
        if let Some(prior) = self
            .sessions
            .find_active_by_user_and_device(user_id, device_id)
            .await?
            && self.sessions.end(prior.id, now).await?
        {
            info!(superseded = prior.id, "Ended prior session on device");
        }

        let session = self
            .sessions
            .insert(NewSession {
                user_id,
                device_id: device_id.to_owned(),
                device_name: device_name.to_owned(),
                ip_address,
                started_at: now,
            })
            .await?;

        info!(session_id = session.id, "Session started");
        Ok(session)
    }

    /// Record a heartbeat. Unknown and already-ended sessions are reported as
    /// not found so the client knows to start a new one.
    pub async fn heartbeat(&self, session_id: i64) -> Result<HeartbeatAck, PresenceError> {
        let now = self.clock.now();
        let Some(session) = self.sessions.touch_heartbeat(session_id, now).await? else {
            warn!(session_id, "Heartbeat for unknown or ended session");
            return Err(PresenceError::NotFound(session_id));
        };

        let pending_sync = self.backlog.pending_for(session.user_id).await?;
        debug!(session_id, user_id = session.user_id, pending_sync, "Heartbeat");

        Ok(HeartbeatAck {
            success: true,
            server_time: now,
            pending_sync,
        })
    }

    /// End a session. Ending an already-ended session succeeds without change.
    pub async fn end_session(&self, session_id: i64) -> Result<(), PresenceError> {
        if self.sessions.end(session_id, self.clock.now()).await? {
            info!(session_id, "Session ended");
            return Ok(());
        }

        match self.sessions.find_by_id(session_id).await? {
            Some(_) => {
                debug!(session_id, "Session already ended");
                Ok(())
            }
            None => Err(PresenceError::NotFound(session_id)),
        }
    }

    /// Number of per-device start locks currently held in memory.
    pub fn device_lock_count(&self) -> usize {
        self.device_locks.len()
    }

    /// One entry per user with at least one active session, online users first.
    pub async fn active_presence(&self) -> Result<Vec<PresenceSnapshot>, PresenceError> {
        let sessions =
            warn_if_slow("list active sessions", SLOW_QUERY_THRESHOLD, self.sessions.list_active())
                .await?;

        let mut user_ids: Vec<i64> = sessions.iter().map(|s| s.user_id).collect();
        user_ids.sort_unstable();
        user_ids.dedup();
        let profiles = self.users.profiles(&user_ids).await?;

        let snapshots = aggregate(&sessions, &profiles, self.clock.now(), &self.thresholds);
        debug!(
            sessions = sessions.len(),
            users = snapshots.len(),
            "Computed active presence"
        );
        Ok(snapshots)
    }
}

/// Group active sessions by user and summarize each user by their most
/// recently heartbeating session.
///
/// Ended sessions are skipped. Ordering is online first, then most recent
/// `last_seen`, then user id.
pub fn aggregate(
    sessions: &[Session],
    profiles: &HashMap<i64, UserProfile>,
    now: DateTime<Utc>,
    thresholds: &PresenceThresholds,
) -> Vec<PresenceSnapshot> {
    let mut latest: HashMap<i64, &Session> = HashMap::new();
    for session in sessions.iter().filter(|s| s.is_active()) {
        latest
            .entry(session.user_id)
            .and_modify(|current| {
                if (session.last_heartbeat_at, session.id) > (current.last_heartbeat_at, current.id)
                {
                    *current = session;
                }
            })
            .or_insert(session);
    }

    let mut snapshots: Vec<PresenceSnapshot> = latest
        .into_values()
        .map(|session| {
            let (user_name, user_role) = match profiles.get(&session.user_id) {
                Some(profile) => (profile.name.clone(), profile.role.clone()),
                None => (format!("User #{}", session.user_id), "unknown".to_owned()),
            };
            PresenceSnapshot {
                user_id: session.user_id,
                user_name,
                user_role,
                status: session.status_at(now, thresholds),
                last_seen: session.last_heartbeat_at,
                device_name: session.device_name.clone(),
            }
        })
        .collect();

    snapshots.sort_by_key(|s| (s.status.rank(), Reverse(s.last_seen), s.user_id));
    snapshots
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::presence::models::SessionStatus;
    use crate::presence::store::MemorySessionStore;
    use chrono::TimeZone;

    fn start() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 14, 9, 0, 0).unwrap()
    }

    fn tracker() -> (PresenceTracker, MemorySessionStore, ManualClock) {
        let store = MemorySessionStore::new();
        store.add_user(1, "Dana", "manager");
        store.add_user(2, "Lee", "technician");
        store.add_user(3, "Sam", "receptionist");
        let clock = ManualClock::new(start());
        let tracker = PresenceTracker::new(
            Arc::new(store.clone()),
            Arc::new(store.clone()),
            Arc::new(store.clone()),
            Arc::new(clock.clone()),
            PresenceThresholds::default(),
        );
        (tracker, store, clock)
    }

    #[tokio::test]
    async fn new_session_on_same_device_supersedes_prior() {
        let (tracker, store, clock) = tracker();
        let first = tracker.start_session(1, "pc-1", "Office PC", None).await.unwrap();
        clock.advance(chrono::Duration::seconds(5));
        let second = tracker.start_session(1, "pc-1", "Office PC", None).await.unwrap();

        let first = store.find_by_id(first.id).await.unwrap().unwrap();
        assert_eq!(first.ended_at, Some(start() + chrono::Duration::seconds(5)));
        assert_eq!(
            first.status_at(clock.now(), tracker.thresholds()),
            SessionStatus::Offline
        );

        let active = store.list_active().await.unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].id, second.id);

        let presence = tracker.active_presence().await.unwrap();
        assert_eq!(presence.len(), 1);
        assert_eq!(presence[0].status, SessionStatus::Online);
    }

    #[tokio::test]
    async fn concurrent_starts_on_one_device_leave_one_active() {
        let (tracker, store, _clock) = tracker();
        let tracker = Arc::new(tracker);

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let tracker = Arc::clone(&tracker);
                tokio::spawn(async move { tracker.start_session(2, "tablet", "Tablet", None).await })
            })
            .collect();
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        assert_eq!(store.list_active().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn sessions_on_other_devices_are_untouched() {
        let (tracker, store, _clock) = tracker();
        tracker.start_session(1, "pc-1", "Office PC", None).await.unwrap();
        tracker.start_session(1, "phone", "Phone", None).await.unwrap();

        assert_eq!(store.list_active().await.unwrap().len(), 2);
        assert_eq!(tracker.active_presence().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn heartbeat_refreshes_and_reports_backlog() {
        let (tracker, store, clock) = tracker();
        let session = tracker.start_session(3, "desk", "Desk", None).await.unwrap();
        store.set_pending(3, 4);

        clock.advance(chrono::Duration::minutes(2));
        assert_eq!(
            tracker.active_presence().await.unwrap()[0].status,
            SessionStatus::Away
        );

        let ack = tracker.heartbeat(session.id).await.unwrap();
        assert!(ack.success);
        assert_eq!(ack.server_time, clock.now());
        assert_eq!(ack.pending_sync, 4);

        let presence = tracker.active_presence().await.unwrap();
        assert_eq!(presence[0].status, SessionStatus::Online);
        assert_eq!(presence[0].last_seen, clock.now());
    }

    #[tokio::test]
    async fn heartbeat_for_unknown_session_is_not_found() {
        let (tracker, _store, _clock) = tracker();
        let err = tracker.heartbeat(99999).await.unwrap_err();
        assert!(matches!(err, PresenceError::NotFound(99999)));
    }

    #[tokio::test]
    async fn heartbeat_for_ended_session_is_not_found() {
        let (tracker, _store, _clock) = tracker();
        let session = tracker.start_session(1, "pc-1", "Office PC", None).await.unwrap();
        tracker.end_session(session.id).await.unwrap();

        assert!(tracker.heartbeat(session.id).await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn end_session_is_idempotent() {
        let (tracker, store, clock) = tracker();
        let session = tracker.start_session(1, "pc-1", "Office PC", None).await.unwrap();

        tracker.end_session(session.id).await.unwrap();
        let ended_at = store.find_by_id(session.id).await.unwrap().unwrap().ended_at;
        clock.advance(chrono::Duration::minutes(1));
        tracker.end_session(session.id).await.unwrap();

        let after = store.find_by_id(session.id).await.unwrap().unwrap();
        assert_eq!(after.ended_at, ended_at);
        assert!(tracker.end_session(424242).await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn presence_transitions_with_heartbeat_age() {
        let (tracker, _store, clock) = tracker();
        tracker.start_session(1, "pc-1", "Office PC", None).await.unwrap();

        clock.advance(chrono::Duration::seconds(10));
        assert_eq!(tracker.active_presence().await.unwrap()[0].status, SessionStatus::Online);
        clock.advance(chrono::Duration::seconds(110));
        assert_eq!(tracker.active_presence().await.unwrap()[0].status, SessionStatus::Away);
        clock.advance(chrono::Duration::minutes(8));
        assert_eq!(
            tracker.active_presence().await.unwrap()[0].status,
            SessionStatus::Disconnected
        );
    }

    #[tokio::test]
    async fn ended_sessions_are_excluded_from_presence() {
        let (tracker, _store, _clock) = tracker();
        let session = tracker.start_session(1, "pc-1", "Office PC", None).await.unwrap();
        tracker.end_session(session.id).await.unwrap();

        assert!(tracker.active_presence().await.unwrap().is_empty());
    }

    /// Store whose `touch_heartbeat` parks until released, so other calls
    /// can run while a heartbeat is in flight.
    struct ParkedHeartbeats {
        inner: MemorySessionStore,
        entered: Arc<tokio::sync::Notify>,
        release: Arc<tokio::sync::Notify>,
    }

    #[async_trait::async_trait]
    impl SessionStore for ParkedHeartbeats {
        async fn insert(&self, session: NewSession) -> anyhow::Result<Session> {
            self.inner.insert(session).await
        }

        async fn find_by_id(&self, id: i64) -> anyhow::Result<Option<Session>> {
            self.inner.find_by_id(id).await
        }

        async fn find_active_by_user_and_device(
            &self,
            user_id: i64,
            device_id: &str,
        ) -> anyhow::Result<Option<Session>> {
            self.inner.find_active_by_user_and_device(user_id, device_id).await
        }

        async fn list_active(&self) -> anyhow::Result<Vec<Session>> {
            self.inner.list_active().await
        }

        async fn touch_heartbeat(
            &self,
            id: i64,
            at: DateTime<Utc>,
        ) -> anyhow::Result<Option<Session>> {
            self.entered.notify_one();
            self.release.notified().await;
            self.inner.touch_heartbeat(id, at).await
        }

        async fn end(&self, id: i64, at: DateTime<Utc>) -> anyhow::Result<bool> {
            self.inner.end(id, at).await
        }
    }

    fn parked_tracker() -> (Arc<PresenceTracker>, Arc<ParkedHeartbeats>, MemorySessionStore) {
        let inner = MemorySessionStore::new();
        let store = Arc::new(ParkedHeartbeats {
            inner: inner.clone(),
            entered: Arc::new(tokio::sync::Notify::new()),
            release: Arc::new(tokio::sync::Notify::new()),
        });
        let tracker = PresenceTracker::new(
            store.clone(),
            Arc::new(inner.clone()),
            Arc::new(inner.clone()),
            Arc::new(ManualClock::new(start())),
            PresenceThresholds::default(),
        );
        (Arc::new(tracker), store, inner)
    }

    #[tokio::test]
    async fn heartbeat_racing_end_does_not_revive_session() {
        let (tracker, parked, store) = parked_tracker();
        let session = tracker.start_session(1, "pc", "Office PC", None).await.unwrap();

        let pending = {
            let tracker = Arc::clone(&tracker);
            tokio::spawn(async move { tracker.heartbeat(session.id).await })
        };
        parked.entered.notified().await;
        tracker.end_session(session.id).await.unwrap();
        parked.release.notify_one();

        assert!(pending.await.unwrap().unwrap_err().is_not_found());
        let stored = store.find_by_id(session.id).await.unwrap().unwrap();
        assert_eq!(stored.ended_at, Some(start()));
        assert!(store.list_active().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn heartbeat_racing_supersede_keeps_one_active_session() {
        let (tracker, parked, store) = parked_tracker();
        let first = tracker.start_session(1, "pc", "Office PC", None).await.unwrap();

        let pending = {
            let tracker = Arc::clone(&tracker);
            tokio::spawn(async move { tracker.heartbeat(first.id).await })
        };
        parked.entered.notified().await;
        let second = tracker.start_session(1, "pc", "Office PC", None).await.unwrap();
        parked.release.notify_one();

        assert!(pending.await.unwrap().unwrap_err().is_not_found());
        let active: Vec<i64> = store.list_active().await.unwrap().iter().map(|s| s.id).collect();
        assert_eq!(active, vec![second.id]);

        let third = tracker.start_session(1, "pc", "Office PC", None).await.unwrap();
        assert_ne!(third.id, second.id);
    }

    #[tokio::test]
    async fn device_locks_are_released_after_start() {
        let (tracker, _store, _clock) = tracker();
        let tracker = Arc::new(tracker);

        let handles: Vec<_> = (0..6)
            .map(|i| {
                let tracker = Arc::clone(&tracker);
                tokio::spawn(async move {
                    tracker
                        .start_session(1, &format!("pc-{}", i % 2), "PC", None)
                        .await
                })
            })
            .collect();
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        assert_eq!(tracker.device_lock_count(), 0);
    }

    fn session(id: i64, user_id: i64, device: &str, age_secs: i64, now: DateTime<Utc>) -> Session {
        let at = now - chrono::Duration::seconds(age_secs);
        Session {
            id,
            user_id,
            device_id: device.to_owned(),
            device_name: device.to_owned(),
            ip_address: None,
            started_at: at,
            last_heartbeat_at: at,
            ended_at: None,
        }
    }

    #[test]
    fn aggregate_picks_most_recent_device_per_user() {
        let now = start();
        let sessions = vec![
            session(1, 1, "laptop", 400, now),
            session(2, 1, "phone", 20, now),
            session(3, 2, "desk", 90, now),
        ];
        let profiles = HashMap::from([(
            1,
            UserProfile {
                id: 1,
                name: "Dana".into(),
                role: "manager".into(),
            },
        )]);

        let snapshots = aggregate(&sessions, &profiles, now, &PresenceThresholds::default());

        assert_eq!(snapshots.len(), 2);
        assert_eq!(snapshots[0].user_id, 1);
        assert_eq!(snapshots[0].device_name, "phone");
        assert_eq!(snapshots[0].status, SessionStatus::Online);
        assert_eq!(snapshots[0].last_seen, now - chrono::Duration::seconds(20));
        assert_eq!(snapshots[1].user_name, "User #2");
        assert_eq!(snapshots[1].status, SessionStatus::Away);
    }

    #[test]
    fn aggregate_orders_online_first_then_recency() {
        let now = start();
        let sessions = vec![
            session(1, 10, "a", 1000, now),
            session(2, 11, "b", 100, now),
            session(3, 12, "c", 25, now),
            session(4, 13, "d", 5, now),
            session(5, 14, "e", 60, now),
        ];
        let mut ended = session(6, 15, "f", 1, now);
        ended.ended_at = Some(now);
        let mut all = sessions.clone();
        all.push(ended);

        let order: Vec<i64> = aggregate(&all, &HashMap::new(), now, &PresenceThresholds::default())
            .iter()
            .map(|s| s.user_id)
            .collect();

        assert_eq!(order, vec![13, 12, 14, 11, 10]);
    }
}
