//! `PgSessionStore` against a real database. Each test gets a fresh database
//! with the migrations applied; requires `DATABASE_URL`.

use chrono::{DateTime, Duration, TimeZone, Utc};
use opsdesk::clock::ManualClock;
use opsdesk::presence::{
    NewSession, PgSessionStore, PresenceThresholds, PresenceTracker, SessionStore, SyncBacklog,
    UserDirectory,
};
use sqlx::PgPool;
use std::sync::Arc;

fn start() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 3, 14, 9, 0, 0).unwrap()
}

async fn seed_users(pool: &PgPool) {
    sqlx::query(
        "INSERT INTO users (id, name, role) VALUES (1, 'Dana', 'manager'), (2, 'Lee', 'technician')",
    )
    .execute(pool)
    .await
    .expect("failed to seed users");
}

fn new_session(user_id: i64, device_id: &str) -> NewSession {
    NewSession {
        user_id,
        device_id: device_id.to_owned(),
        device_name: format!("{device_id} workstation"),
        ip_address: Some("10.0.0.5".into()),
        started_at: start(),
    }
}

#[sqlx::test(migrations = "./migrations")]
async fn insert_then_find_round_trips_the_row(pool: PgPool) {
    seed_users(&pool).await;
    let store = PgSessionStore::new(pool);

    let inserted = store.insert(new_session(1, "pc")).await.unwrap();
    assert_eq!(inserted.last_heartbeat_at, start());
    assert!(inserted.ended_at.is_none());

    let found = store.find_by_id(inserted.id).await.unwrap().unwrap();
    assert_eq!(found, inserted);
    assert_eq!(found.ip_address.as_deref(), Some("10.0.0.5"));

    let active = store
        .find_active_by_user_and_device(1, "pc")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(active.id, inserted.id);
    assert!(store.find_by_id(inserted.id + 1000).await.unwrap().is_none());
}

#[sqlx::test(migrations = "./migrations")]
async fn one_active_session_per_device(pool: PgPool) {
    seed_users(&pool).await;
    let store = PgSessionStore::new(pool);

    let first = store.insert(new_session(1, "pc")).await.unwrap();
    assert!(store.insert(new_session(1, "pc")).await.is_err());

    // Other devices and other users are unaffected.
    store.insert(new_session(1, "phone")).await.unwrap();
    store.insert(new_session(2, "pc")).await.unwrap();

    assert!(store.end(first.id, start() + Duration::seconds(5)).await.unwrap());
    let replacement = store.insert(new_session(1, "pc")).await.unwrap();

    let active: Vec<i64> = store.list_active().await.unwrap().iter().map(|s| s.id).collect();
    assert_eq!(active.len(), 3);
    assert!(active.contains(&replacement.id));
    assert!(!active.contains(&first.id));
}

#[sqlx::test(migrations = "./migrations")]
async fn ended_rows_reject_touch_and_second_end(pool: PgPool) {
    seed_users(&pool).await;
    let store = PgSessionStore::new(pool);
    let session = store.insert(new_session(1, "pc")).await.unwrap();

    let touched = store
        .touch_heartbeat(session.id, start() + Duration::seconds(10))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(touched.last_heartbeat_at, start() + Duration::seconds(10));

    let ended_at = start() + Duration::seconds(20);
    assert!(store.end(session.id, ended_at).await.unwrap());
    assert!(!store.end(session.id, ended_at + Duration::seconds(5)).await.unwrap());
    assert!(
        store
            .touch_heartbeat(session.id, ended_at + Duration::seconds(5))
            .await
            .unwrap()
            .is_none()
    );

    let stored = store.find_by_id(session.id).await.unwrap().unwrap();
    assert_eq!(stored.ended_at, Some(ended_at));
    assert_eq!(stored.last_heartbeat_at, start() + Duration::seconds(10));

    assert!(!store.end(9999, ended_at).await.unwrap());
    assert!(store.touch_heartbeat(9999, ended_at).await.unwrap().is_none());
}

#[sqlx::test(migrations = "./migrations")]
async fn profiles_returns_only_known_users(pool: PgPool) {
    seed_users(&pool).await;
    let store = PgSessionStore::new(pool);

    let profiles = store.profiles(&[1, 2, 99]).await.unwrap();
    assert_eq!(profiles.len(), 2);
    assert_eq!(profiles[&1].name, "Dana");
    assert_eq!(profiles[&2].role, "technician");

    assert!(store.profiles(&[]).await.unwrap().is_empty());
}

#[sqlx::test(migrations = "./migrations")]
async fn pending_counts_unprocessed_items_per_user(pool: PgPool) {
    seed_users(&pool).await;
    sqlx::query(
        "INSERT INTO inbound_items (user_id, processed) VALUES (1, false), (1, false), (1, true), (2, true)",
    )
    .execute(&pool)
    .await
    .unwrap();
    let store = PgSessionStore::new(pool);

    assert_eq!(store.pending_for(1).await.unwrap(), 2);
    assert_eq!(store.pending_for(2).await.unwrap(), 0);
    assert_eq!(store.pending_for(99).await.unwrap(), 0);
}

#[sqlx::test(migrations = "./migrations")]
async fn tracker_lifecycle_over_postgres(pool: PgPool) {
    seed_users(&pool).await;
    let store = Arc::new(PgSessionStore::new(pool));
    let clock = ManualClock::new(start());
    let tracker = PresenceTracker::new(
        store.clone(),
        store.clone(),
        store.clone(),
        Arc::new(clock.clone()),
        PresenceThresholds::default(),
    );

    let first = tracker.start_session(1, "pc", "Office PC", None).await.unwrap();
    clock.advance(Duration::seconds(5));
    let second = tracker.start_session(1, "pc", "Office PC", None).await.unwrap();

    assert!(tracker.heartbeat(first.id).await.unwrap_err().is_not_found());
    assert!(tracker.heartbeat(second.id).await.unwrap().success);

    let presence = tracker.active_presence().await.unwrap();
    assert_eq!(presence.len(), 1);
    assert_eq!(presence[0].user_name, "Dana");

    tracker.end_session(second.id).await.unwrap();
    tracker.end_session(second.id).await.unwrap();
    assert!(tracker.heartbeat(second.id).await.unwrap_err().is_not_found());
    assert!(tracker.active_presence().await.unwrap().is_empty());
}
