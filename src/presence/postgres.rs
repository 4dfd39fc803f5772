//! Postgres-backed session storage.
//!
//! `user_sessions` has a partial unique index on `(user_id, device_id)` for
//! rows with `ended_at IS NULL`, so the one-active-session-per-device rule
//! also holds across multiple server processes.

use crate::presence::models::{NewSession, Session, UserProfile};
use crate::presence::store::{SessionStore, SyncBacklog, UserDirectory};
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use std::collections::HashMap;

const SESSION_SELECT: &str = "SELECT id, user_id, device_id, device_name, ip_address, \
     started_at, last_heartbeat_at, ended_at FROM user_sessions";

#[derive(Debug, Clone)]
pub struct PgSessionStore {
    pool: PgPool,
}

impl PgSessionStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl SessionStore for PgSessionStore {
    async fn insert(&self, new: NewSession) -> Result<Session> {
        sqlx::query_as::<_, Session>(
            r#"
            INSERT INTO user_sessions
                (user_id, device_id, device_name, ip_address, started_at, last_heartbeat_at)
            VALUES ($1, $2, $3, $4, $5, $5)
            RETURNING id, user_id, device_id, device_name, ip_address,
                      started_at, last_heartbeat_at, ended_at
            "#,
        )
        .bind(new.user_id)
        .bind(&new.device_id)
        .bind(&new.device_name)
        .bind(&new.ip_address)
        .bind(new.started_at)
        .fetch_one(&self.pool)
        .await
        .context("Failed to insert session")
    }

    async fn find_by_id(&self, id: i64) -> Result<Option<Session>> {
        sqlx::query_as::<_, Session>(&format!("{SESSION_SELECT} WHERE id = $1"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(anyhow::Error::from)
    }

    async fn find_active_by_user_and_device(
        &self,
        user_id: i64,
        device_id: &str,
    ) -> Result<Option<Session>> {
        sqlx::query_as::<_, Session>(&format!(
            "{SESSION_SELECT} WHERE user_id = $1 AND device_id = $2 AND ended_at IS NULL"
        ))
        .bind(user_id)
        .bind(device_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(anyhow::Error::from)
    }

    async fn list_active(&self) -> Result<Vec<Session>> {
        sqlx::query_as::<_, Session>(&format!(
            "{SESSION_SELECT} WHERE ended_at IS NULL ORDER BY id"
        ))
        .fetch_all(&self.pool)
        .await
        .map_err(anyhow::Error::from)
    }

    async fn touch_heartbeat(&self, id: i64, at: DateTime<Utc>) -> Result<Option<Session>> {
        sqlx::query_as::<_, Session>(
            r#"
            UPDATE user_sessions SET last_heartbeat_at = $2
            WHERE id = $1 AND ended_at IS NULL
            RETURNING id, user_id, device_id, device_name, ip_address,
                      started_at, last_heartbeat_at, ended_at
            "#,
        )
        .bind(id)
        .bind(at)
        .fetch_optional(&self.pool)
        .await
        .context("Failed to record heartbeat")
    }

    async fn end(&self, id: i64, at: DateTime<Utc>) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE user_sessions SET ended_at = $2 WHERE id = $1 AND ended_at IS NULL",
        )
        .bind(id)
        .bind(at)
        .execute(&self.pool)
        .await
        .context("Failed to end session")?;
        Ok(result.rows_affected() > 0)
    }
}

#[async_trait]
impl UserDirectory for PgSessionStore {
    async fn profiles(&self, user_ids: &[i64]) -> Result<HashMap<i64, UserProfile>> {
        if user_ids.is_empty() {
            return Ok(HashMap::new());
        }
        let rows: Vec<UserProfile> =
            sqlx::query_as("SELECT id, name, role FROM users WHERE id = ANY($1)")
                .bind(user_ids)
                .fetch_all(&self.pool)
                .await?;
        Ok(rows.into_iter().map(|u| (u.id, u)).collect())
    }
}

#[async_trait]
impl SyncBacklog for PgSessionStore {
    async fn pending_for(&self, user_id: i64) -> Result<u64> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM inbound_items WHERE user_id = $1 AND NOT processed",
        )
        .bind(user_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(u64::try_from(count).unwrap_or(0))
    }
}
