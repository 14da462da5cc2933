use sqlx::SqlitePool;
use time::OffsetDateTime;

use super::{FlowSession, SessionStore};
use crate::db::with_retry;
use crate::error::Error;
use crate::types::SessionId;

/// Session store shared by every gateway instance through the SQLite file.
#[derive(Debug, Clone)]
pub struct SqliteSessionStore {
    pool: SqlitePool,
}

impl SqliteSessionStore {
    #[must_use]
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

impl SessionStore for SqliteSessionStore {
    async fn create(&self, id: &SessionId, session: FlowSession) -> Result<(), Error> {
        let data = serde_json::to_string(&session)
            .map_err(|e| Error::Store(format!("serialize session: {e}")))?;
        let expires_at = session.expires_at.unix_timestamp();
        let pool = &self.pool;
        let id = id.as_str();
        let data = data.as_str();

        with_retry("create session", || {
            sqlx::query("INSERT INTO flow_sessions (id, data, expires_at) VALUES (?1, ?2, ?3)")
                .bind(id)
                .bind(data)
                .bind(expires_at)
                .execute(pool)
        })
        .await
        .map(|_| ())
    }

    async fn find(&self, id: &SessionId) -> Result<Option<FlowSession>, Error> {
        let now = OffsetDateTime::now_utc().unix_timestamp();
        let pool = &self.pool;
        let id = id.as_str();

        let row: Option<String> = with_retry("find session", || {
            sqlx::query_scalar("SELECT data FROM flow_sessions WHERE id = ?1 AND expires_at > ?2")
                .bind(id)
                .bind(now)
                .fetch_optional(pool)
        })
        .await?;

        row.map(|data| {
            serde_json::from_str(&data).map_err(|e| Error::Store(format!("decode session: {e}")))
        })
        .transpose()
    }

    async fn take(&self, id: &SessionId) -> Result<Option<FlowSession>, Error> {
        let now = OffsetDateTime::now_utc().unix_timestamp();
        let pool = &self.pool;
        let id = id.as_str();

        let row: Option<(String, i64)> = with_retry("take session", || {
            sqlx::query_as("DELETE FROM flow_sessions WHERE id = ?1 RETURNING data, expires_at")
                .bind(id)
                .fetch_optional(pool)
        })
        .await?;

        match row {
            Some((data, expires_at)) if expires_at > now => serde_json::from_str(&data)
                .map(Some)
                .map_err(|e| Error::Store(format!("decode session: {e}"))),
            _ => Ok(None),
        }
    }

    async fn delete(&self, id: &SessionId) -> Result<(), Error> {
        let pool = &self.pool;
        let id = id.as_str();

        with_retry("delete session", || {
            sqlx::query("DELETE FROM flow_sessions WHERE id = ?1")
                .bind(id)
                .execute(pool)
        })
        .await
        .map(|_| ())
    }

    async fn purge_expired(&self) -> Result<u64, Error> {
        let now = OffsetDateTime::now_utc().unix_timestamp();
        let pool = &self.pool;

        with_retry("purge sessions", || {
            sqlx::query("DELETE FROM flow_sessions WHERE expires_at <= ?1")
                .bind(now)
                .execute(pool)
        })
        .await
        .map(|r| r.rows_affected())
    }
}
