//! Shared SQLite store for sessions and jobs.
//!
//! One database file serves every gateway and worker process on the host.
//! WAL mode lets readers (status polling) proceed during writes; the busy
//! timeout plus [`with_retry`] absorb lock contention between processes.

use std::future::Future;
use std::str::FromStr;
use std::time::Duration;

use sqlx::SqlitePool;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};

use crate::error::Error;

const SCHEMA: &str = r"
CREATE TABLE IF NOT EXISTS flow_sessions (
    id          TEXT PRIMARY KEY NOT NULL,
    data        TEXT NOT NULL,
    expires_at  INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_flow_sessions_expires ON flow_sessions(expires_at);

CREATE TABLE IF NOT EXISTS jobs (
    id                TEXT PRIMARY KEY NOT NULL,
    state             TEXT NOT NULL CHECK(state IN ('pending', 'running', 'success', 'error')),
    payload           TEXT NOT NULL,
    lease_token       TEXT,
    lease_expires_at  INTEGER,
    attempts          INTEGER NOT NULL DEFAULT 0,
    created_at        INTEGER NOT NULL,
    finished_at       INTEGER
);

CREATE INDEX IF NOT EXISTS idx_jobs_claimable ON jobs(state, created_at);

CREATE TABLE IF NOT EXISTS job_logs (
    seq     INTEGER PRIMARY KEY AUTOINCREMENT,
    job_id  TEXT NOT NULL,
    line    TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_job_logs_job ON job_logs(job_id, seq);
";

const MAX_ATTEMPTS: u32 = 10;
const BACKOFF_STEP_MS: u64 = 100;
const BACKOFF_CAP_MS: u64 = 2_000;

/// Opens (creating if needed) the store at `database_url` and applies the schema.
///
/// # Errors
///
/// Returns [`Error::Config`] for an unparsable URL and [`Error::Store`] if the
/// database cannot be opened or initialised.
pub async fn connect(database_url: &str) -> Result<SqlitePool, Error> {
    let options = SqliteConnectOptions::from_str(database_url)
        .map_err(|e| Error::Config(format!("DATABASE_URL: {e}")))?
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .busy_timeout(Duration::from_secs(5));

    let pool = SqlitePoolOptions::new()
        .max_connections(5)
        .min_connections(1)
        .acquire_timeout(Duration::from_secs(10))
        .connect_with(options)
        .await
        .map_err(|e| Error::Store(format!("Failed to connect to database: {e}")))?;

    init_schema(&pool).await?;
    Ok(pool)
}

/// Applies the schema; idempotent.
///
/// # Errors
///
/// Returns [`Error::Store`] if a statement fails.
pub async fn init_schema(pool: &SqlitePool) -> Result<(), Error> {
    sqlx::raw_sql(SCHEMA)
        .execute(pool)
        .await
        .map(|_| ())
        .map_err(|e| Error::Store(format!("Failed to initialize schema: {e}")))
}

/// Runs `op`, retrying transient failures with capped linear backoff.
///
/// Delays grow by 100 ms per attempt up to 2 s; after ten attempts the error
/// is surfaced. Non-transient errors are surfaced immediately.
pub(crate) async fn with_retry<T, F, Fut>(operation: &'static str, mut op: F) -> Result<T, Error>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, sqlx::Error>>,
{
    let mut attempt = 0;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if is_transient(&e) && attempt < MAX_ATTEMPTS => {
                attempt += 1;
                let delay = backoff(attempt);
                tracing::warn!(operation, attempt, error = %e, "Transient store error, retrying");
                tokio::time::sleep(delay).await;
            }
            Err(e) => {
                tracing::error!(operation, attempt, error = %e, "Store operation failed");
                return Err(Error::Store(format!("{operation}: {e}")));
            }
        }
    }
}

fn backoff(attempt: u32) -> Duration {
    Duration::from_millis((BACKOFF_STEP_MS * u64::from(attempt)).min(BACKOFF_CAP_MS))
}

/// Lock contention and connection-level failures; constraint or syntax
/// errors are not retried.
fn is_transient(e: &sqlx::Error) -> bool {
    match e {
        sqlx::Error::Io(_) | sqlx::Error::PoolTimedOut => true,
        sqlx::Error::Database(db) => db
            .code()
            .and_then(|code| code.parse::<i32>().ok())
            // SQLITE_BUSY = 5, SQLITE_LOCKED = 6; extended codes keep the primary code in the low byte.
            .is_some_and(|code| matches!(code & 0xff, 5 | 6)),
        _ => false,
    }
}

/// Current time as unix milliseconds.
pub(crate) fn now_millis() -> i64 {
    let nanos = time::OffsetDateTime::now_utc().unix_timestamp_nanos();
    i64::try_from(nanos / 1_000_000).unwrap_or(i64::MAX)
}

pub(crate) fn millis(duration: Duration) -> i64 {
    i64::try_from(duration.as_millis()).unwrap_or(i64::MAX)
}

#[cfg(test)]
pub(crate) async fn temp_pool() -> (tempfile::TempDir, SqlitePool) {
    let dir = tempfile::tempdir().unwrap();
    let url = format!("sqlite://{}", dir.path().join("store.db").display());
    let pool = connect(&url).await.unwrap();
    (dir, pool)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn backoff_is_capped() {
        assert_eq!(backoff(1), Duration::from_millis(100));
        assert_eq!(backoff(5), Duration::from_millis(500));
        assert_eq!(backoff(50), Duration::from_millis(2_000));
    }

    #[tokio::test]
    async fn connect_is_idempotent() {
        let (dir, pool) = temp_pool().await;
        init_schema(&pool).await.unwrap();
        let tables: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' \
             AND name IN ('flow_sessions', 'jobs', 'job_logs')",
        )
        .fetch_one(&pool)
        .await
        .unwrap();
        assert_eq!(tables, 3);
        drop(dir);
    }

    #[tokio::test(start_paused = true)]
    async fn retry_recovers_from_transient_errors() {
        let calls = AtomicU32::new(0);
        let result = with_retry("test", || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(sqlx::Error::PoolTimedOut)
                } else {
                    Ok(n)
                }
            }
        })
        .await;
        assert_eq!(result.unwrap(), 2);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn retry_surfaces_after_cap() {
        let calls = AtomicU32::new(0);
        let result: Result<(), Error> = with_retry("test", || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(sqlx::Error::PoolTimedOut) }
        })
        .await;
        assert!(matches!(result, Err(Error::Store(_))));
        assert_eq!(calls.load(Ordering::SeqCst), MAX_ATTEMPTS + 1);
    }

    #[tokio::test]
    async fn permanent_errors_are_not_retried() {
        let calls = AtomicU32::new(0);
        let result: Result<(), Error> = with_retry("test", || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(sqlx::Error::RowNotFound) }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
