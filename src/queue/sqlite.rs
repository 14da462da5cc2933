use std::time::Duration;

use sqlx::SqlitePool;

use super::{ClaimedJob, DEFAULT_LEASE, JobPayload, JobQueue, JobState, JobStatus, error_line};
use crate::db::{millis, now_millis, with_retry};
use crate::error::Error;
use crate::types::{JobId, Lease};

/// Job queue backed by the shared SQLite store.
///
/// Claims are a single `UPDATE … RETURNING` statement, so SQLite's write lock
/// serialises competing workers across processes.
#[derive(Debug, Clone)]
pub struct SqliteQueue {
    pool: SqlitePool,
    lease: Duration,
}

impl SqliteQueue {
    #[must_use]
    pub fn new(pool: SqlitePool) -> Self {
        Self {
            pool,
            lease: DEFAULT_LEASE,
        }
    }

    #[must_use]
    pub fn with_lease(mut self, lease: Duration) -> Self {
        self.lease = lease;
        self
    }

    /// Moves a leased job to a terminal state, synthesizing the error line for `reason`.
    async fn finish(&self, lease: &Lease, state: JobState, reason: Option<&str>) -> Result<(), Error> {
        let pool = &self.pool;
        let id = lease.job_id.as_str();
        let token = lease.token.as_str();

        let updated = with_retry("finish job", || async move {
            let mut tx = pool.begin().await?;

            if let Some(reason) = reason {
                let logs: Vec<String> =
                    sqlx::query_scalar("SELECT line FROM job_logs WHERE job_id = ?1 ORDER BY seq")
                        .bind(id)
                        .fetch_all(&mut *tx)
                        .await?;
                if let Some(line) = error_line(&logs, reason) {
                    sqlx::query(
                        "INSERT INTO job_logs (job_id, line) \
                         SELECT id, ?2 FROM jobs WHERE id = ?1 AND lease_token = ?3 AND state = 'running'",
                    )
                    .bind(id)
                    .bind(line)
                    .bind(token)
                    .execute(&mut *tx)
                    .await?;
                }
            }

            let result = sqlx::query(
                "UPDATE jobs SET state = ?3, lease_token = NULL, lease_expires_at = NULL, finished_at = ?4 \
                 WHERE id = ?1 AND lease_token = ?2 AND state = 'running'",
            )
            .bind(id)
            .bind(token)
            .bind(state.as_str())
            .bind(now_millis())
            .execute(&mut *tx)
            .await?;

            if result.rows_affected() == 1 {
                tx.commit().await?;
                Ok(true)
            } else {
                tx.rollback().await?;
                Ok(false)
            }
        })
        .await?;

        if updated {
            Ok(())
        } else {
            Err(Error::LeaseLost(lease.job_id.clone()))
        }
    }
}

impl JobQueue for SqliteQueue {
    async fn enqueue(&self, payload: JobPayload, greeting: &[&str]) -> Result<JobId, Error> {
        let id = JobId::generate();
        let data = serde_json::to_string(&payload)
            .map_err(|e| Error::Store(format!("serialize payload: {e}")))?;
        let pool = &self.pool;
        let id_str = id.as_str();
        let data = data.as_str();

        with_retry("enqueue job", || async move {
            let mut tx = pool.begin().await?;
            sqlx::query(
                "INSERT INTO jobs (id, state, payload, created_at) VALUES (?1, 'pending', ?2, ?3)",
            )
            .bind(id_str)
            .bind(data)
            .bind(now_millis())
            .execute(&mut *tx)
            .await?;
            for line in greeting {
                sqlx::query("INSERT INTO job_logs (job_id, line) VALUES (?1, ?2)")
                    .bind(id_str)
                    .bind(*line)
                    .execute(&mut *tx)
                    .await?;
            }
            tx.commit().await
        })
        .await?;

        tracing::debug!(job_id = %id, "Job enqueued");
        Ok(id)
    }

    async fn claim(&self) -> Result<Option<ClaimedJob>, Error> {
        let pool = &self.pool;
        let lease_for = millis(self.lease);
        let token = Lease::generate_token();
        let token = token.as_str();

        let row: Option<(String, String, i64)> = with_retry("claim job", || {
            let now = now_millis();
            sqlx::query_as(
                "UPDATE jobs SET state = 'running', lease_token = ?1, lease_expires_at = ?2, \
                 attempts = attempts + 1 \
                 WHERE id = (SELECT id FROM jobs \
                             WHERE state = 'pending' OR (state = 'running' AND lease_expires_at <= ?3) \
                             ORDER BY created_at, id LIMIT 1) \
                 RETURNING id, payload, attempts",
            )
            .bind(token)
            .bind(now.saturating_add(lease_for))
            .bind(now)
            .fetch_optional(pool)
        })
        .await?;

        let Some((id, payload, attempts)) = row else {
            return Ok(None);
        };
        let job_id = JobId::from(id);
        let payload: JobPayload = serde_json::from_str(&payload)
            .map_err(|e| Error::Store(format!("decode payload for {job_id}: {e}")))?;

        Ok(Some(ClaimedJob {
            lease: Lease {
                job_id,
                token: token.to_string(),
            },
            payload,
            attempt: u32::try_from(attempts).unwrap_or(u32::MAX),
        }))
    }

    async fn heartbeat(&self, lease: &Lease) -> Result<(), Error> {
        let pool = &self.pool;
        let lease_for = millis(self.lease);

        let result = with_retry("heartbeat", || {
            sqlx::query(
                "UPDATE jobs SET lease_expires_at = ?3 \
                 WHERE id = ?1 AND lease_token = ?2 AND state = 'running'",
            )
            .bind(lease.job_id.as_str())
            .bind(lease.token.as_str())
            .bind(now_millis().saturating_add(lease_for))
            .execute(pool)
        })
        .await?;

        if result.rows_affected() == 0 {
            return Err(Error::LeaseLost(lease.job_id.clone()));
        }
        Ok(())
    }

    async fn append_log(&self, lease: &Lease, line: &str) -> Result<(), Error> {
        let pool = &self.pool;

        let result = with_retry("append log", || {
            sqlx::query(
                "INSERT INTO job_logs (job_id, line) \
                 SELECT id, ?2 FROM jobs WHERE id = ?1 AND lease_token = ?3 AND state = 'running'",
            )
            .bind(lease.job_id.as_str())
            .bind(line)
            .bind(lease.token.as_str())
            .execute(pool)
        })
        .await?;

        if result.rows_affected() == 0 {
            return Err(Error::LeaseLost(lease.job_id.clone()));
        }
        Ok(())
    }

    async fn complete(&self, lease: &Lease) -> Result<(), Error> {
        self.finish(lease, JobState::Success, None).await
    }

    async fn fail(&self, lease: &Lease, reason: &str) -> Result<(), Error> {
        self.finish(lease, JobState::Error, Some(reason)).await
    }

    async fn status(&self, id: &JobId) -> Result<JobStatus, Error> {
        let pool = &self.pool;
        let id = id.as_str();

        let state: Option<String> = with_retry("job status", || {
            sqlx::query_scalar("SELECT state FROM jobs WHERE id = ?1")
                .bind(id)
                .fetch_optional(pool)
        })
        .await?;
        let Some(state) = state else {
            return Ok(JobStatus::unknown());
        };

        let logs: Vec<String> = with_retry("job logs", || {
            sqlx::query_scalar("SELECT line FROM job_logs WHERE job_id = ?1 ORDER BY seq")
                .bind(id)
                .fetch_all(pool)
        })
        .await?;

        Ok(JobStatus {
            status: JobState::parse(&state),
            logs,
        })
    }

    async fn reap(&self, retention: Duration) -> Result<u64, Error> {
        let pool = &self.pool;
        let cutoff = now_millis().saturating_sub(millis(retention));

        with_retry("reap jobs", || async move {
            let mut tx = pool.begin().await?;
            sqlx::query(
                "DELETE FROM job_logs WHERE job_id IN \
                 (SELECT id FROM jobs WHERE state IN ('success', 'error') AND finished_at <= ?1)",
            )
            .bind(cutoff)
            .execute(&mut *tx)
            .await?;
            let result = sqlx::query(
                "DELETE FROM jobs WHERE state IN ('success', 'error') AND finished_at <= ?1",
            )
            .bind(cutoff)
            .execute(&mut *tx)
            .await?;
            tx.commit().await?;
            Ok(result.rows_affected())
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::temp_pool;
    use crate::queue::WELCOME_LINES;
    use crate::queue::tests::payload;
    use std::collections::HashSet;

    #[tokio::test]
    async fn worker_lines_then_complete() {
        let (_dir, pool) = temp_pool().await;
        let queue = SqliteQueue::new(pool);
        let id = queue.enqueue(payload(), &[]).await.unwrap();

        let job = queue.claim().await.unwrap().unwrap();
        assert_eq!(job.id(), &id);
        assert_eq!(job.payload, payload());
        for line in ["one", "two", "three"] {
            queue.append_log(&job.lease, line).await.unwrap();
        }
        queue.complete(&job.lease).await.unwrap();

        let status = queue.status(&id).await.unwrap();
        assert_eq!(status.status, JobState::Success);
        assert_eq!(status.logs, ["one", "two", "three"]);
    }

    #[tokio::test]
    async fn greeting_is_stored_in_order() {
        let (_dir, pool) = temp_pool().await;
        let queue = SqliteQueue::new(pool);
        let id = queue.enqueue(payload(), &WELCOME_LINES).await.unwrap();
        let status = queue.status(&id).await.unwrap();
        assert_eq!(status.status, JobState::Pending);
        assert_eq!(status.logs, WELCOME_LINES);
    }

    #[tokio::test]
    async fn never_enqueued_is_unknown() {
        let (_dir, pool) = temp_pool().await;
        let queue = SqliteQueue::new(pool);
        assert_eq!(
            queue.status(&JobId::generate()).await.unwrap(),
            JobStatus::unknown()
        );
    }

    #[tokio::test]
    async fn claims_across_queue_handles_are_exclusive() {
        let (_dir, pool) = temp_pool().await;
        let producer = SqliteQueue::new(pool.clone());
        for _ in 0..12 {
            producer.enqueue(payload(), &[]).await.unwrap();
        }

        let mut handles = Vec::new();
        for _ in 0..4 {
            let queue = SqliteQueue::new(pool.clone());
            handles.push(tokio::spawn(async move {
                let mut ids = Vec::new();
                while let Some(job) = queue.claim().await.unwrap() {
                    ids.push(job.id().clone());
                }
                ids
            }));
        }

        let mut seen = HashSet::new();
        for handle in handles {
            for id in handle.await.unwrap() {
                assert!(seen.insert(id), "job claimed twice");
            }
        }
        assert_eq!(seen.len(), 12);
    }

    #[tokio::test]
    async fn lapsed_lease_is_redelivered_and_old_holder_fenced() {
        let (_dir, pool) = temp_pool().await;
        let queue = SqliteQueue::new(pool).with_lease(Duration::ZERO);
        let id = queue.enqueue(payload(), &[]).await.unwrap();

        let first = queue.claim().await.unwrap().unwrap();
        let second = queue.claim().await.unwrap().unwrap();
        assert_eq!(second.id(), &id);
        assert_eq!(second.attempt, 2);

        assert!(matches!(
            queue.append_log(&first.lease, "stale").await,
            Err(Error::LeaseLost(_))
        ));
        assert!(matches!(queue.heartbeat(&first.lease).await, Err(Error::LeaseLost(_))));
        queue.complete(&second.lease).await.unwrap();
        assert!(matches!(queue.fail(&first.lease, "x").await, Err(Error::LeaseLost(_))));
        assert_eq!(queue.status(&id).await.unwrap().status, JobState::Success);
    }

    #[tokio::test]
    async fn fail_appends_error_line_unless_present() {
        let (_dir, pool) = temp_pool().await;
        let queue = SqliteQueue::new(pool);

        let id = queue.enqueue(payload(), &[]).await.unwrap();
        let job = queue.claim().await.unwrap().unwrap();
        queue.append_log(&job.lease, "working").await.unwrap();
        queue.fail(&job.lease, "Data load script failed").await.unwrap();
        let status = queue.status(&id).await.unwrap();
        assert_eq!(status.status, JobState::Error);
        assert_eq!(status.logs, ["working", "ERROR: Data load script failed"]);

        let id = queue.enqueue(payload(), &[]).await.unwrap();
        let job = queue.claim().await.unwrap().unwrap();
        queue.append_log(&job.lease, "[t] ERROR: denied").await.unwrap();
        queue.fail(&job.lease, "denied").await.unwrap();
        assert_eq!(queue.status(&id).await.unwrap().logs, ["[t] ERROR: denied"]);
    }

    #[tokio::test]
    async fn reap_keeps_recent_and_unfinished_jobs() {
        let (_dir, pool) = temp_pool().await;
        let queue = SqliteQueue::new(pool);
        let done = queue.enqueue(payload(), &WELCOME_LINES).await.unwrap();
        let job = queue.claim().await.unwrap().unwrap();
        queue.complete(&job.lease).await.unwrap();
        let waiting = queue.enqueue(payload(), &[]).await.unwrap();

        assert_eq!(queue.reap(Duration::from_secs(3600)).await.unwrap(), 0);
        assert_eq!(queue.reap(Duration::ZERO).await.unwrap(), 1);
        assert_eq!(queue.status(&done).await.unwrap(), JobStatus::unknown());
        assert_eq!(queue.status(&waiting).await.unwrap().status, JobState::Pending);
    }
}
