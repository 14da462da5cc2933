use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

use super::{ClaimedJob, DEFAULT_LEASE, JobPayload, JobQueue, JobState, JobStatus, error_line};
use crate::error::Error;
use crate::types::{JobId, Lease};

#[derive(Debug)]
struct Entry {
    state: JobState,
    payload: JobPayload,
    logs: Vec<String>,
    lease: Option<(String, Instant)>,
    attempts: u32,
    finished_at: Option<Instant>,
}

#[derive(Debug, Default)]
struct Inner {
    jobs: HashMap<JobId, Entry>,
    /// Enqueue order, for oldest-first claims.
    order: Vec<JobId>,
}

/// Process-local queue for tests and single-process deployments.
#[derive(Debug)]
pub struct MemoryQueue {
    inner: Mutex<Inner>,
    lease: Duration,
}

impl Default for MemoryQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryQueue {
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            lease: DEFAULT_LEASE,
        }
    }

    #[must_use]
    pub fn with_lease(mut self, lease: Duration) -> Self {
        self.lease = lease;
        self
    }

    fn lock(&self) -> Result<MutexGuard<'_, Inner>, Error> {
        self.inner
            .lock()
            .map_err(|_| Error::Store("job queue lock poisoned".into()))
    }

    /// Runs `f` on the entry only if `lease` still holds it.
    fn with_leased<T>(
        &self,
        lease: &Lease,
        f: impl FnOnce(&mut Entry) -> T,
    ) -> Result<T, Error> {
        let mut inner = self.lock()?;
        match inner.jobs.get_mut(&lease.job_id) {
            Some(entry)
                if entry.state == JobState::Running
                    && entry.lease.as_ref().is_some_and(|(t, _)| *t == lease.token) =>
            {
                Ok(f(entry))
            }
            _ => Err(Error::LeaseLost(lease.job_id.clone())),
        }
    }

    fn finish(entry: &mut Entry, state: JobState) {
        entry.state = state;
        entry.lease = None;
        entry.finished_at = Some(Instant::now());
    }
}

impl JobQueue for MemoryQueue {
    async fn enqueue(&self, payload: JobPayload, greeting: &[&str]) -> Result<JobId, Error> {
        let id = JobId::generate();
        let entry = Entry {
            state: JobState::Pending,
            payload,
            logs: greeting.iter().map(ToString::to_string).collect(),
            lease: None,
            attempts: 0,
            finished_at: None,
        };
        let mut inner = self.lock()?;
        inner.jobs.insert(id.clone(), entry);
        inner.order.push(id.clone());
        Ok(id)
    }

    async fn claim(&self) -> Result<Option<ClaimedJob>, Error> {
        let now = Instant::now();
        let mut inner = self.lock()?;
        let Inner { jobs, order } = &mut *inner;

        for id in order.iter() {
            let Some(entry) = jobs.get_mut(id) else {
                continue;
            };
            let claimable = match entry.state {
                JobState::Pending => true,
                JobState::Running => entry.lease.as_ref().is_some_and(|(_, until)| *until <= now),
                _ => false,
            };
            if !claimable {
                continue;
            }

            let lease = Lease::new(id.clone());
            entry.state = JobState::Running;
            entry.lease = Some((lease.token.clone(), now + self.lease));
            entry.attempts += 1;
            return Ok(Some(ClaimedJob {
                lease,
                payload: entry.payload.clone(),
                attempt: entry.attempts,
            }));
        }
        Ok(None)
    }

    async fn heartbeat(&self, lease: &Lease) -> Result<(), Error> {
        let until = Instant::now() + self.lease;
        self.with_leased(lease, |entry| {
            entry.lease = Some((lease.token.clone(), until));
        })
    }

    async fn append_log(&self, lease: &Lease, line: &str) -> Result<(), Error> {
        self.with_leased(lease, |entry| entry.logs.push(line.to_string()))
    }

    async fn complete(&self, lease: &Lease) -> Result<(), Error> {
        self.with_leased(lease, |entry| Self::finish(entry, JobState::Success))
    }

    async fn fail(&self, lease: &Lease, reason: &str) -> Result<(), Error> {
        self.with_leased(lease, |entry| {
            if let Some(line) = error_line(&entry.logs, reason) {
                entry.logs.push(line);
            }
            Self::finish(entry, JobState::Error);
        })
    }

    async fn status(&self, id: &JobId) -> Result<JobStatus, Error> {
        let inner = self.lock()?;
        Ok(inner.jobs.get(id).map_or_else(JobStatus::unknown, |entry| JobStatus {
            status: entry.state,
            logs: entry.logs.clone(),
        }))
    }

    async fn reap(&self, retention: Duration) -> Result<u64, Error> {
        let now = Instant::now();
        let mut inner = self.lock()?;
        let before = inner.jobs.len();
        inner.jobs.retain(|_, entry| {
            entry
                .finished_at
                .is_none_or(|finished| now.duration_since(finished) < retention)
        });
        let Inner { jobs, order } = &mut *inner;
        order.retain(|id| jobs.contains_key(id));
        Ok((before - jobs.len()) as u64)
    }
}
