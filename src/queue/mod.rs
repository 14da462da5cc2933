//! Durable job queue shared by gateway and worker processes.
//!
//! Delivery is at-least-once: a claim hands out a [`Lease`] that must be
//! renewed with [`JobQueue::heartbeat`]; a lease that runs out makes the job
//! claimable again. Every mutation of a running job is conditional on the
//! lease token, so a worker that lost its lease cannot write.

mod memory;
#[cfg(feature = "sqlite")]
mod sqlite;

use std::future::Future;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::Error;
use crate::types::{JobId, Lease};

pub use memory::MemoryQueue;
#[cfg(feature = "sqlite")]
pub use sqlite::SqliteQueue;

/// Default lease length; a worker heartbeats well inside this window.
pub const DEFAULT_LEASE: Duration = Duration::from_secs(60);

/// Lines shown to the user between enqueue and the first worker output.
pub const WELCOME_LINES: [&str; 3] = [
    "Authentication successful. Starting deployment...",
    "This may take 2\u{2013}3 minutes. Progress will appear below.",
    "",
];

/// Externally visible job state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    Pending,
    Running,
    Success,
    Error,
    /// Never enqueued, or already reaped.
    Unknown,
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl JobState {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Success => "success",
            Self::Error => "error",
            Self::Unknown => "unknown",
        }
    }

    /// Parses a stored state; anything unrecognised is `Unknown`.
    #[must_use]
    pub fn parse(value: &str) -> Self {
        match value {
            "pending" => Self::Pending,
            "running" => Self::Running,
            "success" => Self::Success,
            "error" => Self::Error,
            _ => Self::Unknown,
        }
    }

    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Success | Self::Error)
    }
}

/// Snapshot returned to pollers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobStatus {
    pub status: JobState,
    pub logs: Vec<String>,
}

impl JobStatus {
    #[must_use]
    pub fn unknown() -> Self {
        Self {
            status: JobState::Unknown,
            logs: Vec::new(),
        }
    }
}

/// Tokens the worker needs to act on the target environment.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    pub access_token: String,
    pub refresh_token: String,
    pub instance_url: String,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("access_token", &"***")
            .field("refresh_token", &"***")
            .field("instance_url", &"***")
            .finish()
    }
}

/// Everything a worker needs to run one deployment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobPayload {
    pub credentials: Credentials,
    pub alias: String,
    pub branch: String,
    /// Display identity, used as the log line prefix.
    pub username: Option<String>,
}

/// A job handed to exactly one worker.
#[derive(Debug, Clone)]
pub struct ClaimedJob {
    pub lease: Lease,
    pub payload: JobPayload,
    /// 1 on first delivery; higher when a lapsed lease was reclaimed.
    pub attempt: u32,
}

impl ClaimedJob {
    #[must_use]
    pub fn id(&self) -> &JobId {
        &self.lease.job_id
    }
}

/// Shared job queue.
///
/// Implementations must be safe for concurrent use from many processes:
/// [`claim`](Self::claim) never hands the same claimable job to two callers.
pub trait JobQueue: Send + Sync + 'static {
    /// Store a new `pending` job whose log starts with `greeting`.
    fn enqueue(
        &self,
        payload: JobPayload,
        greeting: &[&str],
    ) -> impl Future<Output = Result<JobId, Error>> + Send;

    /// Claim the oldest pending job, or a running job whose lease has lapsed.
    fn claim(&self) -> impl Future<Output = Result<Option<ClaimedJob>, Error>> + Send;

    /// Extend the lease.
    fn heartbeat(&self, lease: &Lease) -> impl Future<Output = Result<(), Error>> + Send;

    /// Append one line to the job log.
    fn append_log(&self, lease: &Lease, line: &str) -> impl Future<Output = Result<(), Error>> + Send;

    /// Transition to `success`.
    fn complete(&self, lease: &Lease) -> impl Future<Output = Result<(), Error>> + Send;

    /// Transition to `error`, appending `ERROR: <reason>` unless the log
    /// already carries an `ERROR:` line.
    fn fail(&self, lease: &Lease, reason: &str) -> impl Future<Output = Result<(), Error>> + Send;

    /// Read-only snapshot; absent ids are [`JobState::Unknown`].
    fn status(&self, id: &JobId) -> impl Future<Output = Result<JobStatus, Error>> + Send;

    /// Delete terminal jobs finished more than `retention` ago.
    fn reap(&self, retention: Duration) -> impl Future<Output = Result<u64, Error>> + Send;
}

/// The line `fail` synthesizes, unless one is already present.
pub(crate) fn error_line(logs: &[String], reason: &str) -> Option<String> {
    if logs.iter().any(|l| l.contains("ERROR:")) {
        None
    } else {
        Some(format!("ERROR: {}", crate::redact::sanitize(reason)))
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn payload() -> JobPayload {
        JobPayload {
            credentials: Credentials {
                access_token: "00Dxx!access".into(),
                refresh_token: "5Aep861refresh".into(),
                instance_url: "https://acme--dev.sandbox.my.salesforce.com".into(),
            },
            alias: "LSStarterConfigSandbox".into(),
            branch: "main".into(),
            username: Some("admin@acme.dev".into()),
        }
    }

    #[test]
    fn state_serializes_lowercase() {
        let status = JobStatus::unknown();
        assert_eq!(
            serde_json::to_value(&status).unwrap(),
            serde_json::json!({ "status": "unknown", "logs": [] })
        );
        assert_eq!(JobState::parse("running"), JobState::Running);
        assert_eq!(JobState::parse("bogus"), JobState::Unknown);
        assert_eq!(JobState::Success.to_string(), "success");
    }

    #[test]
    fn credentials_debug_is_masked() {
        let rendered = format!("{:?}", payload());
        assert!(!rendered.contains("5Aep861refresh"));
        assert!(!rendered.contains("00Dxx!access"));
        assert!(rendered.contains("admin@acme.dev"));
    }

    #[test]
    fn error_line_is_not_duplicated() {
        let logs = vec!["[t] ERROR: denied".to_string()];
        assert_eq!(error_line(&logs, "denied"), None);
        assert_eq!(
            error_line(&[], "refreshToken=abc"),
            Some("ERROR: refreshToken=***".into())
        );
    }
}
