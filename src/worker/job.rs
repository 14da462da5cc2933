use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;

use crate::error::Error;
use crate::queue::JobQueue;
use crate::redact;
use crate::types::Lease;

/// Per-job handle for writing progress.
///
/// Every line is prefixed with a timestamp and the display username, then
/// redacted, before it reaches the queue.
pub struct JobContext<'a, Q> {
    queue: &'a Q,
    lease: &'a Lease,
    username: Option<&'a str>,
    verbose: bool,
}

impl<'a, Q: JobQueue> JobContext<'a, Q> {
    #[must_use]
    pub fn new(queue: &'a Q, lease: &'a Lease, username: Option<&'a str>, verbose: bool) -> Self {
        Self {
            queue,
            lease,
            username,
            verbose,
        }
    }

    #[must_use]
    pub fn lease(&self) -> &Lease {
        self.lease
    }

    /// Append one user-visible line.
    ///
    /// # Errors
    ///
    /// Propagates queue failures, including [`Error::LeaseLost`].
    pub async fn write(&self, line: impl AsRef<str>) -> Result<(), Error> {
        let line = self.format(line.as_ref());
        self.queue.append_log(self.lease, &line).await
    }

    /// Append a diagnostic line; a no-op unless verbose mode is on.
    ///
    /// # Errors
    ///
    /// Same as [`write`](Self::write).
    pub async fn vwrite(&self, line: impl AsRef<str>) -> Result<(), Error> {
        if self.verbose {
            self.write(line).await
        } else {
            Ok(())
        }
    }

    /// Renew the lease.
    ///
    /// # Errors
    ///
    /// [`Error::LeaseLost`] if another worker took the job over.
    pub async fn heartbeat(&self) -> Result<(), Error> {
        self.queue.heartbeat(self.lease).await
    }

    fn format(&self, line: &str) -> String {
        let ts = OffsetDateTime::now_utc()
            .format(&Rfc3339)
            .unwrap_or_default();
        let line = redact::redact(line);
        match self.username {
            Some(user) => format!("[{ts}] [{user}] {line}"),
            None => format!("[{ts}] {line}"),
        }
    }
}
