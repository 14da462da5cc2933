//! Deployment worker: claims jobs and drives each one through the
//! authenticate → eligibility → conflict check → fetch → execute sequence.
//!
//! A job failure is recorded in the job (log line plus `error` state) and
//! never stops the pool. There are no retries inside a run; a failed job
//! needs a new login flow.

mod config;
pub mod content;
mod job;
pub mod script;
pub mod target;

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time::{Instant, interval_at};
use tokio_util::sync::CancellationToken;

use crate::eligibility;
use crate::error::Error;
use crate::queue::{ClaimedJob, JobPayload, JobQueue, JobState};
use crate::redact;

pub use config::WorkerConfig;
pub use content::{ArchiveSource, ContentSource, FetchedContent};
pub use job::JobContext;
pub use script::ScriptRunner;
pub use target::{CliTarget, OrgInfo, TargetEnvironment, TargetSession};

/// Final line of a successful job.
pub const SUCCESS_LINE: &str = "SUCCESS: Configurations have been deployed successfully.";

/// Worker pool over a shared queue.
pub struct Worker<Q, T, C> {
    queue: Arc<Q>,
    target: Arc<T>,
    content: Arc<C>,
    config: Arc<WorkerConfig>,
}

impl<Q, T, C> Clone for Worker<Q, T, C> {
    fn clone(&self) -> Self {
        Self {
            queue: self.queue.clone(),
            target: self.target.clone(),
            content: self.content.clone(),
            config: self.config.clone(),
        }
    }
}

impl<Q, T, C> Worker<Q, T, C>
where
    Q: JobQueue,
    T: TargetEnvironment,
    C: ContentSource,
{
    #[must_use]
    pub fn new(queue: Arc<Q>, target: Arc<T>, content: Arc<C>, config: WorkerConfig) -> Self {
        Self {
            queue,
            target,
            content,
            config: Arc::new(config),
        }
    }

    #[must_use]
    pub fn queue(&self) -> &Arc<Q> {
        &self.queue
    }

    /// Claims and runs at most one job. Returns its final state, or `None`
    /// if the queue was empty.
    ///
    /// # Errors
    ///
    /// Queue failures only; job failures are recorded in the job itself.
    pub async fn run_once(&self) -> Result<Option<JobState>, Error> {
        match self.queue.claim().await? {
            Some(job) => self.process(job).await.map(Some),
            None => Ok(None),
        }
    }

    /// Runs one claimed job to a terminal state.
    ///
    /// # Errors
    ///
    /// Returns [`Error::LeaseLost`] if the job was taken over mid-run (nothing
    /// more is written), or a queue error if the outcome cannot be recorded.
    pub async fn process(&self, job: ClaimedJob) -> Result<JobState, Error> {
        let ClaimedJob {
            lease,
            payload,
            attempt,
        } = job;
        let job_id = lease.job_id.clone();
        tracing::info!(%job_id, attempt, alias = %payload.alias, branch = %payload.branch, "Job started");

        let ctx = JobContext::new(
            &*self.queue,
            &lease,
            payload.username.as_deref(),
            self.config.verbose,
        );

        match self.deploy_leased(&ctx, &payload).await {
            Ok(()) => {
                self.queue.complete(&lease).await?;
                tracing::info!(%job_id, "Job succeeded");
                Ok(JobState::Success)
            }
            Err(Error::LeaseLost(id)) => {
                tracing::warn!(job_id = %id, "Lease lost, abandoning job");
                Err(Error::LeaseLost(id))
            }
            Err(e) => {
                let reason = redact::sanitize(&e.to_string());
                tracing::warn!(%job_id, error = %reason, "Job failed");
                self.queue.fail(&lease, &reason).await?;
                Ok(JobState::Error)
            }
        }
    }

    /// Runs the deployment while renewing the lease every heartbeat interval.
    /// A lost lease drops the deployment, killing any tool it is running.
    async fn deploy_leased(&self, ctx: &JobContext<'_, Q>, payload: &JobPayload) -> Result<(), Error> {
        let period = self.config.heartbeat_interval.max(Duration::from_millis(10));
        let mut heartbeat = interval_at(Instant::now() + period, period);
        let deploy = self.deploy(ctx, payload);
        tokio::pin!(deploy);

        loop {
            tokio::select! {
                result = &mut deploy => return result,
                _ = heartbeat.tick() => ctx.heartbeat().await?,
            }
        }
    }

    async fn deploy(&self, ctx: &JobContext<'_, Q>, payload: &JobPayload) -> Result<(), Error> {
        let config = &self.config;
        ctx.write("Starting deployment process...").await?;

        let session = self
            .target
            .authenticate(&payload.alias, &payload.credentials)
            .await?;
        ctx.vwrite("CLI login via sfdx-url completed.").await?;
        if let Some(username) = &payload.username {
            ctx.write(format!("Logged in as {username}")).await?;
        }

        // Authoritative eligibility check: recomputed from the target itself.
        ctx.vwrite("Querying Organization for IsSandbox and InstanceName...")
            .await?;
        let org = session.org_info().await?;
        ctx.vwrite(format!(
            "IsSandbox: {}, InstanceName: {}",
            org.is_sandbox,
            org.instance_name.as_deref().unwrap_or("null")
        ))
        .await?;

        let decision = eligibility::decide(
            org.is_sandbox,
            org.instance_name.as_deref(),
            &config.allow_list,
        );
        if !decision.allowed {
            let denied = Error::AccessDenied(decision.reason);
            ctx.write("").await?;
            ctx.write(format!("ERROR: {denied}")).await?;
            ctx.write("").await?;
            return Err(denied);
        }
        ctx.vwrite(format!("Deployment allowed: {}", decision.reason))
            .await?;

        // Not transactional: a concurrent deployment can still race past this.
        ctx.vwrite(format!("Querying {} COUNT()...", config.sentinel_object))
            .await?;
        let count = session.count_records(&config.sentinel_object).await?;
        ctx.vwrite(format!("COUNT() returned {count}.")).await?;
        if count > 0 {
            let conflict = Error::ConflictExists {
                object: config.sentinel_object.clone(),
                count,
            };
            ctx.write(conflict.to_string()).await?;
            return Err(conflict);
        }

        ctx.vwrite(format!("Downloading content branch {}...", payload.branch))
            .await?;
        let content = self.content.fetch(&payload.branch).await?;
        ctx.vwrite("Content downloaded and extracted.").await?;

        ctx.vwrite("Starting deployment script...").await?;
        ScriptRunner::new(&config.script_path)
            .run(content.root(), &session.script_env(), ctx)
            .await?;

        ctx.write("").await?;
        ctx.write(SUCCESS_LINE).await?;
        ctx.vwrite("Deployment completed.").await?;
        Ok(())
    }

    /// Runs the pool until `shutdown` fires, then waits for in-flight jobs.
    ///
    /// At most `concurrency` jobs run at once. An idle pool polls the queue
    /// every `poll_interval`; finished jobs older than the retention window
    /// are reaped every `reap_interval`.
    ///
    /// # Errors
    ///
    /// Only if the concurrency semaphore is closed, which does not happen
    /// while the pool owns it.
    pub async fn run(self, shutdown: CancellationToken) -> Result<(), Error> {
        let permits = Arc::new(Semaphore::new(self.config.concurrency));
        let mut tasks = JoinSet::new();
        let mut last_reap: Option<Instant> = None;

        tracing::info!(concurrency = self.config.concurrency, "Worker pool started");

        loop {
            while let Some(result) = tasks.try_join_next() {
                log_task_result(result);
            }

            if last_reap.is_none_or(|at| at.elapsed() >= self.config.reap_interval) {
                match self.queue.reap(self.config.retention).await {
                    Ok(0) => {}
                    Ok(n) => tracing::info!(reaped = n, "Reaped finished jobs"),
                    Err(e) => tracing::warn!(error = %e, "Job reaping failed"),
                }
                last_reap = Some(Instant::now());
            }

            let permit = tokio::select! {
                () = shutdown.cancelled() => break,
                permit = permits.clone().acquire_owned() => permit
                    .map_err(|e| Error::Io(std::io::Error::other(e)))?,
            };

            match self.queue.claim().await {
                Ok(Some(job)) => {
                    let worker = self.clone();
                    tasks.spawn(async move {
                        let _permit = permit;
                        worker.process(job).await
                    });
                    continue;
                }
                Ok(None) => drop(permit),
                Err(e) => {
                    drop(permit);
                    tracing::error!(error = %e, "Failed to claim job");
                }
            }

            tokio::select! {
                () = shutdown.cancelled() => break,
                () = tokio::time::sleep(self.config.poll_interval) => {}
            }
        }

        tracing::info!(in_flight = tasks.len(), "Worker pool stopping, waiting for running jobs");
        while let Some(result) = tasks.join_next().await {
            log_task_result(result);
        }
        Ok(())
    }
}

fn log_task_result(result: Result<Result<JobState, Error>, tokio::task::JoinError>) {
    match result {
        Ok(Ok(_)) => {}
        Ok(Err(e)) => tracing::error!(error = %redact::redact(&e.to_string()), "Job outcome not recorded"),
        Err(e) => tracing::error!(error = %e, "Job task panicked"),
    }
}
