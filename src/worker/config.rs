use std::path::PathBuf;
use std::time::Duration;

use crate::eligibility::AllowList;
use crate::env;
use crate::error::Error;

/// Runtime settings of a worker process.
///
/// Use [`from_env()`](WorkerConfig::from_env) in the binary, or
/// [`new()`](WorkerConfig::new) with `with_*` methods in tests.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub(crate) allow_list: AllowList,
    pub(crate) sentinel_object: String,
    pub(crate) script_path: PathBuf,
    pub(crate) concurrency: usize,
    pub(crate) poll_interval: Duration,
    pub(crate) heartbeat_interval: Duration,
    pub(crate) retention: Duration,
    pub(crate) reap_interval: Duration,
    pub(crate) verbose: bool,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl WorkerConfig {
    #[must_use]
    pub fn new() -> Self {
        Self {
            allow_list: AllowList::default(),
            sentinel_object: "LifeSciMetadataCategory".into(),
            script_path: PathBuf::from("Scripts/sh/data_load.sh"),
            concurrency: 5,
            poll_interval: Duration::from_secs(1),
            heartbeat_interval: Duration::from_secs(15),
            retention: Duration::from_secs(3600),
            reap_interval: Duration::from_secs(60),
            verbose: false,
        }
    }

    /// Reads worker settings from the environment.
    ///
    /// # Optional env vars
    /// - `ALLOWED_INSTANCE_NAMES`: comma-separated production instance names
    /// - `SENTINEL_OBJECT`: record type whose presence blocks a deployment
    /// - `DEPLOY_SCRIPT`: script path relative to the content root
    /// - `WORKER_CONCURRENCY`: jobs run in parallel (at least 1)
    /// - `JOB_RETENTION_SECS`: how long finished jobs stay pollable
    /// - `LOG_VERBOSE`: add diagnostic step lines to job logs
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if a numeric variable does not parse.
    pub fn from_env() -> Result<Self, Error> {
        let mut config = Self::new()
            .with_allow_list(AllowList::parse(
                &env::var("ALLOWED_INSTANCE_NAMES").unwrap_or_default(),
            ))
            .with_verbose(env::flag("LOG_VERBOSE"));

        if let Some(object) = env::var("SENTINEL_OBJECT") {
            config = config.with_sentinel_object(object);
        }
        if let Some(script) = env::var("DEPLOY_SCRIPT") {
            config = config.with_script_path(script);
        }
        if let Some(n) = env::parse::<usize>("WORKER_CONCURRENCY")? {
            config = config.with_concurrency(n);
        }
        if let Some(secs) = env::parse::<u64>("JOB_RETENTION_SECS")? {
            config = config.with_retention(Duration::from_secs(secs));
        }

        if config.allow_list.is_empty() {
            tracing::info!("No instance names configured; only sandbox targets are eligible");
        } else {
            tracing::info!(instances = %config.allow_list.display(), "Loaded allowed instance names");
        }
        Ok(config)
    }

    #[must_use]
    pub fn with_allow_list(mut self, allow_list: AllowList) -> Self {
        self.allow_list = allow_list;
        self
    }

    #[must_use]
    pub fn with_sentinel_object(mut self, object: impl Into<String>) -> Self {
        self.sentinel_object = object.into();
        self
    }

    #[must_use]
    pub fn with_script_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.script_path = path.into();
        self
    }

    #[must_use]
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    #[must_use]
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    #[must_use]
    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    #[must_use]
    pub fn with_retention(mut self, retention: Duration) -> Self {
        self.retention = retention;
        self
    }

    #[must_use]
    pub fn with_reap_interval(mut self, interval: Duration) -> Self {
        self.reap_interval = interval;
        self
    }

    #[must_use]
    pub fn with_verbose(mut self, verbose: bool) -> Self {
        self.verbose = verbose;
        self
    }

    #[must_use]
    pub fn allow_list(&self) -> &AllowList {
        &self.allow_list
    }

    #[must_use]
    pub fn concurrency(&self) -> usize {
        self.concurrency
    }
}
