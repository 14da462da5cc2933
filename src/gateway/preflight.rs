use std::sync::{Arc, Mutex, PoisonError};

use serde::Serialize;

use crate::worker::CliTarget;

/// Readiness reported by `GET /preflight`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PreflightStatus {
    pub ready: bool,
    pub message: String,
}

/// Shared, updatable readiness of the target CLI.
///
/// Starts as "Initializing..." and is settled once by [`Preflight::probe`].
#[derive(Debug, Clone)]
pub struct Preflight {
    inner: Arc<Mutex<PreflightStatus>>,
}

impl Default for Preflight {
    fn default() -> Self {
        Self::new()
    }
}

impl Preflight {
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(PreflightStatus {
                ready: false,
                message: "Initializing...".into(),
            })),
        }
    }

    #[must_use]
    pub fn snapshot(&self) -> PreflightStatus {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn set(&self, ready: bool, message: impl Into<String>) {
        let mut status = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        status.ready = ready;
        status.message = message.into();
    }

    /// Checks that the target CLI starts and records the outcome.
    pub async fn probe(&self, target: &CliTarget) {
        let program = target.program();
        match target.probe().await {
            Ok(version) => {
                tracing::info!(%program, %version, "Target CLI ready");
                self.set(true, format!("{program} OK: {version}"));
            }
            Err(e) => {
                tracing::error!(%program, error = %e, "Target CLI preflight failed");
                self.set(false, format!("{program} init failed: {e}"));
            }
        }
    }
}
