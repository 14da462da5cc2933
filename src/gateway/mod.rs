//! Browser-facing HTTP gateway.
//!
//! Runs the PKCE login against the identity provider, pre-checks the target
//! account, enqueues a deployment job, and serves job status for polling.
//!
//! # Routes
//!
//! | Route | Purpose |
//! |---|---|
//! | `GET /login?alias=&branch=` | start a flow, set the session cookie, redirect to the provider |
//! | `GET /oauth/callback` | finish the flow, enqueue the job, redirect to `/?id=<job>` |
//! | `GET /status?id=` | `{status, logs}` as JSON; `unknown` for anything not found |
//! | `GET /preflight` | readiness of the target CLI |
//! | `GET /healthz` | liveness |
//!
//! # Quick Start
//!
//! ```rust,ignore
//! use orgdeploy::gateway::{GatewayConfig, gateway_routes};
//!
//! let config = GatewayConfig::from_env()?;
//! let app = axum::Router::new()
//!     .merge(gateway_routes(config, session_store, queue, target));
//! ```

mod config;
mod cookies;
mod error;
mod preflight;
mod routes;
mod state;

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::session::SessionStore;

pub use config::GatewayConfig;
pub use error::GatewayError;
pub use preflight::{Preflight, PreflightStatus};
pub use routes::{CALLBACK_PATH, gateway_routes};

/// Re-export cookie key type for builder API.
pub use axum_extra::extract::cookie::Key as CookieKey;

/// Removes expired login sessions every `interval` until `shutdown` fires.
pub async fn purge_sessions<S: SessionStore>(
    store: Arc<S>,
    interval: Duration,
    shutdown: CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval);
    loop {
        tokio::select! {
            () = shutdown.cancelled() => break,
            _ = ticker.tick() => match store.purge_expired().await {
                Ok(0) => {}
                Ok(n) => tracing::debug!(purged = n, "Expired sessions removed"),
                Err(e) => tracing::warn!(error = %e, "Session purge failed"),
            },
        }
    }
}
