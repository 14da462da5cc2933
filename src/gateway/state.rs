use std::sync::Arc;

use axum::extract::FromRef;
use axum_extra::extract::cookie::Key;

use super::config::GatewaySettings;
use crate::queue::JobQueue;
use crate::session::{SessionManager, SessionStore};
use crate::worker::TargetEnvironment;

/// Shared state for gateway route handlers.
pub(super) struct GatewayState<S, Q, T> {
    pub(super) sessions: SessionManager<S>,
    pub(super) queue: Arc<Q>,
    pub(super) target: Arc<T>,
    pub(super) settings: GatewaySettings,
}

// Manual Clone: avoid derive adding `S: Clone, Q: Clone, T: Clone` bounds.
impl<S, Q, T> Clone for GatewayState<S, Q, T> {
    fn clone(&self) -> Self {
        Self {
            sessions: self.sessions.clone(),
            queue: self.queue.clone(),
            target: self.target.clone(),
            settings: self.settings.clone(),
        }
    }
}

// PrivateCookieJar requires Key to be extractable from state
impl<S: SessionStore, Q: JobQueue, T: TargetEnvironment> FromRef<GatewayState<S, Q, T>> for Key {
    fn from_ref(state: &GatewayState<S, Q, T>) -> Self {
        state.settings.cookie_key.clone()
    }
}
