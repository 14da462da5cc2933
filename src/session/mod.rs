//! Server-side PKCE sessions and the flow that consumes them.
//!
//! A session lives from `/login` to `/oauth/callback`: it holds the verifier,
//! the challenge sent to the provider, and the exact callback address. The
//! browser only ever sees the opaque [`SessionId`] (inside a private cookie)
//! and the routing `state`.

mod memory;
#[cfg(feature = "sqlite")]
mod sqlite;

use std::future::Future;
use std::sync::Arc;

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use serde::{Deserialize, Serialize};
use time::{Duration, OffsetDateTime};

use crate::error::Error;
use crate::oauth::{AuthClient, TokenResponse};
use crate::pkce;
use crate::types::SessionId;

pub use memory::MemorySessionStore;
#[cfg(feature = "sqlite")]
pub use sqlite::SqliteSessionStore;

/// Lifetime of an untouched session.
pub const SESSION_TTL: Duration = Duration::minutes(10);

const DEFAULT_ALIAS: &str = "LSStarterConfigSandbox";
const DEFAULT_BRANCH: &str = "main";
const MAX_ROUTE_FIELD_LEN: usize = 100;

/// Routing metadata for one flow: which target alias, which content branch.
///
/// Travels through the browser as the `OAuth2` `state` parameter, so it never
/// holds anything secret.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlowRoute {
    pub alias: String,
    pub branch: String,
}

impl Default for FlowRoute {
    fn default() -> Self {
        Self {
            alias: DEFAULT_ALIAS.into(),
            branch: DEFAULT_BRANCH.into(),
        }
    }
}

impl FlowRoute {
    /// Builds a route from optional user input, falling back to defaults.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidRoute`] if either field contains characters
    /// outside `[A-Za-z0-9._/-]` or is too long.
    pub fn new(alias: Option<&str>, branch: Option<&str>) -> Result<Self, Error> {
        let defaults = Self::default();
        let alias = non_empty(alias).unwrap_or(&defaults.alias);
        let branch = non_empty(branch).unwrap_or(&defaults.branch);
        validate_field("alias", alias)?;
        validate_field("branch", branch)?;
        if branch.contains("..") {
            return Err(Error::InvalidRoute("branch must not contain '..'".into()));
        }
        Ok(Self {
            alias: alias.to_string(),
            branch: branch.to_string(),
        })
    }

    /// Encodes the route as the `state` blob: base64url(JSON), no padding.
    #[must_use]
    pub fn encode_state(&self) -> String {
        let json = serde_json::to_vec(self).unwrap_or_default();
        URL_SAFE_NO_PAD.encode(json)
    }

    /// Decodes a returned `state` blob.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidRoute`] if the blob is not a valid encoded route.
    pub fn decode_state(state: &str) -> Result<Self, Error> {
        let bytes = URL_SAFE_NO_PAD
            .decode(state.trim())
            .map_err(|_| Error::InvalidRoute("state is not base64url".into()))?;

        #[derive(Deserialize)]
        struct Raw {
            alias: Option<String>,
            branch: Option<String>,
        }
        let raw: Raw = serde_json::from_slice(&bytes)
            .map_err(|_| Error::InvalidRoute("state is not a route".into()))?;
        Self::new(raw.alias.as_deref(), raw.branch.as_deref())
    }
}

fn non_empty(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|v| !v.is_empty())
}

fn validate_field(name: &str, value: &str) -> Result<(), Error> {
    let valid_chars = value
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '/' | '-'));
    if !valid_chars || value.len() > MAX_ROUTE_FIELD_LEN || value.starts_with('-') {
        return Err(Error::InvalidRoute(format!(
            "{name} may only contain letters, digits, '.', '_', '/' and '-'"
        )));
    }
    Ok(())
}

/// Persisted state of one PKCE flow.
///
/// The sensitive fields are optional so a scrubbed record is representable;
/// a session without a verifier can never complete.
#[derive(Clone, Serialize, Deserialize)]
pub struct FlowSession {
    pub code_verifier: Option<String>,
    pub code_challenge: Option<String>,
    pub callback_url: Option<String>,
    pub route: FlowRoute,
    #[serde(with = "time::serde::timestamp")]
    pub expires_at: OffsetDateTime,
}

impl FlowSession {
    #[must_use]
    pub fn is_expired(&self, now: OffsetDateTime) -> bool {
        now >= self.expires_at
    }

    /// Drops the verifier, challenge and callback address.
    pub fn scrub(&mut self) {
        self.code_verifier = None;
        self.code_challenge = None;
        self.callback_url = None;
    }
}

impl std::fmt::Debug for FlowSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FlowSession")
            .field("code_verifier", &self.code_verifier.as_ref().map(|_| "***"))
            .field("code_challenge", &self.code_challenge)
            .field("callback_url", &self.callback_url)
            .field("route", &self.route)
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

/// Shared persistence for PKCE sessions.
///
/// Must not be process-local in a multi-instance deployment: the `/callback`
/// request may land on a different gateway instance than `/login`.
///
/// # Example
///
/// ```rust,ignore
/// impl SessionStore for MyStore {
///     async fn create(&self, id: &SessionId, session: FlowSession) -> Result<(), Error> {
///         self.redis.set_ex(id.as_str(), serde_json::to_string(&session)?, 600).await
///     }
///     // ...
/// }
/// ```
pub trait SessionStore: Send + Sync + 'static {
    /// Persist a new session under `id`.
    fn create(
        &self,
        id: &SessionId,
        session: FlowSession,
    ) -> impl Future<Output = Result<(), Error>> + Send;

    /// Look up a session. Expired sessions are reported as absent.
    fn find(&self, id: &SessionId) -> impl Future<Output = Result<Option<FlowSession>, Error>> + Send;

    /// Atomically remove and return a live session.
    ///
    /// Of two concurrent callers for the same id at most one gets `Some`.
    fn take(&self, id: &SessionId) -> impl Future<Output = Result<Option<FlowSession>, Error>> + Send;

    /// Delete a session; deleting an absent session is not an error.
    fn delete(&self, id: &SessionId) -> impl Future<Output = Result<(), Error>> + Send;

    /// Remove every expired session. Returns the number removed.
    fn purge_expired(&self) -> impl Future<Output = Result<u64, Error>> + Send;
}

/// Result of [`SessionManager::begin_flow`].
#[derive(Debug, Clone)]
pub struct FlowStart {
    pub authorization_url: String,
    pub session_id: SessionId,
}

/// Result of [`SessionManager::complete_flow`].
#[derive(Debug, Clone)]
pub struct CompletedFlow {
    pub tokens: TokenResponse,
    pub route: FlowRoute,
}

/// Generates, binds and completes PKCE flows.
pub struct SessionManager<S> {
    client: Arc<AuthClient>,
    store: Arc<S>,
    ttl: Duration,
}

impl<S> Clone for SessionManager<S> {
    fn clone(&self) -> Self {
        Self {
            client: self.client.clone(),
            store: self.store.clone(),
            ttl: self.ttl,
        }
    }
}

impl<S: SessionStore> SessionManager<S> {
    #[must_use]
    pub fn new(client: AuthClient, store: Arc<S>) -> Self {
        Self {
            client: Arc::new(client),
            store,
            ttl: SESSION_TTL,
        }
    }

    #[must_use]
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    #[must_use]
    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    #[must_use]
    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    /// Starts a flow: new verifier/challenge, persisted session, provider URL.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Store`] if the session cannot be persisted.
    pub async fn begin_flow(&self, route: FlowRoute, callback_url: &str) -> Result<FlowStart, Error> {
        let code_verifier = pkce::generate_code_verifier();
        let code_challenge = pkce::generate_code_challenge(&code_verifier);
        let state = route.encode_state();

        let authorization_url = self
            .client
            .authorization_url(callback_url, &code_challenge, &state);

        tracing::debug!(alias = %route.alias, branch = %route.branch, "PKCE flow started");

        let session_id = SessionId::generate();
        let session = FlowSession {
            code_verifier: Some(code_verifier),
            code_challenge: Some(code_challenge),
            callback_url: Some(callback_url.to_string()),
            route,
            expires_at: OffsetDateTime::now_utc() + self.ttl,
        };
        self.store.create(&session_id, session).await?;

        Ok(FlowStart {
            authorization_url,
            session_id,
        })
    }

    /// Completes a flow: consumes the session, verifies it, and exchanges the code.
    ///
    /// Routing metadata comes from `returned_state`, not the session. A state
    /// blob that does not decode falls back to the default route.
    ///
    /// # Errors
    ///
    /// - [`Error::SessionExpired`] if the session is absent, expired, or has no verifier;
    /// - [`Error::PkceMismatch`] if the verifier does not derive the stored challenge;
    /// - [`Error::TokenExchangeFailed`] if the provider rejects the code.
    pub async fn complete_flow(
        &self,
        session_id: &SessionId,
        authorization_code: &str,
        returned_state: &str,
    ) -> Result<CompletedFlow, Error> {
        // Single use: the session is gone whether or not the exchange succeeds.
        let session = self
            .store
            .take(session_id)
            .await?
            .ok_or(Error::SessionExpired)?;

        let (Some(verifier), Some(challenge)) = (&session.code_verifier, &session.code_challenge)
        else {
            return Err(Error::SessionExpired);
        };

        if !pkce::verify_code_challenge(verifier, challenge) {
            tracing::warn!("PKCE verification failed: verifier does not match challenge");
            return Err(Error::PkceMismatch);
        }

        let callback_url = session.callback_url.as_deref().ok_or(Error::SessionExpired)?;

        let tokens = self
            .client
            .exchange_code(authorization_code, verifier, callback_url)
            .await?;

        let route = FlowRoute::decode_state(returned_state).unwrap_or_else(|e| {
            tracing::warn!(error = %e, "Unreadable OAuth state, using default route");
            FlowRoute::default()
        });

        Ok(CompletedFlow { tokens, route })
    }
}
