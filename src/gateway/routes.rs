use std::sync::Arc;

use axum::Router;
use axum::extract::{Query, State};
use axum::http::header::{HOST, LOCATION};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::get;
use axum_extra::extract::PrivateCookieJar;
use serde::Deserialize;

use super::config::{GatewayConfig, GatewaySettings};
use super::cookies;
use super::error::GatewayError;
use super::preflight::PreflightStatus;
use super::state::GatewayState;
use crate::eligibility;
use crate::error::Error;
use crate::oauth::TokenResponse;
use crate::queue::{Credentials, JobPayload, JobQueue, JobStatus, WELCOME_LINES};
use crate::session::{FlowRoute, SessionManager, SessionStore};
use crate::types::JobId;
use crate::worker::{TargetEnvironment, TargetSession};

/// Path the identity provider redirects back to.
pub const CALLBACK_PATH: &str = "/oauth/callback";

/// Create the gateway router.
///
/// `target` is used for the eligibility pre-check before a job is enqueued;
/// the worker repeats the check against the same account.
pub fn gateway_routes<S, Q, T>(
    config: GatewayConfig,
    session_store: Arc<S>,
    queue: Arc<Q>,
    target: Arc<T>,
) -> Router
where
    S: SessionStore,
    Q: JobQueue,
    T: TargetEnvironment,
{
    let sessions =
        SessionManager::new(config.client, session_store).with_ttl(config.settings.session_ttl);

    let state = GatewayState {
        sessions,
        queue,
        target,
        settings: config.settings,
    };

    Router::new()
        .route("/", get(index))
        .route("/login", get(login::<S, Q, T>))
        .route(CALLBACK_PATH, get(callback::<S, Q, T>))
        .route("/status", get(status::<S, Q, T>))
        .route("/preflight", get(preflight::<S, Q, T>))
        .route("/healthz", get(healthz))
        .with_state(state)
}

/// `302 Found` to `location`.
fn found(location: &str) -> Response {
    (StatusCode::FOUND, [(LOCATION, location.to_string())]).into_response()
}

// ── Index ──────────────────────────────────────────────────────────

#[derive(Deserialize)]
struct StatusParams {
    id: Option<String>,
}

async fn index(Query(params): Query<StatusParams>) -> String {
    match params.id.filter(|id| !id.is_empty()) {
        Some(id) => format!("Deployment {id} queued. Poll /status?id={id} for progress.\n"),
        None => "Start a deployment at /login?alias=<alias>&branch=<branch>.\n".to_string(),
    }
}

// ── Login ──────────────────────────────────────────────────────────

#[derive(Deserialize)]
struct LoginParams {
    alias: Option<String>,
    branch: Option<String>,
}

async fn login<S: SessionStore, Q: JobQueue, T: TargetEnvironment>(
    State(state): State<GatewayState<S, Q, T>>,
    jar: PrivateCookieJar,
    headers: HeaderMap,
    Query(params): Query<LoginParams>,
) -> Result<(PrivateCookieJar, Response), GatewayError> {
    let route = FlowRoute::new(params.alias.as_deref(), params.branch.as_deref())?;
    let callback_url = callback_url(&state.settings, &headers)?;

    let flow = state.sessions.begin_flow(route, &callback_url).await?;

    let cookie = cookies::session_cookie(
        &state.settings.session_cookie_name,
        &flow.session_id,
        state.settings.session_ttl,
        state.settings.production,
    );

    Ok((jar.add(cookie), found(&flow.authorization_url)))
}

/// The absolute callback address for this request.
///
/// A configured public base URL wins; otherwise the scheme comes from the
/// first `X-Forwarded-Proto` value (default `http`) and the authority from
/// `Host`.
fn callback_url(settings: &GatewaySettings, headers: &HeaderMap) -> Result<String, GatewayError> {
    if let Some(base) = &settings.public_base_url {
        let url = base
            .join(CALLBACK_PATH)
            .map_err(|e| Error::Config(format!("callback URL: {e}")))?;
        return Ok(url.into());
    }

    let header = |name: &str| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.split(',').next())
            .map(str::trim)
            .filter(|v| !v.is_empty())
    };
    let proto = match header("x-forwarded-proto") {
        Some(p) if p.eq_ignore_ascii_case("https") => "https",
        _ => "http",
    };
    let host = header(HOST.as_str()).unwrap_or("localhost");
    Ok(format!("{proto}://{host}{CALLBACK_PATH}"))
}

// ── Callback ───────────────────────────────────────────────────────

#[derive(Deserialize)]
struct CallbackParams {
    code: Option<String>,
    state: Option<String>,
    error: Option<String>,
    error_description: Option<String>,
}

async fn callback<S: SessionStore, Q: JobQueue, T: TargetEnvironment>(
    State(state): State<GatewayState<S, Q, T>>,
    jar: PrivateCookieJar,
    Query(params): Query<CallbackParams>,
) -> Result<(PrivateCookieJar, Response), GatewayError> {
    let cookie_name = &state.settings.session_cookie_name;
    let session_id = cookies::get_session_id(&jar, cookie_name);

    if let Some(code) = params.error {
        tracing::warn!(error = %code, "OAuth error from provider");
        if let Some(id) = &session_id {
            if let Err(e) = state.sessions.store().delete(id).await {
                tracing::warn!(error = %e, "Session deletion failed after provider error");
            }
        }
        return Err(Error::Authorization {
            code,
            description: params.error_description,
        }
        .into());
    }

    let code = params
        .code
        .filter(|c| !c.is_empty())
        .ok_or(GatewayError::MissingCode)?;
    let session_id = session_id.ok_or(Error::SessionExpired)?;

    let flow = state
        .sessions
        .complete_flow(&session_id, &code, params.state.as_deref().unwrap_or_default())
        .await?;

    let credentials = credentials_from(flow.tokens)?;
    let username = precheck(&state, &flow.route.alias, &credentials).await?;

    let payload = JobPayload {
        credentials,
        alias: flow.route.alias,
        branch: flow.route.branch,
        username,
    };
    let job_id = state.queue.enqueue(payload, &WELCOME_LINES).await?;
    tracing::info!(job_id = %job_id, "Deployment job enqueued");

    let jar = jar.remove(cookies::clear_session_cookie(cookie_name));
    Ok((jar, found(&format!("/?id={job_id}"))))
}

fn credentials_from(tokens: TokenResponse) -> Result<Credentials, GatewayError> {
    let instance_url = tokens
        .instance_url
        .filter(|u| !u.is_empty())
        .ok_or(GatewayError::MissingInstanceUrl)?;
    let refresh_token = tokens
        .refresh_token
        .filter(|t| !t.is_empty())
        .ok_or(GatewayError::MissingRefreshToken)?;
    Ok(Credentials {
        access_token: tokens.access_token,
        refresh_token,
        instance_url,
    })
}

/// Rejects ineligible accounts before anything is queued.
///
/// Returns the display username; a failed lookup only costs the display name.
async fn precheck<S, Q, T: TargetEnvironment>(
    state: &GatewayState<S, Q, T>,
    alias: &str,
    credentials: &Credentials,
) -> Result<Option<String>, GatewayError> {
    let session = state.target.authenticate(alias, credentials).await?;

    let username = session.username().await.unwrap_or_else(|e| {
        tracing::warn!(error = %e, "Username lookup failed");
        None
    });

    let org = session.org_info().await?;
    let decision = eligibility::decide(
        org.is_sandbox,
        org.instance_name.as_deref(),
        &state.settings.allow_list,
    );
    if !decision.allowed {
        tracing::warn!(
            instance = org.instance_name.as_deref().unwrap_or("null"),
            "Deployment denied by eligibility policy"
        );
        return Err(Error::AccessDenied(decision.reason).into());
    }
    Ok(username)
}

// ── Status ─────────────────────────────────────────────────────────

async fn status<S: SessionStore, Q: JobQueue, T: TargetEnvironment>(
    State(state): State<GatewayState<S, Q, T>>,
    Query(params): Query<StatusParams>,
) -> Json<JobStatus> {
    let Some(id) = params.id.filter(|id| !id.is_empty()) else {
        return Json(JobStatus::unknown());
    };
    match state.queue.status(&JobId(id)).await {
        Ok(status) => Json(status),
        Err(e) => {
            tracing::warn!(error = %e, "Status lookup failed");
            Json(JobStatus::unknown())
        }
    }
}

// ── Health ─────────────────────────────────────────────────────────

async fn preflight<S: SessionStore, Q: JobQueue, T: TargetEnvironment>(
    State(state): State<GatewayState<S, Q, T>>,
) -> Json<PreflightStatus> {
    Json(state.settings.preflight.snapshot())
}

async fn healthz() -> &'static str {
    "ok"
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::oauth::{AuthClient, OAuthConfig};

    fn settings() -> GatewaySettings {
        GatewayConfig::new(AuthClient::new(OAuthConfig::new("cid"))).settings
    }

    #[test]
    fn callback_url_from_forwarded_headers() {
        let mut headers = HeaderMap::new();
        headers.insert(HOST, "deploy.example.com".parse().unwrap());
        headers.insert("x-forwarded-proto", "https, http".parse().unwrap());
        assert_eq!(
            callback_url(&settings(), &headers).unwrap(),
            "https://deploy.example.com/oauth/callback"
        );
    }

    #[test]
    fn callback_url_defaults_to_http() {
        let mut headers = HeaderMap::new();
        headers.insert(HOST, "localhost:8080".parse().unwrap());
        assert_eq!(
            callback_url(&settings(), &headers).unwrap(),
            "http://localhost:8080/oauth/callback"
        );
    }

    #[test]
    fn public_base_url_wins() {
        let mut settings = settings();
        settings.public_base_url = Some("https://public.example.com/app/".parse().unwrap());
        let mut headers = HeaderMap::new();
        headers.insert(HOST, "internal:8080".parse().unwrap());
        assert_eq!(
            callback_url(&settings, &headers).unwrap(),
            "https://public.example.com/oauth/callback"
        );
    }

    #[test]
    fn credentials_require_refresh_token_and_instance() {
        let tokens = |refresh: Option<&str>, instance: Option<&str>| TokenResponse {
            access_token: "at".into(),
            refresh_token: refresh.map(str::to_string),
            instance_url: instance.map(str::to_string),
            ..TokenResponse::default()
        };
        assert!(matches!(
            credentials_from(tokens(Some("rt"), None)),
            Err(GatewayError::MissingInstanceUrl)
        ));
        assert!(matches!(
            credentials_from(tokens(None, Some("https://acme.example.com"))),
            Err(GatewayError::MissingRefreshToken)
        ));
        let creds = credentials_from(tokens(Some("rt"), Some("https://acme.example.com"))).unwrap();
        assert_eq!(creds.refresh_token, "rt");
    }
}
