#![allow(dead_code)]

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::post;
use axum::{Form, Router};
use serde_json::json;
use url::Url;

use orgdeploy::Error;
use orgdeploy::queue::Credentials;
use orgdeploy::worker::{ContentSource, FetchedContent, OrgInfo, TargetEnvironment, TargetSession};

// ── Identity provider ──────────────────────────────────────────────

#[derive(Default)]
struct ProviderState {
    codes: Vec<String>,
    exchanges: Vec<HashMap<String, String>>,
    omit_refresh_token: bool,
}

/// Token endpoint on a loopback port. Codes are single-use.
#[derive(Clone)]
pub struct FakeProvider {
    pub base_url: Url,
    state: Arc<Mutex<ProviderState>>,
}

impl FakeProvider {
    pub async fn start() -> Self {
        Self::start_with(false).await
    }

    /// A provider whose token response carries no refresh token.
    pub async fn without_refresh_token() -> Self {
        Self::start_with(true).await
    }

    async fn start_with(omit_refresh_token: bool) -> Self {
        let state = Arc::new(Mutex::new(ProviderState {
            omit_refresh_token,
            ..ProviderState::default()
        }));
        let app = Router::new()
            .route("/services/oauth2/token", post(token))
            .with_state(state.clone());

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self {
            base_url: format!("http://{addr}").parse().unwrap(),
            state,
        }
    }

    pub fn issue_code(&self, code: &str) {
        self.state.lock().unwrap().codes.push(code.to_string());
    }

    /// Form parameters of every token request received so far.
    pub fn exchanges(&self) -> Vec<HashMap<String, String>> {
        self.state.lock().unwrap().exchanges.clone()
    }
}

async fn token(
    State(state): State<Arc<Mutex<ProviderState>>>,
    Form(params): Form<HashMap<String, String>>,
) -> Response {
    let mut state = state.lock().unwrap();
    state.exchanges.push(params.clone());

    let code = params.get("code").cloned().unwrap_or_default();
    let Some(pos) = state.codes.iter().position(|c| *c == code) else {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({
                "error": "invalid_grant",
                "error_description": "expired authorization code"
            })),
        )
            .into_response();
    };
    state.codes.remove(pos);

    let mut body = json!({
        "access_token": "00Dxx0000001gPL!AQ4AQFake",
        "instance_url": "https://acme.my.salesforce.com",
        "token_type": "Bearer",
        "scope": "refresh_token api"
    });
    if !state.omit_refresh_token {
        body["refresh_token"] = json!("5Aep861FakeRefresh");
    }
    Json(body).into_response()
}

// ── Target environment ─────────────────────────────────────────────

#[derive(Clone)]
pub struct FakeTarget {
    pub org: OrgInfo,
    pub conflicts: u64,
    pub fail_login: bool,
}

impl FakeTarget {
    pub fn sandbox() -> Self {
        Self {
            org: OrgInfo {
                is_sandbox: true,
                instance_name: Some("CS42".into()),
            },
            conflicts: 0,
            fail_login: false,
        }
    }

    pub fn production(instance: &str) -> Self {
        Self {
            org: OrgInfo {
                is_sandbox: false,
                instance_name: Some(instance.into()),
            },
            ..Self::sandbox()
        }
    }
}

pub struct FakeSession {
    org: OrgInfo,
    conflicts: u64,
}

impl TargetEnvironment for FakeTarget {
    type Session = FakeSession;

    async fn authenticate(&self, _alias: &str, credentials: &Credentials) -> Result<FakeSession, Error> {
        if self.fail_login || credentials.refresh_token.is_empty() {
            return Err(Error::AuthenticationFailed("expired refresh token".into()));
        }
        Ok(FakeSession {
            org: self.org.clone(),
            conflicts: self.conflicts,
        })
    }
}

impl TargetSession for FakeSession {
    async fn username(&self) -> Result<Option<String>, Error> {
        Ok(Some("admin@acme.dev".into()))
    }

    async fn org_info(&self) -> Result<OrgInfo, Error> {
        Ok(self.org.clone())
    }

    async fn count_records(&self, _object: &str) -> Result<u64, Error> {
        Ok(self.conflicts)
    }

    fn script_env(&self) -> Vec<(String, String)> {
        vec![("SF_TARGET_ORG".into(), "Dev1".into())]
    }
}

// ── Content ────────────────────────────────────────────────────────

/// Serves a content tree holding only the deployment script.
pub struct FakeContent {
    pub script: &'static str,
}

impl ContentSource for FakeContent {
    async fn fetch(&self, branch: &str) -> Result<FetchedContent, Error> {
        let dir = tempfile::tempdir()?;
        let root: PathBuf = dir.path().join(format!("LSStarterConfig-{branch}"));
        std::fs::create_dir_all(root.join("Scripts/sh"))?;
        std::fs::write(root.join("Scripts/sh/data_load.sh"), self.script)?;
        Ok(FetchedContent::new(dir, root))
    }
}

pub fn credentials() -> Credentials {
    Credentials {
        access_token: "00Dxx!access".into(),
        refresh_token: "5Aep861refresh".into(),
        instance_url: "https://acme.my.salesforce.com".into(),
    }
}
