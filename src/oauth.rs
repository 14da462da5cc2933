use std::time::Duration;

use serde::Deserialize;
use url::Url;

use crate::error::Error;
use crate::redact;

const AUTHORIZE_PATH: &str = "/services/oauth2/authorize";
const TOKEN_PATH: &str = "/services/oauth2/token";

/// Identity provider `OAuth2` configuration.
///
/// The token endpoint is fixed when the configuration is built: one base URL
/// per environment, never guessed after a failure.
///
/// ```rust,ignore
/// use orgdeploy::oauth::OAuthConfig;
///
/// let config = OAuthConfig::new("my-client-id")
///     .with_base_url("https://test.salesforce.com".parse()?)?;
/// ```
#[derive(Debug, Clone)]
#[non_exhaustive]
pub struct OAuthConfig {
    pub(crate) client_id: String,
    pub(crate) auth_url: Url,
    pub(crate) token_url: Url,
    pub(crate) scopes: Vec<String>,
    pub(crate) prompt: Option<String>,
}

impl OAuthConfig {
    /// Create a configuration against the default login host.
    #[must_use]
    pub fn new(client_id: impl Into<String>) -> Self {
        Self {
            client_id: client_id.into(),
            auth_url: "https://login.salesforce.com/services/oauth2/authorize"
                .parse()
                .expect("valid default URL"),
            token_url: "https://login.salesforce.com/services/oauth2/token"
                .parse()
                .expect("valid default URL"),
            scopes: vec![
                "refresh_token".into(),
                "api".into(),
                "offline_access".into(),
            ],
            prompt: Some("login".into()),
        }
    }

    /// Point both endpoints at another login host.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if `base` cannot be joined with the endpoint paths.
    pub fn with_base_url(mut self, base: &Url) -> Result<Self, Error> {
        self.auth_url = base
            .join(AUTHORIZE_PATH)
            .map_err(|e| Error::Config(format!("authorize URL: {e}")))?;
        self.token_url = base
            .join(TOKEN_PATH)
            .map_err(|e| Error::Config(format!("token URL: {e}")))?;
        Ok(self)
    }

    /// Override the `OAuth2` scopes.
    #[must_use]
    pub fn with_scopes(mut self, scopes: Vec<String>) -> Self {
        self.scopes = scopes;
        self
    }

    /// Override the `prompt` parameter (`None` omits it).
    #[must_use]
    pub fn with_prompt(mut self, prompt: Option<String>) -> Self {
        self.prompt = prompt;
        self
    }

    #[must_use]
    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    #[must_use]
    pub fn auth_url(&self) -> &Url {
        &self.auth_url
    }

    #[must_use]
    pub fn token_url(&self) -> &Url {
        &self.token_url
    }

    #[must_use]
    pub fn scopes(&self) -> &[String] {
        &self.scopes
    }
}

/// `OAuth2` authorization-code client with PKCE.
pub struct AuthClient {
    config: OAuthConfig,
    http: reqwest::Client,
}

/// Token response from the provider's token endpoint.
#[derive(Clone, Default, Deserialize)]
#[non_exhaustive]
pub struct TokenResponse {
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default)]
    pub instance_url: Option<String>,
    #[serde(default)]
    pub token_type: Option<String>,
    #[serde(default)]
    pub scope: Option<String>,
}

impl std::fmt::Debug for TokenResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenResponse")
            .field("access_token", &"***")
            .field("refresh_token", &self.refresh_token.as_ref().map(|_| "***"))
            .field("instance_url", &self.instance_url.as_ref().map(|_| "***"))
            .field("token_type", &self.token_type)
            .field("scope", &self.scope)
            .finish()
    }
}

#[derive(Deserialize)]
struct ProviderError {
    error: String,
    #[serde(default)]
    error_description: Option<String>,
}

/// HTTP client with the bounded timeouts the gateway relies on.
#[must_use]
pub fn default_http_client() -> reqwest::Client {
    reqwest::Client::builder()
        .connect_timeout(Duration::from_secs(10))
        .timeout(Duration::from_secs(30))
        .build()
        .unwrap_or_else(|_| reqwest::Client::new())
}

impl AuthClient {
    #[must_use]
    pub fn new(config: OAuthConfig) -> Self {
        Self {
            config,
            http: default_http_client(),
        }
    }

    /// Use a custom HTTP client (for connection pool reuse or testing).
    #[must_use]
    pub fn with_http_client(mut self, client: reqwest::Client) -> Self {
        self.http = client;
        self
    }

    #[must_use]
    pub fn config(&self) -> &OAuthConfig {
        &self.config
    }

    /// Builds the authorization URL for one flow.
    ///
    /// `redirect_uri` must be byte-for-byte the value later passed to
    /// [`exchange_code`](Self::exchange_code).
    #[must_use]
    pub fn authorization_url(&self, redirect_uri: &str, code_challenge: &str, state: &str) -> String {
        let scope = self.config.scopes.join(" ");

        let mut url = self.config.auth_url.clone();
        {
            let mut query = url.query_pairs_mut();
            query
                .append_pair("response_type", "code")
                .append_pair("client_id", &self.config.client_id)
                .append_pair("redirect_uri", redirect_uri)
                .append_pair("scope", &scope)
                .append_pair("state", state)
                .append_pair("code_challenge", code_challenge)
                .append_pair("code_challenge_method", "S256");
            if let Some(prompt) = &self.config.prompt {
                query.append_pair("prompt", prompt);
            }
        }
        url.into()
    }

    /// Exchange an authorization code for tokens using PKCE.
    ///
    /// Never retried: authorization codes are single-use.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Http`] on network failure, or
    /// [`Error::TokenExchangeFailed`] if the provider rejects the exchange.
    pub async fn exchange_code(
        &self,
        code: &str,
        code_verifier: &str,
        redirect_uri: &str,
    ) -> Result<TokenResponse, Error> {
        let params = [
            ("grant_type", "authorization_code"),
            ("code", code),
            ("client_id", self.config.client_id.as_str()),
            ("code_verifier", code_verifier),
            ("redirect_uri", redirect_uri),
        ];

        let response = self
            .http
            .post(self.config.token_url.clone())
            .form(&params)
            .send()
            .await?;

        let response = Self::ensure_success(response).await?;
        response.json::<TokenResponse>().await.map_err(Into::into)
    }

    /// Checks HTTP response status; maps provider error bodies to
    /// [`Error::TokenExchangeFailed`].
    async fn ensure_success(response: reqwest::Response) -> Result<reqwest::Response, Error> {
        if response.status().is_success() {
            return Ok(response);
        }
        let status = response.status().as_u16();
        let body = response.text().await.unwrap_or_default();

        let err = match serde_json::from_str::<ProviderError>(&body) {
            Ok(provider) => Error::TokenExchangeFailed {
                code: provider.error,
                description: provider
                    .error_description
                    .map(|d| redact::sanitize(&urlencoding::decode(&d).unwrap_or(d.as_str().into()))),
            },
            Err(_) => Error::TokenExchangeFailed {
                code: format!("http_{status}"),
                description: Some(redact::sanitize(&body)).filter(|d| !d.is_empty()),
            },
        };
        tracing::warn!(status, error = %err, "Token exchange rejected");
        Err(err)
    }
}
