use axum_extra::extract::cookie::Key;
use time::Duration;
use url::Url;

use super::preflight::Preflight;
use crate::eligibility::AllowList;
use crate::env;
use crate::error::Error;
use crate::oauth::{AuthClient, OAuthConfig};
use crate::session::SESSION_TTL;

/// Settings shared by the config and the runtime state.
#[derive(Clone)]
pub(crate) struct GatewaySettings {
    pub(crate) cookie_key: Key,
    pub(crate) session_cookie_name: String,
    pub(crate) session_ttl: Duration,
    pub(crate) production: bool,
    pub(crate) public_base_url: Option<Url>,
    pub(crate) allow_list: AllowList,
    pub(crate) preflight: Preflight,
}

impl GatewaySettings {
    fn defaults() -> Self {
        Self {
            cookie_key: Key::generate(),
            session_cookie_name: "orgdeploy.sid".into(),
            session_ttl: SESSION_TTL,
            production: false,
            public_base_url: None,
            allow_list: AllowList::default(),
            preflight: Preflight::new(),
        }
    }
}

/// Gateway configuration.
///
/// The `AuthClient` is the only required piece and is a constructor
/// parameter. Use [`from_env()`](GatewayConfig::from_env) in the binary, or
/// [`new()`](GatewayConfig::new) with `with_*` methods for full control.
pub struct GatewayConfig {
    pub(super) client: AuthClient,
    pub(super) settings: GatewaySettings,
}

impl GatewayConfig {
    #[must_use]
    pub fn new(client: AuthClient) -> Self {
        Self {
            client,
            settings: GatewaySettings::defaults(),
        }
    }

    /// Create config from environment variables.
    ///
    /// # Required env vars
    /// - `OAUTH_CLIENT_ID`: `OAuth2` client identifier
    ///
    /// # Optional env vars
    /// - `OAUTH_BASE_URL`: login host of the identity provider
    /// - `OAUTH_SCOPES`: space-separated scopes
    /// - `PUBLIC_BASE_URL`: external address used to build the callback URL
    /// - `ALLOWED_INSTANCE_NAMES`: comma-separated production instance names
    /// - `PRODUCTION`: `"1"` or `"true"` for `Secure` + `SameSite=None` cookies
    /// - `COOKIE_KEY`: cookie encryption key bytes (at least 64)
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if a required variable is missing or a value is invalid.
    pub fn from_env() -> Result<Self, Error> {
        let mut oauth = OAuthConfig::new(env::required("OAUTH_CLIENT_ID")?);

        if let Some(base) = env::var("OAUTH_BASE_URL") {
            let base: Url = base
                .parse()
                .map_err(|e| Error::Config(format!("OAUTH_BASE_URL: {e}")))?;
            oauth = oauth.with_base_url(&base)?;
        }
        if let Some(scopes) = env::var("OAUTH_SCOPES") {
            oauth = oauth.with_scopes(scopes.split_whitespace().map(str::to_string).collect());
        }

        let mut config = Self::new(AuthClient::new(oauth))
            .with_production(env::flag("PRODUCTION"))
            .with_allow_list(AllowList::parse(
                &env::var("ALLOWED_INSTANCE_NAMES").unwrap_or_default(),
            ));

        if let Some(url) = env::var("PUBLIC_BASE_URL") {
            let url: Url = url
                .parse()
                .map_err(|e| Error::Config(format!("PUBLIC_BASE_URL: {e}")))?;
            config = config.with_public_base_url(url);
        }

        if let Some(key) = env::var("COOKIE_KEY") {
            let key = Key::try_from(key.as_bytes()).map_err(|_| {
                Error::Config(
                    "COOKIE_KEY is set but invalid (must be at least 64 bytes). \
                     Remove the env var to use an ephemeral key, or provide a valid key."
                        .into(),
                )
            })?;
            config = config.with_cookie_key(key);
        } else if config.settings.production {
            tracing::warn!("COOKIE_KEY not set; in-flight logins will not survive a restart");
        }

        Ok(config)
    }

    #[must_use]
    pub fn with_cookie_key(mut self, key: Key) -> Self {
        self.settings.cookie_key = key;
        self
    }

    #[must_use]
    pub fn with_session_cookie_name(mut self, name: impl Into<String>) -> Self {
        self.settings.session_cookie_name = name.into();
        self
    }

    /// Lifetime of a login session and its cookie.
    #[must_use]
    pub fn with_session_ttl(mut self, ttl: Duration) -> Self {
        self.settings.session_ttl = ttl;
        self
    }

    /// Production cookies are `Secure` and `SameSite=None`; otherwise `Lax`.
    #[must_use]
    pub fn with_production(mut self, production: bool) -> Self {
        self.settings.production = production;
        self
    }

    /// Fixes the external address; without it the callback URL is derived
    /// from the request's `Host` and `X-Forwarded-Proto` headers.
    #[must_use]
    pub fn with_public_base_url(mut self, url: Url) -> Self {
        self.settings.public_base_url = Some(url);
        self
    }

    #[must_use]
    pub fn with_allow_list(mut self, allow_list: AllowList) -> Self {
        self.settings.allow_list = allow_list;
        self
    }

    /// Shares a readiness handle with a background probe.
    #[must_use]
    pub fn with_preflight(mut self, preflight: Preflight) -> Self {
        self.settings.preflight = preflight;
        self
    }

    #[must_use]
    pub fn preflight(&self) -> &Preflight {
        &self.settings.preflight
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_development_friendly() {
        let config = GatewayConfig::new(AuthClient::new(OAuthConfig::new("cid")));
        assert!(!config.settings.production);
        assert_eq!(config.settings.session_cookie_name, "orgdeploy.sid");
        assert_eq!(config.settings.session_ttl, Duration::minutes(10));
        assert!(config.settings.public_base_url.is_none());
        assert!(!config.preflight().snapshot().ready);
    }

    #[test]
    fn builders_override_settings() {
        let config = GatewayConfig::new(AuthClient::new(OAuthConfig::new("cid")))
            .with_production(true)
            .with_session_cookie_name("sid")
            .with_allow_list(AllowList::parse("na123"))
            .with_public_base_url("https://deploy.example.com".parse().unwrap());
        assert!(config.settings.production);
        assert_eq!(config.settings.session_cookie_name, "sid");
        assert!(config.settings.allow_list.contains("NA123"));
        assert!(config.settings.public_base_url.is_some());
    }
}
