use crate::types::JobId;

/// Errors raised while authorizing a flow or running a deployment job.
///
/// The first group is the user-facing taxonomy: every message is safe to show
/// in a browser or a job log once it has gone through [`crate::redact`], and
/// carries a next step. The second group is plumbing.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// No usable PKCE session: missing, expired, or already consumed.
    #[error("Session expired or invalid. Please log in again.")]
    SessionExpired,

    /// The stored verifier does not derive the stored challenge.
    #[error("OAuth security verification failed. Please log in again.")]
    PkceMismatch,

    /// The identity provider rejected the authorization code exchange.
    #[error("Token exchange failed: {}", provider_message(.code, .description))]
    TokenExchangeFailed {
        code: String,
        description: Option<String>,
    },

    /// The identity provider redirected back with an `error` parameter.
    #[error("OAuth error: {}", provider_message(.code, .description))]
    Authorization {
        code: String,
        description: Option<String>,
    },

    /// Login parameters (target alias or branch) are malformed.
    #[error("Invalid deployment target: {0}")]
    InvalidRoute(String),

    #[error("Failed to authenticate with the target environment: {0}. Please try again.")]
    AuthenticationFailed(String),

    /// A query against the authenticated target environment failed.
    #[error("Query against the target environment failed: {0}")]
    TargetQuery(String),

    #[error("Access denied: {0}")]
    AccessDenied(String),

    #[error(
        "Configuration already exists ({count} {object} records). \
         Please clear {object} records before deploying."
    )]
    ConflictExists { object: String, count: u64 },

    #[error("Deployment content not found: {0}")]
    ContentNotFound(String),

    #[error("Deployment script failed{}", exit_suffix(.exit_code))]
    ScriptFailed { exit_code: Option<i32> },

    /// The job's lease was reclaimed by another worker.
    #[error("Lease lost for job {0}")]
    LeaseLost(JobId),

    #[error("Store error: {0}")]
    Store(String),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl Error {
    /// Whether the error describes a problem the end user can act on.
    ///
    /// Everything else is reported with a generic message.
    #[must_use]
    pub fn is_user_facing(&self) -> bool {
        !matches!(
            self,
            Self::LeaseLost(_) | Self::Store(_) | Self::Http(_) | Self::Io(_) | Self::Config(_)
        )
    }
}

#[cfg(feature = "sqlite")]
impl From<sqlx::Error> for Error {
    fn from(e: sqlx::Error) -> Self {
        Self::Store(e.to_string())
    }
}

fn exit_suffix(code: &Option<i32>) -> String {
    match code {
        Some(code) => format!(" with exit code {code}"),
        None => " (terminated by signal)".to_string(),
    }
}

/// Renders a provider `error`/`error_description` pair with a next step.
fn provider_message(code: &str, description: &Option<String>) -> String {
    let description = description.as_deref().unwrap_or_default();
    let mut message = code.to_string();
    if !description.is_empty() {
        message.push_str(" - ");
        message.push_str(description);
    }

    let hint = match code {
        "invalid_grant" if description.contains("expired") => {
            "The authorization code may have expired. Please try logging in again."
        }
        "invalid_grant" if description.contains("authentication failure") => {
            "The code verifier did not match the code challenge. Please try logging in again."
        }
        "invalid_grant" => {
            "Please ensure the client is configured correctly and try logging in again."
        }
        "invalid_client_id" => "Please check that the configured client identifier is correct.",
        "redirect_uri_mismatch" => {
            "The callback URL must match exactly what is configured for the client."
        }
        "access_denied" => "Access was not granted. Please log in again and approve access.",
        _ => "Please try logging in again.",
    };
    format!("{message}. {hint}")
}
