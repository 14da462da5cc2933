use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};

use crate::error::Error;
use crate::redact;

/// Errors returned by gateway routes.
///
/// Bodies are plain text and pass through [`redact::sanitize`] before they
/// leave the process.
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    /// The provider redirected back without an authorization code.
    #[error("Missing authorization code. Please log in again.")]
    MissingCode,

    #[error("Missing instance_url from token response.")]
    MissingInstanceUrl,

    /// Without a refresh token the worker cannot log in to the target.
    #[error("The client must allow offline_access to return a refresh_token.")]
    MissingRefreshToken,

    #[error(transparent)]
    Flow(#[from] Error),
}

impl GatewayError {
    #[must_use]
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::MissingCode => StatusCode::BAD_REQUEST,
            Self::MissingInstanceUrl | Self::MissingRefreshToken => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
            Self::Flow(e) => match e {
                Error::SessionExpired
                | Error::PkceMismatch
                | Error::TokenExchangeFailed { .. }
                | Error::Authorization { .. }
                | Error::InvalidRoute(_) => StatusCode::BAD_REQUEST,
                Error::AccessDenied(_) => StatusCode::FORBIDDEN,
                Error::AuthenticationFailed(_) | Error::TargetQuery(_) | Error::Http(_) => {
                    StatusCode::BAD_GATEWAY
                }
                _ => StatusCode::INTERNAL_SERVER_ERROR,
            },
        }
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body = match &self {
            Self::Flow(Error::Http(_)) => {
                tracing::error!(error = %self, "Identity provider unreachable");
                "Could not reach the identity provider. Please try again.".to_string()
            }
            Self::Flow(e) if !e.is_user_facing() => {
                tracing::error!(error = %self, "Gateway internal error");
                "Internal error. Please try again.".to_string()
            }
            _ => {
                tracing::warn!(status = status.as_u16(), error = %self, "Request rejected");
                redact::sanitize(&self.to_string())
            }
        };
        (status, body).into_response()
    }
}
