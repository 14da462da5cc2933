use axum_extra::extract::PrivateCookieJar;
use axum_extra::extract::cookie::{Cookie, SameSite};
use time::Duration;

use crate::types::SessionId;

/// Create the login session cookie.
///
/// Cross-site redirects back from the provider must carry the cookie, so a
/// production deployment uses `SameSite=None`, which browsers only accept
/// together with `Secure`.
pub(super) fn session_cookie(
    name: &str,
    session_id: &SessionId,
    ttl: Duration,
    production: bool,
) -> Cookie<'static> {
    let same_site = if production {
        SameSite::None
    } else {
        SameSite::Lax
    };
    Cookie::build((name.to_string(), session_id.as_str().to_string()))
        .http_only(true)
        .secure(production)
        .same_site(same_site)
        .path("/".to_string())
        .max_age(ttl)
        .build()
}

/// Create removal cookie for the login session.
pub(super) fn clear_session_cookie(name: &str) -> Cookie<'static> {
    Cookie::build((name.to_string(), ""))
        .path("/".to_string())
        .max_age(Duration::ZERO)
        .build()
}

/// Get the session id from cookies.
pub(super) fn get_session_id(jar: &PrivateCookieJar, name: &str) -> Option<SessionId> {
    jar.get(name)
        .map(|c| c.value().to_string())
        .filter(|v| !v.is_empty())
        .map(SessionId)
}
