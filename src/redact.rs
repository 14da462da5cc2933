//! Blanket masking of credential-shaped text.
//!
//! Applied to every job log line, every error rendered into an HTTP body, and
//! every error recorded through `tracing`. Subprocess output is not trusted to
//! keep secrets out of its own output.

use std::borrow::Cow;
use std::sync::LazyLock;

use regex::Regex;

/// Upper bound on error text written to job logs and HTTP bodies.
pub const MAX_MESSAGE_LEN: usize = 500;

/// `key=value`, `key: value` and `"key": "value"` forms.
static KEYED_SECRET: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r#"(?i)(refresh_?token|access_?token|client_?id|client_?secret|code_?verifier|instance[_-]?url)("?\s*[=:]\s*"?)[^\s"'&,;]+"#,
    )
    .expect("static regex")
});

/// Auth URLs of the form `force://<client>:<secret>:<refresh>@<host>`.
static AUTH_URL: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)force://\S+").expect("static regex"));

/// Bare bearer credentials, e.g. `Authorization: Bearer 00D...`.
static BEARER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)(bearer\s+)[A-Za-z0-9._~+/!=-]+").expect("static regex"));

/// Instance hosts of the target platform.
static INSTANCE_HOST: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)https?://[A-Za-z0-9.-]+\.(?:my\.)?(?:salesforce|force)\.com\S*")
        .expect("static regex")
});

/// Masks credential-shaped substrings of `input`.
///
/// ```
/// assert_eq!(orgdeploy::redact::redact("refreshToken=abc123"), "refreshToken=***");
/// ```
#[must_use]
pub fn redact(input: &str) -> Cow<'_, str> {
    let mut out = KEYED_SECRET.replace_all(input, "${1}${2}***");
    if AUTH_URL.is_match(&out) {
        out = Cow::Owned(AUTH_URL.replace_all(&out, "force://***").into_owned());
    }
    if BEARER.is_match(&out) {
        out = Cow::Owned(BEARER.replace_all(&out, "${1}***").into_owned());
    }
    if INSTANCE_HOST.is_match(&out) {
        out = Cow::Owned(INSTANCE_HOST.replace_all(&out, "https://***").into_owned());
    }
    out
}

/// Redacts and truncates a message for display, on a char boundary.
#[must_use]
pub fn sanitize(input: &str) -> String {
    let redacted = redact(input);
    match redacted.char_indices().nth(MAX_MESSAGE_LEN) {
        Some((cut, _)) => redacted[..cut].to_string(),
        None => redacted.into_owned(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn masks_refresh_token() {
        assert_eq!(redact("refreshToken=abc123"), "refreshToken=***");
        assert_eq!(
            redact("login with refresh_token: 5Aep861 failed"),
            "login with refresh_token: *** failed"
        );
    }

    #[test]
    fn masks_json_fields() {
        let line = r#"{"access_token":"00Dxx!AQ4A","instance_url":"https://acme.my.salesforce.com"}"#;
        let out = redact(line);
        assert!(!out.contains("00Dxx"));
        assert!(!out.contains("acme"));
        assert!(out.contains(r#""access_token":"***""#));
    }

    #[test]
    fn masks_client_id_and_verifier() {
        let out = redact("client_id=3MVG9abc&code_verifier=xyz&grant_type=authorization_code");
        assert_eq!(
            out,
            "client_id=***&code_verifier=***&grant_type=authorization_code"
        );
    }

    #[test]
    fn masks_auth_urls_and_bearer() {
        assert_eq!(
            redact("using force://3MVG::5Aep@acme.my.salesforce.com now"),
            "using force://*** now"
        );
        assert_eq!(
            redact("Authorization: Bearer 00D5g!AQcAQ"),
            "Authorization: Bearer ***"
        );
    }

    #[test]
    fn masks_instance_hosts() {
        assert_eq!(
            redact("connected to https://acme--dev.sandbox.my.salesforce.com/services"),
            "connected to https://***"
        );
    }

    #[test]
    fn leaves_plain_text_borrowed() {
        let line = "Deploying 42 records";
        assert!(matches!(redact(line), Cow::Borrowed(_)));
    }

    #[test]
    fn sanitize_truncates_on_char_boundary() {
        let long = "é".repeat(MAX_MESSAGE_LEN + 10);
        let out = sanitize(&long);
        assert_eq!(out.chars().count(), MAX_MESSAGE_LEN);
    }
}
