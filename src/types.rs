use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use derive_more::{Display, From, Into};
use rand::Rng;
use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Opaque deployment job identifier.
///
/// Generated as a ULID: 48 bits of millisecond timestamp followed by 80 random
/// bits, Crockford base32. URL-safe and not guessable from a neighbouring id.
#[derive(
    Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Display, From, Into,
)]
#[serde(transparent)]
pub struct JobId(pub String);

impl JobId {
    #[must_use]
    pub fn generate() -> Self {
        Self(Ulid::new().to_string())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Server-side PKCE session identifier (carried in the private session cookie).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, Display, From, Into)]
#[serde(transparent)]
pub struct SessionId(pub String);

impl SessionId {
    /// 32 random bytes, base64url without padding.
    #[must_use]
    pub fn generate() -> Self {
        let bytes: [u8; 32] = rand::rng().random();
        Self(URL_SAFE_NO_PAD.encode(bytes))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Proof that a worker holds the claim on a job.
///
/// Every mutation of a running job is conditional on the token; a worker whose
/// lease was reclaimed gets [`Error::LeaseLost`](crate::Error::LeaseLost).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lease {
    pub job_id: JobId,
    pub token: String,
}

impl Lease {
    #[must_use]
    pub fn new(job_id: JobId) -> Self {
        Self {
            job_id,
            token: Self::generate_token(),
        }
    }

    /// 16 random bytes, base64url without padding.
    #[must_use]
    pub fn generate_token() -> String {
        let bytes: [u8; 16] = rand::rng().random();
        URL_SAFE_NO_PAD.encode(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn job_ids_are_unique_and_url_safe() {
        let a = JobId::generate();
        let b = JobId::generate();
        assert_ne!(a, b);
        assert_eq!(a.as_str().len(), 26);
        assert!(a.as_str().chars().all(|c| c.is_ascii_alphanumeric()));
    }

    #[test]
    fn session_id_length() {
        let id = SessionId::generate();
        assert_eq!(id.as_str().len(), 43);
        assert_ne!(id, SessionId::generate());
    }

    #[test]
    fn leases_for_same_job_differ() {
        let job = JobId::from("job-1".to_string());
        let a = Lease::new(job.clone());
        let b = Lease::new(job);
        assert_eq!(a.job_id, b.job_id);
        assert_ne!(a.token, b.token);
    }

    #[test]
    fn job_id_serde_is_transparent() {
        let id = JobId::from("01HZX".to_string());
        assert_eq!(serde_json::to_string(&id).unwrap(), "\"01HZX\"");
    }
}
