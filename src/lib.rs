#![doc = include_str!("../README.md")]

#[cfg(feature = "sqlite")]
pub mod db;
pub mod eligibility;
mod env;
pub mod error;
pub mod gateway;
pub mod oauth;
pub mod pkce;
pub mod queue;
pub mod redact;
pub mod session;
pub mod types;
pub mod worker;

// Re-exports for convenient access
pub use eligibility::{AllowList, Decision, decide};
pub use error::Error;
pub use gateway::{GatewayConfig, GatewayError, gateway_routes};
pub use oauth::{AuthClient, OAuthConfig, TokenResponse};
pub use pkce::{generate_code_challenge, generate_code_verifier, verify_code_challenge};
pub use queue::{JobPayload, JobQueue, JobState, JobStatus, MemoryQueue};
#[cfg(feature = "sqlite")]
pub use queue::SqliteQueue;
pub use session::{FlowRoute, MemorySessionStore, SessionManager, SessionStore};
#[cfg(feature = "sqlite")]
pub use session::SqliteSessionStore;
pub use types::{JobId, Lease, SessionId};
pub use worker::{Worker, WorkerConfig};
