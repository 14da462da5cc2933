use std::collections::HashMap;
use std::sync::Mutex;

use time::OffsetDateTime;

use super::{FlowSession, SessionStore};
use crate::error::Error;
use crate::types::SessionId;

/// Process-local session store.
///
/// Only correct when one process serves both `/login` and `/callback`
/// (tests, `orgdeploy standalone`).
#[derive(Debug, Default)]
pub struct MemorySessionStore {
    sessions: Mutex<HashMap<SessionId, FlowSession>>,
}

impl MemorySessionStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, HashMap<SessionId, FlowSession>>, Error> {
        self.sessions
            .lock()
            .map_err(|_| Error::Store("session store lock poisoned".into()))
    }
}

impl SessionStore for MemorySessionStore {
    async fn create(&self, id: &SessionId, session: FlowSession) -> Result<(), Error> {
        self.lock()?.insert(id.clone(), session);
        Ok(())
    }

    async fn find(&self, id: &SessionId) -> Result<Option<FlowSession>, Error> {
        let now = OffsetDateTime::now_utc();
        Ok(self
            .lock()?
            .get(id)
            .filter(|s| !s.is_expired(now))
            .cloned())
    }

    async fn take(&self, id: &SessionId) -> Result<Option<FlowSession>, Error> {
        let now = OffsetDateTime::now_utc();
        Ok(self.lock()?.remove(id).filter(|s| !s.is_expired(now)))
    }

    async fn delete(&self, id: &SessionId) -> Result<(), Error> {
        self.lock()?.remove(id);
        Ok(())
    }

    async fn purge_expired(&self) -> Result<u64, Error> {
        let now = OffsetDateTime::now_utc();
        let mut sessions = self.lock()?;
        let before = sessions.len();
        sessions.retain(|_, s| !s.is_expired(now));
        Ok((before - sessions.len()) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::FlowRoute;
    use time::Duration;

    fn session(expires_in: Duration) -> FlowSession {
        FlowSession {
            code_verifier: Some("verifier".into()),
            code_challenge: Some("challenge".into()),
            callback_url: Some("https://x/cb".into()),
            route: FlowRoute::default(),
            expires_at: OffsetDateTime::now_utc() + expires_in,
        }
    }

    #[tokio::test]
    async fn find_hides_expired_sessions() {
        let store = MemorySessionStore::new();
        let live = SessionId::generate();
        let stale = SessionId::generate();
        store.create(&live, session(Duration::minutes(10))).await.unwrap();
        store.create(&stale, session(Duration::seconds(-1))).await.unwrap();

        assert!(store.find(&live).await.unwrap().is_some());
        assert!(store.find(&stale).await.unwrap().is_none());
        assert_eq!(store.purge_expired().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn take_is_single_use() {
        let store = MemorySessionStore::new();
        let id = SessionId::generate();
        store.create(&id, session(Duration::minutes(1))).await.unwrap();
        assert!(store.take(&id).await.unwrap().is_some());
        assert!(store.take(&id).await.unwrap().is_none());
        assert!(store.find(&id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn delete_is_idempotent() {
        let store = MemorySessionStore::new();
        let id = SessionId::generate();
        store.create(&id, session(Duration::minutes(1))).await.unwrap();
        store.delete(&id).await.unwrap();
        store.delete(&id).await.unwrap();
        assert!(store.find(&id).await.unwrap().is_none());
    }
}
