//! Shared, lock-serialized access to a session

use std::sync::Arc;
use tokio::sync::{Mutex, MutexGuard};

use super::{RespondingCounter, Session};
use crate::client::ClientRegistry;

/// Cloneable handle through which concurrent tasks reach one session.
///
/// The lock is the session's single mutation actor: every structural change
/// happens while it is held, and it is never held across a model call.
#[derive(Clone)]
pub struct SessionHandle {
    session: Arc<Mutex<Session>>,
    responding: RespondingCounter,
    clients: Arc<ClientRegistry>,
    id: Arc<str>,
}

impl SessionHandle {
    pub fn new(session: Session, clients: ClientRegistry) -> Self {
        let responding = session.responding();
        let id: Arc<str> = Arc::from(session.id());
        Self {
            session: Arc::new(Mutex::new(session)),
            responding,
            clients: Arc::new(clients),
            id,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Acquire the session for a batch of synchronous operations
    pub async fn lock(&self) -> MutexGuard<'_, Session> {
        self.session.lock().await
    }

    /// Run a synchronous operation under the session lock
    pub async fn with_session<R>(&self, f: impl FnOnce(&mut Session) -> R) -> R {
        let mut session = self.session.lock().await;
        f(&mut session)
    }

    /// Calls or chain runs currently in flight; readable without the lock
    pub fn responding_count(&self) -> usize {
        self.responding.count()
    }

    pub(crate) fn responding(&self) -> &RespondingCounter {
        &self.responding
    }

    pub fn clients(&self) -> &ClientRegistry {
        &self.clients
    }

    /// Take the session back out, if this is the last handle
    pub fn into_inner(self) -> Option<Session> {
        Arc::into_inner(self.session).map(Mutex::into_inner)
    }
}

impl std::fmt::Debug for SessionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionHandle")
            .field("id", &self.id)
            .field("responding", &self.responding.count())
            .field("clients", &self.clients)
            .finish()
    }
}
