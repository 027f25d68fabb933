//! The process's current identity and the client authenticated with it.
//!
//! There is exactly one current [`Session`]. Rotation replaces it with a
//! single publish; readers clone the `Arc` and never observe a mix of old
//! identity and new client.

use std::sync::Arc;

use tokio::sync::watch;

use crate::client::AuthApi;
use crate::identity::Identity;

/// An identity paired with the client built from it.
#[derive(Clone)]
pub struct Session {
    pub identity: Arc<Identity>,
    pub client: Arc<dyn AuthApi>,
}

impl Session {
    pub fn new(identity: Arc<Identity>, client: Arc<dyn AuthApi>) -> Self {
        Self { identity, client }
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("identity", &self.identity.id)
            .finish_non_exhaustive()
    }
}

/// Shared handle to the current session.
#[derive(Clone)]
pub struct SessionHandle {
    tx: Arc<watch::Sender<Arc<Session>>>,
}

impl SessionHandle {
    pub fn new(session: Session) -> Self {
        let (tx, _rx) = watch::channel(Arc::new(session));
        Self { tx: Arc::new(tx) }
    }

    /// Snapshot of the current session.
    pub fn current(&self) -> Arc<Session> {
        self.tx.borrow().clone()
    }

    /// Atomically make `session` current. Returns the session it replaced.
    pub fn publish(&self, session: Session) -> Arc<Session> {
        let issued_at = session.identity.issued_at;
        let previous = self.tx.send_replace(Arc::new(session));
        log::info!(
            "published session for {} (issued {issued_at})",
            previous.identity.id
        );
        previous
    }

    /// Receive a notification on every publish.
    pub fn subscribe(&self) -> watch::Receiver<Arc<Session>> {
        self.tx.subscribe()
    }
}
