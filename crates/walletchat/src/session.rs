use crate::network::{Connection, MessagingNetwork};
use crate::types::now_ms;
use crate::{Address, Error, Identity, Result};
use std::fmt;
use std::sync::{Arc, Mutex};
use tokio::sync::watch;
use tracing::info;
use uuid::Uuid;

/// An authenticated connection bound to one identity.
///
/// A session is active from creation until the store replaces or
/// deactivates it; it never becomes active again afterwards.
pub struct Session {
    id: Uuid,
    identity: Arc<Identity>,
    connection: Arc<dyn Connection>,
    activated_at: u64,
    expiry: watch::Sender<bool>,
}

impl Session {
    fn new(identity: Arc<Identity>, connection: Arc<dyn Connection>) -> Self {
        let (expiry, _) = watch::channel(false);
        Self {
            id: Uuid::new_v4(),
            identity,
            connection,
            activated_at: now_ms(),
            expiry,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn identity(&self) -> &Arc<Identity> {
        &self.identity
    }

    pub fn address(&self) -> &Address {
        self.identity.address()
    }

    pub fn connection(&self) -> &Arc<dyn Connection> {
        &self.connection
    }

    pub fn activated_at(&self) -> u64 {
        self.activated_at
    }

    pub fn is_active(&self) -> bool {
        !*self.expiry.borrow()
    }

    pub fn ensure_active(&self) -> Result<()> {
        if self.is_active() {
            Ok(())
        } else {
            Err(Error::SessionExpired)
        }
    }

    /// Resolves once the session has been replaced or deactivated.
    pub async fn expired(&self) {
        let mut rx = self.expiry.subscribe();
        let _ = rx.wait_for(|expired| *expired).await;
    }

    fn expire(&self) {
        if !self.expiry.send_replace(true) {
            self.connection.close();
        }
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("address", self.address())
            .field("active", &self.is_active())
            .finish()
    }
}

/// Holds the single active session and owns its connection.
pub struct SessionStore {
    network: Arc<dyn MessagingNetwork>,
    current: Mutex<Option<Arc<Session>>>,
    activation: tokio::sync::Mutex<()>,
}

impl SessionStore {
    pub fn new(network: Arc<dyn MessagingNetwork>) -> Self {
        Self {
            network,
            current: Mutex::new(None),
            activation: tokio::sync::Mutex::new(()),
        }
    }

    /// Connect as `identity` and make it the active session.
    ///
    /// A previously active session is expired once the new connection is up;
    /// work still in flight on it fails with [`Error::SessionExpired`]. If the
    /// connection cannot be established the previous session stays active.
    pub async fn activate(&self, identity: Arc<Identity>) -> Result<Arc<Session>> {
        let _activation = self.activation.lock().await;

        let connection = self.network.connect(identity.clone()).await?;
        let session = Arc::new(Session::new(identity, connection));
        let previous = self.current.lock().unwrap().replace(session.clone());

        if let Some(previous) = previous {
            info!(session = %previous.id, address = %previous.address(), "replacing active session");
            previous.expire();
        }
        info!(session = %session.id, address = %session.address(), "session activated");
        Ok(session)
    }

    pub fn current(&self) -> Option<Arc<Session>> {
        self.current.lock().unwrap().clone()
    }

    pub fn require_current(&self) -> Result<Arc<Session>> {
        self.current().ok_or(Error::SessionExpired)
    }

    /// Expire the active session, if any. Safe to call repeatedly.
    pub fn deactivate(&self) {
        let previous = self.current.lock().unwrap().take();
        if let Some(previous) = previous {
            info!(session = %previous.id, address = %previous.address(), "session deactivated");
            previous.expire();
        }
    }
}

impl Drop for SessionStore {
    fn drop(&mut self) {
        self.deactivate();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::InMemoryNetwork;

    fn identity(address: &str) -> Arc<Identity> {
        Arc::new(Identity::derive(Address::parse(address).unwrap(), &[3u8; 65]).unwrap())
    }

    const ALICE: &str = "0x00000000000000000000000000000000000a11ce";

    #[tokio::test]
    async fn current_is_none_before_activation() {
        let store = SessionStore::new(Arc::new(InMemoryNetwork::new()));
        assert!(store.current().is_none());
        assert!(matches!(store.require_current(), Err(Error::SessionExpired)));
    }

    #[tokio::test]
    async fn activation_replaces_previous_session() {
        let store = SessionStore::new(Arc::new(InMemoryNetwork::new()));
        let first = store.activate(identity(ALICE)).await.unwrap();
        let second = store.activate(identity(ALICE)).await.unwrap();

        assert!(!first.is_active());
        assert!(second.is_active());
        assert_eq!(store.current().unwrap().id(), second.id());
        // Resolves immediately for an already expired session.
        first.expired().await;
    }

    #[tokio::test]
    async fn deactivate_is_idempotent() {
        let store = SessionStore::new(Arc::new(InMemoryNetwork::new()));
        let session = store.activate(identity(ALICE)).await.unwrap();
        store.deactivate();
        store.deactivate();
        assert!(store.current().is_none());
        assert!(matches!(session.ensure_active(), Err(Error::SessionExpired)));
    }

    #[tokio::test]
    async fn failed_connect_keeps_previous_session() {
        let network = InMemoryNetwork::new();
        let store = SessionStore::new(Arc::new(network.clone()));
        let first = store.activate(identity(ALICE)).await.unwrap();

        network.fail_connect(true);
        let err = store.activate(identity(ALICE)).await.unwrap_err();
        assert!(matches!(err, Error::TransportFailure(_)));
        assert!(first.is_active());
        assert_eq!(store.current().unwrap().id(), first.id());
    }
}
