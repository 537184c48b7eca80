//! Session registry: authentication bookkeeping and broadcast fan-out.
//!
//! Three maps track live connections: sessions by connection handle,
//! sessions by registered client identifier, and the pending challenge per
//! handle. All three are cleared together when a connection closes.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock};

use tracing::{debug, warn};

use crate::packet::Packet;
use crate::session::{ConnectionId, Session};
use crate::transport::Transport;
use crate::types::{Result, SealinkError, SHARED_KEY_SIZE};

/// Concurrent registry of sessions on a server.
///
/// Safe to call from per-session receive tasks and application threads at
/// the same time; broadcast snapshots the recipient set so no lock is held
/// while frames are queued.
pub struct SessionRegistry {
    sessions: RwLock<HashMap<ConnectionId, Arc<Session>>>,
    by_identifier: RwLock<HashMap<String, Arc<Session>>>,
    pending_challenges: RwLock<HashMap<ConnectionId, String>>,
    api_key: String,
}

impl SessionRegistry {
    /// Creates a registry verifying challenges against the given
    /// pre-shared secret.
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            by_identifier: RwLock::new(HashMap::new()),
            pending_challenges: RwLock::new(HashMap::new()),
            api_key: api_key.into(),
        }
    }

    /// The pre-shared secret used as the challenge HMAC key.
    pub(crate) fn api_key(&self) -> &str {
        &self.api_key
    }

    /// Creates and inserts a session for a connection.
    pub fn register(
        &self,
        connection_id: ConnectionId,
        transport: Arc<dyn Transport>,
        shared_key: [u8; SHARED_KEY_SIZE],
    ) -> Arc<Session> {
        let session = Arc::new(Session::new(connection_id, transport, shared_key));
        self.sessions
            .write()
            .expect("session map poisoned")
            .insert(connection_id, Arc::clone(&session));
        session
    }

    /// The session for a connection, if the key exchange happened.
    pub fn get(&self, connection_id: ConnectionId) -> Option<Arc<Session>> {
        self.sessions
            .read()
            .expect("session map poisoned")
            .get(&connection_id)
            .cloned()
    }

    /// The authenticated session that registered the given identifier.
    pub fn get_by_identifier(&self, identifier: &str) -> Option<Arc<Session>> {
        self.by_identifier
            .read()
            .expect("identifier map poisoned")
            .get(identifier)
            .cloned()
    }

    /// Whether an authenticated, connected session owns the identifier.
    pub fn has_identifier(&self, identifier: &str) -> bool {
        self.get_by_identifier(identifier)
            .is_some_and(|s| s.is_authenticated() && s.is_connected())
    }

    /// Removes a connection from all maps.
    ///
    /// The identifier mapping is only dropped if the removed session still
    /// owns it, so a replacement that claimed the identifier after a stale
    /// disconnect is left untouched.
    pub fn remove(&self, connection_id: ConnectionId) -> Option<Arc<Session>> {
        let session = self
            .sessions
            .write()
            .expect("session map poisoned")
            .remove(&connection_id);
        self.pending_challenges
            .write()
            .expect("challenge map poisoned")
            .remove(&connection_id);

        if let Some(session) = &session {
            if let Some(identifier) = session.identifier() {
                let mut by_identifier =
                    self.by_identifier.write().expect("identifier map poisoned");
                if by_identifier
                    .get(&identifier)
                    .is_some_and(|owner| owner.session_id() == session.session_id())
                {
                    by_identifier.remove(&identifier);
                }
            }
        }
        session
    }

    /// Stores the challenge the connection is expected to answer.
    pub(crate) fn store_pending_challenge(&self, connection_id: ConnectionId, challenge: String) {
        self.pending_challenges
            .write()
            .expect("challenge map poisoned")
            .insert(connection_id, challenge);
    }

    /// Takes the pending challenge, clearing it regardless of what the
    /// caller decides about the response.
    pub(crate) fn take_pending_challenge(&self, connection_id: ConnectionId) -> Option<String> {
        self.pending_challenges
            .write()
            .expect("challenge map poisoned")
            .remove(&connection_id)
    }

    /// Claims an identifier for a session.
    ///
    /// Fails with [`SealinkError::IdentifierConflict`] when another
    /// authenticated, connected session already owns it. The check and the
    /// insert happen under one write lock so two racing claims cannot both
    /// succeed.
    pub(crate) fn register_identifier(
        &self,
        session: &Arc<Session>,
        identifier: &str,
    ) -> Result<()> {
        let mut by_identifier = self.by_identifier.write().expect("identifier map poisoned");
        if let Some(owner) = by_identifier.get(identifier) {
            if owner.session_id() != session.session_id()
                && owner.is_authenticated()
                && owner.is_connected()
            {
                return Err(SealinkError::IdentifierConflict(identifier.to_string()));
            }
        }
        session.set_identifier(identifier);
        by_identifier.insert(identifier.to_string(), Arc::clone(session));
        debug!(session = %session.session_id(), identifier, "client identified");
        Ok(())
    }

    /// Snapshot of the sessions that are authenticated and connected.
    pub fn authenticated_sessions(&self) -> Vec<Arc<Session>> {
        self.sessions
            .read()
            .expect("session map poisoned")
            .values()
            .filter(|s| s.is_authenticated() && s.is_connected())
            .cloned()
            .collect()
    }

    /// Number of authenticated, connected sessions.
    pub fn authenticated_count(&self) -> usize {
        self.authenticated_sessions().len()
    }

    /// Total number of tracked sessions, authenticated or not.
    pub fn total_count(&self) -> usize {
        self.sessions.read().expect("session map poisoned").len()
    }

    /// The identifiers currently registered.
    pub fn identifiers(&self) -> HashSet<String> {
        self.by_identifier
            .read()
            .expect("identifier map poisoned")
            .keys()
            .cloned()
            .collect()
    }

    /// Sends a packet to every authenticated, connected session.
    ///
    /// Recipients are snapshotted first; per-recipient failures are logged
    /// and do not abort the sweep.
    pub fn broadcast<P: Packet>(&self, packet: &P) {
        let recipients = self.authenticated_sessions();
        debug!(recipients = recipients.len(), packet = P::TYPE, "broadcasting");
        for session in recipients {
            if let Err(e) = session.send(packet) {
                warn!(session = %session.session_id(), error = %e, "broadcast send failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::generate_shared_key;
    use crate::packet::PacketAuthSuccess;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Mutex;

    struct FakeTransport {
        open: AtomicBool,
        sent: AtomicUsize,
        fail_sends: bool,
        frames: Mutex<Vec<String>>,
    }

    impl FakeTransport {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                open: AtomicBool::new(true),
                sent: AtomicUsize::new(0),
                fail_sends: false,
                frames: Mutex::new(Vec::new()),
            })
        }

        fn failing() -> Arc<Self> {
            Arc::new(Self {
                open: AtomicBool::new(true),
                sent: AtomicUsize::new(0),
                fail_sends: true,
                frames: Mutex::new(Vec::new()),
            })
        }
    }

    impl Transport for FakeTransport {
        fn send_text(&self, text: String) -> Result<()> {
            if self.fail_sends {
                return Err(SealinkError::Transport("broken pipe".into()));
            }
            self.sent.fetch_add(1, Ordering::SeqCst);
            self.frames.lock().unwrap().push(text);
            Ok(())
        }

        fn close(&self, _code: u16, _reason: &str) {
            self.open.store(false, Ordering::SeqCst);
        }

        fn is_open(&self) -> bool {
            self.open.load(Ordering::SeqCst)
        }
    }

    fn registered_session(registry: &SessionRegistry) -> (Arc<Session>, Arc<FakeTransport>) {
        let transport = FakeTransport::new();
        let session = registry.register(
            ConnectionId::next(),
            transport.clone(),
            generate_shared_key(),
        );
        (session, transport)
    }

    #[test]
    fn test_register_get_remove() {
        let registry = SessionRegistry::new("topsecret");
        let (session, _) = registered_session(&registry);
        let id = session.connection_id();

        assert!(registry.get(id).is_some());
        assert_eq!(registry.total_count(), 1);

        registry.remove(id);
        assert!(registry.get(id).is_none());
        assert_eq!(registry.total_count(), 0);
    }

    #[test]
    fn test_pending_challenge_is_taken_once() {
        let registry = SessionRegistry::new("topsecret");
        let id = ConnectionId::next();
        registry.store_pending_challenge(id, "challenge".into());
        assert_eq!(registry.take_pending_challenge(id).as_deref(), Some("challenge"));
        assert!(registry.take_pending_challenge(id).is_none());
    }

    #[test]
    fn test_identifier_uniqueness() {
        let registry = SessionRegistry::new("topsecret");
        let (first, _) = registered_session(&registry);
        let (second, _) = registered_session(&registry);
        first.set_authenticated();
        second.set_authenticated();

        registry.register_identifier(&first, "smp").unwrap();
        let conflict = registry.register_identifier(&second, "smp");
        assert!(matches!(conflict, Err(SealinkError::IdentifierConflict(_))));

        let owner = registry.get_by_identifier("smp").unwrap();
        assert_eq!(owner.session_id(), first.session_id());
        assert_eq!(owner.identifier().as_deref(), Some("smp"));
    }

    #[test]
    fn test_identifier_freed_on_remove() {
        let registry = SessionRegistry::new("topsecret");
        let (session, _) = registered_session(&registry);
        session.set_authenticated();
        registry.register_identifier(&session, "smp").unwrap();

        registry.remove(session.connection_id());
        assert!(registry.get_by_identifier("smp").is_none());
        assert!(registry.identifiers().is_empty());
    }

    #[test]
    fn test_disconnected_owner_can_be_replaced() {
        let registry = SessionRegistry::new("topsecret");
        let (stale, stale_transport) = registered_session(&registry);
        stale.set_authenticated();
        registry.register_identifier(&stale, "smp").unwrap();
        stale_transport.close(1000, "gone");

        let (fresh, _) = registered_session(&registry);
        fresh.set_authenticated();
        registry.register_identifier(&fresh, "smp").unwrap();

        // Removing the stale session must not evict the new owner.
        registry.remove(stale.connection_id());
        let owner = registry.get_by_identifier("smp").unwrap();
        assert_eq!(owner.session_id(), fresh.session_id());
    }

    #[test]
    fn test_broadcast_skips_unauthenticated_and_survives_failures() {
        let registry = SessionRegistry::new("topsecret");

        let (authed, transport) = registered_session(&registry);
        authed.set_authenticated();

        let (_pending, pending_transport) = registered_session(&registry);

        let broken = FakeTransport::failing();
        let broken_session = registry.register(
            ConnectionId::next(),
            broken.clone(),
            generate_shared_key(),
        );
        broken_session.set_authenticated();

        registry.broadcast(&PacketAuthSuccess {
            message: "hello".into(),
        });

        assert_eq!(transport.sent.load(Ordering::SeqCst), 1);
        assert_eq!(pending_transport.sent.load(Ordering::SeqCst), 0);

        // The broken recipient did not abort the sweep.
        let frame: serde_json::Value =
            serde_json::from_str(&transport.frames.lock().unwrap()[0]).unwrap();
        assert_eq!(frame.get("encrypted").unwrap(), true);
    }
}
