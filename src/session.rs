//! Per-connection session state on the server side.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use uuid::Uuid;

use crate::envelope;
use crate::packet::Packet;
use crate::transport::Transport;
use crate::types::{Result, SealinkError, SHARED_KEY_SIZE};

/// Opaque handle identifying one transport connection, minted when the
/// transport reports the connection opened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(u64);

impl ConnectionId {
    /// Mints a process-unique connection id.
    pub fn next() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// One client connection after the key exchange: the shared key, the
/// authentication flag, and the optional identity the client registered.
///
/// The shared key is created with the session and never rotates. The
/// `authenticated` flag only ever flips false to true and is published
/// atomically so send decisions on other threads observe it.
pub struct Session {
    session_id: Uuid,
    connection_id: ConnectionId,
    transport: Arc<dyn Transport>,
    shared_key: [u8; SHARED_KEY_SIZE],
    authenticated: AtomicBool,
    identifier: RwLock<Option<String>>,
    metadata: RwLock<Option<String>>,
}

impl Session {
    pub(crate) fn new(
        connection_id: ConnectionId,
        transport: Arc<dyn Transport>,
        shared_key: [u8; SHARED_KEY_SIZE],
    ) -> Self {
        Self {
            session_id: Uuid::new_v4(),
            connection_id,
            transport,
            shared_key,
            authenticated: AtomicBool::new(false),
            identifier: RwLock::new(None),
            metadata: RwLock::new(None),
        }
    }

    /// The process-unique id minted when this session was accepted.
    pub fn session_id(&self) -> Uuid {
        self.session_id
    }

    pub(crate) fn connection_id(&self) -> ConnectionId {
        self.connection_id
    }

    pub(crate) fn shared_key(&self) -> &[u8; SHARED_KEY_SIZE] {
        &self.shared_key
    }

    /// Whether the challenge/response exchange has completed.
    pub fn is_authenticated(&self) -> bool {
        self.authenticated.load(Ordering::SeqCst)
    }

    pub(crate) fn set_authenticated(&self) {
        self.authenticated.store(true, Ordering::SeqCst);
    }

    /// Whether the underlying transport is still open.
    pub fn is_connected(&self) -> bool {
        self.transport.is_open()
    }

    /// The identifier the client registered, if any.
    pub fn identifier(&self) -> Option<String> {
        self.identifier.read().expect("identifier poisoned").clone()
    }

    pub(crate) fn set_identifier(&self, identifier: &str) {
        *self.identifier.write().expect("identifier poisoned") = Some(identifier.to_string());
    }

    /// Free-form metadata supplied with the identification, if any.
    pub fn metadata(&self) -> Option<String> {
        self.metadata.read().expect("metadata poisoned").clone()
    }

    pub(crate) fn set_metadata(&self, metadata: &str) {
        *self.metadata.write().expect("metadata poisoned") = Some(metadata.to_string());
    }

    /// Send a packet encrypted under the session key.
    pub fn send<P: Packet>(&self, packet: &P) -> Result<()> {
        if !self.transport.is_open() {
            return Err(SealinkError::Transport("session is not open".into()));
        }
        let text = envelope::encode(packet, Some(&self.shared_key), -1)?;
        self.transport.send_text(text)
    }

    /// Send a packet without encryption.
    ///
    /// Only the shared-secret delivery legitimately travels unencrypted;
    /// everything after it goes through [`Session::send`].
    pub fn send_unencrypted<P: Packet>(&self, packet: &P) -> Result<()> {
        if !self.transport.is_open() {
            return Err(SealinkError::Transport("session is not open".into()));
        }
        let text = envelope::encode(packet, None, -1)?;
        self.transport.send_text(text)
    }

    /// Close the session's transport with an application close code.
    pub fn close(&self, code: u16, reason: &str) {
        self.transport.close(code, reason);
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("session_id", &self.session_id)
            .field("connection_id", &self.connection_id)
            .field("authenticated", &self.is_authenticated())
            .field("identifier", &self.identifier())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::generate_shared_key;
    use std::sync::Mutex;

    struct RecordingTransport {
        sent: Mutex<Vec<String>>,
        open: AtomicBool,
    }

    impl RecordingTransport {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                sent: Mutex::new(Vec::new()),
                open: AtomicBool::new(true),
            })
        }
    }

    impl Transport for RecordingTransport {
        fn send_text(&self, text: String) -> Result<()> {
            self.sent.lock().unwrap().push(text);
            Ok(())
        }

        fn close(&self, _code: u16, _reason: &str) {
            self.open.store(false, Ordering::SeqCst);
        }

        fn is_open(&self) -> bool {
            self.open.load(Ordering::SeqCst)
        }
    }

    #[test]
    fn test_connection_ids_are_unique() {
        assert_ne!(ConnectionId::next(), ConnectionId::next());
    }

    #[test]
    fn test_session_starts_unauthenticated_with_key() {
        let session = Session::new(
            ConnectionId::next(),
            RecordingTransport::new(),
            generate_shared_key(),
        );
        assert!(!session.is_authenticated());
        assert!(session.identifier().is_none());
    }

    #[test]
    fn test_authentication_is_monotonic() {
        let session = Session::new(
            ConnectionId::next(),
            RecordingTransport::new(),
            generate_shared_key(),
        );
        session.set_authenticated();
        assert!(session.is_authenticated());
    }

    #[test]
    fn test_send_encrypts_with_session_key() {
        let transport = RecordingTransport::new();
        let key = generate_shared_key();
        let session = Session::new(ConnectionId::next(), transport.clone(), key);

        session
            .send(&crate::packet::PacketAuthSuccess {
                message: "ok".into(),
            })
            .unwrap();

        let sent = transport.sent.lock().unwrap();
        let frame: serde_json::Value = serde_json::from_str(&sent[0]).unwrap();
        assert_eq!(frame.get("encrypted").unwrap(), true);
    }

    #[test]
    fn test_send_fails_after_close() {
        let transport = RecordingTransport::new();
        let session = Session::new(
            ConnectionId::next(),
            transport.clone(),
            generate_shared_key(),
        );
        session.close(crate::types::CLOSE_PROTOCOL_ERROR, "test");
        let result = session.send_unencrypted(&crate::packet::PacketAuthFailed {
            reason: "late".into(),
        });
        assert!(matches!(result, Err(SealinkError::Transport(_))));
    }
}
