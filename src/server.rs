//! Secure WebSocket server: handshake, dispatch, and the accept loop.
//!
//! The handshake runs per session: the client offers an RSA public key,
//! the server answers with the wrapped AES session key followed by an
//! encrypted challenge, and the client proves possession of the
//! pre-shared secret by returning the challenge's HMAC. Only then does
//! application traffic flow, always encrypted.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, error, info, warn};

use crate::auth::SessionRegistry;
use crate::config::ServerConfig;
use crate::envelope;
use crate::handler::ServerHandler;
use crate::keys;
use crate::packet::{
    Message, Packet, PacketAuthFailed, PacketAuthSuccess, PacketChallenge,
    PacketChallengeResponse, PacketIdentification, PacketPong, PacketPublicKey,
    PacketSharedSecret, PacketVersion,
};
use crate::session::{ConnectionId, Session};
use crate::transport::{Transport, TransportEvent, WsTransport};
use crate::types::{
    Result, SealinkError, CLOSE_AUTH_FAILED, CLOSE_IDENTIFIER_CONFLICT, CLOSE_PROTOCOL_ERROR,
};
use crate::crypto;

/// A server accepting authenticated, encrypted client sessions.
///
/// The transport adapter feeds [`SecureServer::on_open`],
/// [`SecureServer::on_text`] and [`SecureServer::on_close`]; deliveries
/// for one connection are serialized, deliveries for different
/// connections may run concurrently.
pub struct SecureServer {
    registry: Arc<SessionRegistry>,
    handler: Arc<dyn ServerHandler>,
    config: ServerConfig,
    accept_task: Mutex<Option<JoinHandle<()>>>,
}

impl SecureServer {
    /// Creates a server that authenticates clients against `api_key`.
    pub fn new(api_key: impl Into<String>, handler: Arc<dyn ServerHandler>) -> Self {
        Self::with_config(api_key, handler, ServerConfig::default())
    }

    pub fn with_config(
        api_key: impl Into<String>,
        handler: Arc<dyn ServerHandler>,
        config: ServerConfig,
    ) -> Self {
        Self {
            registry: Arc::new(SessionRegistry::new(api_key)),
            handler,
            config,
            accept_task: Mutex::new(None),
        }
    }

    /// The session registry, for targeted sends and statistics.
    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    /// Sends a packet to every authenticated, connected session.
    pub fn broadcast<P: Packet>(&self, packet: &P) {
        self.registry.broadcast(packet);
    }

    /// A connection opened; the server waits for the client's public key.
    pub fn on_open(&self, connection_id: ConnectionId) {
        debug!(%connection_id, "client connected, awaiting authentication");
    }

    /// A text frame arrived on a connection.
    pub fn on_text(&self, connection_id: ConnectionId, transport: &Arc<dyn Transport>, text: &str) {
        let session = self.registry.get(connection_id);
        let key = session.as_ref().map(|s| *s.shared_key());

        let decoded = match envelope::decode(text, key.as_ref()) {
            Ok(decoded) => decoded,
            Err(e) => {
                warn!(%connection_id, error = %e, "failed to decode frame");
                transport.close(e.close_code(), "Protocol error");
                return;
            }
        };

        // Once a session is authenticated, every frame must arrive inside
        // an encryption envelope.
        if session.as_ref().is_some_and(|s| s.is_authenticated()) && !decoded.encrypted {
            warn!(%connection_id, tag = decoded.message.type_tag(), "unencrypted frame after authentication");
            transport.close(CLOSE_PROTOCOL_ERROR, "Protocol error");
            return;
        }

        let result = match (session, decoded.message) {
            (None, Message::PublicKey(packet)) => {
                self.handle_public_key(connection_id, transport, packet)
            }
            (Some(_), Message::PublicKey(_)) => {
                warn!(%connection_id, "public key offered twice");
                transport.close(CLOSE_PROTOCOL_ERROR, "Protocol error");
                Ok(())
            }
            (None, Message::ChallengeResponse(_)) => {
                warn!(%connection_id, "challenge response before key exchange");
                transport.close(CLOSE_AUTH_FAILED, "Invalid authentication state");
                Ok(())
            }
            (Some(session), Message::ChallengeResponse(packet))
                if !session.is_authenticated() =>
            {
                self.handle_challenge_response(&session, packet)
            }
            (Some(session), message) if session.is_authenticated() => {
                self.dispatch_authenticated(&session, message);
                Ok(())
            }
            (_, message) => {
                warn!(%connection_id, tag = message.type_tag(), "rejected packet from unauthenticated client");
                transport.close(CLOSE_AUTH_FAILED, "Not authenticated");
                Ok(())
            }
        };

        if let Err(e) = result {
            error!(%connection_id, error = %e, "failed to handle frame");
            transport.close(e.close_code(), "Protocol error");
        }
    }

    /// A connection closed; drops the session and notifies the handler.
    pub fn on_close(&self, connection_id: ConnectionId, code: u16, reason: &str) {
        let Some(session) = self.registry.remove(connection_id) else {
            debug!(%connection_id, code, "connection closed before key exchange");
            return;
        };
        debug!(
            session = %session.session_id(),
            code,
            reason,
            authenticated = session.is_authenticated(),
            "client disconnected"
        );
        if session.is_authenticated() {
            self.handler.on_disconnect(&session);
        }
    }

    fn handle_public_key(
        &self,
        connection_id: ConnectionId,
        transport: &Arc<dyn Transport>,
        packet: PacketPublicKey,
    ) -> Result<()> {
        debug!(%connection_id, "received public key");
        let client_public = keys::decode_public_key(&packet.public_key)?;

        let shared_key = keys::generate_shared_key();
        let encrypted_secret = crypto::wrap_shared_key(&shared_key, &client_public)?;

        let session = self
            .registry
            .register(connection_id, Arc::clone(transport), shared_key);
        session.send_unencrypted(&PacketSharedSecret { encrypted_secret })?;
        debug!(session = %session.session_id(), "delivered wrapped session key");

        let challenge = crypto::generate_challenge();
        self.registry
            .store_pending_challenge(connection_id, challenge.clone());
        session.send(&PacketChallenge { challenge })?;
        debug!(session = %session.session_id(), "sent encrypted challenge");
        Ok(())
    }

    fn handle_challenge_response(
        &self,
        session: &Arc<Session>,
        packet: PacketChallengeResponse,
    ) -> Result<()> {
        let Some(challenge) = self
            .registry
            .take_pending_challenge(session.connection_id())
        else {
            warn!(session = %session.session_id(), "no pending challenge");
            let _ = session.send(&PacketAuthFailed {
                reason: "No pending challenge".into(),
            });
            session.close(CLOSE_AUTH_FAILED, "Invalid authentication state");
            return Ok(());
        };

        if crypto::verify_hmac(&challenge, self.registry.api_key(), &packet.response) {
            session.set_authenticated();
            info!(session = %session.session_id(), "client authenticated");
            session.send(&PacketAuthSuccess {
                message: "Authentication successful".into(),
            })?;
            session.send(&PacketVersion {
                protocol_version: self.config.protocol_version.clone(),
                client_name: self.config.server_name.clone(),
                client_version: self.config.server_version.clone(),
            })?;
            self.handler.on_authenticated(session);
        } else {
            warn!(session = %session.session_id(), "challenge verification failed");
            let _ = session.send(&PacketAuthFailed {
                reason: "Invalid credentials".into(),
            });
            session.close(CLOSE_AUTH_FAILED, "Authentication failed");
        }
        Ok(())
    }

    fn dispatch_authenticated(&self, session: &Arc<Session>, message: Message) {
        match message {
            Message::Identification(packet) => self.handle_identification(session, packet),
            Message::Ping(ping) => {
                if let Err(e) = session.send(&PacketPong::reply(&ping)) {
                    warn!(session = %session.session_id(), error = %e, "pong send failed");
                }
            }
            Message::Version(version) => {
                debug!(
                    session = %session.session_id(),
                    client = %version.client_name,
                    version = %version.client_version,
                    "client version"
                );
                self.handler.on_version_exchange(session, &version);
            }
            message if message.is_handshake() => {
                warn!(
                    session = %session.session_id(),
                    tag = message.type_tag(),
                    "handshake packet after authentication"
                );
                session.close(CLOSE_PROTOCOL_ERROR, "Protocol error");
            }
            message => self.handler.on_packet(session, message),
        }
    }

    fn handle_identification(&self, session: &Arc<Session>, packet: PacketIdentification) {
        if session.identifier().is_some() {
            warn!(session = %session.session_id(), "client identified twice");
            session.close(CLOSE_PROTOCOL_ERROR, "Protocol error");
            return;
        }

        match self
            .registry
            .register_identifier(session, &packet.client_identifier)
        {
            Ok(()) => {
                if let Some(metadata) = &packet.metadata {
                    session.set_metadata(metadata);
                }
                self.handler
                    .on_identified(session, &packet.client_identifier);
            }
            Err(SealinkError::IdentifierConflict(identifier)) => {
                warn!(session = %session.session_id(), identifier, "identifier already in use");
                let _ = session.send(&PacketAuthFailed {
                    reason: "Identifier already in use".into(),
                });
                session.close(CLOSE_IDENTIFIER_CONFLICT, "Identifier conflict");
            }
            Err(e) => {
                error!(session = %session.session_id(), error = %e, "identifier registration failed");
                session.close(CLOSE_PROTOCOL_ERROR, "Protocol error");
            }
        }
    }

    /// Binds a TCP listener and serves WebSocket upgrades until
    /// [`SecureServer::shutdown`]. Returns the bound local address.
    pub async fn bind(self: &Arc<Self>, addr: &str) -> Result<SocketAddr> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| SealinkError::Transport(format!("bind {addr} failed: {e}")))?;
        let local_addr = listener
            .local_addr()
            .map_err(|e| SealinkError::Transport(e.to_string()))?;
        info!(%local_addr, "listening");

        let server = Arc::clone(self);
        let task = tokio::spawn(async move {
            loop {
                let (stream, peer) = match listener.accept().await {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        warn!(error = %e, "accept failed");
                        continue;
                    }
                };
                let server = Arc::clone(&server);
                tokio::spawn(async move {
                    match tokio_tungstenite::accept_async(stream).await {
                        Ok(ws) => server.run_connection(ws).await,
                        Err(e) => warn!(%peer, error = %e, "websocket upgrade failed"),
                    }
                });
            }
        });
        *self.accept_task.lock().expect("accept task poisoned") = Some(task);
        Ok(local_addr)
    }

    /// Drives one accepted WebSocket connection to completion.
    pub async fn run_connection<S>(&self, stream: WebSocketStream<S>)
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (transport, mut events) = WsTransport::spawn(stream);
        let transport: Arc<dyn Transport> = transport;
        let connection_id = ConnectionId::next();
        self.on_open(connection_id);

        while let Some(event) = events.recv().await {
            match event {
                TransportEvent::Text(text) => self.on_text(connection_id, &transport, &text),
                TransportEvent::Closed { code, reason } => {
                    self.on_close(connection_id, code, &reason);
                    return;
                }
            }
        }
        self.on_close(connection_id, 1006, "");
    }

    /// Stops accepting new connections. Existing sessions keep running
    /// until their transports close.
    pub fn shutdown(&self) {
        if let Some(task) = self.accept_task.lock().expect("accept task poisoned").take() {
            task.abort();
        }
    }
}

impl Drop for SecureServer {
    fn drop(&mut self) {
        self.shutdown();
    }
}
