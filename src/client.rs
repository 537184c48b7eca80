//! Secure WebSocket client: handshake, liveness, and reconnection.
//!
//! [`ClientConnection`] is the per-connection handshake state machine and
//! codec glue; it only needs a [`Transport`] and can be driven by any
//! adapter. [`SecureClient`] owns the tokio-tungstenite connector around
//! it: connect timeout, the ping task, pong correlation, and the
//! auto-reconnect loop.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use rsa::{RsaPrivateKey, RsaPublicKey};
use tokio::task::JoinHandle;
use tokio::time::{interval, sleep, timeout};
use tracing::{debug, error, info, warn};

use crate::config::ClientConfig;
use crate::crypto;
use crate::envelope;
use crate::handler::ClientHandler;
use crate::keys;
use crate::latency::LatencyMonitor;
use crate::packet::{
    Message, Packet, PacketChallenge, PacketChallengeResponse, PacketIdentification,
    PacketPong, PacketPublicKey, PacketSharedSecret, PacketVersion,
};
use crate::transport::{Transport, TransportEvent, WsTransport};
use crate::types::{
    Result, SealinkError, CLOSE_AUTH_FAILED, CLOSE_PROTOCOL_ERROR, SHARED_KEY_SIZE,
};

/// What the client is waiting for in the handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ClientPhase {
    AwaitingSharedSecret,
    AwaitingChallenge,
    AwaitingAuthSuccess,
    Ready,
}

/// One client-side connection: handshake state, session key, and the
/// codec around a [`Transport`].
pub struct ClientConnection {
    api_key: String,
    config: ClientConfig,
    handler: Arc<dyn ClientHandler>,
    transport: Arc<dyn Transport>,
    latency: Arc<LatencyMonitor>,
    private_key: RsaPrivateKey,
    public_key: RsaPublicKey,
    shared_key: RwLock<Option<[u8; SHARED_KEY_SIZE]>>,
    authenticated: AtomicBool,
    phase: Mutex<ClientPhase>,
}

impl ClientConnection {
    /// Creates a connection with a fresh RSA keypair.
    pub fn new(
        api_key: impl Into<String>,
        config: ClientConfig,
        handler: Arc<dyn ClientHandler>,
        transport: Arc<dyn Transport>,
        latency: Arc<LatencyMonitor>,
    ) -> Result<Self> {
        let (private_key, public_key) = keys::generate_keypair()?;
        Ok(Self {
            api_key: api_key.into(),
            config,
            handler,
            transport,
            latency,
            private_key,
            public_key,
            shared_key: RwLock::new(None),
            authenticated: AtomicBool::new(false),
            phase: Mutex::new(ClientPhase::AwaitingSharedSecret),
        })
    }

    /// Begins the handshake by offering our public key.
    pub fn start(&self) -> Result<()> {
        let public_key = keys::encode_public_key(&self.public_key)?;
        self.send_unencrypted(&PacketPublicKey { public_key })?;
        debug!("sent public key");
        Ok(())
    }

    /// Whether the handshake completed on this connection.
    pub fn is_authenticated(&self) -> bool {
        self.authenticated.load(Ordering::SeqCst)
    }

    /// Whether the underlying transport is still open.
    pub fn is_connected(&self) -> bool {
        self.transport.is_open()
    }

    /// The latency statistics fed by this connection's pongs.
    pub fn latency(&self) -> &LatencyMonitor {
        &self.latency
    }

    fn shared_key(&self) -> Option<[u8; SHARED_KEY_SIZE]> {
        *self.shared_key.read().expect("shared key poisoned")
    }

    fn set_phase(&self, phase: ClientPhase) {
        *self.phase.lock().expect("client phase poisoned") = phase;
    }

    /// Sends an application packet encrypted under the session key.
    ///
    /// Fails until authentication completes.
    pub fn send<P: Packet>(&self, packet: &P) -> Result<()> {
        if !self.is_authenticated() {
            return Err(SealinkError::AuthState("not authenticated".into()));
        }
        self.send_encrypted(packet)
    }

    fn send_encrypted<P: Packet>(&self, packet: &P) -> Result<()> {
        let key = self
            .shared_key()
            .ok_or_else(|| SealinkError::AuthState("no shared key established".into()))?;
        let text = envelope::encode(packet, Some(&key), -1)?;
        self.transport.send_text(text)
    }

    fn send_unencrypted<P: Packet>(&self, packet: &P) -> Result<()> {
        let text = envelope::encode(packet, None, self.config.compression_threshold)?;
        self.transport.send_text(text)
    }

    /// Sends a latency probe, rolling it back if the send fails.
    pub fn send_ping(&self) -> Result<()> {
        let ping = self.latency.next_ping();
        if let Err(e) = self.send(&ping) {
            self.latency.abort_ping(ping.sequence_id);
            return Err(e);
        }
        Ok(())
    }

    /// Closes the connection.
    pub fn close(&self) {
        self.transport.close(1000, "client disconnect");
    }

    /// Feeds one received text frame through the handshake machine.
    pub fn on_text(&self, text: &str) {
        let key = self.shared_key();
        let decoded = match envelope::decode(text, key.as_ref()) {
            Ok(decoded) => decoded,
            Err(e) => {
                warn!(error = %e, "failed to decode frame");
                return;
            }
        };

        // Once authenticated, the server must only send encrypted frames.
        if self.is_authenticated() && !decoded.encrypted {
            warn!(tag = decoded.message.type_tag(), "unencrypted frame after authentication");
            self.transport.close(CLOSE_PROTOCOL_ERROR, "Protocol error");
            return;
        }

        let phase = *self.phase.lock().expect("client phase poisoned");

        // Until the session key arrives, the only legal frames are the
        // shared secret itself and an early rejection.
        if phase == ClientPhase::AwaitingSharedSecret {
            match decoded.message {
                Message::SharedSecret(packet) => self.handle_shared_secret(packet),
                Message::AuthFailed(packet) => self.handle_auth_failed(&packet.reason),
                message => {
                    warn!(tag = message.type_tag(), "unexpected packet before key exchange");
                    self.transport.close(CLOSE_PROTOCOL_ERROR, "Protocol error");
                }
            }
            return;
        }

        match decoded.message {
            Message::Challenge(packet) if phase == ClientPhase::AwaitingChallenge => {
                self.handle_challenge(packet)
            }
            Message::AuthSuccess(packet) if phase == ClientPhase::AwaitingAuthSuccess => {
                info!(message = %packet.message, "authenticated");
                self.handle_auth_success();
            }
            Message::AuthFailed(packet) => self.handle_auth_failed(&packet.reason),
            Message::Pong(pong) => self.latency.record_pong(&pong),
            Message::Version(version) => {
                debug!(
                    peer = %version.client_name,
                    version = %version.client_version,
                    "server version"
                );
                self.handler.on_version_exchange(&version);
            }
            Message::Ping(ping) => {
                if let Err(e) = self.send_encrypted(&PacketPong::reply(&ping)) {
                    warn!(error = %e, "pong send failed");
                }
            }
            message if message.is_handshake() => {
                warn!(tag = message.type_tag(), "handshake packet out of order");
                self.transport.close(CLOSE_PROTOCOL_ERROR, "Protocol error");
            }
            message if phase == ClientPhase::Ready => self.handler.on_packet(message),
            message => {
                debug!(tag = message.type_tag(), "dropping packet received before authentication");
            }
        }
    }

    /// The transport closed; resets the auth flag and notifies the
    /// application.
    pub fn on_close(&self) {
        self.authenticated.store(false, Ordering::SeqCst);
        self.handler.on_disconnect();
    }

    fn handle_shared_secret(&self, packet: PacketSharedSecret) {
        match crypto::unwrap_shared_key(&packet.encrypted_secret, &self.private_key) {
            Ok(shared_key) => {
                *self.shared_key.write().expect("shared key poisoned") = Some(shared_key);
                self.set_phase(ClientPhase::AwaitingChallenge);
                debug!("session key established");
            }
            Err(e) => {
                error!(error = %e, "failed to unwrap session key");
                self.transport.close(CLOSE_AUTH_FAILED, "Key exchange failed");
            }
        }
    }

    fn handle_challenge(&self, packet: PacketChallenge) {
        let response = crypto::hmac_sha256(&packet.challenge, &self.api_key);
        self.set_phase(ClientPhase::AwaitingAuthSuccess);
        if let Err(e) = self.send_encrypted(&PacketChallengeResponse { response }) {
            error!(error = %e, "failed to answer challenge");
        } else {
            debug!("sent challenge response");
        }
    }

    fn handle_auth_success(&self) {
        self.set_phase(ClientPhase::Ready);
        self.authenticated.store(true, Ordering::SeqCst);

        if let Err(e) = self.send_encrypted(&PacketVersion {
            protocol_version: self.config.protocol_version.clone(),
            client_name: self.config.client_name.clone(),
            client_version: self.config.client_version.clone(),
        }) {
            warn!(error = %e, "version exchange failed");
        }

        if self.config.has_identification() {
            let identifier = self.config.client_identifier.clone().unwrap_or_default();
            let packet = PacketIdentification {
                client_identifier: identifier.clone(),
                metadata: self.config.identification_metadata.clone(),
            };
            match self.send_encrypted(&packet) {
                Ok(()) => debug!(identifier, "sent identification"),
                Err(e) => warn!(error = %e, "identification failed"),
            }
        }

        self.handler.on_authenticated();
    }

    fn handle_auth_failed(&self, reason: &str) {
        warn!(reason, "authentication rejected");
        self.transport.close(1000, "Authentication failed");
    }
}

/// A client managing one session to a server, with automatic ping/pong
/// liveness tracking and optional reconnection.
///
/// ```no_run
/// # use std::sync::Arc;
/// # use sealink::{ClientConfig, ClientHandler, Message, SecureClient};
/// struct Quiet;
/// impl ClientHandler for Quiet {
///     fn on_packet(&self, _message: Message) {}
///     fn on_disconnect(&self) {}
/// }
///
/// # async fn run() -> sealink::Result<()> {
/// let config = ClientConfig::default().with_auto_reconnect(true);
/// let client = SecureClient::with_config("topsecret", Arc::new(Quiet), config);
/// client.connect("ws://localhost:8080/ws").await?;
/// # Ok(())
/// # }
/// ```
pub struct SecureClient {
    api_key: String,
    config: ClientConfig,
    handler: Arc<dyn ClientHandler>,
    latency: Arc<LatencyMonitor>,
    url: Mutex<Option<String>>,
    connection: Mutex<Option<Arc<ClientConnection>>>,
    connected: AtomicBool,
    should_reconnect: AtomicBool,
    reconnect_attempts: AtomicU32,
    ping_task: Mutex<Option<JoinHandle<()>>>,
    reconnect_task: Mutex<Option<JoinHandle<()>>>,
}

impl SecureClient {
    /// Creates a client with default settings.
    pub fn new(api_key: impl Into<String>, handler: Arc<dyn ClientHandler>) -> Arc<Self> {
        Self::with_config(api_key, handler, ClientConfig::default())
    }

    pub fn with_config(
        api_key: impl Into<String>,
        handler: Arc<dyn ClientHandler>,
        config: ClientConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            api_key: api_key.into(),
            config,
            handler,
            latency: Arc::new(LatencyMonitor::new()),
            url: Mutex::new(None),
            connection: Mutex::new(None),
            connected: AtomicBool::new(false),
            should_reconnect: AtomicBool::new(false),
            reconnect_attempts: AtomicU32::new(0),
            ping_task: Mutex::new(None),
            reconnect_task: Mutex::new(None),
        })
    }

    /// Connects and starts the handshake.
    ///
    /// An initial connect failure is returned to the caller; the
    /// reconnect loop only takes over after an established connection
    /// drops.
    pub async fn connect(self: &Arc<Self>, url: &str) -> Result<()> {
        *self.url.lock().expect("url poisoned") = Some(url.to_string());
        self.should_reconnect
            .store(self.config.auto_reconnect, Ordering::SeqCst);
        self.reconnect_attempts.store(0, Ordering::SeqCst);
        self.establish(url).await
    }

    async fn establish(self: &Arc<Self>, url: &str) -> Result<()> {
        info!(url, "connecting");
        let connect = tokio_tungstenite::connect_async(url);
        let (stream, _response) = timeout(self.config.connection_timeout, connect)
            .await
            .map_err(|_| SealinkError::ConnectionTimeout(self.config.connection_timeout))?
            .map_err(|e| SealinkError::Transport(format!("connect failed: {e}")))?;

        let (transport, mut events) = WsTransport::spawn(stream);
        let transport: Arc<dyn Transport> = transport;
        let connection = Arc::new(ClientConnection::new(
            self.api_key.clone(),
            self.config.clone(),
            Arc::clone(&self.handler),
            transport,
            Arc::clone(&self.latency),
        )?);

        *self.connection.lock().expect("connection poisoned") = Some(Arc::clone(&connection));
        self.connected.store(true, Ordering::SeqCst);
        self.reconnect_attempts.store(0, Ordering::SeqCst);
        self.latency.reset();

        self.handler.on_connect();
        connection.start()?;
        self.start_ping_task();

        let client = Arc::clone(self);
        let conn = Arc::clone(&connection);
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                match event {
                    TransportEvent::Text(text) => conn.on_text(&text),
                    TransportEvent::Closed { code, reason } => {
                        debug!(code, reason, "disconnected");
                        break;
                    }
                }
            }
            client.handle_disconnect(&conn);
        });
        Ok(())
    }

    fn handle_disconnect(self: &Arc<Self>, connection: &Arc<ClientConnection>) {
        self.connected.store(false, Ordering::SeqCst);
        self.stop_ping_task();
        connection.on_close();
        if self.should_reconnect.load(Ordering::SeqCst) {
            self.schedule_reconnect();
        }
    }

    fn schedule_reconnect(self: &Arc<Self>) {
        let max = self.config.max_reconnect_attempts;
        let attempts = self.reconnect_attempts.load(Ordering::SeqCst);
        if max >= 0 && attempts >= max as u32 {
            warn!(attempts, "reconnect attempts exhausted");
            self.handler.on_reconnect_failed(self);
            return;
        }

        let client = Arc::clone(self);
        let delay = self.config.reconnect_delay;
        let task = tokio::spawn(async move {
            sleep(delay).await;
            if !client.should_reconnect.load(Ordering::SeqCst) {
                return;
            }
            let attempt = client.reconnect_attempts.fetch_add(1, Ordering::SeqCst) + 1;
            let url = client.url.lock().expect("url poisoned").clone();
            let Some(url) = url else { return };
            info!(attempt, "reconnecting");
            if let Err(e) = client.establish(&url).await {
                warn!(attempt, error = %e, "reconnect failed");
                client.schedule_reconnect();
            }
        });
        *self.reconnect_task.lock().expect("reconnect task poisoned") = Some(task);
    }

    fn start_ping_task(self: &Arc<Self>) {
        if !self.config.enable_ping {
            return;
        }
        self.stop_ping_task();

        let client = Arc::clone(self);
        let period = self.config.ping_interval;
        let task = tokio::spawn(async move {
            let mut ticker = interval(period);
            // The first tick fires immediately; skip it so probes are one
            // full period apart, and never before the handshake is done.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if !client.connected.load(Ordering::SeqCst) {
                    return;
                }
                let connection = client
                    .connection
                    .lock()
                    .expect("connection poisoned")
                    .clone();
                let Some(connection) = connection else { return };
                if !connection.is_authenticated() {
                    continue;
                }
                if let Err(e) = connection.send_ping() {
                    debug!(error = %e, "ping failed");
                }
            }
        });
        *self.ping_task.lock().expect("ping task poisoned") = Some(task);
    }

    fn stop_ping_task(&self) {
        if let Some(task) = self.ping_task.lock().expect("ping task poisoned").take() {
            task.abort();
        }
    }

    /// Disconnects and cancels the ping and reconnect tasks. Idempotent.
    pub fn disconnect(&self) {
        self.should_reconnect.store(false, Ordering::SeqCst);
        self.stop_ping_task();
        if let Some(task) = self
            .reconnect_task
            .lock()
            .expect("reconnect task poisoned")
            .take()
        {
            task.abort();
        }
        if let Some(connection) = self.connection.lock().expect("connection poisoned").clone() {
            connection.close();
        }
        self.connected.store(false, Ordering::SeqCst);
    }

    /// Sends an application packet on the current connection.
    pub fn send<P: Packet>(&self, packet: &P) -> Result<()> {
        let connection = self
            .connection
            .lock()
            .expect("connection poisoned")
            .clone()
            .ok_or_else(|| SealinkError::Transport("not connected".into()))?;
        connection.send(packet)
    }

    /// Whether a transport connection is currently established.
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Whether the current connection finished the handshake.
    pub fn is_authenticated(&self) -> bool {
        self.connection
            .lock()
            .expect("connection poisoned")
            .as_ref()
            .is_some_and(|c| c.is_authenticated())
    }

    /// Latency statistics for the current connection.
    pub fn latency(&self) -> &LatencyMonitor {
        &self.latency
    }

    /// The client configuration.
    pub fn config(&self) -> &ClientConfig {
        &self.config
    }
}

impl Drop for SecureClient {
    fn drop(&mut self) {
        self.disconnect();
    }
}
