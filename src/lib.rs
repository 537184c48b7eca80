//! Sealink - secure type-tagged packet messaging over WebSocket.
//!
//! Layers an authenticated, encrypted packet protocol over a raw text
//! WebSocket transport: RSA-2048 key exchange delivers a per-session
//! AES-256-GCM key, an HMAC-SHA256 challenge/response proves possession
//! of a pre-shared secret, and typed JSON packets flow encrypted from
//! then on. Unencrypted handshake-phase frames may be GZIP compressed.

mod auth;
mod client;
mod config;
mod crypto;
mod envelope;
mod handler;
mod keys;
mod latency;
mod packet;
pub mod registry;
mod server;
mod session;
mod transport;
mod types;

pub use auth::SessionRegistry;
pub use client::{ClientConnection, SecureClient};
pub use config::{ClientConfig, ServerConfig};
pub use envelope::{decode, encode, Decoded};
pub use handler::{ClientHandler, ServerHandler};
pub use latency::LatencyMonitor;
pub use packet::{
    AppMessage, Message, Packet, PacketAuthFailed, PacketAuthSuccess, PacketChallenge,
    PacketChallengeResponse, PacketIdentification, PacketPing, PacketPong, PacketPublicKey,
    PacketSharedSecret, PacketVersion,
};
pub use server::SecureServer;
pub use session::{ConnectionId, Session};
pub use transport::{Transport, TransportEvent, WsTransport};
pub use types::{
    Result, SealinkError, CLOSE_AUTH_FAILED, CLOSE_IDENTIFIER_CONFLICT, CLOSE_PROTOCOL_ERROR,
};
