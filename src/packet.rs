//! Packet kinds exchanged over a Sealink connection.
//!
//! Every packet is a named record serialized as the `data` member of a
//! typed envelope, with its type tag taken from the kind's name. The
//! handshake and system kinds are built in; applications add their own
//! kinds through the [`registry`](crate::registry).

use std::time::{SystemTime, UNIX_EPOCH};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::types::{Result, SealinkError};

/// A typed message that can cross a Sealink connection.
///
/// Implementors pick a process-unique type tag; by convention the tag is
/// the type's own name (e.g. `"PacketGameUpdate"`). Wire field names are
/// camelCase and optional fields serialize as JSON nulls when absent.
pub trait Packet: Serialize + DeserializeOwned + Send + Sync + 'static {
    /// The type tag carried in the envelope's `type` field.
    const TYPE: &'static str;
}

/// Milliseconds since the Unix epoch, for ping/pong timestamps.
pub(crate) fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

// ============================================================================
// Handshake packets
// ============================================================================

/// Client offers its RSA public key to start the handshake.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PacketPublicKey {
    /// Base64 SubjectPublicKeyInfo encoding.
    pub public_key: String,
}

/// Server delivers the session key wrapped under the client's public key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PacketSharedSecret {
    /// Base64 RSA-OAEP ciphertext.
    pub encrypted_secret: String,
}

/// Server challenges the client to prove possession of the API key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PacketChallenge {
    /// Base64 of 32 random bytes.
    pub challenge: String,
}

/// Client answers a challenge with its HMAC under the API key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PacketChallengeResponse {
    /// Base64 HMAC-SHA256 of the challenge text.
    pub response: String,
}

/// Server confirms the handshake completed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PacketAuthSuccess {
    pub message: String,
}

/// Server rejects the handshake or a post-handshake request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PacketAuthFailed {
    pub reason: String,
}

/// Authenticated client labels itself for targeted messaging.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PacketIdentification {
    /// Short label unique across authenticated sessions (e.g. "smp").
    pub client_identifier: String,
    /// Opaque free-form metadata.
    pub metadata: Option<String>,
}

// ============================================================================
// System packets
// ============================================================================

/// Peer reports its protocol and software identity. Advisory only.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PacketVersion {
    pub protocol_version: String,
    pub client_name: String,
    pub client_version: String,
}

/// Latency probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PacketPing {
    /// Sender's clock in milliseconds since the Unix epoch.
    pub timestamp: u64,
    /// Monotonically increasing per-sender sequence id.
    pub sequence_id: u32,
}

/// Latency response echoing the probe's timestamp and sequence id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PacketPong {
    pub client_timestamp: u64,
    pub server_timestamp: u64,
    pub sequence_id: u32,
}

impl PacketPong {
    /// Builds the response to a ping, stamping the responder's clock.
    pub fn reply(ping: &PacketPing) -> Self {
        Self {
            client_timestamp: ping.timestamp,
            server_timestamp: unix_millis(),
            sequence_id: ping.sequence_id,
        }
    }
}

macro_rules! impl_packet {
    ($($kind:ident),* $(,)?) => {
        $(impl Packet for $kind {
            const TYPE: &'static str = stringify!($kind);
        })*
    };
}

impl_packet!(
    PacketPublicKey,
    PacketSharedSecret,
    PacketChallenge,
    PacketChallengeResponse,
    PacketAuthSuccess,
    PacketAuthFailed,
    PacketIdentification,
    PacketVersion,
    PacketPing,
    PacketPong,
);

// ============================================================================
// Decoded messages
// ============================================================================

/// A decoded inbound message: one of the built-in kinds, or an
/// application kind resolved through the registry.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    PublicKey(PacketPublicKey),
    SharedSecret(PacketSharedSecret),
    Challenge(PacketChallenge),
    ChallengeResponse(PacketChallengeResponse),
    AuthSuccess(PacketAuthSuccess),
    AuthFailed(PacketAuthFailed),
    Identification(PacketIdentification),
    Version(PacketVersion),
    Ping(PacketPing),
    Pong(PacketPong),
    App(AppMessage),
}

impl Message {
    /// The type tag this message was decoded from.
    pub fn type_tag(&self) -> &str {
        match self {
            Self::PublicKey(_) => PacketPublicKey::TYPE,
            Self::SharedSecret(_) => PacketSharedSecret::TYPE,
            Self::Challenge(_) => PacketChallenge::TYPE,
            Self::ChallengeResponse(_) => PacketChallengeResponse::TYPE,
            Self::AuthSuccess(_) => PacketAuthSuccess::TYPE,
            Self::AuthFailed(_) => PacketAuthFailed::TYPE,
            Self::Identification(_) => PacketIdentification::TYPE,
            Self::Version(_) => PacketVersion::TYPE,
            Self::Ping(_) => PacketPing::TYPE,
            Self::Pong(_) => PacketPong::TYPE,
            Self::App(app) => app.tag(),
        }
    }

    /// True for the handshake kinds that must never appear after
    /// authentication completes.
    pub(crate) fn is_handshake(&self) -> bool {
        matches!(
            self,
            Self::PublicKey(_)
                | Self::SharedSecret(_)
                | Self::Challenge(_)
                | Self::ChallengeResponse(_)
                | Self::AuthSuccess(_)
                | Self::AuthFailed(_)
        )
    }
}

/// An application-defined message, held as its registered tag plus the
/// raw `data` value it arrived with.
///
/// The registry validates the shape against the registered kind at decode
/// time; handlers call [`AppMessage::parse`] to materialize the typed
/// record.
#[derive(Debug, Clone, PartialEq)]
pub struct AppMessage {
    tag: String,
    data: serde_json::Value,
}

impl AppMessage {
    pub(crate) fn new(tag: String, data: serde_json::Value) -> Self {
        Self { tag, data }
    }

    /// The registered type tag.
    pub fn tag(&self) -> &str {
        &self.tag
    }

    /// Whether this message carries the given kind.
    pub fn is<P: Packet>(&self) -> bool {
        self.tag == P::TYPE
    }

    /// Materialize the typed record this message carries.
    pub fn parse<P: Packet>(&self) -> Result<P> {
        if self.tag != P::TYPE {
            return Err(SealinkError::Codec(format!(
                "expected {} but message is {}",
                P::TYPE,
                self.tag
            )));
        }
        serde_json::from_value(self.data.clone())
            .map_err(|e| SealinkError::Codec(format!("malformed {} data: {e}", self.tag)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_type_tags_match_kind_names() {
        assert_eq!(PacketPublicKey::TYPE, "PacketPublicKey");
        assert_eq!(PacketSharedSecret::TYPE, "PacketSharedSecret");
        assert_eq!(PacketChallengeResponse::TYPE, "PacketChallengeResponse");
        assert_eq!(PacketPong::TYPE, "PacketPong");
    }

    #[test]
    fn test_wire_field_names_are_camel_case() {
        let json = serde_json::to_value(PacketPublicKey {
            public_key: "abc".into(),
        })
        .unwrap();
        assert!(json.get("publicKey").is_some());

        let json = serde_json::to_value(PacketPong {
            client_timestamp: 1,
            server_timestamp: 2,
            sequence_id: 3,
        })
        .unwrap();
        assert!(json.get("clientTimestamp").is_some());
        assert!(json.get("serverTimestamp").is_some());
        assert!(json.get("sequenceId").is_some());
    }

    #[test]
    fn test_absent_metadata_serializes_as_null() {
        let json = serde_json::to_value(PacketIdentification {
            client_identifier: "smp".into(),
            metadata: None,
        })
        .unwrap();
        assert!(json.get("metadata").unwrap().is_null());
    }

    #[test]
    fn test_pong_reply_echoes_ping() {
        let ping = PacketPing {
            timestamp: 1234,
            sequence_id: 7,
        };
        let pong = PacketPong::reply(&ping);
        assert_eq!(pong.client_timestamp, 1234);
        assert_eq!(pong.sequence_id, 7);
        assert!(pong.server_timestamp > 0);
    }

    #[test]
    fn test_app_message_parse_checks_tag() {
        let app = AppMessage::new(
            "PacketPing".into(),
            serde_json::json!({"timestamp": 1, "sequenceId": 2}),
        );
        assert!(app.is::<PacketPing>());
        assert!(!app.is::<PacketPong>());
        assert_eq!(app.parse::<PacketPing>().unwrap().sequence_id, 2);
        assert!(app.parse::<PacketPong>().is_err());
    }
}
