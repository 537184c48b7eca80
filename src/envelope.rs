//! Envelope encoding and decoding for the Sealink wire format.
//!
//! One transport frame carries exactly one envelope. A typed envelope is
//! `{"type": tag, "data": {...}}`; it may be transparently wrapped in a
//! compression envelope (`{"compressed": true, "payload": base64-gzip}`)
//! or an encryption envelope (`{"encrypted": true, "payload": base64,
//! "iv": base64}`). The encoder produces at most one wrapping layer, and
//! encryption always wins once a shared key exists, so compression and
//! encryption never combine on the wire.

use std::io::{Read, Write};

use base64::{engine::general_purpose::STANDARD, Engine};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde_json::{json, Value};
use tracing::warn;

use crate::crypto::{self, EncryptedPayload};
use crate::packet::{Message, Packet};
use crate::registry;
use crate::types::{Result, SealinkError, SHARED_KEY_SIZE};

/// A decoded frame: the message it carried, and whether the outer
/// envelope layer was encrypted. Receive loops use the flag to enforce
/// that authenticated sessions only accept encrypted frames.
#[derive(Debug)]
pub struct Decoded {
    pub message: Message,
    pub encrypted: bool,
}

/// Encode a packet for transport.
///
/// With a shared key the typed envelope is sealed in an encryption
/// envelope. Without one, the typed envelope is emitted as-is unless
/// `compression_threshold` is non-negative and the JSON exceeds it, in
/// which case a compression envelope is produced — falling back to the
/// uncompressed form when compression does not actually shrink the
/// payload or fails.
pub fn encode<P: Packet>(
    packet: &P,
    key: Option<&[u8; SHARED_KEY_SIZE]>,
    compression_threshold: i32,
) -> Result<String> {
    let data = serde_json::to_value(packet)
        .map_err(|e| SealinkError::Codec(format!("failed to serialize {}: {e}", P::TYPE)))?;
    let typed = json!({ "type": P::TYPE, "data": data }).to_string();

    if let Some(key) = key {
        let EncryptedPayload { payload, iv } = crypto::encrypt(&typed, key)?;
        return Ok(json!({ "encrypted": true, "payload": payload, "iv": iv }).to_string());
    }

    if compression_threshold >= 0 && typed.len() > compression_threshold as usize {
        match compress(&typed) {
            Ok(payload) if payload.len() < typed.len() => {
                return Ok(json!({ "compressed": true, "payload": payload }).to_string());
            }
            Ok(_) => {}
            Err(e) => warn!(packet = P::TYPE, error = %e, "compression failed, sending uncompressed"),
        }
    }

    Ok(typed)
}

/// Decode a transport frame into a typed message.
///
/// Unwraps encryption and compression envelopes recursively, then resolves
/// the type tag through the packet registry. An encrypted envelope without
/// a shared key available is a crypto error; a compression envelope that
/// fails to inflate is fatal to the frame.
pub fn decode(text: &str, key: Option<&[u8; SHARED_KEY_SIZE]>) -> Result<Decoded> {
    let mut envelope: Value = serde_json::from_str(text)
        .map_err(|e| SealinkError::Codec(format!("malformed frame: {e}")))?;
    let mut encrypted = false;

    loop {
        if flag(&envelope, "encrypted") {
            let key = key.ok_or_else(|| {
                SealinkError::crypto("aes-gcm-decrypt", "encrypted frame but no shared key")
            })?;
            let payload = EncryptedPayload {
                payload: field(&envelope, "payload")?,
                iv: field(&envelope, "iv")?,
            };
            let inner = crypto::decrypt(&payload, key)?;
            envelope = serde_json::from_str(&inner)
                .map_err(|e| SealinkError::Codec(format!("malformed encrypted frame: {e}")))?;
            encrypted = true;
            continue;
        }

        if flag(&envelope, "compressed") {
            let inner = decompress(&field(&envelope, "payload")?)?;
            envelope = serde_json::from_str(&inner)
                .map_err(|e| SealinkError::Codec(format!("malformed compressed frame: {e}")))?;
            continue;
        }

        let tag = envelope
            .get("type")
            .and_then(Value::as_str)
            .ok_or_else(|| SealinkError::Codec("envelope is missing the type field".into()))?
            .to_string();
        let data = envelope
            .get_mut("data")
            .map(Value::take)
            .ok_or_else(|| SealinkError::Codec("envelope is missing the data field".into()))?;

        let message = registry::decode(&tag, data)?;
        return Ok(Decoded { message, encrypted });
    }
}

fn flag(envelope: &Value, name: &str) -> bool {
    envelope.get(name).and_then(Value::as_bool).unwrap_or(false)
}

fn field(envelope: &Value, name: &str) -> Result<String> {
    envelope
        .get(name)
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| SealinkError::Codec(format!("envelope is missing the {name} field")))
}

/// GZIP a string and encode the stream as Base64.
fn compress(data: &str) -> Result<String> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder
        .write_all(data.as_bytes())
        .map_err(|e| SealinkError::Codec(format!("gzip failed: {e}")))?;
    let bytes = encoder
        .finish()
        .map_err(|e| SealinkError::Codec(format!("gzip failed: {e}")))?;
    Ok(STANDARD.encode(bytes))
}

/// Decode Base64 and inflate the GZIP stream.
fn decompress(payload: &str) -> Result<String> {
    let bytes = STANDARD
        .decode(payload)
        .map_err(|e| SealinkError::Codec(format!("compressed payload is not base64: {e}")))?;
    let mut inflated = String::new();
    GzDecoder::new(bytes.as_slice())
        .read_to_string(&mut inflated)
        .map_err(|e| SealinkError::Codec(format!("gunzip failed: {e}")))?;
    Ok(inflated)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::generate_shared_key;
    use crate::packet::{PacketAuthSuccess, PacketIdentification, PacketPing};
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    #[serde(rename_all = "camelCase")]
    struct PacketBulkState {
        blob: String,
    }

    impl Packet for PacketBulkState {
        const TYPE: &'static str = "PacketBulkState";
    }

    fn decode_message(text: &str, key: Option<&[u8; SHARED_KEY_SIZE]>) -> Message {
        decode(text, key).unwrap().message
    }

    #[test]
    fn test_plain_roundtrip() {
        let ping = PacketPing {
            timestamp: 123,
            sequence_id: 1,
        };
        let text = encode(&ping, None, -1).unwrap();
        assert_eq!(decode_message(&text, None), Message::Ping(ping));

        let value: Value = serde_json::from_str(&text).unwrap();
        assert_eq!(value.get("type").unwrap(), "PacketPing");
        assert!(value.get("encrypted").is_none());
        assert!(value.get("compressed").is_none());
    }

    #[test]
    fn test_encrypted_roundtrip() {
        let key = generate_shared_key();
        let packet = PacketAuthSuccess {
            message: "Authentication successful".into(),
        };
        let text = encode(&packet, Some(&key), -1).unwrap();

        let value: Value = serde_json::from_str(&text).unwrap();
        assert_eq!(value.get("encrypted").unwrap(), true);
        assert!(value.get("iv").is_some());
        assert!(value.get("type").is_none());

        let decoded = decode(&text, Some(&key)).unwrap();
        assert!(decoded.encrypted);
        assert_eq!(decoded.message, Message::AuthSuccess(packet));
    }

    #[test]
    fn test_compressed_roundtrip() {
        registry::register::<PacketBulkState>();
        let packet = PacketBulkState {
            blob: "state ".repeat(400),
        };
        let text = encode(&packet, None, 100).unwrap();

        let value: Value = serde_json::from_str(&text).unwrap();
        assert_eq!(value.get("compressed").unwrap(), true);

        let decoded = decode(&text, None).unwrap();
        assert!(!decoded.encrypted);
        let Message::App(app) = decoded.message else {
            panic!("expected app message");
        };
        assert_eq!(app.parse::<PacketBulkState>().unwrap(), packet);
    }

    #[test]
    fn test_encryption_wins_over_compression() {
        registry::register::<PacketBulkState>();
        let key = generate_shared_key();
        let packet = PacketBulkState {
            blob: "state ".repeat(400),
        };
        let text = encode(&packet, Some(&key), 100).unwrap();

        let value: Value = serde_json::from_str(&text).unwrap();
        assert_eq!(value.get("encrypted").unwrap(), true);
        assert!(value.get("compressed").is_none());
    }

    #[test]
    fn test_incompressible_payload_stays_typed() {
        // Short payloads inflate under gzip framing, so the encoder keeps
        // the typed envelope even past the threshold.
        let ping = PacketPing {
            timestamp: 123,
            sequence_id: 1,
        };
        let text = encode(&ping, None, 10).unwrap();
        let value: Value = serde_json::from_str(&text).unwrap();
        assert!(value.get("compressed").is_none());
        assert_eq!(value.get("type").unwrap(), "PacketPing");
    }

    #[test]
    fn test_negative_threshold_disables_compression() {
        registry::register::<PacketBulkState>();
        let packet = PacketBulkState {
            blob: "state ".repeat(400),
        };
        let text = encode(&packet, None, -1).unwrap();
        let value: Value = serde_json::from_str(&text).unwrap();
        assert!(value.get("compressed").is_none());
    }

    #[test]
    fn test_nulls_survive_the_wire() {
        let packet = PacketIdentification {
            client_identifier: "smp".into(),
            metadata: None,
        };
        let text = encode(&packet, None, -1).unwrap();
        assert!(text.contains("\"metadata\":null"));
        let Message::Identification(decoded) = decode_message(&text, None) else {
            panic!("expected identification");
        };
        assert_eq!(decoded.metadata, None);
    }

    #[test]
    fn test_encrypted_frame_without_key_fails() {
        let key = generate_shared_key();
        let ping = PacketPing {
            timestamp: 1,
            sequence_id: 1,
        };
        let text = encode(&ping, Some(&key), -1).unwrap();
        let result = decode(&text, None);
        assert!(matches!(result, Err(SealinkError::Crypto { .. })));
    }

    #[test]
    fn test_malformed_frame_is_codec_error() {
        assert!(matches!(
            decode("not json", None),
            Err(SealinkError::Codec(_))
        ));
        assert!(matches!(
            decode(r#"{"data":{}}"#, None),
            Err(SealinkError::Codec(_))
        ));
        assert!(matches!(
            decode(r#"{"type":"PacketPing"}"#, None),
            Err(SealinkError::Codec(_))
        ));
    }

    #[test]
    fn test_corrupt_compressed_payload_is_fatal() {
        let frame = r#"{"compressed":true,"payload":"bm90IGd6aXA="}"#;
        assert!(matches!(decode(frame, None), Err(SealinkError::Codec(_))));
    }

    #[test]
    fn test_unknown_tag_surfaces() {
        let frame = r#"{"type":"PacketMystery","data":{}}"#;
        assert!(matches!(
            decode(frame, None),
            Err(SealinkError::UnknownPacketType(_))
        ));
    }
}
