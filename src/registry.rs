//! Process-wide registry mapping type tags to packet decoders.
//!
//! Application packet kinds must be registered before the first frame that
//! carries them is decoded; an unregistered tag on receive is a hard
//! protocol error. The built-in handshake and system kinds are always
//! resolvable. By convention registration happens once at startup, so
//! steady-state lookups only take the read lock.

use std::collections::HashMap;
use std::sync::{OnceLock, RwLock};

use serde_json::Value;

use crate::packet::{
    AppMessage, Message, Packet, PacketAuthFailed, PacketAuthSuccess, PacketChallenge,
    PacketChallengeResponse, PacketIdentification, PacketPing, PacketPong, PacketPublicKey,
    PacketSharedSecret, PacketVersion,
};
use crate::types::{Result, SealinkError};

type DecodeFn = fn(Value) -> Result<Message>;

fn registry() -> &'static RwLock<HashMap<&'static str, DecodeFn>> {
    static REGISTRY: OnceLock<RwLock<HashMap<&'static str, DecodeFn>>> = OnceLock::new();
    REGISTRY.get_or_init(|| RwLock::new(HashMap::new()))
}

fn decode_app<P: Packet>(data: Value) -> Result<Message> {
    // Materialize once to validate the shape against the registered kind.
    serde_json::from_value::<P>(data.clone())
        .map_err(|e| SealinkError::Codec(format!("malformed {} data: {e}", P::TYPE)))?;
    Ok(Message::App(AppMessage::new(P::TYPE.to_string(), data)))
}

/// Registers an application packet kind under its type tag.
///
/// Registration is additive and idempotent; registering the same kind
/// twice is a no-op. Built-in tags cannot be shadowed.
pub fn register<P: Packet>() {
    let mut map = registry().write().expect("packet registry poisoned");
    map.insert(P::TYPE, decode_app::<P>);
}

/// Whether a tag resolves to a built-in or registered kind.
pub fn is_registered(tag: &str) -> bool {
    decode_builtin(tag).is_some()
        || registry()
            .read()
            .expect("packet registry poisoned")
            .contains_key(tag)
}

fn decode_builtin(tag: &str) -> Option<DecodeFn> {
    fn parse<P: Packet>(data: Value, into: fn(P) -> Message) -> Result<Message> {
        serde_json::from_value::<P>(data)
            .map(into)
            .map_err(|e| SealinkError::Codec(format!("malformed {} data: {e}", P::TYPE)))
    }

    Some(match tag {
        PacketPublicKey::TYPE => |d| parse(d, Message::PublicKey),
        PacketSharedSecret::TYPE => |d| parse(d, Message::SharedSecret),
        PacketChallenge::TYPE => |d| parse(d, Message::Challenge),
        PacketChallengeResponse::TYPE => |d| parse(d, Message::ChallengeResponse),
        PacketAuthSuccess::TYPE => |d| parse(d, Message::AuthSuccess),
        PacketAuthFailed::TYPE => |d| parse(d, Message::AuthFailed),
        PacketIdentification::TYPE => |d| parse(d, Message::Identification),
        PacketVersion::TYPE => |d| parse(d, Message::Version),
        PacketPing::TYPE => |d| parse(d, Message::Ping),
        PacketPong::TYPE => |d| parse(d, Message::Pong),
        _ => return None,
    })
}

/// Decodes an envelope's `data` value into the kind registered for `tag`.
pub fn decode(tag: &str, data: Value) -> Result<Message> {
    if let Some(decode) = decode_builtin(tag) {
        return decode(data);
    }
    let decode = {
        let map = registry().read().expect("packet registry poisoned");
        map.get(tag).copied()
    };
    match decode {
        Some(decode) => decode(data),
        None => Err(SealinkError::UnknownPacketType(tag.to_string())),
    }
}
