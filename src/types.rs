//! Type definitions and protocol constants for Sealink.

use thiserror::Error;

/// Size of the AES-256 shared key in bytes.
pub const SHARED_KEY_SIZE: usize = 32;

/// Size of the AES-GCM nonce in bytes.
pub const NONCE_SIZE: usize = 12;

/// Size of an authentication challenge in bytes.
pub const CHALLENGE_SIZE: usize = 32;

/// RSA modulus size in bits for the handshake keypair.
pub const RSA_KEY_BITS: usize = 2048;

/// Default compression threshold in bytes (-1 disables compression).
pub const DEFAULT_COMPRESSION_THRESHOLD: i32 = 512;

/// Close code for protocol violations (malformed or out-of-order frames).
pub const CLOSE_PROTOCOL_ERROR: u16 = 4000;

/// Close code for authentication failures or invalid auth state.
pub const CLOSE_AUTH_FAILED: u16 = 4001;

/// Close code for client identifier conflicts.
pub const CLOSE_IDENTIFIER_CONFLICT: u16 = 4002;

/// Errors that can occur during Sealink operations.
#[derive(Error, Debug)]
pub enum SealinkError {
    /// Send or receive on a closed or broken transport.
    #[error("Transport error: {0}")]
    Transport(String),

    /// Malformed JSON or a missing envelope field.
    #[error("Codec error: {0}")]
    Codec(String),

    /// Received a type tag that is not in the packet registry.
    #[error("Unknown packet type: {0}")]
    UnknownPacketType(String),

    /// A cryptographic primitive failed.
    #[error("Crypto failure in {operation}: {detail}")]
    Crypto {
        /// The primitive that failed (e.g. "rsa-wrap", "aes-gcm-decrypt").
        operation: &'static str,
        detail: String,
    },

    /// A handshake message arrived out of order.
    #[error("Authentication state error: {0}")]
    AuthState(String),

    /// The requested client identifier is already registered.
    #[error("Identifier already in use: {0}")]
    IdentifierConflict(String),

    /// The transport-level connect did not complete in time.
    #[error("Connection timed out after {0:?}")]
    ConnectionTimeout(std::time::Duration),
}

impl SealinkError {
    /// Builds a crypto error for the named primitive.
    pub(crate) fn crypto(operation: &'static str, detail: impl ToString) -> Self {
        Self::Crypto {
            operation,
            detail: detail.to_string(),
        }
    }

    /// The application close code a server-side receive loop should use
    /// when this error terminates the session.
    pub fn close_code(&self) -> u16 {
        match self {
            Self::Codec(_) | Self::UnknownPacketType(_) => CLOSE_PROTOCOL_ERROR,
            Self::Crypto { .. } | Self::AuthState(_) => CLOSE_AUTH_FAILED,
            Self::IdentifierConflict(_) => CLOSE_IDENTIFIER_CONFLICT,
            _ => CLOSE_PROTOCOL_ERROR,
        }
    }
}

pub type Result<T> = std::result::Result<T, SealinkError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_close_code_mapping() {
        assert_eq!(
            SealinkError::Codec("bad".into()).close_code(),
            CLOSE_PROTOCOL_ERROR
        );
        assert_eq!(
            SealinkError::UnknownPacketType("PacketNope".into()).close_code(),
            CLOSE_PROTOCOL_ERROR
        );
        assert_eq!(
            SealinkError::crypto("aes-gcm-decrypt", "tag mismatch").close_code(),
            CLOSE_AUTH_FAILED
        );
        assert_eq!(
            SealinkError::AuthState("unexpected packet".into()).close_code(),
            CLOSE_AUTH_FAILED
        );
        assert_eq!(
            SealinkError::IdentifierConflict("smp".into()).close_code(),
            CLOSE_IDENTIFIER_CONFLICT
        );
    }

    #[test]
    fn test_crypto_error_names_operation() {
        let err = SealinkError::crypto("rsa-wrap", "key too small");
        assert!(err.to_string().contains("rsa-wrap"));
    }
}
