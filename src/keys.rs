//! Key generation and wire encodings for the Sealink handshake.

use base64::{engine::general_purpose::STANDARD, Engine};
use rand::rngs::OsRng;
use rand::RngCore;
use rsa::pkcs8::{DecodePublicKey, EncodePublicKey};
use rsa::{RsaPrivateKey, RsaPublicKey};

use crate::types::{Result, SealinkError, RSA_KEY_BITS, SHARED_KEY_SIZE};

/// Generate an RSA-2048 key pair for the key exchange.
///
/// # Returns
/// Tuple of (private_key, public_key)
pub fn generate_keypair() -> Result<(RsaPrivateKey, RsaPublicKey)> {
    let private_key = RsaPrivateKey::new(&mut OsRng, RSA_KEY_BITS)
        .map_err(|e| SealinkError::crypto("rsa-keygen", e))?;
    let public_key = RsaPublicKey::from(&private_key);
    Ok((private_key, public_key))
}

/// Generate a random AES-256 shared key from the OS CSPRNG.
pub fn generate_shared_key() -> [u8; SHARED_KEY_SIZE] {
    let mut key = [0u8; SHARED_KEY_SIZE];
    OsRng.fill_bytes(&mut key);
    key
}

/// Encode a public key as Base64 over its X.509 SubjectPublicKeyInfo DER.
pub fn encode_public_key(key: &RsaPublicKey) -> Result<String> {
    let der = key
        .to_public_key_der()
        .map_err(|e| SealinkError::crypto("spki-encode", e))?;
    Ok(STANDARD.encode(der.as_bytes()))
}

/// Decode a public key from Base64-encoded SubjectPublicKeyInfo DER.
pub fn decode_public_key(encoded: &str) -> Result<RsaPublicKey> {
    let der = STANDARD
        .decode(encoded)
        .map_err(|e| SealinkError::crypto("spki-decode", e))?;
    RsaPublicKey::from_public_key_der(&der).map_err(|e| SealinkError::crypto("spki-decode", e))
}

/// Encode a shared key as Base64 over its raw 32 bytes.
pub fn encode_shared_key(key: &[u8; SHARED_KEY_SIZE]) -> String {
    STANDARD.encode(key)
}

/// Decode a shared key from its Base64 encoding.
pub fn decode_shared_key(encoded: &str) -> Result<[u8; SHARED_KEY_SIZE]> {
    let bytes = STANDARD
        .decode(encoded)
        .map_err(|e| SealinkError::crypto("key-decode", e))?;
    bytes
        .try_into()
        .map_err(|_| SealinkError::crypto("key-decode", "shared key is not 32 bytes"))
}
