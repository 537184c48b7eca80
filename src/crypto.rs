//! Cryptographic operations for the Sealink protocol.
//!
//! Wire compatibility pins the exact algorithms: RSA-OAEP-SHA256 for key
//! wrapping, AES-256-GCM with a random 12-byte nonce per message, and
//! HMAC-SHA256 for challenge signing. Binary values cross the wire Base64
//! encoded with the standard alphabet.

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use base64::{engine::general_purpose::STANDARD, Engine};
use hmac::{Hmac, Mac};
use rand::rngs::OsRng;
use rand::RngCore;
use rsa::{Oaep, RsaPrivateKey, RsaPublicKey};
use sha2::Sha256;

use crate::keys::{decode_shared_key, encode_shared_key};
use crate::types::{Result, SealinkError, CHALLENGE_SIZE, NONCE_SIZE, SHARED_KEY_SIZE};

type HmacSha256 = Hmac<Sha256>;

/// An AES-GCM ciphertext and the nonce it was sealed under, both Base64.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncryptedPayload {
    /// Base64 ciphertext including the GCM tag.
    pub payload: String,
    /// Base64 12-byte nonce.
    pub iv: String,
}

/// Wrap a shared key under the peer's RSA public key.
///
/// The OAEP plaintext is the UTF-8 text of the key's Base64 encoding, so
/// the unwrapping side decodes text-then-Base64 rather than raw bytes.
pub fn wrap_shared_key(key: &[u8; SHARED_KEY_SIZE], public_key: &RsaPublicKey) -> Result<String> {
    let encoded = encode_shared_key(key);
    let wrapped = public_key
        .encrypt(&mut OsRng, Oaep::new::<Sha256>(), encoded.as_bytes())
        .map_err(|e| SealinkError::crypto("rsa-wrap", e))?;
    Ok(STANDARD.encode(wrapped))
}

/// Unwrap a shared key with our RSA private key.
pub fn unwrap_shared_key(
    encrypted: &str,
    private_key: &RsaPrivateKey,
) -> Result<[u8; SHARED_KEY_SIZE]> {
    let wrapped = STANDARD
        .decode(encrypted)
        .map_err(|e| SealinkError::crypto("rsa-unwrap", e))?;
    let plaintext = private_key
        .decrypt(Oaep::new::<Sha256>(), &wrapped)
        .map_err(|e| SealinkError::crypto("rsa-unwrap", e))?;
    let encoded = String::from_utf8(plaintext)
        .map_err(|e| SealinkError::crypto("rsa-unwrap", e))?;
    decode_shared_key(&encoded)
}

/// Encrypt text under AES-256-GCM with a fresh random nonce.
pub fn encrypt(plaintext: &str, key: &[u8; SHARED_KEY_SIZE]) -> Result<EncryptedPayload> {
    let cipher = Aes256Gcm::new_from_slice(key)
        .map_err(|e| SealinkError::crypto("aes-gcm-encrypt", e))?;

    let mut nonce_bytes = [0u8; NONCE_SIZE];
    OsRng.fill_bytes(&mut nonce_bytes);
    let nonce = Nonce::from_slice(&nonce_bytes);

    let ciphertext = cipher
        .encrypt(nonce, plaintext.as_bytes())
        .map_err(|e| SealinkError::crypto("aes-gcm-encrypt", e))?;

    Ok(EncryptedPayload {
        payload: STANDARD.encode(ciphertext),
        iv: STANDARD.encode(nonce_bytes),
    })
}

/// Decrypt an AES-256-GCM payload, verifying the authentication tag.
pub fn decrypt(encrypted: &EncryptedPayload, key: &[u8; SHARED_KEY_SIZE]) -> Result<String> {
    let cipher = Aes256Gcm::new_from_slice(key)
        .map_err(|e| SealinkError::crypto("aes-gcm-decrypt", e))?;

    let nonce_bytes = STANDARD
        .decode(&encrypted.iv)
        .map_err(|e| SealinkError::crypto("aes-gcm-decrypt", e))?;
    if nonce_bytes.len() != NONCE_SIZE {
        return Err(SealinkError::crypto("aes-gcm-decrypt", "nonce is not 12 bytes"));
    }
    let ciphertext = STANDARD
        .decode(&encrypted.payload)
        .map_err(|e| SealinkError::crypto("aes-gcm-decrypt", e))?;

    let plaintext = cipher
        .decrypt(Nonce::from_slice(&nonce_bytes), ciphertext.as_slice())
        .map_err(|e| SealinkError::crypto("aes-gcm-decrypt", e))?;
    String::from_utf8(plaintext).map_err(|e| SealinkError::crypto("aes-gcm-decrypt", e))
}

/// Compute HMAC-SHA256 of `data` keyed by `secret`, Base64 encoded.
///
/// Both inputs are taken as UTF-8 text; for challenge signing `data` is the
/// Base64 text of the challenge exactly as carried on the wire.
pub fn hmac_sha256(data: &str, secret: &str) -> String {
    let mut mac = <HmacSha256 as Mac>::new_from_slice(secret.as_bytes())
        .expect("HMAC accepts keys of any length");
    mac.update(data.as_bytes());
    STANDARD.encode(mac.finalize().into_bytes())
}

/// Verify a Base64-encoded HMAC-SHA256 in constant time.
pub fn verify_hmac(data: &str, secret: &str, expected: &str) -> bool {
    let Ok(expected_bytes) = STANDARD.decode(expected) else {
        return false;
    };
    let mut mac = <HmacSha256 as Mac>::new_from_slice(secret.as_bytes())
        .expect("HMAC accepts keys of any length");
    mac.update(data.as_bytes());
    mac.verify_slice(&expected_bytes).is_ok()
}

/// Generate a random 32-byte challenge, Base64 encoded.
pub fn generate_challenge() -> String {
    let mut challenge = [0u8; CHALLENGE_SIZE];
    OsRng.fill_bytes(&mut challenge);
    STANDARD.encode(challenge)
}
