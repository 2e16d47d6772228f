//! Per-message sealing under the conversation key.
//!
//! XChaCha20-Poly1305 with a 192-bit nonce drawn from the OS RNG on every
//! call. No counter state exists, so nothing can replay a nonce across
//! restarts, and the nonce space makes random collisions negligible.
//! Messages are independent: any order of decryption gives the same result.

use crate::conversation_keys::ConversationKey;
use crate::{DecryptionFailure, EncryptedPayload, Error, Result, NONCE_LEN};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{Key, XChaCha20Poly1305, XNonce};
use rand::rngs::OsRng;
use rand::RngCore;

fn fresh_nonce() -> [u8; NONCE_LEN] {
    let mut bytes = [0u8; NONCE_LEN];
    OsRng.fill_bytes(&mut bytes);
    bytes
}

pub fn encrypt(key: &ConversationKey, plaintext: &str) -> Result<EncryptedPayload> {
    let cipher = XChaCha20Poly1305::new(Key::from_slice(key.as_bytes()));
    let nonce = fresh_nonce();

    let sealed = cipher
        .encrypt(XNonce::from_slice(&nonce), plaintext.as_bytes())
        .map_err(|_| Error::Encryption("AEAD seal failed".to_string()))?;

    Ok(EncryptedPayload {
        ciphertext: BASE64.encode(sealed),
        iv: BASE64.encode(nonce),
    })
}

/// Opens one message. Every failure is classified and returned, never raised.
pub fn decrypt(
    key: &ConversationKey,
    ciphertext: &str,
    iv: &str,
) -> std::result::Result<String, DecryptionFailure> {
    let sealed = BASE64
        .decode(ciphertext)
        .map_err(|_| DecryptionFailure::MalformedCiphertext)?;
    let nonce = BASE64
        .decode(iv)
        .map_err(|_| DecryptionFailure::MalformedNonce)?;
    if nonce.len() != NONCE_LEN {
        return Err(DecryptionFailure::MalformedNonce);
    }

    let cipher = XChaCha20Poly1305::new(Key::from_slice(key.as_bytes()));
    let opened = cipher
        .decrypt(XNonce::from_slice(&nonce), sealed.as_slice())
        .map_err(|_| DecryptionFailure::AuthenticationFailed)?;

    String::from_utf8(opened).map_err(|_| DecryptionFailure::InvalidUtf8)
}
