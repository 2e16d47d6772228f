use crate::{Error, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use hkdf::Hkdf;
use sha2::{Digest, Sha256};
use x25519_dalek::PublicKey;
use zeroize::Zeroizing;

/// HKDF-SHA256 expanding `ikm` into a single 32-byte key.
pub fn kdf(ikm: &[u8], salt: &[u8], info: &[u8]) -> Zeroizing<[u8; 32]> {
    let hk = Hkdf::<Sha256>::new(Some(salt), ikm);
    let mut okm = Zeroizing::new([0u8; 32]);
    // 32 bytes is far below the 255 * HashLen limit
    let _ = hk.expand(info, okm.as_mut());
    okm
}

pub fn public_key_from_base64(encoded: &str) -> Result<PublicKey> {
    let bytes = BASE64.decode(encoded.trim())?;
    let array: [u8; 32] = bytes
        .try_into()
        .map_err(|_| Error::InvalidKey("public key must be 32 bytes".to_string()))?;
    Ok(PublicKey::from(array))
}

pub fn public_key_to_base64(key: &PublicKey) -> String {
    BASE64.encode(key.as_bytes())
}

/// Short, human-comparable fingerprint of a public key.
pub fn fingerprint(key: &PublicKey) -> String {
    let digest = Sha256::digest(key.as_bytes());
    hex::encode(&digest[..8])
}
