//! One symmetric key per conversation, derived and never stored.
//!
//! `key = HKDF-SHA256(ikm = X25519(self.private, peer.public),
//!                    salt = conversation_id,
//!                    info = CONVERSATION_KEY_INFO)`
//!
//! The conversation id is assigned by the relay and is known to both
//! participants, so both sides derive the same key without exchanging
//! anything but public keys. The id is not secret; it only separates keys
//! of different conversations between the same pair of users.

use crate::identity::LocalIdentity;
use crate::utils::kdf;
use crate::{Error, Result, CONVERSATION_KEY_INFO};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, RwLock};
use x25519_dalek::PublicKey;
use zeroize::Zeroizing;

pub struct ConversationKey {
    pub conversation_id: String,
    pub peer_id: String,
    symmetric_key: Zeroizing<[u8; 32]>,
    pub established_at: DateTime<Utc>,
}

impl ConversationKey {
    pub fn from_raw(
        conversation_id: impl Into<String>,
        peer_id: impl Into<String>,
        key: [u8; 32],
    ) -> Self {
        Self {
            conversation_id: conversation_id.into(),
            peer_id: peer_id.into(),
            symmetric_key: Zeroizing::new(key),
            established_at: Utc::now(),
        }
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.symmetric_key
    }
}

impl fmt::Debug for ConversationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConversationKey")
            .field("conversation_id", &self.conversation_id)
            .field("peer_id", &self.peer_id)
            .field("established_at", &self.established_at)
            .finish_non_exhaustive()
    }
}

/// Deterministic for a given (identity, peer, conversation) triple.
pub fn derive_conversation_key(
    identity: &LocalIdentity,
    peer_public_key: &PublicKey,
    conversation_id: &str,
) -> Result<Zeroizing<[u8; 32]>> {
    let shared = identity.diffie_hellman(peer_public_key);
    if !shared.was_contributory() {
        return Err(Error::InvalidKey(
            "peer public key is a low-order point".to_string(),
        ));
    }
    Ok(kdf(
        shared.as_bytes(),
        conversation_id.as_bytes(),
        CONVERSATION_KEY_INFO,
    ))
}

#[derive(Default)]
pub struct ConversationKeyStore {
    keys: RwLock<HashMap<String, Arc<ConversationKey>>>,
}

impl ConversationKeyStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Derive the key for `conversation_id` and cache it, replacing any previous one.
    pub fn setup(
        &self,
        conversation_id: &str,
        identity: &LocalIdentity,
        peer_id: &str,
        peer_public_key: &PublicKey,
    ) -> Result<Arc<ConversationKey>> {
        let derived = derive_conversation_key(identity, peer_public_key, conversation_id)?;
        let key = Arc::new(ConversationKey {
            conversation_id: conversation_id.to_string(),
            peer_id: peer_id.to_string(),
            symmetric_key: derived,
            established_at: Utc::now(),
        });

        self.keys
            .write()
            .map_err(|_| Error::Storage("conversation key store poisoned".to_string()))?
            .insert(conversation_id.to_string(), key.clone());
        tracing::debug!(conversation_id, peer_id, "conversation key established");
        Ok(key)
    }

    /// Cached key, if `setup` has run. Never derives on its own.
    pub fn get(&self, conversation_id: &str) -> Option<Arc<ConversationKey>> {
        self.keys.read().ok()?.get(conversation_id).cloned()
    }

    pub fn clear(&self) {
        if let Ok(mut keys) = self.keys.write() {
            keys.clear();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn agreement_is_commutative() {
        let alice = LocalIdentity::generate("alice");
        let bob = LocalIdentity::generate("bob");

        let ab = derive_conversation_key(&alice, &bob.public_key, "c1").unwrap();
        let ba = derive_conversation_key(&bob, &alice.public_key, "c1").unwrap();
        assert_eq!(*ab, *ba);
    }

    #[test]
    fn derivation_is_deterministic_and_conversation_scoped() {
        let alice = LocalIdentity::generate("alice");
        let bob = LocalIdentity::generate("bob");

        let first = derive_conversation_key(&alice, &bob.public_key, "c1").unwrap();
        let again = derive_conversation_key(&alice, &bob.public_key, "c1").unwrap();
        let other = derive_conversation_key(&alice, &bob.public_key, "c2").unwrap();
        assert_eq!(*first, *again);
        assert_ne!(*first, *other);
    }

    #[test]
    fn low_order_peer_key_is_rejected() {
        let alice = LocalIdentity::generate("alice");
        let zero = PublicKey::from([0u8; 32]);
        assert!(matches!(
            derive_conversation_key(&alice, &zero, "c1"),
            Err(Error::InvalidKey(_))
        ));
    }

    #[test]
    fn store_caches_without_recomputing() {
        let store = ConversationKeyStore::new();
        let alice = LocalIdentity::generate("alice");
        let bob = LocalIdentity::generate("bob");

        assert!(store.get("c1").is_none());

        let key = store.setup("c1", &alice, "bob", &bob.public_key).unwrap();
        let cached = store.get("c1").unwrap();
        assert!(Arc::ptr_eq(&key, &cached));
        assert_eq!(cached.peer_id, "bob");
        assert!(store.get("c2").is_none());

        store.clear();
        assert!(store.get("c1").is_none());
    }

    #[test]
    fn debug_output_hides_key_bytes() {
        let key = ConversationKey::from_raw("c1", "bob", [0xAB; 32]);
        let rendered = format!("{:?}", key);
        assert!(!rendered.contains("symmetric_key"));
        assert!(!rendered.contains("[171, 171"));
        assert!(rendered.contains("c1"));
    }
}
