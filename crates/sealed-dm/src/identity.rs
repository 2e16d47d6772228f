//! Long-lived X25519 identity of the local device.
//!
//! The private half is generated once, written to device storage before it
//! is ever used, and never leaves the device. Losing it makes every stored
//! message unreadable; there is no backup path.

use crate::api::ApiClient;
use crate::utils::{fingerprint, public_key_from_base64, public_key_to_base64};
use crate::{Error, PublishKeysRequest, Result, StorageAdapter};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::{Arc, Mutex};
use x25519_dalek::{PublicKey, SharedSecret, StaticSecret};
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

pub struct LocalIdentity {
    pub user_id: String,
    pub public_key: PublicKey,
    private_key: StaticSecret,
}

impl LocalIdentity {
    pub fn generate(user_id: impl Into<String>) -> Self {
        let private_key = StaticSecret::random_from_rng(OsRng);
        Self::from_secret(user_id, private_key)
    }

    pub fn from_secret(user_id: impl Into<String>, private_key: StaticSecret) -> Self {
        Self {
            user_id: user_id.into(),
            public_key: PublicKey::from(&private_key),
            private_key,
        }
    }

    pub fn public_key_base64(&self) -> String {
        public_key_to_base64(&self.public_key)
    }

    pub fn fingerprint(&self) -> String {
        fingerprint(&self.public_key)
    }

    pub(crate) fn diffie_hellman(&self, peer: &PublicKey) -> SharedSecret {
        self.private_key.diffie_hellman(peer)
    }
}

impl fmt::Debug for LocalIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalIdentity")
            .field("user_id", &self.user_id)
            .field("public_key", &self.public_key_base64())
            .finish_non_exhaustive()
    }
}

#[derive(Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
#[serde(rename_all = "camelCase")]
struct StoredIdentity {
    user_id: String,
    public_key: String,
    private_key: String,
}

impl StoredIdentity {
    fn from_identity(identity: &LocalIdentity) -> Self {
        Self {
            user_id: identity.user_id.clone(),
            public_key: identity.public_key_base64(),
            private_key: BASE64.encode(identity.private_key.as_bytes()),
        }
    }

    fn into_identity(self) -> Result<LocalIdentity> {
        let raw = Zeroizing::new(BASE64.decode(&self.private_key)?);
        let mut bytes: [u8; 32] = raw
            .as_slice()
            .try_into()
            .map_err(|_| Error::Storage("stored private key has wrong length".to_string()))?;
        let secret = StaticSecret::from(bytes);
        bytes.zeroize();

        let identity = LocalIdentity::from_secret(self.user_id.clone(), secret);
        if identity.public_key != public_key_from_base64(&self.public_key)? {
            return Err(Error::Storage(
                "stored public key does not match private key".to_string(),
            ));
        }
        Ok(identity)
    }
}

/// What `publish` had to do to make the relay hold our current key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishOutcome {
    AlreadyPublished,
    Published,
    Replaced,
}

pub struct IdentityKeyManager {
    user_id: String,
    storage: Arc<dyn StorageAdapter>,
    cached: Mutex<Option<Arc<LocalIdentity>>>,
}

impl IdentityKeyManager {
    pub fn new(user_id: impl Into<String>, storage: Arc<dyn StorageAdapter>) -> Self {
        Self {
            user_id: user_id.into(),
            storage,
            cached: Mutex::new(None),
        }
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    fn storage_key(&self) -> String {
        format!("identity/{}", self.user_id)
    }

    /// Load the identity from storage, generating and persisting one on first use.
    /// Repeated calls return the cached value.
    pub fn init(&self) -> Result<Arc<LocalIdentity>> {
        let mut cached = self
            .cached
            .lock()
            .map_err(|_| Error::Storage("identity cache poisoned".to_string()))?;
        if let Some(identity) = cached.as_ref() {
            return Ok(identity.clone());
        }

        let identity = match self.storage.get(&self.storage_key())? {
            Some(raw) => {
                let stored: StoredIdentity = serde_json::from_str(&raw)
                    .map_err(|e| Error::Storage(format!("corrupt identity record: {e}")))?;
                stored.into_identity()?
            }
            None => {
                let identity = LocalIdentity::generate(self.user_id.clone());
                let stored = StoredIdentity::from_identity(&identity);
                self.storage
                    .put(&self.storage_key(), serde_json::to_string(&stored)?)?;
                tracing::info!(
                    user_id = %self.user_id,
                    fingerprint = %identity.fingerprint(),
                    "generated new identity key"
                );
                identity
            }
        };

        let identity = Arc::new(identity);
        *cached = Some(identity.clone());
        Ok(identity)
    }

    /// Whether this device already holds a key, without generating one.
    pub fn has_identity(&self) -> Result<bool> {
        if let Ok(cached) = self.cached.lock() {
            if cached.is_some() {
                return Ok(true);
            }
        }
        Ok(self.storage.get(&self.storage_key())?.is_some())
    }

    /// Make sure the relay holds our current public key. Not retried here;
    /// the caller decides when to try again.
    pub async fn publish(&self, api: &ApiClient) -> Result<PublishOutcome> {
        let identity = self.init()?;
        let ours = identity.public_key_base64();

        let outcome = match api.get_own_keys().await? {
            Some(bundle) if bundle.public_key == ours => return Ok(PublishOutcome::AlreadyPublished),
            Some(_) => PublishOutcome::Replaced,
            None => PublishOutcome::Published,
        };

        api.publish_keys(&PublishKeysRequest::for_public_key(&ours))
            .await?;
        tracing::info!(user_id = %self.user_id, ?outcome, "published identity key");
        Ok(outcome)
    }

    /// Forget the identity everywhere on this device.
    pub fn reset(&self) -> Result<()> {
        self.storage.del(&self.storage_key())?;
        if let Ok(mut cached) = self.cached.lock() {
            *cached = None;
        }
        Ok(())
    }
}
