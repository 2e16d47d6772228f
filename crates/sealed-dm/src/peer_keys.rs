//! Looking up a peer's published identity key.
//!
//! A missing key is normal: the peer may simply not have opened their
//! messages yet. The resolver waits on a linear backoff and gives up with a
//! user-facing explanation once the retry budget is spent.

use crate::api::ApiClient;
use crate::shutdown::ShutdownSignal;
use crate::utils::public_key_from_base64;
use crate::{Error, Result, RetryPolicy};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Mutex;
use x25519_dalek::PublicKey;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerKey {
    pub peer_id: String,
    pub public_key: PublicKey,
    pub published_at: Option<DateTime<Utc>>,
}

pub fn waiting_status(peer_name: &str) -> String {
    format!("Waiting for {} to set up encryption...", peer_name)
}

pub fn unavailable_message(peer_name: &str) -> String {
    format!(
        "{} hasn't set up messaging yet. They need to open their messages first.",
        peer_name
    )
}

/// Resolves peer keys for one conversation view. Successful lookups are
/// cached only for the resolver's lifetime so every new view re-verifies.
pub struct PeerKeyResolver {
    api: ApiClient,
    policy: RetryPolicy,
    cache: Mutex<HashMap<String, PeerKey>>,
}

impl PeerKeyResolver {
    pub fn new(api: ApiClient, policy: RetryPolicy) -> Self {
        Self {
            api,
            policy,
            cache: Mutex::new(HashMap::new()),
        }
    }

    pub fn cached(&self, peer_id: &str) -> Option<PeerKey> {
        self.cache.lock().ok()?.get(peer_id).cloned()
    }

    /// One lookup, no retry. `KeyUnavailable` on 404.
    pub async fn fetch_once(&self, peer_id: &str) -> Result<PeerKey> {
        if let Some(hit) = self.cached(peer_id) {
            return Ok(hit);
        }

        let bundle = self
            .api
            .get_peer_key(peer_id)
            .await?
            .ok_or_else(|| Error::KeyUnavailable {
                peer_id: peer_id.to_string(),
            })?;

        let key = PeerKey {
            peer_id: peer_id.to_string(),
            public_key: public_key_from_base64(&bundle.public_key)?,
            published_at: bundle.published_at,
        };
        if let Ok(mut cache) = self.cache.lock() {
            cache.insert(peer_id.to_string(), key.clone());
        }
        Ok(key)
    }

    /// Fetch with retry while the peer has not published.
    ///
    /// `on_status` receives the waiting line before each sleep. Returns
    /// `Cancelled` as soon as `shutdown` fires, and `PeerUnavailable` after
    /// the last retry. Other failures are returned immediately.
    pub async fn resolve<F>(
        &self,
        peer_id: &str,
        peer_name: &str,
        shutdown: &mut ShutdownSignal,
        on_status: F,
    ) -> Result<PeerKey>
    where
        F: Fn(&str) + Sync,
    {
        let mut attempt = 0u32;
        loop {
            if shutdown.is_triggered() {
                return Err(Error::Cancelled);
            }

            let fetched = tokio::select! {
                res = self.fetch_once(peer_id) => res,
                _ = shutdown.triggered() => return Err(Error::Cancelled),
            };

            match fetched {
                Ok(key) => {
                    tracing::debug!(peer_id, attempt, "peer key resolved");
                    return Ok(key);
                }
                Err(Error::KeyUnavailable { .. }) if attempt < self.policy.max_retries => {
                    attempt += 1;
                    let delay = self.policy.delay_for(attempt);
                    tracing::debug!(peer_id, attempt, ?delay, "peer key not published yet");
                    on_status(&waiting_status(peer_name));

                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = shutdown.triggered() => return Err(Error::Cancelled),
                    }
                }
                Err(Error::KeyUnavailable { .. }) => {
                    tracing::info!(peer_id, attempts = attempt + 1, "giving up on peer key");
                    return Err(Error::PeerUnavailable {
                        peer_id: peer_id.to_string(),
                        message: unavailable_message(peer_name),
                    });
                }
                Err(err) => {
                    tracing::warn!(peer_id, error = err.class(), "peer key lookup failed");
                    return Err(err);
                }
            }
        }
    }
}
