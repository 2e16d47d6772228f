use lru::LruCache;
use std::num::NonZeroUsize;
use zeroize::Zeroizing;

/// Message id → plaintext for one open conversation.
///
/// Entries are write-once: a message that decrypted is never decrypted again
/// while it stays cached. Capacity is bounded; the least recently shown
/// entries are evicted (and wiped) first.
pub struct DecryptCache {
    entries: LruCache<String, Zeroizing<String>>,
}

impl DecryptCache {
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            entries: LruCache::new(capacity),
        }
    }

    pub fn get(&mut self, message_id: &str) -> Option<&str> {
        self.entries.get(message_id).map(|s| s.as_str())
    }

    /// Returns `false` without touching the entry if the id is already cached.
    pub fn insert(&mut self, message_id: &str, plaintext: String) -> bool {
        if self.entries.contains(message_id) {
            return false;
        }
        self.entries
            .put(message_id.to_string(), Zeroizing::new(plaintext));
        true
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}
