use crate::{Error, Result};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

/// Device-local key/value storage for secrets that must never leave the device.
pub trait StorageAdapter: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<String>>;
    fn put(&self, key: &str, value: String) -> Result<()>;
    fn del(&self, key: &str) -> Result<()>;
}

#[derive(Clone, Default)]
pub struct InMemoryStorage {
    store: Arc<Mutex<HashMap<String, String>>>,
}

impl InMemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    fn store(&self) -> Result<std::sync::MutexGuard<'_, HashMap<String, String>>> {
        self.store
            .lock()
            .map_err(|_| Error::Storage("in-memory store poisoned".to_string()))
    }
}

impl StorageAdapter for InMemoryStorage {
    fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.store()?.get(key).cloned())
    }

    fn put(&self, key: &str, value: String) -> Result<()> {
        self.store()?.insert(key.to_string(), value);
        Ok(())
    }

    fn del(&self, key: &str) -> Result<()> {
        self.store()?.remove(key);
        Ok(())
    }
}
