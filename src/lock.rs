use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

/// Per-key mutual exclusion
///
/// At most one holder per key at a time. Used so that the same layer digest
/// is never downloaded and registered by two fetches at once. Per-key locks
/// are created on first use and kept for the life of the table.
#[derive(Debug, Default)]
pub struct LayerLock {
    locks: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

/// Proof that a key is held, released on drop or by [LayerLockGuard::release]
#[derive(Debug)]
pub struct LayerLockGuard {
    key: String,
    _guard: OwnedMutexGuard<()>,
}

impl LayerLock {
    pub fn new() -> Self {
        Default::default()
    }

    fn lock_for(&self, key: &str) -> Arc<AsyncMutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        locks
            .entry(key.to_owned())
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone()
    }

    /// Wait until no other caller holds `key`, then take it
    pub async fn acquire(&self, key: &str) -> LayerLockGuard {
        let guard = self.lock_for(key).lock_owned().await;
        log::trace!("layer lock acquired, {}", key);
        LayerLockGuard {
            key: key.to_owned(),
            _guard: guard,
        }
    }
}

impl LayerLockGuard {
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Release the key now, rather than at the end of the enclosing scope
    pub fn release(self) {
        log::trace!("layer lock released, {}", self.key);
    }
}
