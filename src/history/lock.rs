//! Per-key mutual exclusion

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::{Error, Result};

/// A lazily populated map of one mutex per key
///
/// Holders of different keys never contend. Entries nobody holds are
/// dropped the next time a lock is taken, so the map only tracks keys in use.
#[derive(Debug, Default)]
pub struct KeyedLocks {
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl KeyedLocks {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn entry(&self, key: &str) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        // The map's own reference is the only one left for idle keys
        locks.retain(|_, lock| Arc::strong_count(lock) > 1);
        Arc::clone(locks.entry(key.to_string()).or_default())
    }

    #[cfg(test)]
    fn tracked(&self) -> usize {
        self.locks.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Run `f` while holding the lock for `key`
    ///
    /// # Errors
    ///
    /// Returns whatever `f` returns, or a storage error if a previous holder panicked
    pub fn with<T>(&self, key: &str, f: impl FnOnce() -> Result<T>) -> Result<T> {
        let lock = self.entry(key);
        let _guard: MutexGuard<'_, ()> = lock
            .lock()
            .map_err(|_| Error::Storage(format!("lock for {key} poisoned")))?;
        f()
    }
}
