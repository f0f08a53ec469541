//! Keyed async reader-writer locks.
//!
//! One `tokio::sync::RwLock` per key, created on first use. Slots nobody holds
//! or waits on are dropped once the table grows past `PRUNE_THRESHOLD`.

use std::{
    collections::HashMap,
    hash::Hash,
    sync::{Arc, Mutex, PoisonError},
};
use tokio::sync::{OwnedRwLockReadGuard, OwnedRwLockWriteGuard, RwLock};

const PRUNE_THRESHOLD: usize = 1024;

pub struct LockRegistry<K> {
    slots: Mutex<HashMap<K, Arc<RwLock<()>>>>,
}

impl<K> Default for LockRegistry<K> {
    fn default() -> Self {
        Self {
            slots: Mutex::new(HashMap::new()),
        }
    }
}

impl<K: Eq + Hash + Clone> LockRegistry<K> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for exclusive ownership of `key`. Released when the guard drops.
    pub async fn lock(&self, key: K) -> OwnedRwLockWriteGuard<()> {
        self.slot(key).write_owned().await
    }

    /// Wait for shared ownership of `key`; excludes only `lock` holders.
    pub async fn lock_shared(&self, key: K) -> OwnedRwLockReadGuard<()> {
        self.slot(key).read_owned().await
    }

    fn slot(&self, key: K) -> Arc<RwLock<()>> {
        let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        if slots.len() >= PRUNE_THRESHOLD {
            slots.retain(|_, slot| Arc::strong_count(slot) > 1);
        }
        slots.entry(key).or_default().clone()
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner).len()
    }
}
