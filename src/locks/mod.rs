//! Keyed mutual exclusion for the desktop <-> window mapping.
//!
//! Every read-then-write of the mapping for a key must happen while holding
//! that key's [`ResourceGuard`]. Waiters are admitted in arrival order
//! (tokio's mutex is fair), locks are not re-entrant, and the guard releases
//! on drop so an error inside the critical section cannot leak a held lock.

use std::sync::Arc;
#[cfg(debug_assertions)]
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::debug;

/// Upper bound on a single lock wait in debug builds. A wait this long means
/// two coordinator operations deadlocked.
#[cfg(debug_assertions)]
pub const DEBUG_LOCK_WAIT_LIMIT: Duration = Duration::from_secs(30);

type Slot = Arc<Mutex<()>>;

#[derive(Clone, Default)]
pub struct ResourceLockTable {
    entries: Arc<DashMap<String, Slot>>,
}

impl ResourceLockTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Suspends until exclusive access to `key` is granted.
    pub async fn lock(&self, key: impl Into<String>) -> ResourceGuard {
        let key = key.into();
        // The shard lock must be released before awaiting.
        let slot = {
            let entry = self
                .entries
                .entry(key.clone())
                .or_insert_with(|| Arc::new(Mutex::new(())));
            Arc::clone(entry.value())
        };

        debug!("Waiting for lock on {}", key);
        let guard = acquire(&key, slot).await;
        debug!("Lock granted on {}", key);

        ResourceGuard {
            key,
            guard: Some(guard),
            entries: Arc::clone(&self.entries),
        }
    }

    /// Diagnostic only: whether someone currently holds `key`.
    /// Must not drive control decisions.
    pub fn is_locked(&self, key: &str) -> bool {
        self.entries
            .get(key)
            .map(|slot| slot.try_lock().is_err())
            .unwrap_or(false)
    }

    /// Number of keys that are held or awaited.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(debug_assertions)]
async fn acquire(key: &str, slot: Slot) -> OwnedMutexGuard<()> {
    match tokio::time::timeout(DEBUG_LOCK_WAIT_LIMIT, slot.lock_owned()).await {
        Ok(guard) => guard,
        Err(_) => {
            tracing::error!("Lock on {} not granted after {:?}", key, DEBUG_LOCK_WAIT_LIMIT);
            panic!("deadlock on coordinator lock `{key}`");
        }
    }
}

#[cfg(not(debug_assertions))]
async fn acquire(_key: &str, slot: Slot) -> OwnedMutexGuard<()> {
    slot.lock_owned().await
}

/// Exclusive hold on one key of a [`ResourceLockTable`].
pub struct ResourceGuard {
    key: String,
    guard: Option<OwnedMutexGuard<()>>,
    entries: Arc<DashMap<String, Slot>>,
}

impl ResourceGuard {
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Releases the key and wakes the next waiter. Equivalent to dropping.
    pub fn unlock(self) {}
}

impl Drop for ResourceGuard {
    fn drop(&mut self) {
        drop(self.guard.take());
        // Only the map still references an idle slot; waiters hold clones.
        self.entries
            .remove_if(&self.key, |_, slot| Arc::strong_count(slot) == 1);
        debug!("Released lock on {}", self.key);
    }
}
