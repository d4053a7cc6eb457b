//! Per-session operation locks.
//!
//! Start, stop and restart of one session id must not interleave, or a stale
//! process handle could be overwritten while it is still alive. Operations on
//! different ids never contend.

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};

/// Async mutex per session id, created on first use.
#[derive(Default)]
pub struct SessionLocks {
    locks: DashMap<String, Arc<Mutex<()>>>,
}

impl SessionLocks {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock_for(&self, id: &str) -> Arc<Mutex<()>> {
        self.locks
            .entry(id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Wait for exclusive access to `id`.
    pub async fn acquire(&self, id: &str) -> OwnedMutexGuard<()> {
        self.lock_for(id).lock_owned().await
    }

    /// Exclusive access to `id` if nobody else holds it.
    pub fn try_acquire(&self, id: &str) -> Option<OwnedMutexGuard<()>> {
        self.lock_for(id).try_lock_owned().ok()
    }

    /// Drop the lock entry for `id` when nobody holds or waits on it.
    pub fn prune(&self, id: &str) {
        self.locks.remove_if(id, |_, lock| Arc::strong_count(lock) == 1);
    }

    pub fn len(&self) -> usize {
        self.locks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}
