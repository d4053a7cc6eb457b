//! The session registry.
//!
//! Every read or write of session state goes through one mutex covering the
//! whole map. The working set is bounded by the concurrency cap, so a single
//! critical section costs nothing and keeps phase, slot flag and handles
//! consistent with each other. Callers must never block inside a closure passed
//! here: copy what the I/O needs out, do the I/O, write the result back.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;

use super::record::{SessionRecord, SessionSnapshot};

pub(crate) type SessionMap = HashMap<String, SessionRecord>;

/// Concurrency-safe map of session id to [`SessionRecord`].
#[derive(Default)]
pub struct SessionRegistry {
    sessions: Mutex<SessionMap>,
    generations: AtomicU64,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy of the record for `id`.
    pub fn get(&self, id: &str) -> Option<SessionSnapshot> {
        self.sessions.lock().get(id).map(SessionRecord::snapshot)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.sessions.lock().contains_key(id)
    }

    /// Generation of the record for `id`, if present.
    pub fn generation_of(&self, id: &str) -> Option<u64> {
        self.sessions.lock().get(id).map(|r| r.generation)
    }

    /// Mutate an existing record. Returns `None` when `id` is unknown.
    pub fn update<R>(&self, id: &str, mutate: impl FnOnce(&mut SessionRecord) -> R) -> Option<R> {
        self.sessions.lock().get_mut(id).map(mutate)
    }

    /// Mutate the record for `id`, creating it with `init` first if absent.
    pub fn upsert<R>(
        &self,
        id: &str,
        init: impl FnOnce() -> SessionRecord,
        mutate: impl FnOnce(&mut SessionRecord) -> R,
    ) -> R {
        let mut sessions = self.sessions.lock();
        let record = sessions.entry(id.to_string()).or_insert_with(init);
        mutate(record)
    }

    /// Remove and return the record.
    ///
    /// Dropping the returned record kills its pipeline without waiting; prefer
    /// [`PipelineLauncher::stop`](crate::launcher::PipelineLauncher::stop).
    pub fn remove(&self, id: &str) -> Option<SessionRecord> {
        self.sessions.lock().remove(id)
    }

    /// Copies of every record.
    pub fn snapshot(&self) -> Vec<(String, SessionSnapshot)> {
        self.sessions
            .lock()
            .iter()
            .map(|(id, record)| (id.clone(), record.snapshot()))
            .collect()
    }

    pub fn ids(&self) -> Vec<String> {
        self.sessions.lock().keys().cloned().collect()
    }

    /// Number of records holding a concurrency slot.
    pub fn running_count(&self) -> usize {
        self.sessions.lock().values().filter(|r| r.running).count()
    }

    pub fn len(&self) -> usize {
        self.sessions.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.lock().is_empty()
    }

    /// Allocate a generation number for a new admission or restart.
    pub fn next_generation(&self) -> u64 {
        self.generations.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Run `f` with exclusive access to the whole map.
    ///
    /// For multi-record decisions that must be atomic (admission, sweeps).
    pub(crate) fn with_sessions<R>(&self, f: impl FnOnce(&mut SessionMap) -> R) -> R {
        f(&mut self.sessions.lock())
    }
}
