//! Pending update queue.
//!
//! A deduplicated map of composite key → [`PendingUpdate`]. Every operation
//! holds the mutex only for the map mutation itself; persisting the queue is
//! the caller's job and happens after the lock is released.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use log::debug;

use crate::types::PendingUpdate;

#[derive(Debug, Default)]
pub struct PendingQueue {
    entries: Mutex<HashMap<String, PendingUpdate>>,
}

impl PendingQueue {
    pub fn new() -> Self {
        Self::default()
    }

    fn entries(&self) -> MutexGuard<'_, HashMap<String, PendingUpdate>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Inserts or replaces the entry for the update's key. Returns the
    /// superseded entry, if any.
    pub fn add(&self, update: PendingUpdate) -> Option<PendingUpdate> {
        let key = update.key();
        let previous = self.entries().insert(key.clone(), update);
        if previous.is_some() {
            debug!("Replaced pending update for {}", key);
        }
        previous
    }

    pub fn get(&self, key: &str) -> Option<PendingUpdate> {
        self.entries().get(key).cloned()
    }

    /// All entries ordered by key.
    pub fn list(&self) -> Vec<PendingUpdate> {
        let mut updates: Vec<PendingUpdate> = self.entries().values().cloned().collect();
        updates.sort_by_key(PendingUpdate::key);
        updates
    }

    /// Removes and returns the entry. The caller must `add` it back if the
    /// dispatch reports the container busy.
    pub fn approve(&self, key: &str) -> Option<PendingUpdate> {
        self.entries().remove(key)
    }

    pub fn remove(&self, key: &str) -> bool {
        self.entries().remove(key).is_some()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries().contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries().is_empty()
    }

    /// Loads entries restored from the settings store, keeping anything
    /// already queued under the same key.
    pub fn restore(&self, updates: Vec<PendingUpdate>) -> usize {
        let mut entries = self.entries();
        let mut restored = 0;
        for update in updates {
            if let std::collections::hash_map::Entry::Vacant(slot) = entries.entry(update.key()) {
                slot.insert(update);
                restored += 1;
            }
        }
        restored
    }
}
