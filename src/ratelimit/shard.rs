//! One partition of the limiter's key space.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tracing::debug;

use super::entry::Entry;

pub(crate) type SharedEntry = Arc<Mutex<Entry>>;

/// Map from key hash to entry, guarded by its own lock.
///
/// The shard lock covers the map structure only. Entry state is guarded by
/// each entry's mutex, which callers take after releasing the shard lock.
/// When both are held, the shard lock is always taken first.
#[derive(Debug)]
pub(crate) struct Shard {
    entries: RwLock<HashMap<u64, SharedEntry>>,
    capacity: Option<usize>,
    accesses: AtomicU64,
}

impl Shard {
    pub(crate) fn new(capacity: Option<usize>) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            capacity,
            accesses: AtomicU64::new(0),
        }
    }

    /// Next access stamp. Stamps order every check made against this shard.
    pub(crate) fn next_stamp(&self) -> u64 {
        self.accesses.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub(crate) fn get(&self, hash: u64) -> Option<SharedEntry> {
        self.entries.read().get(&hash).cloned()
    }

    /// Fetch the entry for `hash`, inserting one built by `create` if absent.
    ///
    /// `now` decides which entries are stale when the shard is at capacity.
    pub(crate) fn get_or_insert_with<F>(&self, hash: u64, now: u64, create: F) -> SharedEntry
    where
        F: FnOnce() -> Entry,
    {
        if let Some(entry) = self.get(hash) {
            return entry;
        }

        let mut entries = self.entries.write();
        // Another caller may have inserted between the read and write locks.
        if let Some(entry) = entries.get(&hash) {
            return Arc::clone(entry);
        }

        if let Some(capacity) = self.capacity {
            if entries.len() >= capacity {
                Self::make_room(&mut entries, capacity, now);
            }
        }

        let entry = Arc::new(Mutex::new(create()));
        entries.insert(hash, Arc::clone(&entry));
        entry
    }

    /// Evict stale entries, then the least recently accessed one if still full.
    fn make_room(entries: &mut HashMap<u64, SharedEntry>, capacity: usize, now: u64) {
        let evicted = Self::retain_fresh(entries, now);
        if entries.len() < capacity {
            debug!(evicted, "Evicted stale entries to make room");
            return;
        }

        let oldest = entries
            .iter()
            .min_by_key(|(_, entry)| entry.lock().last_access())
            .map(|(hash, _)| *hash);

        if let Some(hash) = oldest {
            if let Some(entry) = entries.remove(&hash) {
                entry.lock().mark_evicted();
                debug!(hash, "Evicted least recently accessed entry");
            }
        }
    }

    fn retain_fresh(entries: &mut HashMap<u64, SharedEntry>, now: u64) -> usize {
        let before = entries.len();
        entries.retain(|_, entry| {
            let mut entry = entry.lock();
            if entry.is_stale(now) {
                entry.mark_evicted();
                false
            } else {
                true
            }
        });
        before - entries.len()
    }

    /// Remove every stale entry. Returns how many were removed.
    pub(crate) fn evict_stale(&self, now: u64) -> usize {
        let mut entries = self.entries.write();
        Self::retain_fresh(&mut entries, now)
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub(crate) fn clear(&self) {
        let mut entries = self.entries.write();
        for entry in entries.values() {
            entry.lock().mark_evicted();
        }
        entries.clear();
    }
}
