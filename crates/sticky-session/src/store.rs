//! Concurrent map of cache entries with time-ordered eviction.
//!
//! Entries live in a sharded map keyed by session id. Every `put` also files
//! the entry in an eviction schedule ordered by due time. The schedule is not
//! scrubbed when entries are removed; each scheduled item carries the
//! generation of the slot it was filed for, and items whose slot is gone or
//! has been replaced are skipped when they come due.

use std::collections::hash_map::RandomState;
use std::collections::{BTreeSet, HashMap};
use std::hash::BuildHasher;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, trace};

use crate::clock::{Clock, add_duration, elapsed_at_least};
use crate::entry::CacheEntry;
use crate::record::CachedSession;

/// Callback invoked with the last cached state of an entry removed from the cache.
pub type DestructionListener = Box<dyn Fn(&CachedSession) + Send + Sync>;

#[derive(Debug, Clone)]
struct Slot {
    generation: u64,
    entry: Arc<CacheEntry>,
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
struct ScheduledCleanup {
    at: DateTime<Utc>,
    id: String,
    generation: u64,
}

/// Cache entries keyed by session id.
pub struct SessionEntryStore {
    shards: Box<[RwLock<HashMap<String, Slot>>]>,
    hasher: RandomState,
    schedule: Mutex<BTreeSet<ScheduledCleanup>>,
    next_generation: AtomicU64,
    cleanup_after: RwLock<Duration>,
    clock: Arc<dyn Clock>,
    listeners: RwLock<Vec<DestructionListener>>,
}

impl SessionEntryStore {
    /// Create a store split into `concurrency` shards.
    pub fn new(concurrency: usize, cleanup_after: Duration, clock: Arc<dyn Clock>) -> Self {
        let shards = (0..concurrency.max(1))
            .map(|_| RwLock::new(HashMap::new()))
            .collect();
        Self {
            shards,
            hasher: RandomState::new(),
            schedule: Mutex::new(BTreeSet::new()),
            next_generation: AtomicU64::new(1),
            cleanup_after: RwLock::new(cleanup_after),
            clock,
            listeners: RwLock::new(Vec::new()),
        }
    }

    fn shard(&self, id: &str) -> &RwLock<HashMap<String, Slot>> {
        let index = self.hasher.hash_one(id) as usize % self.shards.len();
        &self.shards[index]
    }

    /// Idle period after which entries are dropped by [`cleanup`](Self::cleanup).
    pub fn cleanup_after(&self) -> Duration {
        *self.cleanup_after.read()
    }

    /// Change the eviction horizon.
    ///
    /// Entries already scheduled keep their due time; a longer horizon is
    /// honored when they come due, a shorter one only once that happens.
    pub fn set_cleanup_after(&self, period: Duration) {
        *self.cleanup_after.write() = period;
    }

    /// Register a listener for entries leaving the cache.
    pub fn on_destroy(&self, listener: impl Fn(&CachedSession) + Send + Sync + 'static) {
        self.listeners.write().push(Box::new(listener));
    }

    pub fn get(&self, id: &str) -> Option<Arc<CacheEntry>> {
        self.shard(id).read().get(id).map(|slot| Arc::clone(&slot.entry))
    }

    pub fn contains(&self, id: &str) -> bool {
        self.shard(id).read().contains_key(id)
    }

    /// Insert an entry under its current id and schedule it for eviction.
    pub fn put(&self, entry: Arc<CacheEntry>) {
        let id = entry.id();
        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        let at = add_duration(entry.last_accessed_time(), self.cleanup_after());

        let replaced = self.shard(&id).write().insert(
            id.clone(),
            Slot {
                generation,
                entry: Arc::clone(&entry),
            },
        );
        if let Some(previous) = replaced
            && !Arc::ptr_eq(&previous.entry, &entry)
        {
            previous.entry.mark_removed();
        }

        trace!(session_id = %id, cleanup_at = %at, "Scheduling cache cleanup");
        self.schedule.lock().insert(ScheduledCleanup { at, id, generation });
    }

    /// Remove an entry and notify destruction listeners.
    pub fn remove(&self, id: &str) -> Option<Arc<CacheEntry>> {
        let slot = self.shard(id).write().remove(id)?;
        self.retire(&slot.entry);
        Some(slot.entry)
    }

    /// Re-file `entry` from `old_id` under its current id, without treating
    /// it as removed.
    pub(crate) fn rekey(&self, old_id: &str, entry: &Arc<CacheEntry>) {
        {
            let mut shard = self.shard(old_id).write();
            if shard
                .get(old_id)
                .is_some_and(|slot| Arc::ptr_eq(&slot.entry, entry))
            {
                shard.remove(old_id);
            }
        }
        self.put(Arc::clone(entry));
    }

    fn remove_generation(&self, id: &str, generation: u64) -> Option<Arc<CacheEntry>> {
        let mut shard = self.shard(id).write();
        if shard.get(id).is_some_and(|slot| slot.generation == generation) {
            shard.remove(id).map(|slot| slot.entry)
        } else {
            None
        }
    }

    fn live_entry(&self, id: &str, generation: u64) -> Option<Arc<CacheEntry>> {
        self.shard(id)
            .read()
            .get(id)
            .filter(|slot| slot.generation == generation)
            .map(|slot| Arc::clone(&slot.entry))
    }

    fn retire(&self, entry: &CacheEntry) {
        entry.mark_removed();
        let listeners = self.listeners.read();
        if listeners.is_empty() {
            return;
        }
        let session = entry.snapshot();
        for listener in listeners.iter() {
            listener(&session);
        }
    }

    /// Remove every entry that has not been accessed for the eviction horizon.
    ///
    /// Returns the number of entries removed. This only drops the local copy;
    /// the remote store is untouched.
    pub fn cleanup(&self) -> usize {
        let now = self.clock.now();
        let cleanup_after = self.cleanup_after();
        let mut removed = 0;

        loop {
            let due = {
                let mut schedule = self.schedule.lock();
                match schedule.first() {
                    Some(first) if first.at <= now => schedule.pop_first(),
                    _ => None,
                }
            };
            let Some(due) = due else {
                break;
            };

            let Some(entry) = self.live_entry(&due.id, due.generation) else {
                continue;
            };

            if elapsed_at_least(entry.last_accessed_time(), now, cleanup_after) {
                if let Some(entry) = self.remove_generation(&due.id, due.generation) {
                    debug!(session_id = %due.id, "Cached session is outdated, removing from cache");
                    self.retire(&entry);
                    removed += 1;
                }
            } else {
                let at = add_duration(entry.last_accessed_time(), cleanup_after);
                trace!(
                    session_id = %due.id,
                    cleanup_at = %at,
                    "Session was accessed, rescheduling cleanup"
                );
                self.schedule.lock().insert(ScheduledCleanup {
                    at,
                    id: due.id,
                    generation: due.generation,
                });
            }
        }

        if removed > 0 {
            debug!(count = removed, "Cleaned up outdated sessions");
        }
        removed
    }

    /// Remove and return every entry, notifying listeners.
    pub fn drain(&self) -> Vec<Arc<CacheEntry>> {
        let mut drained = Vec::new();
        for shard in self.shards.iter() {
            let slots: Vec<Slot> = shard.write().drain().map(|(_, slot)| slot).collect();
            drained.extend(slots.into_iter().map(|slot| slot.entry));
        }
        self.schedule.lock().clear();
        for entry in &drained {
            self.retire(entry);
        }
        drained
    }

    /// Ids of all cached sessions.
    pub fn ids(&self) -> Vec<String> {
        self.shards
            .iter()
            .flat_map(|shard| shard.read().keys().cloned().collect::<Vec<_>>())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.shards.iter().map(|shard| shard.read().len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.shards.iter().all(|shard| shard.read().is_empty())
    }

    /// Number of items in the eviction schedule, including stale ones.
    pub fn scheduled(&self) -> usize {
        self.schedule.lock().len()
    }

    /// Run [`cleanup`](Self::cleanup) every `interval` until the store is dropped.
    pub fn spawn_cleanup_task(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let store: Weak<Self> = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The first tick completes immediately.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(store) = store.upgrade() else {
                    trace!("Entry store dropped, stopping cleanup task");
                    break;
                };
                store.cleanup();
            }
        })
    }
}

impl std::fmt::Debug for SessionEntryStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionEntryStore")
            .field("shards", &self.shards.len())
            .field("len", &self.len())
            .field("scheduled", &self.scheduled())
            .field("cleanup_after", &self.cleanup_after())
            .finish()
    }
}
