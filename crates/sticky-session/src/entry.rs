//! The shared cache entry for one session.

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde_json::Value;
use tracing::{debug, trace};

use crate::error::Result;
use crate::record::{CachedSession, SessionRecord};
use crate::remote::RemoteSessionStore;

/// Changes accumulated by a view since it was created or last saved.
#[derive(Debug, Clone, Default, PartialEq)]
pub(crate) struct Delta {
    /// `None` marks a removed attribute.
    pub attributes: HashMap<String, Option<Value>>,
    pub last_accessed_time: Option<DateTime<Utc>>,
    pub max_inactive_interval: Option<Option<Duration>>,
}

impl Delta {
    pub fn is_empty(&self) -> bool {
        self.attributes.is_empty()
            && self.last_accessed_time.is_none()
            && self.max_inactive_interval.is_none()
    }
}

/// What a merge did to the entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum MergeOutcome {
    /// The entry has been removed from the cache; the changes were dropped.
    Discarded,
    /// Nothing needs to be written.
    Clean,
    /// The remote handle has unsaved changes.
    Pending,
}

#[derive(Debug)]
struct EntryState {
    cached: CachedSession,
    remote: SessionRecord,
    awaits_remote_save: bool,
    /// Bumped by every merge, so a write can tell whether it saw the latest state.
    revision: u64,
    removed: bool,
    deleted: bool,
}

/// Cached state of one session plus the remote handle used to write it back.
#[derive(Debug)]
pub struct CacheEntry {
    state: Mutex<EntryState>,
    /// Serializes remote writes of this entry.
    save_lock: tokio::sync::Mutex<()>,
}

impl CacheEntry {
    /// Wrap a remote record. `awaits_remote_save` is true for records the
    /// remote store has not persisted yet.
    pub fn new(remote: SessionRecord, awaits_remote_save: bool) -> Self {
        Self {
            state: Mutex::new(EntryState {
                cached: CachedSession::from(&remote),
                remote,
                awaits_remote_save,
                revision: 0,
                removed: false,
                deleted: false,
            }),
            save_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub fn id(&self) -> String {
        self.state.lock().cached.id.clone()
    }

    pub fn last_accessed_time(&self) -> DateTime<Utc> {
        self.state.lock().cached.last_accessed_time
    }

    /// Whether merged changes have not reached the remote store yet.
    pub fn awaits_remote_save(&self) -> bool {
        self.state.lock().awaits_remote_save
    }

    /// Copy of the cached state.
    pub fn snapshot(&self) -> CachedSession {
        self.state.lock().cached.clone()
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.state.lock().cached.is_expired_at(now)
    }

    pub(crate) fn is_removed(&self) -> bool {
        self.state.lock().removed
    }

    pub(crate) fn mark_removed(&self) {
        self.state.lock().removed = true;
    }

    /// Mark the session as gone remotely. Pending writes become no-ops so they
    /// cannot bring it back.
    pub(crate) fn mark_deleted(&self) {
        let mut state = self.state.lock();
        state.removed = true;
        state.deleted = true;
    }

    /// Apply a view's delta to the cached state and the remote handle.
    pub(crate) fn merge(&self, delta: &Delta) -> MergeOutcome {
        let mut state = self.state.lock();

        if state.removed {
            debug!(
                session_id = %state.cached.id,
                "Discarding changes to a session no longer in the cache"
            );
            return MergeOutcome::Discarded;
        }

        if !delta.is_empty() {
            for (name, value) in &delta.attributes {
                match value {
                    Some(value) => {
                        state.cached.attributes.insert(name.clone(), value.clone());
                        state.remote.set_attribute(name.clone(), value.clone());
                    }
                    None => {
                        state.cached.attributes.remove(name);
                        state.remote.remove_attribute(name);
                    }
                }
            }
            if let Some(time) = delta.last_accessed_time {
                state.cached.last_accessed_time = time;
                state.remote.set_last_accessed_time(time);
            }
            if let Some(interval) = delta.max_inactive_interval {
                state.cached.max_inactive_interval = interval;
                state.remote.set_max_inactive_interval(interval);
            }
            state.awaits_remote_save = true;
            state.revision += 1;
        }

        if state.awaits_remote_save {
            MergeOutcome::Pending
        } else {
            MergeOutcome::Clean
        }
    }

    /// Write the remote handle if it has unsaved changes.
    pub(crate) async fn persist(&self, remote: &dyn RemoteSessionStore) -> Result<()> {
        let _save = self.save_lock.lock().await;
        self.persist_locked(remote).await
    }

    /// Body of [`persist`](Self::persist); the caller holds `save_lock`.
    async fn persist_locked(&self, remote: &dyn RemoteSessionStore) -> Result<()> {
        let (record, revision) = {
            let state = self.state.lock();
            if state.deleted || !state.awaits_remote_save {
                trace!(session_id = %state.cached.id, "Nothing to save");
                return Ok(());
            }
            (state.remote.clone(), state.revision)
        };

        debug!(session_id = %record.id(), "Saving remote session");
        remote.save(&record).await?;

        let mut state = self.state.lock();
        if state.revision == revision {
            state.awaits_remote_save = false;
        }
        if record.original_id().is_some() && state.remote.original_id() == record.original_id() {
            state.remote.clear_original_id();
        }
        Ok(())
    }

    /// Wait for a write already in flight to finish.
    pub(crate) async fn settle(&self) {
        let _save = self.save_lock.lock().await;
    }

    /// Move the entry to `new_id`.
    ///
    /// Any pending write is flushed first, on the caller's task, so it lands
    /// on the handle it was merged into. Returns the previous id.
    pub(crate) async fn rotate_id(
        &self,
        new_id: &str,
        remote: &dyn RemoteSessionStore,
    ) -> Result<String> {
        let _save = self.save_lock.lock().await;
        self.persist_locked(remote).await?;

        let mut state = self.state.lock();
        let old_id = std::mem::replace(&mut state.cached.id, new_id.to_string());
        state.remote.rename(new_id.to_string());
        state.awaits_remote_save = true;
        state.revision += 1;
        debug!(old_id = %old_id, new_id = %new_id, "Rotated session id");
        Ok(old_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::InMemorySessionStore;
    use serde_json::json;

    fn delta_with(name: &str, value: Option<Value>) -> Delta {
        let mut delta = Delta::default();
        delta.attributes.insert(name.to_string(), value);
        delta
    }

    #[test]
    fn test_merge_updates_cached_and_remote() {
        let record = SessionRecord::with_id("s1", Utc::now()).with_attribute("a", 1);
        let entry = CacheEntry::new(record, false);

        let mut delta = delta_with("b", Some(json!(2)));
        delta.attributes.insert("a".to_string(), None);
        assert_eq!(entry.merge(&delta), MergeOutcome::Pending);

        let state = entry.state.lock();
        assert_eq!(state.cached.attribute("b"), Some(&json!(2)));
        assert_eq!(state.cached.attribute("a"), None);
        assert_eq!(state.remote.attribute("b"), Some(&json!(2)));
        assert_eq!(state.remote.attribute("a"), None);
        assert!(state.awaits_remote_save);
    }

    #[test]
    fn test_empty_merge_is_clean() {
        let entry = CacheEntry::new(SessionRecord::with_id("s1", Utc::now()), false);
        assert_eq!(entry.merge(&Delta::default()), MergeOutcome::Clean);

        let entry = CacheEntry::new(SessionRecord::with_id("s2", Utc::now()), true);
        assert_eq!(entry.merge(&Delta::default()), MergeOutcome::Pending);
    }

    #[test]
    fn test_merge_into_removed_entry_discarded() {
        let entry = CacheEntry::new(SessionRecord::with_id("s1", Utc::now()), false);
        entry.mark_removed();
        assert_eq!(
            entry.merge(&delta_with("a", Some(json!(1)))),
            MergeOutcome::Discarded
        );
        assert!(entry.snapshot().attributes.is_empty());
    }

    #[tokio::test]
    async fn test_persist_clears_pending_and_is_idempotent() {
        let store = InMemorySessionStore::new();
        let entry = CacheEntry::new(SessionRecord::with_id("s1", Utc::now()), false);
        entry.merge(&delta_with("a", Some(json!(1))));

        entry.persist(&store).await.unwrap();
        entry.persist(&store).await.unwrap();

        assert!(!entry.awaits_remote_save());
        assert_eq!(store.calls().saves(), 1);
        assert_eq!(
            store.get("s1").unwrap().attribute("a"),
            Some(&json!(1))
        );
    }

    #[tokio::test]
    async fn test_persist_failure_keeps_pending() {
        let store = InMemorySessionStore::new();
        store.set_unreachable(true);
        let entry = CacheEntry::new(SessionRecord::with_id("s1", Utc::now()), false);
        entry.merge(&delta_with("a", Some(json!(1))));

        assert!(entry.persist(&store).await.is_err());
        assert!(entry.awaits_remote_save());
    }

    #[tokio::test]
    async fn test_deleted_entry_is_not_persisted() {
        let store = InMemorySessionStore::new();
        let entry = CacheEntry::new(SessionRecord::with_id("s1", Utc::now()), true);
        entry.mark_deleted();

        entry.persist(&store).await.unwrap();
        assert_eq!(store.calls().saves(), 0);
        assert!(store.get("s1").is_none());
    }

    #[tokio::test]
    async fn test_rotate_flushes_pending_then_renames() {
        let store = InMemorySessionStore::new();
        let entry = CacheEntry::new(SessionRecord::with_id("old", Utc::now()), false);
        entry.merge(&delta_with("a", Some(json!(1))));

        let previous = entry.rotate_id("new", &store).await.unwrap();
        assert_eq!(previous, "old");
        assert_eq!(entry.id(), "new");
        assert_eq!(store.calls().saves(), 1);
        assert!(store.get("old").is_some());

        entry.persist(&store).await.unwrap();
        assert_eq!(store.calls().saves(), 2);
        assert!(store.get("old").is_none());
        assert_eq!(store.get("new").unwrap().attribute("a"), Some(&json!(1)));
        assert_eq!(entry.state.lock().remote.original_id(), None);
    }
}
