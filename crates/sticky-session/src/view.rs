//! Per-caller handle onto a cached session.
//!
//! A [`SessionView`] works on a private copy of the cached state and records
//! what it changes. Saving merges only those changes into the shared entry,
//! so concurrent views of one session do not overwrite each other's
//! untouched fields.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::Value;
use tracing::{debug, trace};

use crate::config::{FlushMode, SaveMode};
use crate::dispatch::SaveWork;
use crate::entry::{CacheEntry, Delta, MergeOutcome};
use crate::error::Result;
use crate::record::CachedSession;
use crate::repository::RepositoryCore;

/// A session as seen by one caller.
pub struct SessionView {
    core: Arc<RepositoryCore>,
    entry: Arc<CacheEntry>,
    session: CachedSession,
    /// Changed attributes; `None` marks a removal.
    changes: HashMap<String, Option<Value>>,
    /// Id of the entry when the view was created or last saved.
    original_id: String,
    original_last_accessed_time: DateTime<Utc>,
    original_max_inactive_interval: Option<Duration>,
}

impl SessionView {
    pub(crate) fn new(core: Arc<RepositoryCore>, entry: Arc<CacheEntry>) -> Self {
        let session = entry.snapshot();
        let changes = if core.config.save_mode == SaveMode::Always {
            session
                .attributes
                .iter()
                .map(|(name, value)| (name.clone(), Some(value.clone())))
                .collect()
        } else {
            HashMap::new()
        };

        Self {
            original_id: session.id.clone(),
            original_last_accessed_time: session.last_accessed_time,
            original_max_inactive_interval: session.max_inactive_interval,
            core,
            entry,
            session,
            changes,
        }
    }

    pub fn id(&self) -> &str {
        &self.session.id
    }

    pub fn creation_time(&self) -> DateTime<Utc> {
        self.session.creation_time
    }

    pub fn last_accessed_time(&self) -> DateTime<Utc> {
        self.session.last_accessed_time
    }

    pub fn max_inactive_interval(&self) -> Option<Duration> {
        self.session.max_inactive_interval
    }

    /// The view's current state, including unsaved changes.
    pub fn session(&self) -> &CachedSession {
        &self.session
    }

    pub fn is_expired(&self) -> bool {
        self.session.is_expired_at(self.core.clock.now())
    }

    /// Whether the shared entry has changes the remote store has not seen.
    pub fn awaits_remote_save(&self) -> bool {
        self.entry.awaits_remote_save()
    }

    /// Read an attribute. Under [`SaveMode::OnGetAttribute`] this marks it dirty.
    pub fn attribute(&mut self, name: &str) -> Option<&Value> {
        if self.core.config.save_mode == SaveMode::OnGetAttribute
            && let Some(value) = self.session.attributes.get(name)
        {
            self.changes.insert(name.to_string(), Some(value.clone()));
        }
        self.session.attributes.get(name)
    }

    pub fn attribute_names(&self) -> impl Iterator<Item = &str> {
        self.session.attributes.keys().map(String::as_str)
    }

    pub async fn set_attribute(
        &mut self,
        name: impl Into<String>,
        value: impl Into<Value>,
    ) -> Result<()> {
        let name = name.into();
        let value = value.into();
        self.session.attributes.insert(name.clone(), value.clone());
        self.changes.insert(name, Some(value));
        self.flush_if_immediate().await
    }

    pub async fn remove_attribute(&mut self, name: &str) -> Result<()> {
        self.session.attributes.remove(name);
        self.changes.insert(name.to_string(), None);
        self.flush_if_immediate().await
    }

    pub async fn set_last_accessed_time(&mut self, time: DateTime<Utc>) -> Result<()> {
        self.session.last_accessed_time = time;
        self.flush_if_immediate().await
    }

    /// Mark the session as accessed now.
    pub async fn touch(&mut self) -> Result<()> {
        let now = self.core.clock.now();
        self.set_last_accessed_time(now).await
    }

    /// `None` means the session never expires.
    pub async fn set_max_inactive_interval(&mut self, interval: Option<Duration>) -> Result<()> {
        self.session.max_inactive_interval = interval;
        self.flush_if_immediate().await
    }

    /// Give the session a new random id. Takes effect in the cache and the
    /// remote store on the next [`save`](Self::save).
    pub fn change_session_id(&mut self) -> String {
        let new_id = uuid::Uuid::new_v4().to_string();
        self.session.id = new_id.clone();
        new_id
    }

    /// Whether the view has changes not yet merged into the cache.
    pub fn has_changes(&self) -> bool {
        !self.changes.is_empty()
            || self.session.id != self.original_id
            || self.session.last_accessed_time != self.original_last_accessed_time
            || self.session.max_inactive_interval != self.original_max_inactive_interval
    }

    /// Merge this view's changes into the cache and hand the write to the
    /// configured dispatcher.
    pub async fn save(&mut self) -> Result<()> {
        if self.session.id != self.original_id {
            self.rotate_id().await?;
        }

        let delta = self.take_delta();
        match self.entry.merge(&delta) {
            MergeOutcome::Discarded | MergeOutcome::Clean => Ok(()),
            MergeOutcome::Pending => {
                let entry = Arc::clone(&self.entry);
                let remote = Arc::clone(&self.core.remote);
                let work: SaveWork = Box::pin(async move { entry.persist(remote.as_ref()).await });
                self.core
                    .dispatcher
                    .queue_save(&self.session.id, work)
                    .await
            }
        }
    }

    async fn flush_if_immediate(&mut self) -> Result<()> {
        if self.core.config.flush_mode == FlushMode::Immediate {
            self.save().await
        } else {
            Ok(())
        }
    }

    /// Move the shared entry to this view's new id before anything else is
    /// written, so no buffered write lands on the superseded handle.
    async fn rotate_id(&mut self) -> Result<()> {
        let new_id = self.session.id.clone();
        // Another view may move the entry while we wait for its key.
        let (current_id, _guard) = loop {
            let current_id = self.entry.id();
            let guard = self.core.locks.lock(&current_id).await;
            if self.entry.id() == current_id {
                break (current_id, guard);
            }
            trace!(session_id = %current_id, "Session was rotated concurrently, retrying");
        };

        if self.entry.is_removed() {
            debug!(session_id = %current_id, "Session left the cache, not rotating its id");
        } else {
            let old_id = self
                .entry
                .rotate_id(&new_id, self.core.remote.as_ref())
                .await?;
            self.core.store.rekey(&old_id, &self.entry);
        }

        self.original_id = new_id;
        Ok(())
    }

    fn take_delta(&mut self) -> Delta {
        let mut delta = Delta {
            attributes: std::mem::take(&mut self.changes),
            ..Delta::default()
        };
        if self.session.last_accessed_time != self.original_last_accessed_time {
            delta.last_accessed_time = Some(self.session.last_accessed_time);
            self.original_last_accessed_time = self.session.last_accessed_time;
        }
        if self.session.max_inactive_interval != self.original_max_inactive_interval {
            delta.max_inactive_interval = Some(self.session.max_inactive_interval);
            self.original_max_inactive_interval = self.session.max_inactive_interval;
        }
        delta
    }
}

impl std::fmt::Debug for SessionView {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionView")
            .field("session", &self.session)
            .field("changes", &self.changes)
            .field("original_id", &self.original_id)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{Clock, ManualClock};
    use crate::config::{SaveDispatch, StickyConfig};
    use crate::memory::InMemorySessionStore;
    use crate::record::SessionRecord;
    use crate::repository::StickySessionRepository;
    use serde_json::json;

    fn setup(save_mode: SaveMode) -> (Arc<InMemorySessionStore>, StickySessionRepository) {
        let clock = ManualClock::starting_now();
        let remote = Arc::new(InMemorySessionStore::with_clock(clock.clone()));
        remote.insert(
            SessionRecord::with_id("s1", clock.now())
                .with_attribute("a", 1)
                .with_attribute("b", 2),
        );
        let repo = StickySessionRepository::builder(remote.clone())
            .config(
                StickyConfig::new()
                    .with_save_dispatch(SaveDispatch::Synchronous)
                    .with_save_mode(save_mode),
            )
            .clock(clock)
            .build()
            .unwrap();
        (remote, repo)
    }

    #[tokio::test]
    async fn test_has_changes_tracks_mutations() {
        let (_remote, repo) = setup(SaveMode::OnSetAttribute);
        let mut view = repo.find_by_id("s1").await.unwrap().unwrap();
        assert!(!view.has_changes());

        view.set_attribute("c", 3).await.unwrap();
        assert!(view.has_changes());
        view.save().await.unwrap();
        assert!(!view.has_changes());

        view.set_max_inactive_interval(None).await.unwrap();
        assert!(view.has_changes());
    }

    #[tokio::test]
    async fn test_unchanged_view_does_not_write() {
        let (remote, repo) = setup(SaveMode::OnSetAttribute);
        let mut view = repo.find_by_id("s1").await.unwrap().unwrap();
        let _ = view.attribute("a");
        view.save().await.unwrap();
        assert_eq!(remote.calls().saves(), 0);
    }

    #[tokio::test]
    async fn test_always_mode_rewrites_every_attribute() {
        let (remote, repo) = setup(SaveMode::Always);
        let mut stale = repo.find_by_id("s1").await.unwrap().unwrap();
        let mut fresh = repo.find_by_id("s1").await.unwrap().unwrap();

        fresh.set_attribute("b", 20).await.unwrap();
        fresh.save().await.unwrap();
        stale.save().await.unwrap();

        let stored = remote.get("s1").unwrap();
        assert_eq!(stored.attribute("a"), Some(&json!(1)));
        assert_eq!(stored.attribute("b"), Some(&json!(2)));
        assert_eq!(remote.calls().saves(), 2);
    }

    #[tokio::test]
    async fn test_removed_attribute_reaches_cache() {
        let (_remote, repo) = setup(SaveMode::OnSetAttribute);
        let mut view = repo.find_by_id("s1").await.unwrap().unwrap();
        view.remove_attribute("a").await.unwrap();
        assert_eq!(view.attribute_names().count(), 1);
        view.save().await.unwrap();

        let again = repo.find_by_id("s1").await.unwrap().unwrap();
        assert_eq!(again.session().attribute("a"), None);
        assert_eq!(again.session().attribute("b"), Some(&json!(2)));
    }

    #[tokio::test]
    async fn test_concurrent_rotations_settle_on_one_id() {
        let clock = ManualClock::starting_now();
        let remote = Arc::new(
            InMemorySessionStore::with_clock(clock.clone())
                .with_latency(std::time::Duration::from_millis(10)),
        );
        remote.insert(SessionRecord::with_id("s1", clock.now()));
        let repo = StickySessionRepository::builder(remote.clone())
            .config(StickyConfig::new().with_save_dispatch(SaveDispatch::Synchronous))
            .clock(clock)
            .build()
            .unwrap();

        let mut first = repo.find_by_id("s1").await.unwrap().unwrap();
        let mut second = repo.find_by_id("s1").await.unwrap().unwrap();
        let first_id = first.change_session_id();
        let second_id = second.change_session_id();

        let (a, b) = tokio::join!(first.save(), second.save());
        a.unwrap();
        b.unwrap();

        let ids = repo.store().ids();
        assert_eq!(ids.len(), 1);
        let entry = repo.store().get(&ids[0]).unwrap();
        assert_eq!(entry.id(), ids[0]);
        assert!(ids[0] == first_id || ids[0] == second_id);

        assert_eq!(remote.len(), 1);
        assert!(remote.get(&ids[0]).is_some());
        assert!(remote.get("s1").is_none());
    }
}
