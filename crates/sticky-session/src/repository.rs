//! The repository facade: local-first reads, write-back saves.

use std::sync::{Arc, Weak};

use chrono::{DateTime, Utc};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use crate::clock::{Clock, SystemClock, elapsed_at_least};
use crate::config::StickyConfig;
use crate::dispatch::{self, SaveDispatcher};
use crate::entry::CacheEntry;
use crate::error::Result;
use crate::events::SessionEvent;
use crate::lock_pool::KeyLockPool;
use crate::record::{CachedSession, SessionRecord};
use crate::remote::{RemoteSessionEvent, RemoteSessionStore, SessionEventPublisher};
use crate::store::SessionEntryStore;
use crate::view::SessionView;

/// Capacity of the lifecycle event channel.
pub const EVENT_CHANNEL_CAPACITY: usize = 256;

/// State shared by the repository, its views and the event relay.
pub(crate) struct RepositoryCore {
    pub(crate) remote: Arc<dyn RemoteSessionStore>,
    pub(crate) store: Arc<SessionEntryStore>,
    pub(crate) locks: KeyLockPool,
    pub(crate) dispatcher: Arc<dyn SaveDispatcher>,
    pub(crate) config: StickyConfig,
    pub(crate) clock: Arc<dyn Clock>,
    events: broadcast::Sender<SessionEvent>,
}

impl RepositoryCore {
    fn needs_revalidation(&self, entry: &CacheEntry, now: DateTime<Utc>) -> bool {
        match self.config.revalidate_after {
            Some(period) => elapsed_at_least(entry.last_accessed_time(), now, period),
            None => false,
        }
    }

    /// Load a session that is not usable from the cache.
    async fn load(&self, id: &str) -> Result<Option<Arc<CacheEntry>>> {
        let _guard = self.locks.lock(id).await;
        self.load_locked(id).await
    }

    /// Body of [`load`](Self::load); the caller holds the key lock.
    async fn load_locked(&self, id: &str) -> Result<Option<Arc<CacheEntry>>> {
        let now = self.clock.now();
        if let Some(entry) = self.store.get(id) {
            if !entry.is_expired_at(now) {
                trace!(session_id = %id, "Session was loaded concurrently");
                return Ok(Some(entry));
            }
            debug!(session_id = %id, "Cached session expired, removing from cache");
            self.store.remove(id);
        }

        trace!(session_id = %id, "Loading session from remote store");
        match self.remote.find_by_id(id).await? {
            Some(record) => Ok(self.cache_record(record, now)),
            None => {
                debug!(session_id = %id, "Session unknown to remote store");
                Ok(None)
            }
        }
    }

    fn cache_record(&self, record: SessionRecord, now: DateTime<Utc>) -> Option<Arc<CacheEntry>> {
        if record.is_expired_at(now) {
            debug!(session_id = %record.id(), "Remote session is expired, not caching");
            return None;
        }
        let entry = Arc::new(CacheEntry::new(record, false));
        self.store.put(Arc::clone(&entry));
        Some(entry)
    }

    /// Drop an entry whose session no longer exists as cached. Its pending
    /// writes are discarded.
    fn discard(&self, id: &str) {
        if let Some(entry) = self.store.remove(id) {
            entry.mark_deleted();
        }
    }

    /// Check a cached entry against the remote store.
    async fn revalidate(
        &self,
        id: &str,
        entry: Arc<CacheEntry>,
    ) -> Result<Option<Arc<CacheEntry>>> {
        let _guard = self.locks.lock(id).await;
        let now = self.clock.now();

        match self.store.get(id) {
            Some(current) if Arc::ptr_eq(&current, &entry) => {}
            Some(current) if !current.is_expired_at(now) => {
                trace!(session_id = %id, "Session was reloaded concurrently");
                return Ok(Some(current));
            }
            _ => return self.load_locked(id).await,
        }

        let (remote_last_accessed, mut fetched) = match self.remote.last_accessed_time_accessor() {
            Some(accessor) => match accessor.last_accessed_time(id).await {
                Ok(time) => (time, None),
                Err(err) => {
                    warn!(
                        session_id = %id,
                        error = %err,
                        "Revalidation failed, keeping cached session"
                    );
                    return Ok(Some(entry));
                }
            },
            None => match self.remote.find_by_id(id).await {
                Ok(record) => (record.as_ref().map(SessionRecord::last_accessed_time), record),
                Err(err) => {
                    warn!(
                        session_id = %id,
                        error = %err,
                        "Revalidation failed, keeping cached session"
                    );
                    return Ok(Some(entry));
                }
            },
        };

        let Some(remote_last_accessed) = remote_last_accessed else {
            if entry.awaits_remote_save() {
                trace!(session_id = %id, "Session not saved remotely yet, keeping cached copy");
                return Ok(Some(entry));
            }
            debug!(session_id = %id, "Session deleted remotely, removing from cache");
            self.discard(id);
            return Ok(None);
        };

        if let Some(record) = &fetched
            && record.is_expired_at(now)
        {
            debug!(session_id = %id, "Remote session expired, removing from cache");
            self.discard(id);
            return Ok(None);
        }

        if remote_last_accessed <= entry.last_accessed_time() {
            trace!(session_id = %id, "Cached session is up to date");
            return Ok(Some(entry));
        }

        debug!(
            session_id = %id,
            remote_last_accessed = %remote_last_accessed,
            "Session was used on another node, reloading"
        );
        if fetched.is_none() {
            fetched = match self.remote.find_by_id(id).await {
                Ok(record) => record,
                Err(err) => {
                    warn!(session_id = %id, error = %err, "Reload failed, keeping cached session");
                    return Ok(Some(entry));
                }
            };
        }

        self.discard(id);
        Ok(fetched.and_then(|record| self.cache_record(record, now)))
    }

    fn relay(self: &Arc<Self>, event: RemoteSessionEvent) {
        if event.origin != self.remote.origin() {
            warn!(
                session_id = %event.session_id,
                origin = %event.origin,
                "Ignoring session event from a foreign store"
            );
            return;
        }
        let Some(record) = event.session else {
            warn!(
                session_id = %event.session_id,
                kind = %event.kind,
                "Dropping session event without a session"
            );
            return;
        };

        let cached = self.store.get(&event.session_id);
        let session = match &cached {
            Some(entry) => entry.snapshot(),
            None => CachedSession::from(&record),
        };

        if event.kind.is_destroyed() {
            if cached.is_some() {
                debug!(
                    session_id = %event.session_id,
                    kind = %event.kind,
                    "Session destroyed remotely, removing from cache"
                );
                self.discard(&event.session_id);
            }
            self.discard_after_loads(&event.session_id);
        }

        if self.events.send(SessionEvent::new(event.kind, session)).is_err() {
            trace!(session_id = %event.session_id, "No subscribers for session event");
        }
    }

    /// Repeat the removal of a destroyed session under its key lock, so a
    /// load that fetched the record before the event cannot leave it cached.
    fn discard_after_loads(self: &Arc<Self>, id: &str) {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let core = Arc::clone(self);
        let id = id.to_string();
        runtime.spawn(async move {
            let _guard = core.locks.lock(&id).await;
            if core.store.contains(&id) {
                debug!(session_id = %id, "Destroyed session was reloaded concurrently, removing");
                core.discard(&id);
            }
        });
    }
}

/// Forwards remote store events to the repository while it is alive.
struct EventRelay {
    core: Weak<RepositoryCore>,
}

impl SessionEventPublisher for EventRelay {
    fn publish(&self, event: RemoteSessionEvent) {
        match self.core.upgrade() {
            Some(core) => core.relay(event),
            None => trace!(session_id = %event.session_id, "Repository dropped, ignoring event"),
        }
    }
}

/// Builder for [`StickySessionRepository`].
pub struct RepositoryBuilder {
    remote: Arc<dyn RemoteSessionStore>,
    config: StickyConfig,
    clock: Arc<dyn Clock>,
    dispatcher: Option<Arc<dyn SaveDispatcher>>,
    event_capacity: usize,
}

impl RepositoryBuilder {
    pub fn config(mut self, config: StickyConfig) -> Self {
        self.config = config;
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Use a custom dispatcher instead of the one selected by
    /// [`StickyConfig::save_dispatch`].
    pub fn dispatcher(mut self, dispatcher: Arc<dyn SaveDispatcher>) -> Self {
        self.dispatcher = Some(dispatcher);
        self
    }

    pub fn event_capacity(mut self, capacity: usize) -> Self {
        self.event_capacity = capacity.max(1);
        self
    }

    /// Validate the configuration and connect to the remote store's events.
    pub fn build(self) -> Result<StickySessionRepository> {
        self.config.validate()?;

        let dispatcher = self
            .dispatcher
            .unwrap_or_else(|| dispatch::from_config(&self.config.save_dispatch));
        let store = Arc::new(SessionEntryStore::new(
            self.config.concurrency,
            self.config.cleanup_after,
            Arc::clone(&self.clock),
        ));
        let (events, _) = broadcast::channel(self.event_capacity);

        let core = Arc::new(RepositoryCore {
            remote: self.remote,
            store,
            locks: KeyLockPool::new(self.config.concurrency),
            dispatcher,
            config: self.config,
            clock: self.clock,
            events,
        });
        core.remote.set_event_publisher(Arc::new(EventRelay {
            core: Arc::downgrade(&core),
        }));

        debug!(
            origin = %core.remote.origin(),
            config = ?core.config,
            "Sticky session repository ready"
        );
        Ok(StickySessionRepository { core })
    }
}

/// Session repository serving reads from a local cache and writing changes
/// back to a remote store.
///
/// Cloning is cheap; clones share the cache.
#[derive(Clone)]
pub struct StickySessionRepository {
    core: Arc<RepositoryCore>,
}

impl StickySessionRepository {
    pub fn builder(remote: Arc<dyn RemoteSessionStore>) -> RepositoryBuilder {
        RepositoryBuilder {
            remote,
            config: StickyConfig::default(),
            clock: Arc::new(SystemClock),
            dispatcher: None,
            event_capacity: EVENT_CHANNEL_CAPACITY,
        }
    }

    /// Build a repository with the default configuration.
    pub fn new(remote: Arc<dyn RemoteSessionStore>) -> Result<Self> {
        Self::builder(remote).build()
    }

    fn view(&self, entry: Arc<CacheEntry>) -> SessionView {
        SessionView::new(Arc::clone(&self.core), entry)
    }

    /// Create a new session. It reaches the remote store on its first save.
    pub async fn create(&self) -> Result<SessionView> {
        let record = self.core.remote.create_session().await?;
        let entry = Arc::new(CacheEntry::new(record, true));
        self.core.store.put(Arc::clone(&entry));
        debug!(session_id = %entry.id(), "Created session");
        Ok(self.view(entry))
    }

    /// Find a session, preferring the cached copy.
    ///
    /// Returns `Ok(None)` if the session does not exist or has expired.
    pub async fn find_by_id(&self, id: &str) -> Result<Option<SessionView>> {
        let now = self.core.clock.now();
        let entry = match self.core.store.get(id) {
            Some(entry) if !entry.is_expired_at(now) => {
                if self.core.needs_revalidation(&entry, now) {
                    self.core.revalidate(id, entry).await?
                } else {
                    trace!(session_id = %id, "Serving session from cache");
                    Some(entry)
                }
            }
            _ => self.core.load(id).await?,
        };
        Ok(entry.map(|entry| self.view(entry)))
    }

    /// Delete a session locally and remotely. Pending writes are dropped.
    pub async fn delete_by_id(&self, id: &str) -> Result<()> {
        let _guard = self.core.locks.lock(id).await;
        if let Some(entry) = self.core.store.remove(id) {
            entry.mark_deleted();
            entry.settle().await;
            debug!(session_id = %id, "Removed deleted session from cache");
        }
        self.core.remote.delete_by_id(id).await
    }

    /// Subscribe to session lifecycle events.
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.core.events.subscribe()
    }

    /// Drop cached sessions idle for longer than the eviction horizon.
    pub fn cleanup_outdated_entries(&self) -> usize {
        self.core.store.cleanup()
    }

    /// Run [`cleanup_outdated_entries`](Self::cleanup_outdated_entries) every
    /// configured cleanup interval.
    pub fn spawn_cleanup_task(&self) -> JoinHandle<()> {
        self.core
            .store
            .spawn_cleanup_task(self.core.config.cleanup_interval)
    }

    /// Write every cached session back, empty the cache and wait for queued
    /// writes.
    pub async fn shutdown(&self) {
        let entries = self.core.store.drain();
        info!(count = entries.len(), "Flushing cached sessions");
        for entry in entries {
            if let Err(err) = entry.persist(self.core.remote.as_ref()).await {
                warn!(session_id = %entry.id(), error = %err, "Failed to flush session");
            }
        }
        self.core.dispatcher.shutdown().await;
    }

    /// Cancel queued writes that have not started.
    pub fn abort(&self) {
        info!("Aborting pending session writes");
        self.core.dispatcher.abort();
    }

    pub fn config(&self) -> &StickyConfig {
        &self.core.config
    }

    pub fn store(&self) -> &Arc<SessionEntryStore> {
        &self.core.store
    }

    pub fn remote(&self) -> &Arc<dyn RemoteSessionStore> {
        &self.core.remote
    }
}

impl std::fmt::Debug for StickySessionRepository {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StickySessionRepository")
            .field("origin", &self.core.remote.origin())
            .field("config", &self.core.config)
            .field("cached", &self.core.store.len())
            .finish()
    }
}
