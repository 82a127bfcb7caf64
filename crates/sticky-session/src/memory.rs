//! In-process remote store.
//!
//! [`InMemorySessionStore`] implements the remote store contracts on a plain
//! map. It counts every call and can simulate latency, outages and lifecycle
//! events, which makes it the reference backend for exercising the cache.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};

use crate::clock::{Clock, SystemClock};
use crate::error::{Error, Result};
use crate::events::SessionEventKind;
use crate::record::SessionRecord;
use crate::remote::{
    LastAccessedTimeAccessor, RemoteSessionEvent, RemoteSessionStore, SessionEventPublisher,
};

/// Number of calls made to each store operation.
#[derive(Debug, Default)]
pub struct CallCounts {
    creates: AtomicUsize,
    finds: AtomicUsize,
    saves: AtomicUsize,
    deletes: AtomicUsize,
    last_accessed_lookups: AtomicUsize,
}

impl CallCounts {
    pub fn creates(&self) -> usize {
        self.creates.load(Ordering::SeqCst)
    }

    pub fn finds(&self) -> usize {
        self.finds.load(Ordering::SeqCst)
    }

    pub fn saves(&self) -> usize {
        self.saves.load(Ordering::SeqCst)
    }

    pub fn deletes(&self) -> usize {
        self.deletes.load(Ordering::SeqCst)
    }

    pub fn last_accessed_lookups(&self) -> usize {
        self.last_accessed_lookups.load(Ordering::SeqCst)
    }
}

/// A remote session store kept in memory.
pub struct InMemorySessionStore {
    origin: String,
    sessions: Mutex<HashMap<String, SessionRecord>>,
    clock: Arc<dyn Clock>,
    calls: CallCounts,
    accessor_enabled: bool,
    latency: Option<Duration>,
    unreachable: AtomicBool,
    publisher: RwLock<Option<Arc<dyn SessionEventPublisher>>>,
}

impl InMemorySessionStore {
    /// Create an empty store using the system clock.
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    /// Create an empty store stamping new records with `clock`.
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            origin: format!("memory-{}", uuid::Uuid::new_v4()),
            sessions: Mutex::new(HashMap::new()),
            clock,
            calls: CallCounts::default(),
            accessor_enabled: true,
            latency: None,
            unreachable: AtomicBool::new(false),
            publisher: RwLock::new(None),
        }
    }

    /// Do not offer a [`LastAccessedTimeAccessor`], forcing full loads on revalidation.
    pub fn without_last_accessed_accessor(mut self) -> Self {
        self.accessor_enabled = false;
        self
    }

    /// Delay every remote call by `latency`.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    /// Make every call fail until switched back.
    pub fn set_unreachable(&self, unreachable: bool) {
        self.unreachable.store(unreachable, Ordering::SeqCst);
    }

    pub fn calls(&self) -> &CallCounts {
        &self.calls
    }

    /// Store a record directly, bypassing call counting.
    pub fn insert(&self, record: SessionRecord) {
        self.sessions.lock().insert(record.id().to_string(), record);
    }

    /// Read a record directly, bypassing call counting.
    pub fn get(&self, id: &str) -> Option<SessionRecord> {
        self.sessions.lock().get(id).cloned()
    }

    /// Remove a record directly, without emitting an event.
    pub fn forget(&self, id: &str) -> Option<SessionRecord> {
        self.sessions.lock().remove(id)
    }

    /// Simulate another node touching a session.
    pub fn touch(&self, id: &str, last_accessed_time: DateTime<Utc>) -> bool {
        match self.sessions.lock().get_mut(id) {
            Some(record) => {
                record.set_last_accessed_time(last_accessed_time);
                true
            }
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        self.sessions.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Emit a lifecycle event as this store.
    pub fn emit(&self, kind: SessionEventKind, id: &str) {
        let session = self.get(id);
        self.emit_event(RemoteSessionEvent::new(self.origin.clone(), kind, id, session));
    }

    /// Emit an arbitrary event to the installed publisher.
    pub fn emit_event(&self, event: RemoteSessionEvent) {
        let publisher = self.publisher.read().clone();
        if let Some(publisher) = publisher {
            publisher.publish(event);
        }
    }

    /// Remove a session and announce that it expired.
    pub fn expire(&self, id: &str) {
        if let Some(record) = self.forget(id) {
            self.emit_event(RemoteSessionEvent::new(
                self.origin.clone(),
                SessionEventKind::Expired,
                id,
                Some(record),
            ));
        }
    }

    async fn call(&self, counter: &AtomicUsize) -> Result<()> {
        counter.fetch_add(1, Ordering::SeqCst);
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
        if self.unreachable.load(Ordering::SeqCst) {
            return Err(Error::remote(format!("{} is unreachable", self.origin)));
        }
        Ok(())
    }
}

impl Default for InMemorySessionStore {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for InMemorySessionStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemorySessionStore")
            .field("origin", &self.origin)
            .field("sessions", &self.len())
            .field("calls", &self.calls)
            .finish()
    }
}

#[async_trait]
impl RemoteSessionStore for InMemorySessionStore {
    fn origin(&self) -> &str {
        &self.origin
    }

    async fn create_session(&self) -> Result<SessionRecord> {
        self.call(&self.calls.creates).await?;
        Ok(SessionRecord::new(self.clock.now()))
    }

    async fn find_by_id(&self, id: &str) -> Result<Option<SessionRecord>> {
        self.call(&self.calls.finds).await?;
        Ok(self.get(id))
    }

    async fn save(&self, session: &SessionRecord) -> Result<()> {
        self.call(&self.calls.saves).await?;

        let mut record = session.clone();
        let mut sessions = self.sessions.lock();
        if let Some(original_id) = record.original_id()
            && original_id != record.id()
        {
            sessions.remove(original_id);
        }
        record.clear_original_id();
        sessions.insert(record.id().to_string(), record);
        Ok(())
    }

    async fn delete_by_id(&self, id: &str) -> Result<()> {
        self.call(&self.calls.deletes).await?;
        self.sessions.lock().remove(id);
        Ok(())
    }

    fn last_accessed_time_accessor(&self) -> Option<&dyn LastAccessedTimeAccessor> {
        if self.accessor_enabled {
            Some(self)
        } else {
            None
        }
    }

    fn set_event_publisher(&self, publisher: Arc<dyn SessionEventPublisher>) {
        *self.publisher.write() = Some(publisher);
    }
}

#[async_trait]
impl LastAccessedTimeAccessor for InMemorySessionStore {
    async fn last_accessed_time(&self, id: &str) -> Result<Option<DateTime<Utc>>> {
        self.call(&self.calls.last_accessed_lookups).await?;
        Ok(self
            .sessions
            .lock()
            .get(id)
            .map(SessionRecord::last_accessed_time))
    }
}
