//! Contracts for the remote session store behind the cache.
//!
//! The cache is decoupled from any particular backend. A backend implements
//! [`RemoteSessionStore`]; if it can read a session's last-accessed time
//! without loading the whole record it also exposes a
//! [`LastAccessedTimeAccessor`], which the repository uses to make
//! revalidation cheap.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::Result;
use crate::events::SessionEventKind;
use crate::record::SessionRecord;

/// The authoritative store of session records.
#[async_trait]
pub trait RemoteSessionStore: Send + Sync + 'static {
    /// Identifies this store as the origin of the events it emits.
    fn origin(&self) -> &str;

    /// Create a new, not yet persisted, session record.
    async fn create_session(&self) -> Result<SessionRecord>;

    /// Load a session. Return `Ok(None)` if the store does not know it.
    async fn find_by_id(&self, id: &str) -> Result<Option<SessionRecord>>;

    /// Persist a session.
    ///
    /// If [`SessionRecord::original_id`] is set, the record was stored under
    /// that id before a rotation and must be moved to its new id.
    async fn save(&self, session: &SessionRecord) -> Result<()>;

    /// Delete a session.
    async fn delete_by_id(&self, id: &str) -> Result<()>;

    /// Cheap access to a session's last-accessed time, if this store supports it.
    fn last_accessed_time_accessor(&self) -> Option<&dyn LastAccessedTimeAccessor> {
        None
    }

    /// Install the publisher this store should emit lifecycle events to.
    ///
    /// Stores that emit no events can ignore this; the local cache is then
    /// only cleaned up by eviction and explicit deletes.
    fn set_event_publisher(&self, _publisher: Arc<dyn SessionEventPublisher>) {}
}

/// Reads a session's last-accessed time without materializing the record.
#[async_trait]
pub trait LastAccessedTimeAccessor: Send + Sync {
    /// `Ok(None)` means the store does not know the session. Errors mean the
    /// store could not be asked and say nothing about the session.
    async fn last_accessed_time(&self, id: &str) -> Result<Option<DateTime<Utc>>>;
}

/// Lifecycle event emitted by a remote store.
#[derive(Debug, Clone)]
pub struct RemoteSessionEvent {
    /// Origin of the emitting store, see [`RemoteSessionStore::origin`].
    pub origin: String,
    pub kind: SessionEventKind,
    pub session_id: String,
    /// The store's view of the session, if it has one.
    pub session: Option<SessionRecord>,
}

impl RemoteSessionEvent {
    pub fn new(
        origin: impl Into<String>,
        kind: SessionEventKind,
        session_id: impl Into<String>,
        session: Option<SessionRecord>,
    ) -> Self {
        Self {
            origin: origin.into(),
            kind,
            session_id: session_id.into(),
            session,
        }
    }
}

/// Receives lifecycle events from a remote store.
pub trait SessionEventPublisher: Send + Sync {
    fn publish(&self, event: RemoteSessionEvent);
}
