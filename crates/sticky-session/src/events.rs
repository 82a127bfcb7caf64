//! Session lifecycle events re-published by the repository.

use serde::{Deserialize, Serialize};

use crate::record::CachedSession;

/// Kind of session lifecycle event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionEventKind {
    /// Session was created.
    Created,
    /// Session timed out in the remote store.
    Expired,
    /// Session was explicitly deleted.
    Deleted,
}

impl SessionEventKind {
    /// Whether the session no longer exists after this event.
    pub fn is_destroyed(self) -> bool {
        matches!(self, SessionEventKind::Expired | SessionEventKind::Deleted)
    }
}

impl std::fmt::Display for SessionEventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionEventKind::Created => write!(f, "created"),
            SessionEventKind::Expired => write!(f, "expired"),
            SessionEventKind::Deleted => write!(f, "deleted"),
        }
    }
}

/// Lifecycle event carrying the cache's view of the session.
///
/// When the session is cached locally, `session` holds the cached state,
/// which may be newer than what the remote store announced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionEvent {
    pub kind: SessionEventKind,
    pub session: CachedSession,
}

impl SessionEvent {
    pub fn new(kind: SessionEventKind, session: CachedSession) -> Self {
        Self { kind, session }
    }

    pub fn session_id(&self) -> &str {
        &self.session.id
    }
}
