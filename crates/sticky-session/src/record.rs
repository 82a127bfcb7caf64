//! Session records: the remote handle and the local cached copy.

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::clock::elapsed_at_least;

/// Default inactivity period after which a session expires.
pub const DEFAULT_MAX_INACTIVE_INTERVAL: Duration = Duration::from_secs(30 * 60);

fn expired_at(
    last_accessed_time: DateTime<Utc>,
    max_inactive_interval: Option<Duration>,
    now: DateTime<Utc>,
) -> bool {
    match max_inactive_interval {
        None => false,
        Some(interval) => elapsed_at_least(last_accessed_time, now, interval),
    }
}

/// A session record as owned by the remote store.
///
/// The cache keeps one of these per entry as the handle used for the next
/// write-back.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionRecord {
    id: String,

    /// Id the record was last persisted under, set when the id is rotated
    /// and cleared once the rotation has been written.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    original_id: Option<String>,

    creation_time: DateTime<Utc>,

    last_accessed_time: DateTime<Utc>,

    max_inactive_interval: Option<Duration>,

    #[serde(default)]
    attributes: HashMap<String, Value>,
}

impl SessionRecord {
    /// Create a new record with a random id.
    pub fn new(now: DateTime<Utc>) -> Self {
        Self::with_id(uuid::Uuid::new_v4().to_string(), now)
    }

    /// Create a new record with the given id.
    pub fn with_id(id: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            id: id.into(),
            original_id: None,
            creation_time: now,
            last_accessed_time: now,
            max_inactive_interval: Some(DEFAULT_MAX_INACTIVE_INTERVAL),
            attributes: HashMap::new(),
        }
    }

    /// Set the maximum inactive interval.
    pub fn with_max_inactive_interval(mut self, interval: Option<Duration>) -> Self {
        self.max_inactive_interval = interval;
        self
    }

    /// Set an attribute.
    pub fn with_attribute(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.attributes.insert(name.into(), value.into());
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// The id this record is still stored under remotely, if its id was rotated.
    pub fn original_id(&self) -> Option<&str> {
        self.original_id.as_deref()
    }

    pub fn creation_time(&self) -> DateTime<Utc> {
        self.creation_time
    }

    pub fn last_accessed_time(&self) -> DateTime<Utc> {
        self.last_accessed_time
    }

    pub fn set_last_accessed_time(&mut self, time: DateTime<Utc>) {
        self.last_accessed_time = time;
    }

    pub fn max_inactive_interval(&self) -> Option<Duration> {
        self.max_inactive_interval
    }

    pub fn set_max_inactive_interval(&mut self, interval: Option<Duration>) {
        self.max_inactive_interval = interval;
    }

    pub fn attribute(&self, name: &str) -> Option<&Value> {
        self.attributes.get(name)
    }

    pub fn attributes(&self) -> &HashMap<String, Value> {
        &self.attributes
    }

    pub fn set_attribute(&mut self, name: impl Into<String>, value: Value) {
        self.attributes.insert(name.into(), value);
    }

    pub fn remove_attribute(&mut self, name: &str) -> Option<Value> {
        self.attributes.remove(name)
    }

    /// Whether the record has been inactive for longer than its interval.
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        expired_at(self.last_accessed_time, self.max_inactive_interval, now)
    }

    /// Give the record a new random id, remembering the old one until the
    /// rotation is persisted.
    pub fn change_session_id(&mut self) -> String {
        let new_id = uuid::Uuid::new_v4().to_string();
        self.rename(new_id.clone());
        new_id
    }

    pub(crate) fn rename(&mut self, new_id: String) {
        let old_id = std::mem::replace(&mut self.id, new_id);
        if self.original_id.is_none() {
            self.original_id = Some(old_id);
        }
        if self.original_id.as_deref() == Some(self.id.as_str()) {
            self.original_id = None;
        }
    }

    /// Forget the pre-rotation id. Stores call this on their own copy once
    /// the record has been moved.
    pub fn clear_original_id(&mut self) {
        self.original_id = None;
    }
}

/// Local copy of a session's state, independent of the remote handle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CachedSession {
    pub id: String,
    pub creation_time: DateTime<Utc>,
    pub last_accessed_time: DateTime<Utc>,
    pub max_inactive_interval: Option<Duration>,
    #[serde(default)]
    pub attributes: HashMap<String, Value>,
}

impl CachedSession {
    /// Whether the session has been inactive for longer than its interval.
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        expired_at(self.last_accessed_time, self.max_inactive_interval, now)
    }

    pub fn attribute(&self, name: &str) -> Option<&Value> {
        self.attributes.get(name)
    }
}

impl From<&SessionRecord> for CachedSession {
    fn from(record: &SessionRecord) -> Self {
        Self {
            id: record.id.clone(),
            creation_time: record.creation_time,
            last_accessed_time: record.last_accessed_time,
            max_inactive_interval: record.max_inactive_interval,
            attributes: record.attributes.clone(),
        }
    }
}
