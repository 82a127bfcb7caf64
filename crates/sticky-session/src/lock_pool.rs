//! Per-key mutual exclusion.
//!
//! The pool hands out one lock per string key. Callers that ask for the same
//! key while any of them still holds the token get the same lock; once every
//! token for a key is dropped the next caller gets a fresh one, so the pool
//! never pins memory for keys nobody is using.

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tokio::sync::OwnedMutexGuard;
use tracing::trace;

/// The lock handed out for one key.
pub type KeyLock = tokio::sync::Mutex<()>;

/// Guard holding a key's lock. Dropping it releases the lock and the token.
pub type KeyGuard = OwnedMutexGuard<()>;

const MIN_PURGE_THRESHOLD: usize = 64;

#[derive(Debug)]
struct PoolInner {
    tokens: HashMap<String, Weak<KeyLock>>,
    /// Purge dead tokens once the map grows past this size.
    purge_threshold: usize,
}

/// Pool of per-key locks.
#[derive(Debug)]
pub struct KeyLockPool {
    inner: Mutex<PoolInner>,
}

impl KeyLockPool {
    /// Create a pool sized for roughly `concurrency` simultaneously locked keys.
    pub fn new(concurrency: usize) -> Self {
        let capacity = concurrency.max(1);
        Self {
            inner: Mutex::new(PoolInner {
                tokens: HashMap::with_capacity(capacity),
                purge_threshold: (capacity * 4).max(MIN_PURGE_THRESHOLD),
            }),
        }
    }

    /// Get the token for `key`.
    pub fn token(&self, key: &str) -> Arc<KeyLock> {
        let mut inner = self.inner.lock();

        if let Some(token) = inner.tokens.get(key).and_then(Weak::upgrade) {
            return token;
        }

        let token = Arc::new(KeyLock::new(()));
        inner.tokens.insert(key.to_string(), Arc::downgrade(&token));

        if inner.tokens.len() >= inner.purge_threshold {
            let before = inner.tokens.len();
            inner.tokens.retain(|_, token| token.strong_count() > 0);
            let live = inner.tokens.len();
            inner.purge_threshold = (live * 2).max(MIN_PURGE_THRESHOLD);
            trace!(purged = before - live, live, "Purged stale key locks");
        }

        token
    }

    /// Acquire the lock for `key`, waiting for any current holder.
    pub async fn lock(&self, key: &str) -> KeyGuard {
        self.token(key).lock_owned().await
    }

    /// Number of keys with bookkeeping entries, live or not yet purged.
    pub fn len(&self) -> usize {
        self.inner.lock().tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for KeyLockPool {
    fn default() -> Self {
        Self::new(crate::config::DEFAULT_CONCURRENCY)
    }
}
