//! Sticky write-back session cache.
//!
//! This crate keeps sessions in local memory in front of a remote session
//! store, for deployments where a load balancer routes a client's requests
//! to the same node:
//! - Reads are served from the cache, revalidated against the remote store
//!   once they have been idle for a while
//! - Saves merge only what a caller changed and are written back
//!   synchronously, in the background, or after a coalescing delay
//! - Idle entries are evicted on a schedule; the remote store is untouched
//! - Remote lifecycle events are re-published and keep the cache coherent
//!
//! # Example
//!
//! ```rust,ignore
//! use sticky_session::{InMemorySessionStore, StickyConfig, StickySessionRepository};
//!
//! let remote = Arc::new(InMemorySessionStore::new());
//! let repo = StickySessionRepository::builder(remote)
//!     .config(StickyConfig::default().with_cleanup_after(Duration::from_secs(600)))
//!     .build()?;
//!
//! let mut session = repo.create().await?;
//! session.set_attribute("user", "alice").await?;
//! session.save().await?;
//! ```

mod clock;
mod config;
mod dispatch;
mod entry;
mod error;
mod events;
mod lock_pool;
mod memory;
mod record;
mod remote;
mod repository;
mod store;
mod view;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{
    DEFAULT_CLEANUP_AFTER, DEFAULT_CLEANUP_INTERVAL, DEFAULT_CONCURRENCY,
    DEFAULT_REVALIDATE_AFTER, DEFAULT_SAVE_POOL_SIZE, FlushMode, SaveDispatch, SaveMode,
    StickyConfig,
};
pub use dispatch::{
    AsyncDispatcher, DelayedDispatcher, SaveDispatcher, SaveWork, SynchronousDispatcher,
};
pub use entry::CacheEntry;
pub use error::{Error, Result};
pub use events::{SessionEvent, SessionEventKind};
pub use lock_pool::{KeyGuard, KeyLock, KeyLockPool};
pub use memory::{CallCounts, InMemorySessionStore};
pub use record::{CachedSession, DEFAULT_MAX_INACTIVE_INTERVAL, SessionRecord};
pub use remote::{
    LastAccessedTimeAccessor, RemoteSessionEvent, RemoteSessionStore, SessionEventPublisher,
};
pub use repository::{EVENT_CHANNEL_CAPACITY, RepositoryBuilder, StickySessionRepository};
pub use store::{DestructionListener, SessionEntryStore};
pub use view::SessionView;
