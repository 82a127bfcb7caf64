//! Common test utilities for integration tests.

#![allow(dead_code)]

use std::sync::Arc;

use anyhow::Result;
use chrono::Utc;

use sticky_session::{
    Clock, InMemorySessionStore, ManualClock, SaveDispatch, SessionRecord, StickyConfig,
    StickySessionRepository,
};

/// A repository in front of an in-memory remote store, driven by a manual clock.
pub struct Fixture {
    pub clock: Arc<ManualClock>,
    pub remote: Arc<InMemorySessionStore>,
    pub repo: StickySessionRepository,
}

impl Fixture {
    pub fn new(config: StickyConfig) -> Result<Self> {
        Self::with_remote(config, |remote| remote)
    }

    /// Build a fixture after customizing the remote store.
    pub fn with_remote(
        config: StickyConfig,
        customize: impl FnOnce(InMemorySessionStore) -> InMemorySessionStore,
    ) -> Result<Self> {
        let clock = ManualClock::new(Utc::now());
        let remote = Arc::new(customize(InMemorySessionStore::with_clock(clock.clone())));
        let repo = StickySessionRepository::builder(remote.clone())
            .config(config)
            .clock(clock.clone())
            .build()?;
        Ok(Self {
            clock,
            remote,
            repo,
        })
    }

    /// Put a session straight into the remote store.
    pub fn seed(&self, id: &str) -> SessionRecord {
        let record = SessionRecord::with_id(id, self.clock.now());
        self.remote.insert(record.clone());
        record
    }
}

/// Config that writes back on the caller's task.
pub fn sync_config() -> StickyConfig {
    StickyConfig::new().with_save_dispatch(SaveDispatch::Synchronous)
}
