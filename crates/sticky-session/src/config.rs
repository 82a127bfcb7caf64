//! Configuration for the sticky session repository.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Default period after which a cached session is revalidated against the remote store.
pub const DEFAULT_REVALIDATE_AFTER: Option<Duration> = Some(Duration::from_secs(30));

/// Default idle period after which a session is dropped from the local cache.
pub const DEFAULT_CLEANUP_AFTER: Duration = Duration::from_secs(20 * 60);

/// Default cadence of the background cleanup task.
pub const DEFAULT_CLEANUP_INTERVAL: Duration = Duration::from_secs(60);

/// Default size of the save worker pool.
pub const DEFAULT_SAVE_POOL_SIZE: usize = 16;

/// Default concurrency hint for the entry store and lock pool.
pub const DEFAULT_CONCURRENCY: usize = 16;

/// When sessions are written to the remote store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlushMode {
    /// Only when the view is explicitly saved.
    #[default]
    OnSave,
    /// After every mutation of a view.
    Immediate,
}

impl std::fmt::Display for FlushMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FlushMode::OnSave => write!(f, "on_save"),
            FlushMode::Immediate => write!(f, "immediate"),
        }
    }
}

/// Which attributes a view considers dirty.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SaveMode {
    /// Attributes that were set or removed.
    #[default]
    OnSetAttribute,
    /// Attributes that were set, removed or read.
    OnGetAttribute,
    /// Every attribute of the session.
    Always,
}

impl std::fmt::Display for SaveMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SaveMode::OnSetAttribute => write!(f, "on_set_attribute"),
            SaveMode::OnGetAttribute => write!(f, "on_get_attribute"),
            SaveMode::Always => write!(f, "always"),
        }
    }
}

/// How merged changes are handed to the remote store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaveDispatch {
    /// Write on the caller's task before `save` returns.
    Synchronous,
    /// Write on a bounded pool of background tasks.
    Asynchronous { pool_size: usize },
    /// Write on a bounded pool after a fixed delay, coalescing repeated saves.
    Delayed { pool_size: usize, delay: Duration },
}

impl Default for SaveDispatch {
    fn default() -> Self {
        SaveDispatch::Asynchronous {
            pool_size: DEFAULT_SAVE_POOL_SIZE,
        }
    }
}

/// Configuration for the sticky session repository.
#[derive(Debug, Clone)]
pub struct StickyConfig {
    /// Idle period after which a cached session is compared against the remote store.
    /// `None` disables revalidation, zero revalidates on every access.
    pub revalidate_after: Option<Duration>,

    /// Sessions not accessed within this period are dropped from the local cache
    /// (not from the remote store) by the cleanup pass.
    pub cleanup_after: Duration,

    /// Cadence of the background cleanup task, if one is spawned.
    pub cleanup_interval: Duration,

    /// Strategy used to write merged changes to the remote store.
    pub save_dispatch: SaveDispatch,

    /// When views flush their changes.
    pub flush_mode: FlushMode,

    /// Which attributes views consider dirty.
    pub save_mode: SaveMode,

    /// Sizing hint for the entry store shards and the lock pool.
    pub concurrency: usize,
}

impl Default for StickyConfig {
    fn default() -> Self {
        Self {
            revalidate_after: DEFAULT_REVALIDATE_AFTER,
            cleanup_after: DEFAULT_CLEANUP_AFTER,
            cleanup_interval: DEFAULT_CLEANUP_INTERVAL,
            save_dispatch: SaveDispatch::default(),
            flush_mode: FlushMode::default(),
            save_mode: SaveMode::default(),
            concurrency: DEFAULT_CONCURRENCY,
        }
    }
}

impl StickyConfig {
    /// Create a new configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the revalidation period.
    pub fn with_revalidate_after(mut self, period: Duration) -> Self {
        self.revalidate_after = Some(period);
        self
    }

    /// Disable revalidation (the cached copy is always authoritative).
    pub fn without_revalidation(mut self) -> Self {
        self.revalidate_after = None;
        self
    }

    /// Set the eviction horizon.
    pub fn with_cleanup_after(mut self, period: Duration) -> Self {
        self.cleanup_after = period;
        self
    }

    /// Set the cleanup task cadence.
    pub fn with_cleanup_interval(mut self, interval: Duration) -> Self {
        self.cleanup_interval = interval;
        self
    }

    /// Set the save dispatch strategy.
    pub fn with_save_dispatch(mut self, dispatch: SaveDispatch) -> Self {
        self.save_dispatch = dispatch;
        self
    }

    /// Set the flush mode.
    pub fn with_flush_mode(mut self, mode: FlushMode) -> Self {
        self.flush_mode = mode;
        self
    }

    /// Set the save mode.
    pub fn with_save_mode(mut self, mode: SaveMode) -> Self {
        self.save_mode = mode;
        self
    }

    /// Set the concurrency hint.
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency;
        self
    }

    /// Check that the options are consistent with each other.
    pub fn validate(&self) -> Result<()> {
        if self.concurrency == 0 {
            return Err(Error::InvalidConfig(
                "concurrency must be at least 1".to_string(),
            ));
        }

        match self.save_dispatch {
            SaveDispatch::Synchronous => {}
            SaveDispatch::Asynchronous { pool_size } | SaveDispatch::Delayed { pool_size, .. }
                if pool_size == 0 =>
            {
                return Err(Error::InvalidConfig(
                    "save pool size must be at least 1".to_string(),
                ));
            }
            SaveDispatch::Asynchronous { .. } => {}
            SaveDispatch::Delayed { delay, .. } => {
                // A delayed write landing after a revalidation would make the
                // cache look stale against its own older remote copy.
                if let Some(revalidate_after) = self.revalidate_after
                    && delay >= revalidate_after
                {
                    return Err(Error::InvalidConfig(format!(
                        "save delay {delay:?} must be below revalidate_after {revalidate_after:?}"
                    )));
                }
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = StickyConfig::default();
        assert_eq!(config.revalidate_after, Some(Duration::from_secs(30)));
        assert_eq!(config.cleanup_after, Duration::from_secs(1200));
        assert_eq!(
            config.save_dispatch,
            SaveDispatch::Asynchronous { pool_size: 16 }
        );
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_delay_must_be_shorter_than_revalidation() {
        let config = StickyConfig::new()
            .with_revalidate_after(Duration::from_secs(10))
            .with_save_dispatch(SaveDispatch::Delayed {
                pool_size: 4,
                delay: Duration::from_secs(10),
            });
        assert!(matches!(config.validate(), Err(Error::InvalidConfig(_))));

        let config = config.with_save_dispatch(SaveDispatch::Delayed {
            pool_size: 4,
            delay: Duration::from_secs(5),
        });
        assert!(config.validate().is_ok());

        let config = config.without_revalidation();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_zero_sizes_rejected() {
        let config = StickyConfig::new().with_concurrency(0);
        assert!(config.validate().is_err());

        let config =
            StickyConfig::new().with_save_dispatch(SaveDispatch::Asynchronous { pool_size: 0 });
        assert!(config.validate().is_err());

        let config = StickyConfig::new().with_save_dispatch(SaveDispatch::Synchronous);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_mode_serde() {
        let mode: SaveMode = serde_json::from_str("\"on_get_attribute\"").unwrap();
        assert_eq!(mode, SaveMode::OnGetAttribute);
        assert_eq!(
            serde_json::to_string(&FlushMode::Immediate).unwrap(),
            "\"immediate\""
        );
        assert_eq!(SaveMode::Always.to_string(), "always");
    }
}
