//! Strategies deciding when merged changes are written to the remote store.
//!
//! A [`SaveDispatcher`] receives a ready-to-run write (see [`SaveWork`]) once a
//! view has merged its changes into a cache entry. The write re-reads the
//! entry when it runs, so running it late or more than once is harmless.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures::future::BoxFuture;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, trace, warn};

use crate::config::SaveDispatch;
use crate::error::Result;

/// A pending write to the remote store.
pub type SaveWork = BoxFuture<'static, Result<()>>;

/// Decides when and where a [`SaveWork`] runs.
#[async_trait]
pub trait SaveDispatcher: Send + Sync {
    /// Queue a write for `session_id`.
    ///
    /// Only a synchronous dispatcher reports the write's own error; background
    /// dispatchers log it.
    async fn queue_save(&self, session_id: &str, work: SaveWork) -> Result<()>;

    /// Stop accepting background work and wait for queued writes to finish.
    async fn shutdown(&self) {}

    /// Cancel queued writes that have not started yet. Background
    /// dispatchers also drop writes queued after the abort.
    fn abort(&self) {}
}

/// Build the dispatcher selected by the configuration.
pub fn from_config(dispatch: &SaveDispatch) -> Arc<dyn SaveDispatcher> {
    match *dispatch {
        SaveDispatch::Synchronous => Arc::new(SynchronousDispatcher),
        SaveDispatch::Asynchronous { pool_size } => Arc::new(AsyncDispatcher::new(pool_size)),
        SaveDispatch::Delayed { pool_size, delay } => {
            Arc::new(DelayedDispatcher::new(pool_size, delay))
        }
    }
}

/// Runs the write on the caller's task before returning.
#[derive(Debug, Clone, Copy, Default)]
pub struct SynchronousDispatcher;

#[async_trait]
impl SaveDispatcher for SynchronousDispatcher {
    async fn queue_save(&self, session_id: &str, work: SaveWork) -> Result<()> {
        trace!(session_id = %session_id, "Saving remote session synchronously");
        work.await
    }
}

/// Bounded pool of background tasks, optionally delaying each write.
#[derive(Debug)]
struct WorkerPool {
    permits: Arc<Semaphore>,
    tracker: TaskTracker,
    /// Cancelled on graceful shutdown to cut pending delays short.
    expedite: CancellationToken,
    /// Cancelled on abort to drop writes that have not started.
    cancel: CancellationToken,
    closed: AtomicBool,
    delay: Option<Duration>,
}

impl WorkerPool {
    fn new(pool_size: usize, delay: Option<Duration>) -> Self {
        Self {
            permits: Arc::new(Semaphore::new(pool_size.max(1))),
            tracker: TaskTracker::new(),
            expedite: CancellationToken::new(),
            cancel: CancellationToken::new(),
            closed: AtomicBool::new(false),
            delay,
        }
    }

    async fn submit(&self, session_id: &str, work: SaveWork) -> Result<()> {
        if self.cancel.is_cancelled() {
            debug!(session_id = %session_id, "Save pool was aborted, dropping write");
            return Ok(());
        }
        if self.closed.load(Ordering::Acquire) {
            debug!(session_id = %session_id, "Save pool is shut down, saving inline");
            return work.await;
        }

        let permits = Arc::clone(&self.permits);
        let expedite = self.expedite.clone();
        let cancel = self.cancel.clone();
        let delay = self.delay;
        let session_id = session_id.to_string();

        self.tracker.spawn(async move {
            if let Some(delay) = delay {
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = expedite.cancelled() => {}
                    _ = cancel.cancelled() => return,
                }
            }

            let _permit = tokio::select! {
                permit = permits.acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => return,
                },
                _ = cancel.cancelled() => return,
            };

            if let Err(e) = work.await {
                warn!(
                    session_id = %session_id,
                    error = %e,
                    "Background save to remote store failed"
                );
            }
        });

        Ok(())
    }

    async fn shutdown(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            self.tracker.wait().await;
            return;
        }
        info!(pending = self.tracker.len(), "Draining save pool");
        self.tracker.close();
        self.expedite.cancel();
        self.tracker.wait().await;
    }

    fn abort(&self) {
        self.closed.store(true, Ordering::Release);
        self.tracker.close();
        self.cancel.cancel();
        self.permits.close();
    }
}

/// Writes on a bounded pool of background tasks.
#[derive(Debug)]
pub struct AsyncDispatcher {
    pool: WorkerPool,
}

impl AsyncDispatcher {
    /// Create a dispatcher running at most `pool_size` writes at once.
    pub fn new(pool_size: usize) -> Self {
        Self {
            pool: WorkerPool::new(pool_size, None),
        }
    }
}

#[async_trait]
impl SaveDispatcher for AsyncDispatcher {
    async fn queue_save(&self, session_id: &str, work: SaveWork) -> Result<()> {
        self.pool.submit(session_id, work).await
    }

    async fn shutdown(&self) {
        self.pool.shutdown().await;
    }

    fn abort(&self) {
        self.pool.abort();
    }
}

/// Writes on a bounded pool of background tasks after a fixed delay.
///
/// Repeated saves of one session within the delay collapse into a single
/// remote write: the first write to fire persists the latest merged state and
/// the later ones find nothing pending.
#[derive(Debug)]
pub struct DelayedDispatcher {
    pool: WorkerPool,
}

impl DelayedDispatcher {
    pub fn new(pool_size: usize, delay: Duration) -> Self {
        Self {
            pool: WorkerPool::new(pool_size, Some(delay)),
        }
    }
}

#[async_trait]
impl SaveDispatcher for DelayedDispatcher {
    async fn queue_save(&self, session_id: &str, work: SaveWork) -> Result<()> {
        self.pool.submit(session_id, work).await
    }

    async fn shutdown(&self) {
        self.pool.shutdown().await;
    }

    fn abort(&self) {
        self.pool.abort();
    }
}
