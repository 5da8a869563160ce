//! Semaphore-bounded executor for synchronous handlers.
//!
//! Synchronous handler code runs on `spawn_blocking` worker threads behind a
//! counting semaphore sized `max_threads`. Admission is fail-fast: when every
//! permit is taken, `submit` rejects immediately instead of queuing, and the
//! rejection is the backpressure signal the server maps to a retryable error.

use crate::error::TransportError;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::Semaphore;

/// Decrements the active-thread gauge on every exit path, panic included.
struct ActiveGuard(Arc<AtomicUsize>);

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Admission-controlled pool for synchronous handler execution.
#[derive(Debug)]
pub struct BoundedExecutor {
    permits: Arc<Semaphore>,
    max_threads: usize,
    active: Arc<AtomicUsize>,
    rejected: AtomicU64,
}

impl BoundedExecutor {
    /// Create an executor admitting at most `max_threads` concurrent
    /// synchronous handlers. Fails for zero.
    pub fn new(max_threads: usize) -> anyhow::Result<Self> {
        anyhow::ensure!(max_threads >= 1, "max_threads must be >= 1");
        Ok(Self {
            permits: Arc::new(Semaphore::new(max_threads)),
            max_threads,
            active: Arc::new(AtomicUsize::new(0)),
            rejected: AtomicU64::new(0),
        })
    }

    /// Default sizing: `min(32, available_parallelism + 4)`.
    pub fn default_max_threads() -> usize {
        let cpus = std::thread::available_parallelism()
            .map(std::num::NonZeroUsize::get)
            .unwrap_or(1);
        cpus.saturating_add(4).min(32)
    }

    pub fn with_default_size() -> anyhow::Result<Self> {
        Self::new(Self::default_max_threads())
    }

    /// Run `f` on a blocking worker thread.
    ///
    /// Rejects immediately with [`TransportError::ThreadPoolExhausted`] when
    /// all permits are taken. The permit is released when the task exits,
    /// whether it returns or panics; a panicking task surfaces as
    /// [`TransportError::Internal`].
    pub async fn submit<T, F>(&self, f: F) -> Result<T, TransportError>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        let Ok(permit) = Arc::clone(&self.permits).try_acquire_owned() else {
            self.rejected.fetch_add(1, Ordering::Relaxed);
            let active = self.active.load(Ordering::SeqCst);
            tracing::warn!(
                max_threads = self.max_threads,
                active,
                "Handler pool saturated - rejecting submission"
            );
            return Err(TransportError::ThreadPoolExhausted {
                max_threads: self.max_threads,
                active,
            });
        };

        self.active.fetch_add(1, Ordering::SeqCst);
        let active = Arc::clone(&self.active);

        let handle = tokio::task::spawn_blocking(move || {
            let _permit = permit;
            let _active = ActiveGuard(active);
            f()
        });

        match handle.await {
            Ok(value) => Ok(value),
            Err(join_err) => {
                tracing::error!(error = %join_err, "Synchronous handler panicked");
                Err(TransportError::Internal(format!(
                    "handler task failed: {join_err}"
                )))
            }
        }
    }

    pub fn max_threads(&self) -> usize {
        self.max_threads
    }

    /// Currently running synchronous handlers.
    pub fn active_count(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    /// Total fail-fast rejections since construction.
    pub fn rejected_count(&self) -> u64 {
        self.rejected.load(Ordering::Relaxed)
    }
}
