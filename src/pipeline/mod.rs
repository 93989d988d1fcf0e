//! Pipeline stages for turning a job's documents into one Markdown artifact.
//!
//! Each submodule implements exactly one transformation step.
//! Keeping stages separate makes each independently testable and lets a
//! transport swap converters without touching the merge logic.
//!
//! ## Data Flow
//!
//! ```text
//! stored docs ──▶ convert ──▶ merge ──▶ artifact
//!  (any format)   (formats)   (heading, normalize)
//! ```
//!
//! 1. [`convert`] — dispatch every non-Markdown document to its
//!    [`formats::DocumentConverter`] on the shared [`WorkerPool`]; results come
//!    back tagged and in input order
//! 2. [`merge`]   — read the converted documents back, clean them up with
//!    [`normalize`], make sure each opens with a heading ([`heading`]) and
//!    join them with the configured separator
//!
//! ## Why a shared worker pool?
//!
//! Conversion is CPU-bound (unzipping, tokenizing) and runs through
//! `spawn_blocking` so the Tokio workers that drive sessions and the queue
//! never stall. Tokio's blocking pool is effectively unbounded, so a semaphore
//! in front of it caps how many documents are processed at once across *all*
//! running jobs.

pub mod convert;
pub mod formats;
pub mod heading;
pub mod merge;
pub mod normalize;

use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Semaphore;

/// Failure to run a closure on the worker pool.
#[derive(Debug, Error)]
pub enum PoolError {
    #[error("worker pool is shut down")]
    Closed,

    #[error("worker task failed: {0}")]
    Panicked(String),
}

/// Bounded front for `tokio::task::spawn_blocking`.
#[derive(Debug, Clone)]
pub struct WorkerPool {
    permits: Arc<Semaphore>,
    size: usize,
}

impl WorkerPool {
    pub fn new(size: usize) -> Self {
        let size = size.max(1);
        Self {
            permits: Arc::new(Semaphore::new(size)),
            size,
        }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Run `f` on the blocking pool once a slot is free.
    pub async fn run<F, T>(&self, f: F) -> Result<T, PoolError>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        let _permit = Arc::clone(&self.permits)
            .acquire_owned()
            .await
            .map_err(|_| PoolError::Closed)?;
        tokio::task::spawn_blocking(f)
            .await
            .map_err(|e| PoolError::Panicked(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn pool_bounds_parallelism() {
        let pool = WorkerPool::new(2);
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let tasks: Vec<_> = (0..6)
            .map(|_| {
                let pool = pool.clone();
                let running = Arc::clone(&running);
                let peak = Arc::clone(&peak);
                tokio::spawn(async move {
                    pool.run(move || {
                        let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                        peak.fetch_max(now, Ordering::SeqCst);
                        std::thread::sleep(Duration::from_millis(20));
                        running.fetch_sub(1, Ordering::SeqCst);
                    })
                    .await
                })
            })
            .collect();
        for t in tasks {
            t.await.unwrap().unwrap();
        }
        assert!(peak.load(Ordering::SeqCst) <= 2);
        assert_eq!(pool.size(), 2);
    }

    #[tokio::test]
    async fn panics_are_reported_not_propagated() {
        let pool = WorkerPool::new(1);
        let res: Result<(), _> = pool.run(|| panic!("boom")).await;
        assert!(matches!(res, Err(PoolError::Panicked(_))));
        // The permit was released.
        assert_eq!(pool.run(|| 7).await.unwrap(), 7);
    }
}
