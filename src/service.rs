//! One-stop wiring of the quota tracker, sessions, queue, status board and
//! runner around a shared store and notifier.

use crate::config::MergeConfig;
use crate::notify::Notifier;
use crate::queue::JobQueue;
use crate::quota::{Clock, QuotaTracker, SystemClock};
use crate::runner::JobRunner;
use crate::session::SessionManager;
use crate::status::StatusBoard;
use crate::store::FileStore;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// All services of one deployment. Cheap handles; clone the fields freely.
pub struct MergeService {
    pub config: MergeConfig,
    pub store: Arc<dyn FileStore>,
    pub quota: Arc<QuotaTracker>,
    pub queue: Arc<JobQueue>,
    pub sessions: SessionManager,
    pub status: StatusBoard,
    pub runner: JobRunner,
}

impl MergeService {
    pub fn new(config: MergeConfig, store: Arc<dyn FileStore>, notifier: Arc<dyn Notifier>) -> Self {
        Self::with_clock(config, store, notifier, Arc::new(SystemClock))
    }

    /// Like [`new`](Self::new) with the clock that drives daily quota resets.
    pub fn with_clock(
        config: MergeConfig,
        store: Arc<dyn FileStore>,
        notifier: Arc<dyn Notifier>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let quota = Arc::new(QuotaTracker::from_config(&config, clock));
        let queue = Arc::new(JobQueue::new(config.max_concurrent_jobs, store.clone()));
        let sessions = SessionManager::new(
            &config,
            quota.clone(),
            queue.clone(),
            store.clone(),
            notifier.clone(),
        );
        let status = StatusBoard::new(queue.clone(), quota.clone(), config.items_per_status_page);
        let runner = JobRunner::new(&config, queue.clone(), store.clone(), notifier);
        Self {
            config,
            store,
            quota,
            queue,
            sessions,
            status,
            runner,
        }
    }

    /// Start the job runner on its own task.
    pub fn spawn_runner(&self, shutdown: CancellationToken) -> JoinHandle<()> {
        let runner = self.runner.clone();
        tokio::spawn(async move { runner.run(shutdown).await })
    }
}
