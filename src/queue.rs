//! FIFO job admission with a bounded active set.
//!
//! A job lives in exactly one of three places: the queue, the active set, or
//! nowhere (completed or cancelled). All moves between them happen under one
//! short-lived lock that is never held across an `.await`, so
//! `active ≤ max_active` holds after every operation regardless of
//! interleaving. Job IDs come from a process-wide counter and are never
//! reused.

use crate::error::MergeError;
use crate::store::FileStore;
use crate::types::{ChatId, Recipient, StoredDocument, UserId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::Notify;
use tracing::{info, warn};

/// Stable external handle of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct JobId(pub u64);

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One admitted unit of work. Immutable once created.
#[derive(Debug, Clone, Serialize)]
pub struct Job {
    pub id: JobId,
    pub owner: UserId,
    pub chat: ChatId,
    /// Sorted by `sequence_key`.
    pub documents: Vec<StoredDocument>,
    /// Sanitized base name of the artifact, without extension.
    pub output_name: String,
    pub submitted_at: DateTime<Utc>,
}

impl Job {
    pub fn recipient(&self) -> Recipient {
        Recipient::new(self.chat, self.owner)
    }
}

/// Everything needed to create a [`Job`]; the queue assigns the ID.
#[derive(Debug, Clone)]
pub struct JobRequest {
    pub owner: UserId,
    pub chat: ChatId,
    pub documents: Vec<StoredDocument>,
    pub output_name: String,
}

/// Result of [`JobQueue::enqueue`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Enqueued {
    pub job_id: JobId,
    /// 1-based position in the waiting line at the time of enqueueing.
    pub position: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum JobStatus {
    Active,
    /// 1-based position among all queued jobs.
    Queued { position: usize },
}

/// What a user is shown about one of their jobs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct JobSummary {
    pub id: JobId,
    pub output_name: String,
    pub documents: usize,
    pub submitted_at: DateTime<Utc>,
    pub status: JobStatus,
}

impl JobSummary {
    fn of(job: &Job, status: JobStatus) -> Self {
        Self {
            id: job.id,
            output_name: job.output_name.clone(),
            documents: job.documents.len(),
            submitted_at: job.submitted_at,
            status,
        }
    }

    pub fn is_cancellable(&self) -> bool {
        matches!(self.status, JobStatus::Queued { .. })
    }
}

/// System-wide counts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct QueueSnapshot {
    pub active: usize,
    pub queued: usize,
    pub max_active: usize,
}

/// Outcome of a cancellation request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum CancelOutcome {
    Cancelled { job: JobId, files_deleted: usize },
    AlreadyRunning,
    NotOwner,
    NotFound,
}

impl CancelOutcome {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, CancelOutcome::Cancelled { .. })
    }

    /// User-facing error for the non-cancelled outcomes. Jobs of other users
    /// are reported as not found.
    pub fn into_result(self, id: JobId) -> Result<usize, MergeError> {
        match self {
            CancelOutcome::Cancelled { files_deleted, .. } => Ok(files_deleted),
            CancelOutcome::AlreadyRunning => Err(MergeError::AlreadyRunning(id.0)),
            CancelOutcome::NotOwner | CancelOutcome::NotFound => Err(MergeError::JobNotFound(id.0)),
        }
    }
}

#[derive(Default)]
struct QueueState {
    queued: VecDeque<Job>,
    active: HashMap<JobId, Job>,
}

pub struct JobQueue {
    state: Mutex<QueueState>,
    next_id: AtomicU64,
    max_active: usize,
    store: Arc<dyn FileStore>,
    wakeup: Notify,
}

impl JobQueue {
    pub fn new(max_active: usize, store: Arc<dyn FileStore>) -> Self {
        Self {
            state: Mutex::new(QueueState::default()),
            next_id: AtomicU64::new(1),
            max_active: max_active.max(1),
            store,
            wakeup: Notify::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        // Every mutation leaves the state consistent, so a poisoned lock is safe to reuse.
        match self.state.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Append a job to the FIFO and return its ID and 1-based queue position.
    pub fn enqueue(&self, request: JobRequest) -> Enqueued {
        let id = JobId(self.next_id.fetch_add(1, Ordering::SeqCst));
        let job = Job {
            id,
            owner: request.owner,
            chat: request.chat,
            documents: request.documents,
            output_name: request.output_name,
            submitted_at: Utc::now(),
        };
        let documents = job.documents.len();
        let position = {
            let mut state = self.lock();
            state.queued.push_back(job);
            state.queued.len()
        };
        info!(job_id = %id, user = %request.owner, documents, position, "Job queued");
        self.wakeup.notify_one();
        Enqueued {
            job_id: id,
            position,
        }
    }

    /// Move the oldest queued job to the active set if there is room.
    pub fn try_dequeue(&self) -> Option<Job> {
        let mut state = self.lock();
        if state.active.len() >= self.max_active {
            return None;
        }
        let job = state.queued.pop_front()?;
        state.active.insert(job.id, job.clone());
        Some(job)
    }

    /// Remove a finished job from the active set and wake the runner.
    pub fn complete(&self, id: JobId) -> bool {
        let removed = self.lock().active.remove(&id).is_some();
        if removed {
            self.wakeup.notify_one();
        }
        removed
    }

    /// Cancel a queued job owned by `requester` and delete its documents.
    pub async fn cancel(&self, id: JobId, requester: UserId) -> CancelOutcome {
        let job = {
            let mut state = self.lock();
            if let Some(active) = state.active.get(&id) {
                return if active.owner == requester {
                    CancelOutcome::AlreadyRunning
                } else {
                    CancelOutcome::NotOwner
                };
            }
            let Some(pos) = state.queued.iter().position(|j| j.id == id) else {
                return CancelOutcome::NotFound;
            };
            if state.queued[pos].owner != requester {
                return CancelOutcome::NotOwner;
            }
            match state.queued.remove(pos) {
                Some(job) => job,
                None => return CancelOutcome::NotFound,
            }
        };

        let mut files_deleted = 0;
        for doc in &job.documents {
            match self.store.delete(&doc.handle).await {
                Ok(()) => files_deleted += 1,
                Err(e) => warn!(job_id = %id, handle = %doc.handle, "Could not delete document: {}", e),
            }
        }
        info!(job_id = %id, user = %requester, files_deleted, "Job cancelled");
        CancelOutcome::Cancelled {
            job: id,
            files_deleted,
        }
    }

    /// The user's jobs: active ones first, then queued ones, each by
    /// submission time.
    pub fn list_for_user(&self, user: UserId) -> Vec<JobSummary> {
        let state = self.lock();
        let mut active: Vec<&Job> = state.active.values().filter(|j| j.owner == user).collect();
        active.sort_by_key(|j| (j.submitted_at, j.id));

        let mut out: Vec<JobSummary> = active
            .into_iter()
            .map(|j| JobSummary::of(j, JobStatus::Active))
            .collect();
        out.extend(
            state
                .queued
                .iter()
                .enumerate()
                .filter(|(_, j)| j.owner == user)
                .map(|(i, j)| JobSummary::of(j, JobStatus::Queued { position: i + 1 })),
        );
        out
    }

    pub fn status_of(&self, id: JobId) -> Option<JobStatus> {
        let state = self.lock();
        if state.active.contains_key(&id) {
            return Some(JobStatus::Active);
        }
        state
            .queued
            .iter()
            .position(|j| j.id == id)
            .map(|i| JobStatus::Queued { position: i + 1 })
    }

    /// `true` while another job could become active right now.
    pub fn can_admit_more(&self) -> bool {
        self.lock().active.len() < self.max_active
    }

    pub fn snapshot(&self) -> QueueSnapshot {
        let state = self.lock();
        QueueSnapshot {
            active: state.active.len(),
            queued: state.queued.len(),
            max_active: self.max_active,
        }
    }

    pub fn max_active(&self) -> usize {
        self.max_active
    }

    /// Signalled on every enqueue and completion.
    pub(crate) fn wakeup(&self) -> &Notify {
        &self.wakeup
    }
}
