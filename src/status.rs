//! Paginated per-user view of the job queue, plus the quota report.
//!
//! The board remembers which page each user is looking at, so a refresh or
//! a page button press never has to guess the current page from what was
//! rendered before.

use crate::error::format_eta;
use crate::queue::{JobId, JobQueue, JobStatus, JobSummary, QueueSnapshot};
use crate::quota::{QuotaTracker, QuotaUsage};
use crate::types::UserId;
use dashmap::DashMap;
use serde::Serialize;
use std::sync::Arc;
use tracing::debug;

/// One rendered page of a user's jobs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StatusPage {
    /// Jobs on this page, active first then queued.
    pub jobs: Vec<JobSummary>,
    /// 1-based.
    pub page: usize,
    pub total_pages: usize,
    /// Jobs on this page that may be offered a cancel action.
    pub cancellable: Vec<JobId>,
    pub system: QueueSnapshot,
}

impl StatusPage {
    pub fn has_previous(&self) -> bool {
        self.page > 1
    }

    pub fn has_next(&self) -> bool {
        self.page < self.total_pages
    }

    pub fn render(&self) -> String {
        if self.jobs.is_empty() {
            return format!(
                "📭 You have no jobs.\nSystem: {}/{} active, {} queued.",
                self.system.active, self.system.max_active, self.system.queued
            );
        }
        let mut out = format!("📋 Your jobs (page {}/{}):", self.page, self.total_pages);
        for job in &self.jobs {
            let state = match job.status {
                JobStatus::Active => "⚙️ processing".to_string(),
                JobStatus::Queued { position } => format!("⏳ queued, position {position}"),
            };
            out.push_str(&format!(
                "\n#{} {}.md ({} files) {}",
                job.id, job.output_name, job.documents, state
            ));
        }
        out
    }
}

/// Keeps the per-user page cursor.
pub struct StatusBoard {
    queue: Arc<JobQueue>,
    quota: Arc<QuotaTracker>,
    per_page: usize,
    cursors: DashMap<UserId, usize>,
}

impl StatusBoard {
    pub fn new(queue: Arc<JobQueue>, quota: Arc<QuotaTracker>, per_page: usize) -> Self {
        Self {
            queue,
            quota,
            per_page: per_page.max(1),
            cursors: DashMap::new(),
        }
    }

    /// Show the first page and remember it.
    pub fn open(&self, user: UserId) -> StatusPage {
        self.show(user, 1)
    }

    /// Jump to `page`, clamped to the pages that exist.
    pub fn turn(&self, user: UserId, page: usize) -> StatusPage {
        self.show(user, page)
    }

    /// Re-render at the stored cursor. Without a cursor this is [`open`](Self::open).
    pub fn refresh(&self, user: UserId) -> StatusPage {
        let page = self.cursors.get(&user).map(|c| *c).unwrap_or(1);
        self.show(user, page)
    }

    pub fn close(&self, user: UserId) {
        self.cursors.remove(&user);
    }

    /// Stored page of `user`, if the board is open.
    pub fn cursor(&self, user: UserId) -> Option<usize> {
        self.cursors.get(&user).map(|c| *c)
    }

    pub fn limits(&self, user: UserId) -> QuotaUsage {
        self.quota.usage(user)
    }

    fn show(&self, user: UserId, requested: usize) -> StatusPage {
        let jobs = self.queue.list_for_user(user);
        let total_pages = jobs.len().div_ceil(self.per_page).max(1);
        let page = requested.clamp(1, total_pages);
        self.cursors.insert(user, page);

        let jobs: Vec<JobSummary> = jobs
            .into_iter()
            .skip((page - 1) * self.per_page)
            .take(self.per_page)
            .collect();
        let cancellable = jobs
            .iter()
            .filter(|j| j.is_cancellable())
            .map(|j| j.id)
            .collect();
        debug!(user = %user, page, total_pages, "Status page rendered");
        StatusPage {
            jobs,
            page,
            total_pages,
            cancellable,
            system: self.queue.snapshot(),
        }
    }
}

/// Human-readable quota report.
pub fn render_limits(usage: &QuotaUsage) -> String {
    format!(
        "📊 Files today: {}/{} ({} left)\nMax file size: {} MB\nResets in: {}",
        usage.used,
        usage.max,
        usage.remaining,
        usage.max_file_size_bytes / crate::config::MIB,
        format_eta(&usage.resets_in.as_secs())
    )
}
