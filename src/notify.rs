//! Notifier trait: how the pipeline talks back to the user.
//!
//! The core never sends chat messages itself. Inject an
//! [`Arc<dyn Notifier>`] and it receives progress lines, the single terminal
//! result of every job, and inactivity-timeout notices. Implementations own
//! delivery: a failed send is theirs to log, the pipeline treats every call as
//! fire-and-forget.
//!
//! # Example
//!
//! ```rust
//! use async_trait::async_trait;
//! use docmerge::{JobResult, Notifier, Recipient};
//! use std::sync::atomic::{AtomicUsize, Ordering};
//!
//! struct CountingNotifier {
//!     results: AtomicUsize,
//! }
//!
//! #[async_trait]
//! impl Notifier for CountingNotifier {
//!     async fn notify_progress(&self, _to: Recipient, text: String) {
//!         eprintln!("{text}");
//!     }
//!
//!     async fn notify_result(&self, _to: Recipient, _result: JobResult) {
//!         self.results.fetch_add(1, Ordering::SeqCst);
//!     }
//! }
//! ```

use crate::error::DocumentError;
use crate::queue::JobId;
use crate::store::FileHandle;
use crate::types::Recipient;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

/// Terminal outcome of a job, sent exactly once per job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum JobResult {
    /// The merged artifact is ready. It stays in the store until
    /// [`Notifier::notify_result`] returns.
    Delivered {
        job_id: JobId,
        artifact: FileHandle,
        /// Name the artifact should be presented under (`<base>.md`).
        file_name: String,
        /// Origin names of the merged sources, in merge order.
        sources: Vec<String>,
        /// Documents whose content made it into the artifact.
        merged: usize,
        /// Documents replaced by an error marker.
        failed: Vec<DocumentError>,
        elapsed: Duration,
    },
    /// No usable artifact could be produced.
    Failed { job_id: JobId, reason: String },
}

impl JobResult {
    pub fn job_id(&self) -> JobId {
        match self {
            JobResult::Delivered { job_id, .. } | JobResult::Failed { job_id, .. } => *job_id,
        }
    }

    pub fn is_delivered(&self) -> bool {
        matches!(self, JobResult::Delivered { .. })
    }

    /// Human-readable summary line for chat transports.
    pub fn summary(&self) -> String {
        match self {
            JobResult::Delivered {
                job_id,
                file_name,
                sources,
                failed,
                elapsed,
                ..
            } => {
                let mut text = format!(
                    "✅ Job #{} finished in {:.1}s\nFile: {}\nMerged from {} files:",
                    job_id,
                    elapsed.as_secs_f64(),
                    file_name,
                    sources.len()
                );
                for name in sources {
                    text.push_str("\n- ");
                    text.push_str(name);
                }
                if !failed.is_empty() {
                    text.push_str(&format!("\n⚠️ {} file(s) could not be added:", failed.len()));
                    for e in failed {
                        text.push_str("\n  ");
                        text.push_str(&e.to_string());
                    }
                }
                text
            }
            JobResult::Failed { job_id, reason } => {
                format!("❌ Job #{} failed: {}", job_id, reason)
            }
        }
    }
}

/// Receives user-facing events from sessions, the queue and the runner.
///
/// Implementations must be `Send + Sync`: jobs for different users finish on
/// different tasks and may call in concurrently.
#[async_trait]
pub trait Notifier: Send + Sync {
    /// Informational line (job started, job queued, …).
    async fn notify_progress(&self, to: Recipient, text: String);

    /// The one terminal notification of a job.
    async fn notify_result(&self, to: Recipient, result: JobResult);

    /// A collecting session was cancelled for inactivity and `discarded`
    /// documents were deleted.
    async fn notify_timeout(&self, to: Recipient, discarded: usize) {
        self.notify_progress(
            to,
            format!("⏰ File collection cancelled due to inactivity ({discarded} files discarded)."),
        )
        .await;
    }
}

/// A notifier that drops every event.
pub struct NoopNotifier;

#[async_trait]
impl Notifier for NoopNotifier {
    async fn notify_progress(&self, _to: Recipient, _text: String) {}

    async fn notify_result(&self, _to: Recipient, _result: JobResult) {}
}

/// Convenience alias for the shared notifier handle.
pub type SharedNotifier = Arc<dyn Notifier>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ChatId, UserId};
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recording {
        lines: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl Notifier for Recording {
        async fn notify_progress(&self, _to: Recipient, text: String) {
            self.lines.lock().unwrap().push(text);
        }

        async fn notify_result(&self, _to: Recipient, result: JobResult) {
            self.lines.lock().unwrap().push(result.summary());
        }
    }

    #[tokio::test]
    async fn default_timeout_notice_goes_through_progress() {
        let n = Recording::default();
        n.notify_timeout(Recipient::new(ChatId(1), UserId(2)), 3).await;
        let lines = n.lines.lock().unwrap();
        assert_eq!(lines.len(), 1);
        assert!(lines[0].contains("inactivity"));
        assert!(lines[0].contains('3'));
    }

    #[tokio::test]
    async fn noop_notifier_accepts_everything() {
        let n: SharedNotifier = Arc::new(NoopNotifier);
        let to = Recipient::new(ChatId(1), UserId(1));
        n.notify_progress(to, "x".into()).await;
        n.notify_result(
            to,
            JobResult::Failed {
                job_id: JobId(1),
                reason: "nothing".into(),
            },
        )
        .await;
        n.notify_timeout(to, 0).await;
    }

    #[test]
    fn delivered_summary_lists_sources_and_failures() {
        let r = JobResult::Delivered {
            job_id: JobId(7),
            artifact: FileHandle::new("000001_book.md"),
            file_name: "book.md".into(),
            sources: vec!["a.txt".into(), "b.epub".into()],
            merged: 1,
            failed: vec![DocumentError::ConversionFailed {
                index: 1,
                file_name: "b.epub".into(),
                detail: "worker crashed".into(),
            }],
            elapsed: Duration::from_millis(1500),
        };
        let s = r.summary();
        assert!(s.contains("#7"));
        assert!(s.contains("- a.txt"));
        assert!(s.contains("worker crashed"));
        assert!(r.is_delivered());
        assert_eq!(r.job_id(), JobId(7));
    }

    #[test]
    fn results_serialise_for_transports() {
        let r = JobResult::Failed {
            job_id: JobId(3),
            reason: "the merged file is empty".into(),
        };
        let json = serde_json::to_value(&r).unwrap();
        assert_eq!(json["Failed"]["job_id"], 3);
        assert_eq!(json["Failed"]["reason"], "the merged file is empty");
    }
}
