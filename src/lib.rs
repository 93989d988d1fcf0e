//! # docmerge
//!
//! Collect documents from users, normalise them to Markdown and merge them
//! into one file in the order they were sent.
//!
//! ## Why this crate?
//!
//! Chat transports deliver uploads concurrently and out of order, users run
//! out of patience mid-collection, and one corrupt EPUB should not cost
//! someone the other twenty files. This crate keeps that bookkeeping out of
//! the transport: it owns per-user quotas, the collection state machine,
//! a bounded FIFO of merge jobs and a pipeline that never loses a document's
//! position, even when it fails to convert.
//!
//! ## Pipeline Overview
//!
//! ```text
//! upload
//!  │
//!  ├─ 1. Session   begin → submit documents → finalize → name   (session)
//!  │                quota reserved per file before download      (quota)
//!  ├─ 2. Queue     FIFO, at most max_concurrent_jobs active      (queue)
//!  ├─ 3. Convert   txt / fb2 / epub / docx → Markdown, pooled    (pipeline::convert)
//!  ├─ 4. Merge     clean-up, ensure heading, separators          (pipeline::merge)
//!  ├─ 5. Deliver   exactly one Notifier::notify_result per job   (runner)
//!  └─ 6. Cleanup   originals, intermediates and artifact deleted (runner)
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use docmerge::{
//!     BoxError, ChatId, IncomingDocument, MemoryFileStore, MergeConfig, MergeService, NoopNotifier,
//!     UserId,
//! };
//! use std::sync::Arc;
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let service = MergeService::new(
//!         MergeConfig::default(),
//!         Arc::new(MemoryFileStore::new()),
//!         Arc::new(NoopNotifier),
//!     );
//!     let shutdown = CancellationToken::new();
//!     let runner = service.spawn_runner(shutdown.clone());
//!
//!     let (chat, user) = (ChatId(1), UserId(42));
//!     service.sessions.begin(chat, user)?;
//!     let doc = IncomingDocument::new("notes.txt", 5, 1);
//!     service
//!         .sessions
//!         .submit_document(chat, user, doc, async { Ok::<_, BoxError>(b"hello".to_vec()) })
//!         .await?;
//!     service.sessions.finalize(chat, user)?;
//!     let queued = service.sessions.set_output_name(chat, user, Some("Notes"))?;
//!     println!("job #{} queued at position {}", queued.job_id, queued.position);
//!
//!     shutdown.cancel();
//!     runner.await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Feature Flags
//!
//! | Feature | Default | Description |
//! |---------|---------|-------------|
//! | `cli`   | on      | Enables the `docmerge` binary (clap + anyhow + tracing-subscriber + indicatif) |
//!
//! Disable `cli` when using only the library:
//! ```toml
//! docmerge = { version = "0.1", default-features = false }
//! ```

// ── Modules ──────────────────────────────────────────────────────────────

pub mod config;
pub mod error;
pub mod notify;
pub mod pipeline;
pub mod queue;
pub mod quota;
pub mod runner;
pub mod service;
pub mod session;
pub mod status;
pub mod store;
pub mod types;

// ── Re-exports ───────────────────────────────────────────────────────────

pub use config::{DocumentSeparator, MergeConfig, MergeConfigBuilder};
pub use error::{BoxError, DocumentError, MergeError, SessionError};
pub use notify::{JobResult, NoopNotifier, Notifier};
pub use pipeline::formats::DocumentFormat;
pub use queue::{CancelOutcome, Enqueued, JobId, JobQueue, JobStatus};
pub use quota::{QuotaTracker, QuotaUsage};
pub use runner::{JobCleanup, JobRunner};
pub use service::MergeService;
pub use session::{sanitize_output_name, SessionManager};
pub use status::{StatusBoard, StatusPage};
pub use store::{FileHandle, FileStore, LocalFileStore, MemoryFileStore};
pub use types::{ChatId, IncomingDocument, Recipient, StoredDocument, UserId};
