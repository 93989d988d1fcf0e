//! Error types for the docmerge library.
//!
//! Two distinct error types reflect two distinct failure modes:
//!
//! * [`MergeError`] — **Fatal for one request**: the submission, session
//!   transition or cancellation cannot proceed (quota exhausted, wrong session
//!   state, unsupported file). Surfaced immediately to the caller and never
//!   enters the pipeline.
//!
//! * [`DocumentError`] — **Non-fatal**: a single document failed to convert or
//!   to merge, but every other document of the job is fine. Carried through
//!   the pipeline as a tagged value and rendered as a visible error marker in
//!   the merged artifact rather than aborting the whole job.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// All request-level errors returned by the docmerge library.
#[derive(Debug, Error)]
pub enum MergeError {
    // ── Admission errors ──────────────────────────────────────────────────
    /// The user has used up today's file allowance.
    #[error(
        "Daily limit reached ({used}/{max}). Resets in {} (at 00:00 UTC).",
        format_eta(.resets_in_secs)
    )]
    QuotaExceeded {
        used: u32,
        max: u32,
        resets_in_secs: u64,
    },

    /// The submitted file is larger than the per-file limit.
    #[error("File is {size} bytes, the limit is {max} bytes")]
    FileTooLarge { size: u64, max: u64 },

    /// The file extension is not one of the supported source formats.
    #[error("Unsupported file format: '{file_name}'. Supported: .docx, .fb2, .epub, .txt, .md")]
    UnsupportedFormat { file_name: String },

    /// The request does not fit the current collection session.
    #[error(transparent)]
    Session(#[from] SessionError),

    // ── I/O errors ────────────────────────────────────────────────────────
    /// A storage operation failed.
    #[error("Storage operation failed for '{handle}': {detail}")]
    Storage { handle: String, detail: String },

    /// The transport could not deliver the document bytes.
    #[error("Failed to download '{file_name}': {reason}")]
    DownloadFailed { file_name: String, reason: String },

    // ── Cancellation races ────────────────────────────────────────────────
    /// No queued or active job carries this ID.
    #[error("Job #{0} was not found in the queue or has already finished")]
    JobNotFound(u64),

    /// The job has already been picked up by the runner.
    #[error("Job #{0} is already running and can no longer be cancelled")]
    AlreadyRunning(u64),

    // ── Config errors ─────────────────────────────────────────────────────
    /// Builder validation failed.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // ── Catch-all ─────────────────────────────────────────────────────────
    /// Unexpected internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Error type a transport's download future may fail with.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Render a number of seconds as `"H h M min"`.
pub fn format_eta(secs: &u64) -> String {
    format!("{} h {} min", secs / 3600, (secs % 3600) / 60)
}

/// Collection-session protocol violations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SessionError {
    #[error("File collection is already running. Send files or use /end_merge or /cancel.")]
    AlreadyCollecting,

    #[error("Another user is collecting files in this chat. Please wait.")]
    OwnedByOther,

    #[error("File collection is not running. Use /start_merge to begin.")]
    NoActiveSession,

    #[error("Waiting for the output file name. Send a name, skip it, or /cancel.")]
    AwaitingName,

    #[error("Session is {actual}, this action needs it to be {expected}")]
    WrongState {
        expected: SessionStateName,
        actual: SessionStateName,
    },

    #[error("Only the user who started the collection can do this.")]
    NotOwner,

    #[error("No files have been collected yet.")]
    EmptySession,
}

/// Printable name of a session state, used in [`SessionError::WrongState`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionStateName {
    Collecting,
    NamingOutput,
}

impl fmt::Display for SessionStateName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionStateName::Collecting => f.write_str("collecting files"),
            SessionStateName::NamingOutput => f.write_str("waiting for an output name"),
        }
    }
}

/// A non-fatal error for a single document of a job.
///
/// Stored in the pipeline's tagged results; the merge stage renders it as an
/// error marker at the document's position.
#[derive(Debug, Clone, Error, PartialEq, Eq, Serialize, Deserialize)]
pub enum DocumentError {
    /// Reading, converting or storing the canonical form failed.
    #[error("Document {index} ('{file_name}'): conversion failed: {detail}")]
    ConversionFailed {
        index: usize,
        file_name: String,
        detail: String,
    },

    /// The converted document could not be read back for merging.
    #[error("Document {index} ('{file_name}'): could not be merged: {detail}")]
    MergeFailed {
        index: usize,
        file_name: String,
        detail: String,
    },
}

impl DocumentError {
    /// Position of the failed document in the job's document list.
    pub fn index(&self) -> usize {
        match self {
            DocumentError::ConversionFailed { index, .. }
            | DocumentError::MergeFailed { index, .. } => *index,
        }
    }
}
