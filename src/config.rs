//! Configuration types for document collection, queueing and merging.
//!
//! Every limit the service enforces is controlled through [`MergeConfig`],
//! built via its [`MergeConfigBuilder`]. All values are fixed at startup: the
//! quota tracker, the queue and the pipeline stages each copy what they need
//! when they are constructed.

use crate::error::MergeError;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// One mebibyte.
pub const MIB: u64 = 1024 * 1024;

/// Ratio between the accepted upload size and the bytes an archive-based
/// source (EPUB, DOCX) may decompress to.
pub const UNPACK_RATIO: u64 = 16;

/// Limits and knobs for the whole pipeline.
///
/// Built via [`MergeConfig::builder()`] or using [`MergeConfig::default()`].
///
/// # Example
/// ```rust
/// use docmerge::MergeConfig;
///
/// let config = MergeConfig::builder()
///     .max_files_per_day(10)
///     .max_concurrent_jobs(2)
///     .collection_timeout_secs(120)
///     .build()
///     .unwrap();
/// assert_eq!(config.max_concurrent_jobs, 2);
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MergeConfig {
    /// Files a single user may submit per UTC day. Default: 30.
    pub max_files_per_day: u32,

    /// Largest accepted source file in bytes. Default: 15 MiB.
    pub max_file_size_bytes: u64,

    /// Jobs converted and merged at the same time. Default: 1.
    ///
    /// Every further finalized session waits in the FIFO queue.
    pub max_concurrent_jobs: usize,

    /// Inactivity period after which a collecting session is cancelled. Default: 300.
    ///
    /// The watchdog is re-armed on every accepted document.
    pub collection_timeout_secs: u64,

    /// Jobs shown per page of the status board. Default: 4.
    pub items_per_status_page: usize,

    /// Size of the worker pool for CPU-bound conversion and merge work. Default: 4.
    ///
    /// Shared by all running jobs, so the total number of blocking threads
    /// busy with documents never exceeds this value.
    pub conversion_workers: usize,

    /// Leading non-blank lines inspected for an existing heading. Default: 5.
    pub heading_scan_window: usize,

    /// Longest output base name (in characters) after sanitizing. Default: 100.
    pub max_output_name_len: usize,

    /// Break inserted between merged documents. Default: horizontal rule.
    pub separator: DocumentSeparator,
}

impl Default for MergeConfig {
    fn default() -> Self {
        Self {
            max_files_per_day: 30,
            max_file_size_bytes: 15 * MIB,
            max_concurrent_jobs: 1,
            collection_timeout_secs: 300,
            items_per_status_page: 4,
            conversion_workers: 4,
            heading_scan_window: 5,
            max_output_name_len: 100,
            separator: DocumentSeparator::default(),
        }
    }
}

impl MergeConfig {
    /// Create a new builder for `MergeConfig`.
    pub fn builder() -> MergeConfigBuilder {
        MergeConfigBuilder {
            config: Self::default(),
        }
    }

    pub fn collection_timeout(&self) -> Duration {
        Duration::from_secs(self.collection_timeout_secs)
    }

    /// Total decompressed bytes a converter may read from one archive.
    pub fn max_unpacked_bytes(&self) -> u64 {
        self.max_file_size_bytes.saturating_mul(UNPACK_RATIO)
    }
}

/// Builder for [`MergeConfig`].
#[derive(Debug)]
pub struct MergeConfigBuilder {
    config: MergeConfig,
}

impl MergeConfigBuilder {
    pub fn max_files_per_day(mut self, n: u32) -> Self {
        self.config.max_files_per_day = n;
        self
    }

    pub fn max_file_size_bytes(mut self, bytes: u64) -> Self {
        self.config.max_file_size_bytes = bytes;
        self
    }

    pub fn max_file_size_mb(mut self, mb: u64) -> Self {
        self.config.max_file_size_bytes = mb.saturating_mul(MIB);
        self
    }

    pub fn max_concurrent_jobs(mut self, n: usize) -> Self {
        self.config.max_concurrent_jobs = n;
        self
    }

    pub fn collection_timeout_secs(mut self, secs: u64) -> Self {
        self.config.collection_timeout_secs = secs;
        self
    }

    pub fn items_per_status_page(mut self, n: usize) -> Self {
        self.config.items_per_status_page = n;
        self
    }

    pub fn conversion_workers(mut self, n: usize) -> Self {
        self.config.conversion_workers = n;
        self
    }

    pub fn heading_scan_window(mut self, n: usize) -> Self {
        self.config.heading_scan_window = n.max(1);
        self
    }

    pub fn max_output_name_len(mut self, n: usize) -> Self {
        self.config.max_output_name_len = n;
        self
    }

    pub fn separator(mut self, sep: DocumentSeparator) -> Self {
        self.config.separator = sep;
        self
    }

    /// Build the configuration, validating constraints.
    pub fn build(self) -> Result<MergeConfig, MergeError> {
        let c = &self.config;
        if c.max_concurrent_jobs == 0 {
            return Err(MergeError::InvalidConfig(
                "max_concurrent_jobs must be ≥ 1".into(),
            ));
        }
        if c.conversion_workers == 0 {
            return Err(MergeError::InvalidConfig(
                "conversion_workers must be ≥ 1".into(),
            ));
        }
        if c.items_per_status_page == 0 {
            return Err(MergeError::InvalidConfig(
                "items_per_status_page must be ≥ 1".into(),
            ));
        }
        if c.collection_timeout_secs == 0 {
            return Err(MergeError::InvalidConfig(
                "collection_timeout_secs must be ≥ 1".into(),
            ));
        }
        if c.max_output_name_len == 0 {
            return Err(MergeError::InvalidConfig(
                "max_output_name_len must be ≥ 1".into(),
            ));
        }
        Ok(self.config)
    }
}

// ── Enums ────────────────────────────────────────────────────────────────

/// How to separate documents in the merged output.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum DocumentSeparator {
    /// Horizontal rule: "\n\n---\n\n" (default)
    #[default]
    HorizontalRule,
    /// HTML page-break block, honoured by most Markdown → print pipelines.
    PageBreak,
    /// HTML comment with the document number: "<!-- document N -->"
    Comment,
    /// Custom string inserted between documents.
    Custom(String),
}

impl DocumentSeparator {
    /// Render the separator placed before document `doc_num` (1-indexed).
    pub fn render(&self, doc_num: usize) -> String {
        match self {
            DocumentSeparator::HorizontalRule => "\n\n---\n\n".to_string(),
            DocumentSeparator::PageBreak => {
                "\n\n<div style=\"page-break-after: always;\"></div>\n\n".to_string()
            }
            DocumentSeparator::Comment => format!("\n\n<!-- document {} -->\n\n", doc_num),
            DocumentSeparator::Custom(s) => format!("\n\n{}\n\n", s),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let c = MergeConfig::default();
        assert_eq!(c.max_files_per_day, 30);
        assert_eq!(c.max_file_size_bytes, 15 * MIB);
        assert_eq!(c.max_concurrent_jobs, 1);
        assert_eq!(c.collection_timeout_secs, 300);
        assert_eq!(c.items_per_status_page, 4);
        assert_eq!(c.collection_timeout(), Duration::from_secs(300));
    }

    #[test]
    fn builder_rejects_zero_concurrency() {
        let err = MergeConfig::builder()
            .max_concurrent_jobs(0)
            .build()
            .unwrap_err();
        assert!(err.to_string().contains("max_concurrent_jobs"));
    }

    #[test]
    fn builder_rejects_zero_workers_and_page_size() {
        assert!(MergeConfig::builder().conversion_workers(0).build().is_err());
        assert!(MergeConfig::builder()
            .items_per_status_page(0)
            .build()
            .is_err());
    }

    #[test]
    fn file_size_in_megabytes() {
        let c = MergeConfig::builder().max_file_size_mb(2).build().unwrap();
        assert_eq!(c.max_file_size_bytes, 2 * MIB);
        assert_eq!(c.max_unpacked_bytes(), 2 * MIB * UNPACK_RATIO);
    }

    #[test]
    fn separator_rendering() {
        assert_eq!(DocumentSeparator::HorizontalRule.render(2), "\n\n---\n\n");
        assert!(DocumentSeparator::Comment.render(3).contains("document 3"));
        assert_eq!(
            DocumentSeparator::Custom("* * *".into()).render(1),
            "\n\n* * *\n\n"
        );
        assert!(DocumentSeparator::PageBreak.render(2).contains("page-break"));
    }
}
