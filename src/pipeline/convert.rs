//! Conversion stage: every document of a job to canonical Markdown.
//!
//! Documents are converted concurrently on the shared [`WorkerPool`], but the
//! returned vector always has the same length and order as the input. A
//! document that cannot be converted is not dropped: it comes back as
//! [`ConvertedDocument::Failed`] at its original index so the merge stage can
//! put an error marker exactly where its content would have been.

use super::formats::ConverterRegistry;
use super::WorkerPool;
use crate::error::DocumentError;
use crate::queue::JobId;
use crate::store::{FileHandle, FileStore};
use crate::types::StoredDocument;
use futures::stream::{self, StreamExt};
use futures::FutureExt;
use std::path::Path;
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};

/// Tagged outcome of converting one document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConvertedDocument {
    Ready {
        index: usize,
        origin_name: String,
        handle: FileHandle,
        /// `true` when `handle` is a new intermediate file owned by the job,
        /// `false` when it is the original (already canonical) upload.
        intermediate: bool,
    },
    Failed {
        index: usize,
        origin_name: String,
        error: DocumentError,
    },
}

impl ConvertedDocument {
    pub fn index(&self) -> usize {
        match self {
            ConvertedDocument::Ready { index, .. } | ConvertedDocument::Failed { index, .. } => {
                *index
            }
        }
    }

    pub fn origin_name(&self) -> &str {
        match self {
            ConvertedDocument::Ready { origin_name, .. }
            | ConvertedDocument::Failed { origin_name, .. } => origin_name,
        }
    }

    /// Handle of a file created by the conversion, if any.
    pub fn intermediate_handle(&self) -> Option<&FileHandle> {
        match self {
            ConvertedDocument::Ready {
                handle,
                intermediate: true,
                ..
            } => Some(handle),
            _ => None,
        }
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, ConvertedDocument::Failed { .. })
    }
}

/// Dispatches format converters onto the worker pool.
pub struct ConversionStage {
    store: Arc<dyn FileStore>,
    registry: ConverterRegistry,
    pool: WorkerPool,
}

impl ConversionStage {
    pub fn new(store: Arc<dyn FileStore>, registry: ConverterRegistry, pool: WorkerPool) -> Self {
        Self {
            store,
            registry,
            pool,
        }
    }

    /// Convert `documents`, preserving their order in the result.
    ///
    /// Every intermediate file is pushed to `produced` as soon as it is
    /// stored, so the caller can clean it up even if this future never
    /// completes.
    pub async fn convert(
        &self,
        job_id: JobId,
        documents: &[StoredDocument],
        produced: &Mutex<Vec<FileHandle>>,
    ) -> Vec<ConvertedDocument> {
        info!(job_id = %job_id, documents = documents.len(), "Converting documents");

        let tasks: Vec<_> = documents
            .iter()
            .enumerate()
            .map(|(index, doc)| {
                async move {
                    let result = self.convert_one(index, doc, produced).await;
                    if let ConvertedDocument::Failed { error, .. } = &result {
                        warn!(job_id = %job_id, index, "{}", error);
                    }
                    result
                }
                .boxed()
            })
            .collect();

        let mut results: Vec<ConvertedDocument> = stream::iter(tasks)
            .buffer_unordered(self.pool.size())
            .collect()
            .await;

        // buffer_unordered yields in completion order
        results.sort_by_key(ConvertedDocument::index);

        let failed = results.iter().filter(|r| r.is_failed()).count();
        info!(job_id = %job_id, converted = results.len() - failed, failed, "Conversion finished");
        results
    }

    async fn convert_one(
        &self,
        index: usize,
        doc: &StoredDocument,
        produced: &Mutex<Vec<FileHandle>>,
    ) -> ConvertedDocument {
        let failed = |detail: String| ConvertedDocument::Failed {
            index,
            origin_name: doc.origin_name.clone(),
            error: DocumentError::ConversionFailed {
                index,
                file_name: doc.origin_name.clone(),
                detail,
            },
        };

        if doc.format.is_canonical() {
            debug!(index, file = %doc.origin_name, "Already canonical");
            return ConvertedDocument::Ready {
                index,
                origin_name: doc.origin_name.clone(),
                handle: doc.handle.clone(),
                intermediate: false,
            };
        }

        let Some(converter) = self.registry.get(doc.format) else {
            return failed(format!("no converter registered for .{}", doc.format));
        };

        let bytes = match self.store.load(&doc.handle).await {
            Ok(b) => b,
            Err(e) => return failed(format!("could not read source: {e}")),
        };

        let name = doc.origin_name.clone();
        let markdown = match self
            .pool
            .run(move || converter.convert_lossy(&name, &bytes))
            .await
        {
            Ok(md) => md,
            Err(e) => return failed(e.to_string()),
        };
        debug!(index, file = %doc.origin_name, chars = markdown.len(), "Converted");

        let stem = Path::new(&doc.origin_name)
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("document");
        match self
            .store
            .save(&format!("{stem}.md"), markdown.into_bytes())
            .await
        {
            Ok(handle) => {
                if let Ok(mut list) = produced.lock() {
                    list.push(handle.clone());
                }
                ConvertedDocument::Ready {
                    index,
                    origin_name: doc.origin_name.clone(),
                    handle,
                    intermediate: true,
                }
            }
            Err(e) => failed(format!("could not store converted text: {e}")),
        }
    }
}
