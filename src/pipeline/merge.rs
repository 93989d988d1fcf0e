//! Merge stage: assemble converted documents into the final artifact.
//!
//! The stage never fails as a whole. Documents are processed strictly in
//! input order; one that cannot be read back becomes a visible error marker in
//! place of its content. An empty input, or a composite that ends up empty,
//! still produces an artifact holding an explicit error notice. The caller
//! decides success by inspecting [`MergeArtifact`].

use super::convert::ConvertedDocument;
use super::heading::ensure_heading;
use super::normalize::clean_markdown;
use super::WorkerPool;
use crate::config::DocumentSeparator;
use crate::error::DocumentError;
use crate::queue::JobId;
use crate::store::{FileHandle, FileStore};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Best-effort result of [`MergeStage::merge`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergeArtifact {
    /// Stored artifact; `None` when it could not be written at all.
    pub handle: Option<FileHandle>,
    /// Documents whose content is in the artifact.
    pub merged: usize,
    /// Per-document failures, in document order.
    pub failed: Vec<DocumentError>,
}

/// One slot of the composite, in document order.
enum Section {
    Body {
        origin_name: String,
        text: String,
    },
    Error(DocumentError),
}

pub struct MergeStage {
    store: Arc<dyn FileStore>,
    pool: WorkerPool,
    separator: DocumentSeparator,
    heading_window: usize,
}

impl MergeStage {
    pub fn new(
        store: Arc<dyn FileStore>,
        pool: WorkerPool,
        separator: DocumentSeparator,
        heading_window: usize,
    ) -> Self {
        Self {
            store,
            pool,
            separator,
            heading_window,
        }
    }

    /// Merge `documents` (already in job order) into `<output_name>.md`.
    pub async fn merge(
        &self,
        job_id: JobId,
        documents: &[ConvertedDocument],
        output_name: &str,
    ) -> MergeArtifact {
        let mut sections = Vec::with_capacity(documents.len());
        let mut failed = Vec::new();

        for doc in documents {
            match doc {
                ConvertedDocument::Ready {
                    index,
                    origin_name,
                    handle,
                    ..
                } => match self.store.load(handle).await {
                    Ok(bytes) => sections.push(Section::Body {
                        origin_name: origin_name.clone(),
                        text: String::from_utf8_lossy(&bytes).into_owned(),
                    }),
                    Err(e) => {
                        let error = DocumentError::MergeFailed {
                            index: *index,
                            file_name: origin_name.clone(),
                            detail: e.to_string(),
                        };
                        warn!(job_id = %job_id, index, "{}", error);
                        failed.push(error.clone());
                        sections.push(Section::Error(error));
                    }
                },
                ConvertedDocument::Failed { error, .. } => {
                    failed.push(error.clone());
                    sections.push(Section::Error(error.clone()));
                }
            }
        }
        let merged = sections
            .iter()
            .filter(|s| matches!(s, Section::Body { .. }))
            .count();

        let separator = self.separator.clone();
        let window = self.heading_window;
        let composite = match self
            .pool
            .run(move || assemble(&sections, &separator, window))
            .await
        {
            Ok(text) => text,
            Err(e) => {
                warn!(job_id = %job_id, "Merge worker failed: {}", e);
                error_notice(&format!("the documents could not be merged: {e}"))
            }
        };
        let composite = if composite.trim().is_empty() {
            error_notice(if documents.is_empty() {
                "there were no documents to merge"
            } else {
                "the merged document is empty"
            })
        } else {
            composite
        };

        let handle = match self
            .store
            .save(&format!("{output_name}.md"), composite.into_bytes())
            .await
        {
            Ok(h) => Some(h),
            Err(e) => {
                warn!(job_id = %job_id, "Could not write merged artifact: {}", e);
                None
            }
        };

        info!(job_id = %job_id, merged, failed = failed.len(), "Merge finished");
        MergeArtifact {
            handle,
            merged,
            failed,
        }
    }
}

fn error_notice(reason: &str) -> String {
    format!("> **Error:** {reason}.\n")
}

fn assemble(sections: &[Section], separator: &DocumentSeparator, window: usize) -> String {
    let mut out = String::new();
    for (i, section) in sections.iter().enumerate() {
        let doc_num = i + 1;
        if i > 0 {
            out.push_str(&separator.render(doc_num));
        }
        match section {
            Section::Body { origin_name, text } => {
                let text = clean_markdown(text);
                let text = ensure_heading(&text, origin_name, doc_num, window);
                debug!(doc_num, file = %origin_name, chars = text.len(), "Appending document");
                out.push_str(text.trim_end());
            }
            Section::Error(e) => {
                out.push_str(&format!("> **Error:** {e}"));
            }
        }
    }
    let trimmed = out.trim_end().len();
    out.truncate(trimmed);
    if !out.is_empty() {
        out.push('\n');
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryFileStore;

    fn stage(store: &Arc<MemoryFileStore>) -> MergeStage {
        MergeStage::new(
            store.clone(),
            WorkerPool::new(1),
            DocumentSeparator::HorizontalRule,
            5,
        )
    }

    async fn ready(store: &MemoryFileStore, index: usize, name: &str, body: &str) -> ConvertedDocument {
        ConvertedDocument::Ready {
            index,
            origin_name: name.into(),
            handle: store.save(name, body.as_bytes().to_vec()).await.unwrap(),
            intermediate: true,
        }
    }

    async fn artifact_text(store: &MemoryFileStore, a: &MergeArtifact) -> String {
        let h = a.handle.as_ref().unwrap();
        String::from_utf8(store.load(h).await.unwrap()).unwrap()
    }

    #[tokio::test]
    async fn merges_in_order_with_headings_and_separators() {
        let store = Arc::new(MemoryFileStore::new());
        let docs = vec![
            ready(&store, 0, "a.txt", "alpha text\n").await,
            ready(&store, 1, "b.epub", "# Chapter B\n\nbeta text\n").await,
        ];
        let a = stage(&store).merge(JobId(1), &docs, "book").await;
        assert_eq!(a.merged, 2);
        assert!(a.failed.is_empty());
        assert_eq!(
            artifact_text(&store, &a).await,
            "# a\n\nalpha text\n\n---\n\n# Chapter B\n\nbeta text\n"
        );
        assert!(a.handle.unwrap().as_str().ends_with("book.md"));
    }

    #[tokio::test]
    async fn failed_documents_become_markers_in_place() {
        let store = Arc::new(MemoryFileStore::new());
        let docs = vec![
            ready(&store, 0, "a.txt", "alpha\n").await,
            ConvertedDocument::Failed {
                index: 1,
                origin_name: "b.fb2".into(),
                error: DocumentError::ConversionFailed {
                    index: 1,
                    file_name: "b.fb2".into(),
                    detail: "worker crashed".into(),
                },
            },
            ConvertedDocument::Ready {
                index: 2,
                origin_name: "c.txt".into(),
                handle: FileHandle::new("vanished"),
                intermediate: true,
            },
            ready(&store, 3, "d.txt", "delta\n").await,
        ];
        let a = stage(&store).merge(JobId(2), &docs, "out").await;
        assert_eq!(a.merged, 2);
        assert_eq!(a.failed.len(), 2);
        assert_eq!(a.failed[0].index(), 1);
        assert!(matches!(a.failed[1], DocumentError::MergeFailed { index: 2, .. }));

        let text = artifact_text(&store, &a).await;
        let alpha = text.find("alpha").unwrap();
        let worker = text.find("worker crashed").unwrap();
        let vanished = text.find("'c.txt'").unwrap();
        let delta = text.find("delta").unwrap();
        assert!(alpha < worker && worker < vanished && vanished < delta);
    }

    #[tokio::test]
    async fn empty_input_still_yields_error_artifact() {
        let store = Arc::new(MemoryFileStore::new());
        let a = stage(&store).merge(JobId(3), &[], "empty").await;
        assert_eq!(a.merged, 0);
        let text = artifact_text(&store, &a).await;
        assert!(text.contains("no documents to merge"));
    }

    #[test]
    fn assemble_uses_configured_separator() {
        let sections = vec![
            Section::Body {
                origin_name: "x.md".into(),
                text: "# X\n".into(),
            },
            Section::Body {
                origin_name: "y.md".into(),
                text: "# Y\n".into(),
            },
        ];
        let out = assemble(&sections, &DocumentSeparator::Comment, 5);
        assert_eq!(out, "# X\n\n<!-- document 2 -->\n\n# Y\n");
    }
}
