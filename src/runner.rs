//! Job runner: dequeue → convert → merge → deliver → clean up → next.
//!
//! Every admitted job ends with exactly one [`Notifier::notify_result`] call
//! and one cleanup pass, whatever happens in between. The active slot is
//! released by a drop guard, so the queue keeps moving even if a job task
//! panics.

use crate::config::MergeConfig;
use crate::notify::{JobResult, Notifier};
use crate::pipeline::convert::ConversionStage;
use crate::pipeline::formats::ConverterRegistry;
use crate::pipeline::merge::{MergeArtifact, MergeStage};
use crate::pipeline::WorkerPool;
use crate::queue::{Job, JobId, JobQueue};
use crate::store::{FileHandle, FileStore};
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Deletes a job's temporary files.
///
/// Each tracked handle is deleted at most once: a second [`run`](Self::run)
/// only touches handles tracked since the first. A failed delete is retried
/// once, then the file is given up on and reported as leaked.
pub struct JobCleanup {
    job_id: JobId,
    store: Arc<dyn FileStore>,
    pending: Vec<FileHandle>,
    seen: HashSet<FileHandle>,
}

/// What one cleanup pass did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CleanupReport {
    pub deleted: usize,
    pub leaked: usize,
}

impl JobCleanup {
    pub fn new(job_id: JobId, store: Arc<dyn FileStore>) -> Self {
        Self {
            job_id,
            store,
            pending: Vec::new(),
            seen: HashSet::new(),
        }
    }

    /// Register a file for deletion. Already-tracked handles are ignored.
    pub fn track(&mut self, handle: FileHandle) {
        if self.seen.insert(handle.clone()) {
            self.pending.push(handle);
        }
    }

    pub async fn run(&mut self) -> CleanupReport {
        let mut report = CleanupReport::default();
        for handle in std::mem::take(&mut self.pending) {
            let first = self.store.delete(&handle).await;
            let outcome = match first {
                Ok(()) => Ok(()),
                Err(e) => {
                    debug!(job_id = %self.job_id, handle = %handle, "Delete failed, retrying: {}", e);
                    self.store.delete(&handle).await
                }
            };
            match outcome {
                Ok(()) => report.deleted += 1,
                Err(e) => {
                    warn!(job_id = %self.job_id, handle = %handle, "Leaving orphaned file: {}", e);
                    report.leaked += 1;
                }
            }
        }
        debug!(job_id = %self.job_id, deleted = report.deleted, leaked = report.leaked, "Cleanup finished");
        report
    }
}

/// Releases the job's active slot when dropped.
struct CompletionGuard<'a> {
    queue: &'a JobQueue,
    job_id: JobId,
}

impl Drop for CompletionGuard<'_> {
    fn drop(&mut self) {
        if !self.queue.complete(self.job_id) {
            debug!(job_id = %self.job_id, "Job was not active at completion");
        }
    }
}

/// Drives queued jobs through the pipeline.
#[derive(Clone)]
pub struct JobRunner {
    inner: Arc<RunnerInner>,
}

struct RunnerInner {
    queue: Arc<JobQueue>,
    store: Arc<dyn FileStore>,
    notifier: Arc<dyn Notifier>,
    conversion: ConversionStage,
    merge: MergeStage,
}

impl JobRunner {
    pub fn new(
        config: &MergeConfig,
        queue: Arc<JobQueue>,
        store: Arc<dyn FileStore>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        let registry = ConverterRegistry::with_unpack_limit(config.max_unpacked_bytes());
        Self::with_registry(config, queue, store, notifier, registry)
    }

    /// Like [`new`](Self::new) with a custom set of converters.
    pub fn with_registry(
        config: &MergeConfig,
        queue: Arc<JobQueue>,
        store: Arc<dyn FileStore>,
        notifier: Arc<dyn Notifier>,
        registry: ConverterRegistry,
    ) -> Self {
        let pool = WorkerPool::new(config.conversion_workers);
        let conversion = ConversionStage::new(store.clone(), registry, pool.clone());
        let merge = MergeStage::new(
            store.clone(),
            pool,
            config.separator.clone(),
            config.heading_scan_window,
        );
        Self {
            inner: Arc::new(RunnerInner {
                queue,
                store,
                notifier,
                conversion,
                merge,
            }),
        }
    }

    /// Admit and process jobs until `shutdown` fires, then wait for the jobs
    /// already running.
    pub async fn run(&self, shutdown: CancellationToken) {
        info!(max_active = self.inner.queue.max_active(), "Job runner started");
        let mut running = JoinSet::new();
        loop {
            while let Some(job) = self.inner.queue.try_dequeue() {
                let inner = Arc::clone(&self.inner);
                running.spawn(async move { inner.process(job).await });
            }
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = self.inner.queue.wakeup().notified() => {}
                Some(joined) = running.join_next(), if !running.is_empty() => {
                    if let Err(e) = joined {
                        error!("Job task failed: {}", e);
                    }
                }
            }
        }
        info!(in_flight = running.len(), "Job runner stopping");
        while let Some(joined) = running.join_next().await {
            if let Err(e) = joined {
                error!("Job task failed: {}", e);
            }
        }
    }

    /// Process one job that is already active in the queue. Returns the
    /// result that was sent to the notifier.
    pub async fn process(&self, job: Job) -> JobResult {
        self.inner.process(job).await
    }
}

impl RunnerInner {
    async fn process(self: &Arc<Self>, job: Job) -> JobResult {
        let _slot = CompletionGuard {
            queue: &self.queue,
            job_id: job.id,
        };
        let recipient = job.recipient();
        let mut cleanup = JobCleanup::new(job.id, self.store.clone());
        for doc in &job.documents {
            cleanup.track(doc.handle.clone());
        }

        info!(job_id = %job.id, user = %job.owner, documents = job.documents.len(), "Job started");
        self.notifier
            .notify_progress(
                recipient,
                format!("⚙️ Processing job #{} ({} files)…", job.id, job.documents.len()),
            )
            .await;

        // Run the stages on their own task so a panic still ends in a notification.
        // Files they create are recorded in `produced` as they appear.
        let produced = Arc::new(Mutex::new(Vec::new()));
        let pipeline = {
            let this = Arc::clone(self);
            let job = job.clone();
            let produced = Arc::clone(&produced);
            tokio::spawn(async move { this.pipeline(&job, &produced).await })
        };
        let joined = pipeline.await;
        let temporaries = match produced.lock() {
            Ok(mut list) => std::mem::take(&mut *list),
            Err(poisoned) => std::mem::take(&mut *poisoned.into_inner()),
        };
        for handle in temporaries {
            cleanup.track(handle);
        }
        let result = match joined {
            Ok(result) => result,
            Err(e) => {
                error!(job_id = %job.id, "Job pipeline aborted: {}", e);
                JobResult::Failed {
                    job_id: job.id,
                    reason: "internal error while processing the files".to_string(),
                }
            }
        };

        info!(job_id = %job.id, delivered = result.is_delivered(), "Job finished");
        self.notifier.notify_result(recipient, result.clone()).await;
        cleanup.run().await;
        result
    }

    async fn pipeline(&self, job: &Job, produced: &Mutex<Vec<FileHandle>>) -> JobResult {
        let started = Instant::now();
        let converted = self
            .conversion
            .convert(job.id, &job.documents, produced)
            .await;

        let artifact = self.merge.merge(job.id, &converted, &job.output_name).await;
        if let (Some(h), Ok(mut list)) = (&artifact.handle, produced.lock()) {
            list.push(h.clone());
        }

        match self.validate(&artifact).await {
            Ok(handle) => JobResult::Delivered {
                job_id: job.id,
                artifact: handle,
                file_name: format!("{}.md", job.output_name),
                sources: job.documents.iter().map(|d| d.origin_name.clone()).collect(),
                merged: artifact.merged,
                failed: artifact.failed,
                elapsed: started.elapsed(),
            },
            Err(reason) => {
                warn!(job_id = %job.id, "No usable artifact: {}", reason);
                JobResult::Failed {
                    job_id: job.id,
                    reason,
                }
            }
        }
    }

    /// The artifact is usable when it holds at least one document and is a
    /// non-empty stored file.
    async fn validate(&self, artifact: &MergeArtifact) -> Result<FileHandle, String> {
        let Some(handle) = &artifact.handle else {
            return Err("the merged file could not be saved".to_string());
        };
        if artifact.merged == 0 {
            return Err(match artifact.failed.len() {
                0 => "there were no documents to merge".to_string(),
                n => format!("none of the {n} files could be converted"),
            });
        }
        match self.store.exists(handle).await {
            Ok(true) => {}
            Ok(false) => return Err("the merged file is missing".to_string()),
            Err(e) => return Err(format!("the merged file could not be checked: {e}")),
        }
        match self.store.size_of(handle).await {
            Ok(0) => Err("the merged file is empty".to_string()),
            Ok(_) => Ok(handle.clone()),
            Err(e) => Err(format!("the merged file could not be checked: {e}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::formats::DocumentFormat;
    use crate::queue::JobRequest;
    use crate::store::{MemoryFileStore, StoreError, StoreResult};
    use crate::types::{ChatId, Recipient, StoredDocument, UserId};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recording {
        results: Mutex<Vec<JobResult>>,
    }

    #[async_trait]
    impl Notifier for Recording {
        async fn notify_progress(&self, _to: Recipient, _text: String) {}

        async fn notify_result(&self, _to: Recipient, result: JobResult) {
            self.results.lock().unwrap().push(result);
        }
    }

    /// Fails the first `failures` deletes, counting every attempt.
    struct FlakyStore {
        inner: MemoryFileStore,
        failures: AtomicUsize,
        attempts: AtomicUsize,
    }

    #[async_trait]
    impl FileStore for FlakyStore {
        async fn save(&self, name_hint: &str, bytes: Vec<u8>) -> StoreResult<FileHandle> {
            self.inner.save(name_hint, bytes).await
        }
        async fn load(&self, handle: &FileHandle) -> StoreResult<Vec<u8>> {
            self.inner.load(handle).await
        }
        async fn delete(&self, handle: &FileHandle) -> StoreResult<()> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            let left = self.failures.load(Ordering::SeqCst);
            if left > 0 {
                self.failures.store(left - 1, Ordering::SeqCst);
                return Err(StoreError::Io {
                    handle: handle.clone(),
                    source: std::io::Error::other("busy"),
                });
            }
            self.inner.delete(handle).await
        }
        async fn exists(&self, handle: &FileHandle) -> StoreResult<bool> {
            self.inner.exists(handle).await
        }
        async fn size_of(&self, handle: &FileHandle) -> StoreResult<u64> {
            self.inner.size_of(handle).await
        }
    }

    /// Panics when asked to save the merged output.
    struct PanicOnArtifact {
        inner: MemoryFileStore,
    }

    #[async_trait]
    impl FileStore for PanicOnArtifact {
        async fn save(&self, name_hint: &str, bytes: Vec<u8>) -> StoreResult<FileHandle> {
            if name_hint == "book.md" {
                panic!("disk on fire");
            }
            self.inner.save(name_hint, bytes).await
        }
        async fn load(&self, handle: &FileHandle) -> StoreResult<Vec<u8>> {
            self.inner.load(handle).await
        }
        async fn delete(&self, handle: &FileHandle) -> StoreResult<()> {
            self.inner.delete(handle).await
        }
        async fn exists(&self, handle: &FileHandle) -> StoreResult<bool> {
            self.inner.exists(handle).await
        }
        async fn size_of(&self, handle: &FileHandle) -> StoreResult<u64> {
            self.inner.size_of(handle).await
        }
    }

    async fn doc(store: &dyn FileStore, name: &str, body: &str) -> StoredDocument {
        StoredDocument {
            handle: store.save(name, body.as_bytes().to_vec()).await.unwrap(),
            origin_name: name.into(),
            format: DocumentFormat::from_file_name(name).unwrap(),
            sequence_key: 0,
            size_bytes: body.len() as u64,
        }
    }

    fn setup() -> (JobRunner, Arc<JobQueue>, Arc<MemoryFileStore>, Arc<Recording>) {
        let store = Arc::new(MemoryFileStore::new());
        let queue = Arc::new(JobQueue::new(1, store.clone()));
        let notifier = Arc::new(Recording::default());
        let config = MergeConfig::default();
        let runner = JobRunner::new(&config, queue.clone(), store.clone(), notifier.clone());
        (runner, queue, store, notifier)
    }

    fn request(documents: Vec<StoredDocument>) -> JobRequest {
        JobRequest {
            owner: UserId(1),
            chat: ChatId(1),
            documents,
            output_name: "book".into(),
        }
    }

    #[tokio::test]
    async fn delivers_once_and_cleans_everything() {
        let (runner, queue, store, notifier) = setup();
        let docs = vec![
            doc(store.as_ref(), "a.txt", "alpha").await,
            doc(store.as_ref(), "b.md", "# B\n\nbeta\n").await,
        ];
        queue.enqueue(request(docs));
        let job = queue.try_dequeue().unwrap();

        let result = runner.process(job).await;
        match &result {
            JobResult::Delivered {
                file_name,
                merged,
                failed,
                sources,
                ..
            } => {
                assert_eq!(file_name, "book.md");
                assert_eq!(*merged, 2);
                assert!(failed.is_empty());
                assert_eq!(sources, &["a.txt", "b.md"]);
            }
            other => panic!("expected delivery, got {other:?}"),
        }
        assert_eq!(notifier.results.lock().unwrap().len(), 1);
        assert!(store.is_empty());
        assert_eq!(queue.snapshot().active, 0);
    }

    #[tokio::test]
    async fn all_documents_failing_is_a_failed_job() {
        let (runner, queue, store, notifier) = setup();
        let gone = doc(store.as_ref(), "a.txt", "alpha").await;
        store.delete(&gone.handle).await.unwrap();
        queue.enqueue(request(vec![gone]));
        let job = queue.try_dequeue().unwrap();

        let result = runner.process(job).await;
        assert!(matches!(&result, JobResult::Failed { reason, .. } if reason.contains("none of the 1")));
        assert_eq!(notifier.results.lock().unwrap().len(), 1);
        assert!(store.is_empty());
        assert!(queue.can_admit_more());
    }

    #[tokio::test]
    async fn panic_after_conversion_still_removes_intermediates() {
        let store = Arc::new(PanicOnArtifact {
            inner: MemoryFileStore::new(),
        });
        let queue = Arc::new(JobQueue::new(1, store.clone()));
        let notifier = Arc::new(Recording::default());
        let runner = JobRunner::new(&MergeConfig::default(), queue.clone(), store.clone(), notifier.clone());

        let docs = vec![
            doc(store.as_ref(), "a.txt", "alpha").await,
            doc(store.as_ref(), "b.txt", "beta").await,
        ];
        queue.enqueue(request(docs));
        let job = queue.try_dequeue().unwrap();

        let result = runner.process(job).await;
        assert!(matches!(&result, JobResult::Failed { reason, .. } if reason.contains("internal error")));
        assert_eq!(notifier.results.lock().unwrap().len(), 1);
        // originals and both converted .md files
        assert!(store.inner.is_empty());
        assert_eq!(queue.snapshot().active, 0);
    }

    #[tokio::test]
    async fn cleanup_is_idempotent_and_retries_once() {
        let store = Arc::new(FlakyStore {
            inner: MemoryFileStore::new(),
            failures: AtomicUsize::new(1),
            attempts: AtomicUsize::new(0),
        });
        let a = store.save("a.txt", b"a".to_vec()).await.unwrap();
        let b = store.save("b.txt", b"b".to_vec()).await.unwrap();

        let mut cleanup = JobCleanup::new(JobId(1), store.clone());
        cleanup.track(a.clone());
        cleanup.track(b);
        cleanup.track(a);
        let first = cleanup.run().await;
        assert_eq!(first, CleanupReport { deleted: 2, leaked: 0 });
        assert_eq!(store.attempts.load(Ordering::SeqCst), 3);
        assert!(store.inner.is_empty());

        let second = cleanup.run().await;
        assert_eq!(second, CleanupReport::default());
        assert_eq!(store.attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn persistent_delete_failure_is_reported_as_leak() {
        let store = Arc::new(FlakyStore {
            inner: MemoryFileStore::new(),
            failures: AtomicUsize::new(2),
            attempts: AtomicUsize::new(0),
        });
        let a = store.save("a.txt", b"a".to_vec()).await.unwrap();
        let mut cleanup = JobCleanup::new(JobId(1), store.clone());
        cleanup.track(a);
        assert_eq!(cleanup.run().await, CleanupReport { deleted: 0, leaked: 1 });
        assert_eq!(store.inner.len(), 1);
    }

    #[tokio::test]
    async fn run_loop_drains_queue_in_fifo_order() {
        let (runner, queue, store, notifier) = setup();
        for name in ["one.txt", "two.txt", "three.txt"] {
            let d = doc(store.as_ref(), name, "text").await;
            queue.enqueue(request(vec![d]));
        }
        let shutdown = CancellationToken::new();
        let handle = tokio::spawn({
            let runner = runner.clone();
            let shutdown = shutdown.clone();
            async move { runner.run(shutdown).await }
        });

        while notifier.results.lock().unwrap().len() < 3 {
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
        shutdown.cancel();
        handle.await.unwrap();

        let ids: Vec<u64> = notifier
            .results
            .lock()
            .unwrap()
            .iter()
            .map(|r| r.job_id().0)
            .collect();
        assert_eq!(ids, [1, 2, 3]);
        assert!(store.is_empty());
        assert_eq!(queue.snapshot().queued, 0);
    }
}
