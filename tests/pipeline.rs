//! Integration tests for docmerge: sessions, queue, runner and the format
//! converters driven together through the public API.
//!
//! EPUB and DOCX fixtures are built in memory with `zip`, so the suite needs
//! no files on disk beyond a temp dir.
//!
//! Run with:
//!   cargo test --test pipeline -- --nocapture

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use docmerge::pipeline::formats::{ConvertError, ConverterRegistry, DocumentConverter};
use docmerge::quota::ManualClock;
use docmerge::store::StoreResult;
use docmerge::{
    BoxError, CancelOutcome, ChatId, DocumentFormat, FileHandle, FileStore, IncomingDocument,
    JobQueue, JobResult, JobRunner, JobStatus, LocalFileStore, MemoryFileStore, MergeConfig,
    MergeError, MergeService, Notifier, Recipient, SessionError, UserId,
};
use std::collections::HashMap;
use std::io::{Cursor, Write};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use zip::write::FileOptions;
use zip::ZipWriter;

// ── Test helpers ─────────────────────────────────────────────────────────────

fn build_zip(entries: &[(&str, &str)]) -> Vec<u8> {
    let mut zip = ZipWriter::new(Cursor::new(Vec::new()));
    for (name, body) in entries {
        zip.start_file(*name, FileOptions::default()).unwrap();
        zip.write_all(body.as_bytes()).unwrap();
    }
    zip.finish().unwrap().into_inner()
}

fn epub(body: &str) -> Vec<u8> {
    build_zip(&[
        (
            "META-INF/container.xml",
            r#"<container><rootfiles><rootfile full-path="content.opf"/></rootfiles></container>"#,
        ),
        (
            "content.opf",
            r#"<package><manifest><item id="t" href="text.xhtml"/></manifest><spine><itemref idref="t"/></spine></package>"#,
        ),
        ("text.xhtml", body),
    ])
}

fn docx(document_xml: &str) -> Vec<u8> {
    build_zip(&[
        ("[Content_Types].xml", "<Types/>"),
        ("word/document.xml", document_xml),
    ])
}

fn bytes(data: Vec<u8>) -> impl std::future::Future<Output = Result<Vec<u8>, BoxError>> + Send {
    async move { Ok(data) }
}

/// Forwards every result, with the artifact text read before cleanup.
/// The first `notify_result` blocks until the gate opens.
struct Recorder {
    store: Arc<dyn FileStore>,
    results: mpsc::UnboundedSender<(Recipient, JobResult, Option<String>)>,
    gate: tokio::sync::Mutex<Option<oneshot::Receiver<()>>>,
    timeouts: Mutex<Vec<(Recipient, usize)>>,
}

impl Recorder {
    fn new(
        store: Arc<dyn FileStore>,
        gate: Option<oneshot::Receiver<()>>,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<(Recipient, JobResult, Option<String>)>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Arc::new(Self {
                store,
                results: tx,
                gate: tokio::sync::Mutex::new(gate),
                timeouts: Mutex::new(Vec::new()),
            }),
            rx,
        )
    }
}

#[async_trait]
impl Notifier for Recorder {
    async fn notify_progress(&self, _to: Recipient, _text: String) {}

    async fn notify_result(&self, to: Recipient, result: JobResult) {
        let text = match &result {
            JobResult::Delivered { artifact, .. } => self
                .store
                .load(artifact)
                .await
                .ok()
                .map(|b| String::from_utf8(b).unwrap()),
            JobResult::Failed { .. } => None,
        };
        self.results.send((to, result, text)).unwrap();
        let gate = self.gate.lock().await.take();
        if let Some(gate) = gate {
            gate.await.ok();
        }
    }

    async fn notify_timeout(&self, to: Recipient, discarded: usize) {
        self.timeouts.lock().unwrap().push((to, discarded));
    }
}

fn files_in(dir: &std::path::Path) -> usize {
    std::fs::read_dir(dir).unwrap().count()
}

// ── End-to-end ──────────────────────────────────────────────────────────────

#[tokio::test]
async fn two_users_are_served_in_fifo_order() {
    let dir = tempfile::tempdir().unwrap();
    let store: Arc<dyn FileStore> = Arc::new(LocalFileStore::new(dir.path()).unwrap());
    let (release, gate) = oneshot::channel();
    let (recorder, mut results) = Recorder::new(store.clone(), Some(gate));
    let service = MergeService::new(MergeConfig::default(), store, recorder);

    let (alice, alice_chat) = (UserId(1), ChatId(100));
    let (bob, bob_chat) = (UserId(2), ChatId(200));
    service.sessions.begin(alice_chat, alice).unwrap();
    service.sessions.begin(bob_chat, bob).unwrap();

    let epub_bytes = epub("<html><body><p>Beta <b>bold</b> text.</p></body></html>");
    let docx_bytes = docx(r#"<w:document><w:body><w:p><w:r><w:t>Gamma</w:t></w:r></w:p></w:body></w:document>"#);
    let (a, b, c) = tokio::join!(
        service.sessions.submit_document(
            alice_chat,
            alice,
            IncomingDocument::new("a.txt", 11, 1),
            bytes(b"Alpha line\n".to_vec()),
        ),
        service.sessions.submit_document(
            alice_chat,
            alice,
            IncomingDocument::new("b.epub", epub_bytes.len() as u64, 2),
            bytes(epub_bytes.clone()),
        ),
        service.sessions.submit_document(
            bob_chat,
            bob,
            IncomingDocument::new("c.docx", docx_bytes.len() as u64, 1),
            bytes(docx_bytes.clone()),
        ),
    );
    a.unwrap();
    b.unwrap();
    c.unwrap();

    service.sessions.finalize(alice_chat, alice).unwrap();
    service.sessions.finalize(bob_chat, bob).unwrap();
    let job1 = service.sessions.set_output_name(alice_chat, alice, None).unwrap();
    let job2 = service
        .sessions
        .set_output_name(bob_chat, bob, Some("bob's file"))
        .unwrap();
    assert_eq!((job1.position, job2.position), (1, 2));

    let shutdown = CancellationToken::new();
    let runner = service.spawn_runner(shutdown.clone());

    let (to, first, text) = results.recv().await.unwrap();
    assert_eq!(to, Recipient::new(alice_chat, alice));
    assert_eq!(first.job_id(), job1.job_id);
    assert_eq!(
        text.unwrap(),
        "# a\n\nAlpha line\n\n---\n\n# b\n\nBeta **bold** text.\n"
    );
    // Job 1 still holds the only active slot.
    assert_eq!(
        service.queue.status_of(job2.job_id),
        Some(JobStatus::Queued { position: 1 })
    );
    release.send(()).unwrap();

    let (to, second, text) = results.recv().await.unwrap();
    assert_eq!(to, Recipient::new(bob_chat, bob));
    assert_eq!(second.job_id(), job2.job_id);
    match &second {
        JobResult::Delivered { file_name, .. } => assert_eq!(file_name, "bob's file.md"),
        other => panic!("expected delivery, got {other:?}"),
    }
    assert_eq!(text.unwrap(), "# c\n\nGamma\n");

    shutdown.cancel();
    runner.await.unwrap();
    assert_eq!(files_in(dir.path()), 0);
    assert_eq!(service.queue.snapshot().active, 0);
}

// ── Ordering ────────────────────────────────────────────────────────────────

/// Text converter that stalls on documents starting with "slow".
struct Stalling;

impl DocumentConverter for Stalling {
    fn format(&self) -> DocumentFormat {
        DocumentFormat::Text
    }

    fn convert(&self, bytes: &[u8]) -> Result<String, ConvertError> {
        if bytes.starts_with(b"slow") {
            std::thread::sleep(Duration::from_millis(200));
        }
        Ok(String::from_utf8_lossy(bytes).into_owned())
    }
}

#[tokio::test]
async fn merged_order_survives_out_of_order_conversion() {
    let mem = Arc::new(MemoryFileStore::new());
    let store: Arc<dyn FileStore> = mem.clone();
    let (recorder, mut results) = Recorder::new(store.clone(), None);
    let config = MergeConfig::builder().conversion_workers(3).build().unwrap();
    let service = MergeService::new(config.clone(), store.clone(), recorder.clone());

    let (chat, user) = (ChatId(1), UserId(1));
    service.sessions.begin(chat, user).unwrap();
    for (seq, (name, body)) in [("d1.txt", "first"), ("d2.txt", "slow second"), ("d3.txt", "third")]
        .into_iter()
        .enumerate()
    {
        service
            .sessions
            .submit_document(
                chat,
                user,
                IncomingDocument::new(name, body.len() as u64, seq as u64),
                bytes(body.as_bytes().to_vec()),
            )
            .await
            .unwrap();
    }
    service.sessions.finalize(chat, user).unwrap();
    service.sessions.set_output_name(chat, user, Some("ordered")).unwrap();

    let mut registry = ConverterRegistry::default();
    registry.register(Arc::new(Stalling));
    let runner = JobRunner::with_registry(&config, service.queue.clone(), store, recorder, registry);
    let job = service.queue.try_dequeue().unwrap();
    runner.process(job).await;

    let (_, _, text) = results.recv().await.unwrap();
    let text = text.unwrap();
    let first = text.find("first").unwrap();
    let second = text.find("slow second").unwrap();
    let third = text.find("third").unwrap();
    assert!(first < second && second < third, "{text}");
    assert!(mem.is_empty());
}

// ── Timeout ─────────────────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn idle_session_is_cancelled_and_cleaned() {
    let mem = Arc::new(MemoryFileStore::new());
    let (recorder, _results) = Recorder::new(mem.clone(), None);
    let config = MergeConfig::builder().collection_timeout_secs(60).build().unwrap();
    let service = MergeService::new(config, mem.clone(), recorder.clone());

    let (chat, user) = (ChatId(5), UserId(5));
    service.sessions.begin(chat, user).unwrap();
    service
        .sessions
        .submit_document(chat, user, IncomingDocument::new("x.md", 3, 1), bytes(b"# x".to_vec()))
        .await
        .unwrap();
    assert_eq!(service.quota.usage(user).used, 1);

    tokio::time::sleep(Duration::from_secs(61)).await;

    assert!(mem.is_empty());
    assert_eq!(*recorder.timeouts.lock().unwrap(), vec![(Recipient::new(chat, user), 1)]);
    let late = service
        .sessions
        .submit_document(chat, user, IncomingDocument::new("y.md", 3, 2), bytes(b"# y".to_vec()))
        .await;
    assert!(matches!(late, Err(MergeError::Session(SessionError::NoActiveSession))));
    // Accepted files still count against the day.
    assert_eq!(service.quota.usage(user).used, 1);
}

// ── Quota ───────────────────────────────────────────────────────────────────

#[tokio::test]
async fn quota_boundary_and_lazy_reset() {
    let clock = Arc::new(ManualClock::new(Utc.with_ymd_and_hms(2024, 3, 1, 22, 0, 0).unwrap()));
    let mem = Arc::new(MemoryFileStore::new());
    let config = MergeConfig::builder().max_files_per_day(2).build().unwrap();
    let service = MergeService::with_clock(config, mem.clone(), Arc::new(docmerge::NoopNotifier), clock.clone());

    let (chat, user) = (ChatId(9), UserId(9));
    service.sessions.begin(chat, user).unwrap();
    let sessions = &service.sessions;
    let submit = move |name: &'static str, seq: u64| {
        sessions.submit_document(
            chat,
            user,
            IncomingDocument::new(name, 1, seq),
            bytes(b"x".to_vec()),
        )
    };
    submit("1.txt", 1).await.unwrap();
    submit("2.txt", 2).await.unwrap();
    match submit("3.txt", 3).await {
        Err(MergeError::QuotaExceeded { used, max, resets_in_secs }) => {
            assert_eq!((used, max), (2, 2));
            assert_eq!(resets_in_secs, 2 * 3600);
        }
        other => panic!("expected quota rejection, got {other:?}"),
    }
    assert_eq!(mem.len(), 2);

    clock.advance(chrono::Duration::hours(2));
    submit("3.txt", 3).await.unwrap();
    assert_eq!(service.quota.usage(user).used, 1);
}

// ── Cancellation and status ─────────────────────────────────────────────────

#[tokio::test]
async fn queued_jobs_can_be_cancelled_once() {
    let mem = Arc::new(MemoryFileStore::new());
    let service = MergeService::new(MergeConfig::default(), mem.clone(), Arc::new(docmerge::NoopNotifier));
    let user = UserId(3);

    let mut jobs = Vec::new();
    for chat in [ChatId(1), ChatId(2)] {
        service.sessions.begin(chat, user).unwrap();
        service
            .sessions
            .submit_document(chat, user, IncomingDocument::new("n.md", 3, 1), bytes(b"# n".to_vec()))
            .await
            .unwrap();
        service.sessions.finalize(chat, user).unwrap();
        jobs.push(service.sessions.set_output_name(chat, user, None).unwrap().job_id);
    }
    let active = service.queue.try_dequeue().unwrap();
    assert_eq!(active.id, jobs[0]);

    let page = service.status.open(user);
    assert_eq!(page.jobs.len(), 2);
    assert_eq!(page.cancellable, vec![jobs[1]]);

    assert_eq!(service.queue.cancel(jobs[0], user).await, CancelOutcome::AlreadyRunning);
    assert_eq!(service.queue.cancel(jobs[1], UserId(99)).await, CancelOutcome::NotOwner);
    assert!(service.queue.cancel(jobs[1], user).await.is_cancelled());
    assert_eq!(service.queue.cancel(jobs[1], user).await, CancelOutcome::NotFound);
    assert_eq!(mem.len(), 1);
    assert_eq!(service.status.refresh(user).jobs.len(), 1);
}

// ── Cleanup ─────────────────────────────────────────────────────────────────

/// Counts deletes per handle.
#[derive(Default)]
struct CountingStore {
    inner: MemoryFileStore,
    deletes: Mutex<HashMap<FileHandle, usize>>,
}

#[async_trait]
impl FileStore for CountingStore {
    async fn save(&self, name_hint: &str, bytes: Vec<u8>) -> StoreResult<FileHandle> {
        self.inner.save(name_hint, bytes).await
    }
    async fn load(&self, handle: &FileHandle) -> StoreResult<Vec<u8>> {
        self.inner.load(handle).await
    }
    async fn delete(&self, handle: &FileHandle) -> StoreResult<()> {
        *self.deletes.lock().unwrap().entry(handle.clone()).or_default() += 1;
        self.inner.delete(handle).await
    }
    async fn exists(&self, handle: &FileHandle) -> StoreResult<bool> {
        self.inner.exists(handle).await
    }
    async fn size_of(&self, handle: &FileHandle) -> StoreResult<u64> {
        self.inner.size_of(handle).await
    }
}

#[tokio::test]
async fn every_temporary_file_is_deleted_exactly_once() {
    let store = Arc::new(CountingStore::default());
    let (recorder, mut results) = Recorder::new(store.clone(), None);
    let service = MergeService::new(MergeConfig::default(), store.clone(), recorder);

    let (chat, user) = (ChatId(4), UserId(4));
    service.sessions.begin(chat, user).unwrap();
    let broken = b"not a zip".to_vec();
    for (seq, (name, body)) in [
        ("one.txt", b"one".to_vec()),
        ("two.md", b"# Two\n".to_vec()),
        ("three.docx", broken),
    ]
    .into_iter()
    .enumerate()
    {
        service
            .sessions
            .submit_document(chat, user, IncomingDocument::new(name, body.len() as u64, seq as u64), bytes(body))
            .await
            .unwrap();
    }
    service.sessions.finalize(chat, user).unwrap();
    service.sessions.set_output_name(chat, user, None).unwrap();

    let shutdown = CancellationToken::new();
    let runner = service.spawn_runner(shutdown.clone());
    let (_, result, text) = results.recv().await.unwrap();
    shutdown.cancel();
    runner.await.unwrap();

    assert!(result.is_delivered());
    assert!(text.unwrap().contains("could not convert 'three.docx'"));
    assert!(store.inner.is_empty());
    let deletes = store.deletes.lock().unwrap();
    // 3 originals, 2 intermediates (txt, docx) and the artifact.
    assert_eq!(deletes.len(), 6);
    assert!(deletes.values().all(|&n| n == 1), "{deletes:?}");
}

#[tokio::test]
async fn queue_bound_holds_under_concurrent_submissions() {
    let queue = Arc::new(JobQueue::new(2, Arc::new(MemoryFileStore::new())));
    let mut handles = Vec::new();
    for i in 0..8 {
        let queue = queue.clone();
        handles.push(tokio::spawn(async move {
            queue.enqueue(docmerge::queue::JobRequest {
                owner: UserId(i),
                chat: ChatId(i),
                documents: vec![],
                output_name: format!("job{i}"),
            });
            let job = queue.try_dequeue();
            assert!(queue.snapshot().active <= 2);
            if let Some(job) = job {
                tokio::task::yield_now().await;
                queue.complete(job.id);
            }
        }));
    }
    for h in handles {
        h.await.unwrap();
    }
    while let Some(job) = queue.try_dequeue() {
        assert!(queue.snapshot().active <= 2);
        queue.complete(job.id);
    }
    assert_eq!(queue.snapshot().queued, 0);
}
