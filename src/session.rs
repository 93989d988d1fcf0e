//! Collection sessions: gather documents, name the output, hand off a job.
//!
//! ```text
//!            begin                 finalize             set_output_name
//!  (none) ─────────▶ Collecting ─────────────▶ NamingOutput ─────────────▶ (job queued)
//!                      │   ▲                       │
//!                      │   └── submit_document     │
//!                      └──── cancel / timeout ─────┴──▶ (none, documents deleted)
//! ```
//!
//! There is at most one session per chat; it belongs to the user who began it.
//!
//! ## Watchdog races
//!
//! Every accepted document re-arms an inactivity watchdog. Re-arming cancels
//! the previous [`CancellationToken`] while holding the session's map entry,
//! and the watchdog only removes the session from inside the same entry lock
//! after checking that its token is still live, that the session is the one
//! it was armed for, and that it is still collecting. A watchdog that loses
//! any of these races does nothing.

use crate::config::MergeConfig;
use crate::error::{BoxError, MergeError, SessionError, SessionStateName};
use crate::notify::Notifier;
use crate::pipeline::formats::DocumentFormat;
use crate::queue::{Enqueued, JobQueue, JobRequest};
use crate::quota::QuotaTracker;
use crate::store::FileStore;
use crate::types::{ChatId, IncomingDocument, Recipient, StoredDocument, UserId};
use chrono::Utc;
use dashmap::DashMap;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Base name used when the user skips naming the output.
pub const DEFAULT_OUTPUT_NAME: &str = "merged";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SessionState {
    Collecting,
    NamingOutput,
}

impl SessionState {
    fn name(self) -> SessionStateName {
        match self {
            SessionState::Collecting => SessionStateName::Collecting,
            SessionState::NamingOutput => SessionStateName::NamingOutput,
        }
    }
}

struct CollectionSession {
    /// Distinguishes this session from a later one in the same chat.
    id: u64,
    owner: UserId,
    state: SessionState,
    documents: Vec<StoredDocument>,
    started_at: Instant,
    last_activity: Instant,
    watchdog: Option<CancellationToken>,
}

impl CollectionSession {
    fn disarm(&mut self) {
        if let Some(token) = self.watchdog.take() {
            token.cancel();
        }
    }
}

/// Read-only view of a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionSnapshot {
    pub owner: UserId,
    pub state: SessionState,
    pub documents: Vec<String>,
    pub active_for: Duration,
    pub idle_for: Duration,
}

/// Owns every chat's collection session.
#[derive(Clone)]
pub struct SessionManager {
    inner: Arc<Inner>,
}

struct Inner {
    sessions: DashMap<ChatId, CollectionSession>,
    next_session_id: AtomicU64,
    quota: Arc<QuotaTracker>,
    queue: Arc<JobQueue>,
    store: Arc<dyn FileStore>,
    notifier: Arc<dyn Notifier>,
    timeout: Duration,
    max_name_len: usize,
}

impl SessionManager {
    pub fn new(
        config: &MergeConfig,
        quota: Arc<QuotaTracker>,
        queue: Arc<JobQueue>,
        store: Arc<dyn FileStore>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                sessions: DashMap::new(),
                next_session_id: AtomicU64::new(1),
                quota,
                queue,
                store,
                notifier,
                timeout: config.collection_timeout(),
                max_name_len: config.max_output_name_len,
            }),
        }
    }

    /// Start collecting in `chat` on behalf of `user`.
    pub fn begin(&self, chat: ChatId, user: UserId) -> Result<(), MergeError> {
        use dashmap::mapref::entry::Entry;

        match self.inner.sessions.entry(chat) {
            Entry::Occupied(e) => {
                let s = e.get();
                Err(match (s.owner == user, s.state) {
                    (false, _) => SessionError::OwnedByOther,
                    (true, SessionState::Collecting) => SessionError::AlreadyCollecting,
                    (true, SessionState::NamingOutput) => SessionError::AwaitingName,
                }
                .into())
            }
            Entry::Vacant(e) => {
                let id = self.inner.next_session_id.fetch_add(1, Ordering::SeqCst);
                let now = Instant::now();
                let watchdog = Inner::arm(&self.inner, chat, id, user);
                e.insert(CollectionSession {
                    id,
                    owner: user,
                    state: SessionState::Collecting,
                    documents: Vec::new(),
                    started_at: now,
                    last_activity: now,
                    watchdog: Some(watchdog),
                });
                info!(chat = %chat, user = %user, session = id, "Collection started");
                Ok(())
            }
        }
    }

    /// Accept one document into the user's collecting session.
    ///
    /// `fetch` downloads the bytes; it only runs after the session, format
    /// and quota checks pass. The quota slot is given back if the download or
    /// the store step fails, or if the session is gone by the time the
    /// download finishes.
    pub async fn submit_document<F>(
        &self,
        chat: ChatId,
        user: UserId,
        incoming: IncomingDocument,
        fetch: F,
    ) -> Result<StoredDocument, MergeError>
    where
        F: Future<Output = Result<Vec<u8>, BoxError>> + Send,
    {
        let session_id = self.inner.check(chat, user, SessionState::Collecting)?;

        let format = DocumentFormat::from_file_name(&incoming.file_name).ok_or_else(|| {
            MergeError::UnsupportedFormat {
                file_name: incoming.file_name.clone(),
            }
        })?;

        let reservation = self
            .inner
            .quota
            .check_and_reserve(user, incoming.size_bytes)?;

        let bytes = fetch.await.map_err(|e| MergeError::DownloadFailed {
            file_name: incoming.file_name.clone(),
            reason: e.to_string(),
        })?;
        let max = self.inner.quota.max_file_size_bytes();
        if bytes.len() as u64 > max {
            return Err(MergeError::FileTooLarge {
                size: bytes.len() as u64,
                max,
            });
        }

        let size_bytes = bytes.len() as u64;
        let handle = self
            .inner
            .store
            .save(&incoming.file_name, bytes)
            .await
            .map_err(|e| MergeError::Storage {
                handle: incoming.file_name.clone(),
                detail: e.to_string(),
            })?;
        let doc = StoredDocument {
            handle,
            origin_name: incoming.file_name,
            format,
            sequence_key: incoming.sequence_key,
            size_bytes,
        };

        // The session may have been cancelled, timed out or finalized while downloading.
        let appended = match self.inner.sessions.get_mut(&chat) {
            Some(mut s)
                if s.id == session_id
                    && s.owner == user
                    && s.state == SessionState::Collecting =>
            {
                s.documents.push(doc.clone());
                s.last_activity = Instant::now();
                let fresh = Inner::arm(&self.inner, chat, session_id, user);
                if let Some(old) = s.watchdog.replace(fresh) {
                    old.cancel();
                }
                Ok(s.documents.len())
            }
            Some(s) if s.id == session_id && s.state != SessionState::Collecting => {
                Err(SessionError::WrongState {
                    expected: SessionStateName::Collecting,
                    actual: s.state.name(),
                })
            }
            _ => Err(SessionError::NoActiveSession),
        };

        match appended {
            Ok(count) => {
                reservation.commit();
                debug!(chat = %chat, user = %user, file = %doc.origin_name, count, "Document accepted");
                Ok(doc)
            }
            Err(e) => {
                if let Err(del) = self.inner.store.delete(&doc.handle).await {
                    warn!(handle = %doc.handle, "Could not delete orphaned upload: {}", del);
                }
                debug!(chat = %chat, user = %user, file = %doc.origin_name, "Upload arrived after session ended");
                Err(e.into())
            }
        }
    }

    /// Stop collecting and wait for the output name. Returns the number of
    /// collected documents.
    pub fn finalize(&self, chat: ChatId, user: UserId) -> Result<usize, MergeError> {
        let mut s = self
            .inner
            .sessions
            .get_mut(&chat)
            .ok_or(SessionError::NoActiveSession)?;
        if s.owner != user {
            return Err(SessionError::NotOwner.into());
        }
        if s.state != SessionState::Collecting {
            return Err(SessionError::WrongState {
                expected: SessionStateName::Collecting,
                actual: s.state.name(),
            }
            .into());
        }
        if s.documents.is_empty() {
            return Err(SessionError::EmptySession.into());
        }
        s.disarm();
        s.state = SessionState::NamingOutput;
        info!(chat = %chat, user = %user, documents = s.documents.len(), "Collection finalized");
        Ok(s.documents.len())
    }

    /// Name the output and submit the job. `None` keeps the default name.
    pub fn set_output_name(
        &self,
        chat: ChatId,
        user: UserId,
        name: Option<&str>,
    ) -> Result<Enqueued, MergeError> {
        let removed = self.inner.sessions.remove_if(&chat, |_, s| {
            s.owner == user && s.state == SessionState::NamingOutput
        });
        let Some((_, session)) = removed else {
            self.inner.check(chat, user, SessionState::NamingOutput)?;
            return Err(SessionError::NoActiveSession.into());
        };

        let output_name = sanitize_output_name(name, self.inner.max_name_len);
        let mut documents = session.documents;
        documents.sort_by_key(|d| d.sequence_key);

        let enqueued = self.inner.queue.enqueue(JobRequest {
            owner: user,
            chat,
            documents,
            output_name,
        });
        info!(chat = %chat, user = %user, job_id = %enqueued.job_id, "Session converted into job");
        Ok(enqueued)
    }

    /// Abort the session in any state and delete its documents. Returns the
    /// number of documents discarded.
    pub async fn cancel(&self, chat: ChatId, user: UserId) -> Result<usize, MergeError> {
        let removed = self.inner.sessions.remove_if(&chat, |_, s| s.owner == user);
        let Some((_, mut session)) = removed else {
            return Err(match self.inner.sessions.get(&chat) {
                Some(_) => SessionError::NotOwner,
                None => SessionError::NoActiveSession,
            }
            .into());
        };
        session.disarm();
        let n = self.inner.discard(session.documents).await;
        info!(chat = %chat, user = %user, discarded = n, "Collection cancelled");
        Ok(n)
    }

    pub fn snapshot(&self, chat: ChatId) -> Option<SessionSnapshot> {
        self.inner.sessions.get(&chat).map(|s| SessionSnapshot {
            owner: s.owner,
            state: s.state,
            documents: s.documents.iter().map(|d| d.origin_name.clone()).collect(),
            active_for: s.started_at.elapsed(),
            idle_for: s.last_activity.elapsed(),
        })
    }

    pub fn active_sessions(&self) -> usize {
        self.inner.sessions.len()
    }
}

impl Inner {
    /// Verify that `chat` has a session of `user` in `expected` state and
    /// return its id.
    fn check(&self, chat: ChatId, user: UserId, expected: SessionState) -> Result<u64, SessionError> {
        let s = self
            .sessions
            .get(&chat)
            .ok_or(SessionError::NoActiveSession)?;
        if s.owner != user {
            return Err(SessionError::NotOwner);
        }
        if s.state != expected {
            return Err(SessionError::WrongState {
                expected: expected.name(),
                actual: s.state.name(),
            });
        }
        Ok(s.id)
    }

    /// Spawn the inactivity watchdog for session `id`.
    fn arm(this: &Arc<Self>, chat: ChatId, id: u64, owner: UserId) -> CancellationToken {
        let token = CancellationToken::new();
        let armed = token.clone();
        let weak: Weak<Self> = Arc::downgrade(this);
        let timeout = this.timeout;
        tokio::spawn(async move {
            tokio::select! {
                _ = armed.cancelled() => {}
                _ = tokio::time::sleep(timeout) => {
                    if let Some(inner) = weak.upgrade() {
                        inner.expire(chat, id, owner, &armed).await;
                    }
                }
            }
        });
        token
    }

    async fn expire(&self, chat: ChatId, id: u64, owner: UserId, token: &CancellationToken) {
        let removed = self.sessions.remove_if(&chat, |_, s| {
            !token.is_cancelled()
                && s.id == id
                && s.owner == owner
                && s.state == SessionState::Collecting
        });
        let Some((_, session)) = removed else {
            debug!(chat = %chat, session = id, "Stale watchdog ignored");
            return;
        };
        let n = self.discard(session.documents).await;
        info!(chat = %chat, user = %owner, discarded = n, "Collection timed out");
        self.notifier
            .notify_timeout(Recipient::new(chat, owner), n)
            .await;
    }

    async fn discard(&self, documents: Vec<StoredDocument>) -> usize {
        let n = documents.len();
        for doc in documents {
            if let Err(e) = self.store.delete(&doc.handle).await {
                warn!(handle = %doc.handle, "Could not delete document: {}", e);
            }
        }
        n
    }
}

static RE_UNSAFE: Lazy<Regex> = Lazy::new(|| Regex::new(r#"[\\/*?:"<>|]"#).unwrap());
static RE_WS: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s+").unwrap());
static RE_EXT: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)\.(?:md|docx)$").unwrap());

/// Turn user input into a safe artifact base name.
///
/// `None` gives [`DEFAULT_OUTPUT_NAME`]; input that sanitizes to nothing
/// gives `file_<unix seconds>`.
pub fn sanitize_output_name(raw: Option<&str>, max_len: usize) -> String {
    let Some(raw) = raw else {
        return DEFAULT_OUTPUT_NAME.to_string();
    };
    let name = RE_EXT.replace(raw.trim(), "");
    let name = RE_UNSAFE.replace_all(&name, "");
    let name = RE_WS.replace_all(&name, " ");
    let capped: String = name.trim().chars().take(max_len).collect();
    let capped = capped.trim();
    if capped.is_empty() {
        format!("file_{}", Utc::now().timestamp())
    } else {
        capped.to_string()
    }
}
