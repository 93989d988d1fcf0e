//! Temporary document storage.
//!
//! The pipeline never touches a particular storage medium directly: downloaded
//! originals, converted intermediates and merged artifacts all live behind
//! [`FileStore`]. Two backends ship with the crate:
//!
//! * [`LocalFileStore`] — one file per handle under a root directory
//!   (optionally a self-deleting temp dir).
//! * [`MemoryFileStore`] — a `HashMap` of byte buffers, handy for tests and
//!   for transports that keep everything in memory.
//!
//! Deleting a handle that does not exist is **not** an error, so cleanup can
//! run more than once for the same job without failing.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use tempfile::TempDir;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tracing::debug;

/// Opaque identifier of a stored file.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FileHandle(String);

impl FileHandle {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for FileHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Storage operation errors.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("File not found: {0}")]
    NotFound(FileHandle),

    #[error("I/O error on {handle}: {source}")]
    Io {
        handle: FileHandle,
        #[source]
        source: std::io::Error,
    },
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Storage abstraction used by sessions, the queue and the pipeline stages.
#[async_trait]
pub trait FileStore: Send + Sync {
    /// Persist `bytes` and return a fresh handle. `name_hint` only shapes the
    /// key (extension, readability); two saves never share a handle.
    async fn save(&self, name_hint: &str, bytes: Vec<u8>) -> StoreResult<FileHandle>;

    async fn load(&self, handle: &FileHandle) -> StoreResult<Vec<u8>>;

    /// Remove the file. Succeeds when the file is already gone.
    async fn delete(&self, handle: &FileHandle) -> StoreResult<()>;

    async fn exists(&self, handle: &FileHandle) -> StoreResult<bool>;

    async fn size_of(&self, handle: &FileHandle) -> StoreResult<u64>;
}

/// Strip everything but a short, path-safe tail from a user-supplied name.
fn key_for(seq: u64, name_hint: &str) -> String {
    let base = Path::new(name_hint)
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("file");
    let safe: String = base
        .chars()
        .filter(|c| !matches!(c, '\\' | '/' | '*' | '?' | ':' | '"' | '<' | '>' | '|'))
        .collect();
    let tail: String = {
        let chars: Vec<char> = safe.chars().collect();
        let start = chars.len().saturating_sub(60);
        chars[start..].iter().collect()
    };
    if tail.is_empty() || tail == "." || tail == ".." {
        format!("{seq:06}_file")
    } else {
        format!("{seq:06}_{tail}")
    }
}

// ── Local file system ────────────────────────────────────────────────────

/// A [`FileStore`] that keeps one file per handle under `root`.
///
/// Files are created exclusively, so several stores (or processes) may share
/// one directory: a name that is already taken is skipped, never overwritten.
pub struct LocalFileStore {
    root: PathBuf,
    next: AtomicU64,
    // Dropping the store removes the directory when it was created by us.
    _temp_dir: Option<TempDir>,
}

impl LocalFileStore {
    /// Use (and create if missing) `root` as the storage directory.
    pub fn new(root: impl Into<PathBuf>) -> std::io::Result<Self> {
        let root = root.into();
        std::fs::create_dir_all(&root)?;
        Ok(Self {
            root,
            next: AtomicU64::new(1),
            _temp_dir: None,
        })
    }

    /// Store files in a fresh temporary directory removed on drop.
    pub fn temporary() -> std::io::Result<Self> {
        let dir = TempDir::new()?;
        Ok(Self {
            root: dir.path().to_path_buf(),
            next: AtomicU64::new(1),
            _temp_dir: Some(dir),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// File-system path backing `handle`.
    pub fn path_of(&self, handle: &FileHandle) -> PathBuf {
        self.root.join(handle.as_str())
    }

    fn io_err(handle: &FileHandle, source: std::io::Error) -> StoreError {
        if source.kind() == std::io::ErrorKind::NotFound {
            StoreError::NotFound(handle.clone())
        } else {
            StoreError::Io {
                handle: handle.clone(),
                source,
            }
        }
    }
}

#[async_trait]
impl FileStore for LocalFileStore {
    async fn save(&self, name_hint: &str, bytes: Vec<u8>) -> StoreResult<FileHandle> {
        loop {
            let seq = self.next.fetch_add(1, Ordering::Relaxed);
            let handle = FileHandle::new(key_for(seq, name_hint));
            let opened = tokio::fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(self.path_of(&handle))
                .await;
            let mut file = match opened {
                Ok(file) => file,
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                    debug!(handle = %handle, "Key already taken, trying the next one");
                    continue;
                }
                Err(e) => return Err(Self::io_err(&handle, e)),
            };
            file.write_all(&bytes)
                .await
                .map_err(|e| Self::io_err(&handle, e))?;
            file.flush().await.map_err(|e| Self::io_err(&handle, e))?;
            debug!(handle = %handle, size_bytes = bytes.len(), "Saved file");
            return Ok(handle);
        }
    }

    async fn load(&self, handle: &FileHandle) -> StoreResult<Vec<u8>> {
        tokio::fs::read(self.path_of(handle))
            .await
            .map_err(|e| Self::io_err(handle, e))
    }

    async fn delete(&self, handle: &FileHandle) -> StoreResult<()> {
        match tokio::fs::remove_file(self.path_of(handle)).await {
            Ok(()) => {
                debug!(handle = %handle, "Deleted file");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Self::io_err(handle, e)),
        }
    }

    async fn exists(&self, handle: &FileHandle) -> StoreResult<bool> {
        tokio::fs::try_exists(self.path_of(handle))
            .await
            .map_err(|e| Self::io_err(handle, e))
    }

    async fn size_of(&self, handle: &FileHandle) -> StoreResult<u64> {
        tokio::fs::metadata(self.path_of(handle))
            .await
            .map(|m| m.len())
            .map_err(|e| Self::io_err(handle, e))
    }
}

// ── In memory ────────────────────────────────────────────────────────────

/// A [`FileStore`] backed by a `HashMap`.
#[derive(Default)]
pub struct MemoryFileStore {
    files: Mutex<HashMap<FileHandle, Vec<u8>>>,
    next: AtomicU64,
}

impl MemoryFileStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of files currently stored.
    pub fn len(&self) -> usize {
        self.files.lock().map(|f| f.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn with_files<T>(&self, f: impl FnOnce(&mut HashMap<FileHandle, Vec<u8>>) -> T) -> T {
        // A poisoned map is still structurally valid; keep serving it.
        let mut guard = match self.files.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };
        f(&mut guard)
    }
}

#[async_trait]
impl FileStore for MemoryFileStore {
    async fn save(&self, name_hint: &str, bytes: Vec<u8>) -> StoreResult<FileHandle> {
        let seq = self.next.fetch_add(1, Ordering::Relaxed) + 1;
        let handle = FileHandle::new(key_for(seq, name_hint));
        self.with_files(|files| files.insert(handle.clone(), bytes));
        Ok(handle)
    }

    async fn load(&self, handle: &FileHandle) -> StoreResult<Vec<u8>> {
        self.with_files(|files| files.get(handle).cloned())
            .ok_or_else(|| StoreError::NotFound(handle.clone()))
    }

    async fn delete(&self, handle: &FileHandle) -> StoreResult<()> {
        self.with_files(|files| files.remove(handle));
        Ok(())
    }

    async fn exists(&self, handle: &FileHandle) -> StoreResult<bool> {
        Ok(self.with_files(|files| files.contains_key(handle)))
    }

    async fn size_of(&self, handle: &FileHandle) -> StoreResult<u64> {
        self.with_files(|files| files.get(handle).map(|b| b.len() as u64))
            .ok_or_else(|| StoreError::NotFound(handle.clone()))
    }
}
