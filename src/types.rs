//! Identity and document types shared by every stage.

use crate::pipeline::formats::DocumentFormat;
use crate::store::FileHandle;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Transport-level identity of a user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct UserId(pub i64);

/// Transport-level identity of a conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ChatId(pub i64);

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for ChatId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Where a notification about a session or job should go.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Recipient {
    pub chat: ChatId,
    pub user: UserId,
}

impl Recipient {
    pub fn new(chat: ChatId, user: UserId) -> Self {
        Self { chat, user }
    }
}

/// A document that has been downloaded and saved to the [`crate::store::FileStore`].
///
/// `sequence_key` is the index of the transport message that carried the
/// document; sorting by it restores submission order even when downloads
/// finish out of order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredDocument {
    pub handle: FileHandle,
    /// File name as the user sent it.
    pub origin_name: String,
    pub format: DocumentFormat,
    pub sequence_key: u64,
    pub size_bytes: u64,
}

/// Metadata of a document the transport is about to download.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IncomingDocument {
    pub file_name: String,
    /// Size as announced by the transport, checked before downloading.
    pub size_bytes: u64,
    pub sequence_key: u64,
}

impl IncomingDocument {
    pub fn new(file_name: impl Into<String>, size_bytes: u64, sequence_key: u64) -> Self {
        Self {
            file_name: file_name.into(),
            size_bytes,
            sequence_key,
        }
    }
}
