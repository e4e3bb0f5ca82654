//! Persisted session entries.
//!
//! A session file is JSONL: one `session` header line, then `message` and
//! `compaction` entries. Entries are parent-linked; the chain from the
//! root to the current leaf defines the live context. Branching is
//! representable but unused at runtime.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use talon_core::Message;

/// Current session file format version.
pub const SESSION_FORMAT_VERSION: u32 = 1;

/// The one-per-file header, always the first line.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionHeader {
    pub version: u32,
    pub id: String,
    pub timestamp: i64,
    pub cwd: String,
}

/// A persisted message entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageEntry {
    pub id: String,
    pub parent_id: Option<String>,
    pub timestamp: i64,
    pub message: Message,
}

/// A summarization checkpoint.
///
/// On load, `summary` replaces every entry on the path strictly before
/// `first_kept_entry_id`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompactionEntry {
    pub id: String,
    pub parent_id: Option<String>,
    pub timestamp: i64,
    pub summary: String,
    pub first_kept_entry_id: String,
    pub tokens_before: u64,
}

/// One line of a session file.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum SessionEntry {
    Session(SessionHeader),
    Message(MessageEntry),
    Compaction(CompactionEntry),
}

impl SessionEntry {
    /// The entry id, if this entry participates in the parent chain.
    pub fn id(&self) -> Option<&str> {
        match self {
            Self::Session(_) => None,
            Self::Message(e) => Some(&e.id),
            Self::Compaction(e) => Some(&e.id),
        }
    }

    /// The parent link, if any.
    pub fn parent_id(&self) -> Option<&str> {
        match self {
            Self::Session(_) => None,
            Self::Message(e) => e.parent_id.as_deref(),
            Self::Compaction(e) => e.parent_id.as_deref(),
        }
    }
}

/// Generate an 8-character entry id, unique among `taken`.
pub fn new_entry_id(taken: &dyn Fn(&str) -> bool) -> String {
    loop {
        let id: String = Uuid::new_v4().simple().to_string()[..8].to_string();
        if !taken(&id) {
            return id;
        }
    }
}
