//! The session log interface.
//!
//! `SessionStore` is the concrete JSONL-backed implementation; the
//! tool-result guard decorates any `SessionLog` with invariant
//! enforcement. The orchestrator only ever talks to this trait.

use async_trait::async_trait;
use std::sync::Arc;

use talon_core::error::SessionError;
use talon_core::Message;

/// Append-oriented conversation log keyed by session key.
#[async_trait]
pub trait SessionLog: Send + Sync {
    /// Reconstruct the live message sequence (leaf-to-root walk, with
    /// compaction summaries substituted).
    async fn load(&self, session_key: &str) -> Result<Vec<Message>, SessionError>;

    /// Append a message; returns the new entry id.
    async fn append(&self, session_key: &str, message: Message)
        -> Result<String, SessionError>;

    /// Append a compaction checkpoint; returns the new entry id.
    async fn append_compaction(
        &self,
        session_key: &str,
        summary: String,
        first_kept_entry_id: String,
        tokens_before: u64,
    ) -> Result<String, SessionError>;

    /// The entry id of a previously appended/loaded message, if known.
    async fn resolve_message_entry_id(
        &self,
        session_key: &str,
        message: &Message,
    ) -> Option<String>;

    /// Delete the session and its file.
    async fn clear(&self, session_key: &str) -> Result<(), SessionError>;

    /// All session keys with a file on disk.
    async fn list(&self) -> Result<Vec<String>, SessionError>;

    /// Downcast hook keeping guard installation idempotent: the guard
    /// returns itself, everything else `None`.
    fn as_guard(self: Arc<Self>) -> Option<Arc<crate::guard::ToolResultGuard>> {
        None
    }
}
