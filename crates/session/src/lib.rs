//! # Talon Session
//!
//! Append-only, crash-safe conversation persistence.
//!
//! - [`SessionStore`] — JSONL files with parent-linked entries, one per
//!   session key, deferred creation, compaction checkpoints.
//! - [`SessionLock`] — cross-process lock file protocol guarding every
//!   physical write.
//! - [`ToolResultGuard`] — decorator enforcing that every `tool_use` in
//!   the log is matched by a `tool_result` before anything else.

pub mod entry;
pub mod guard;
pub mod lock;
pub mod log;
pub mod store;

pub use entry::{CompactionEntry, MessageEntry, SessionEntry, SessionHeader};
pub use guard::{ToolResultGuard, MISSING_TOOL_RESULT_TEXT};
pub use lock::SessionLock;
pub use log::SessionLog;
pub use store::SessionStore;
