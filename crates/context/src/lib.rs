//! # Talon Context
//!
//! The context pipeline: token estimation, three-layer pruning, and
//! summarization-based compaction. Everything here is pure or
//! summarizer-injected, so the agent loop stays the only place that talks
//! to providers directly.

pub mod compaction;
pub mod estimate;
pub mod prune;
pub mod window;

pub use compaction::{
    build_compaction_summary, should_trigger_compaction, CompactionSettings, CompactionSummary,
    Summarizer, DEFAULT_RESERVE_TOKENS,
};
pub use estimate::{
    estimate_message_tokens, estimate_text_tokens, estimate_total_tokens, CHARS_PER_TOKEN,
};
pub use prune::{
    prune_context_messages, PruneOutcome, PruneSettings, SoftTrimSettings, ToolPrunePolicy,
};
pub use window::{check_context_window, MIN_CONTEXT_TOKENS, WARN_CONTEXT_TOKENS};
