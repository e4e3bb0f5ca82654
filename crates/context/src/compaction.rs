//! Summarization-based compaction.
//!
//! When the live history approaches the context window, the messages that
//! layer-3 pruning would drop are summarized by the model itself and the
//! summary is persisted as a checkpoint. Dropped messages are split into
//! parts, summarized independently, then merged; chunks that fail are
//! retried with their oversized members replaced by short notes.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use talon_core::error::ProviderError;
use talon_core::{ContentBlock, Message, MessageContent, Role};

use crate::estimate::{estimate_message_tokens, estimate_total_tokens};

/// Tokens held back from the window for the reply and the summary itself.
pub const DEFAULT_RESERVE_TOKENS: u32 = 20_000;

const CHUNK_RATIO_BASE: f64 = 0.4;
const CHUNK_RATIO_MIN: f64 = 0.15;

const SUMMARIZE_PROMPT: &str = "Summarize the following conversation excerpt. \
Preserve decisions, facts, file paths, open tasks, and anything the assistant \
promised to do. Be dense and factual; do not add commentary.";

const MERGE_PROMPT: &str = "The following are summaries of consecutive parts of \
one conversation. Merge them into a single coherent summary, preserving all \
decisions, facts, file paths, and open tasks. Do not add commentary.";

/// Tunables for summary construction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompactionSettings {
    pub reserve_tokens: u32,
    /// How many parts to split dropped messages into
    pub parts: usize,
    /// Below this many dropped messages, skip the split
    pub min_messages_for_split: usize,
}

impl Default for CompactionSettings {
    fn default() -> Self {
        Self {
            reserve_tokens: DEFAULT_RESERVE_TOKENS,
            parts: 2,
            min_messages_for_split: 4,
        }
    }
}

/// The model-call seam: compaction only needs "prompt in, text out".
#[async_trait]
pub trait Summarizer: Send + Sync {
    async fn summarize(&self, prompt: String, max_tokens: u32)
        -> Result<String, ProviderError>;
}

/// A finished compaction summary, ready to persist.
#[derive(Debug, Clone)]
pub struct CompactionSummary {
    /// Full formatted text of the synthetic user message
    pub text: String,
    pub summary_chars: usize,
    pub dropped_messages: usize,
    pub tokens_before: u64,
}

impl CompactionSummary {
    /// The synthetic `user` message injected ahead of the kept suffix.
    pub fn to_message(&self) -> Message {
        Message::user(self.text.clone())
    }
}

/// True when the history no longer leaves the reserve free.
pub fn should_trigger_compaction(
    total_tokens: u64,
    context_window_tokens: u32,
    reserve_tokens: u32,
) -> bool {
    total_tokens > u64::from(context_window_tokens.saturating_sub(reserve_tokens))
}

/// Render one message as transcript text for the summarizer.
fn render_message(message: &Message) -> String {
    let role = match message.role {
        Role::User => "User",
        Role::Assistant => "Assistant",
    };
    let mut body = String::new();
    match &message.content {
        MessageContent::Text(text) => body.push_str(text),
        MessageContent::Blocks(blocks) => {
            for block in blocks {
                match block {
                    ContentBlock::Text { text } => {
                        body.push_str(text);
                        body.push('\n');
                    }
                    ContentBlock::ToolUse { name, input, .. } => {
                        body.push_str(&format!("[called tool {name} with {input}]\n"));
                    }
                    ContentBlock::ToolResult { name, content, .. } => {
                        let name = name.as_deref().unwrap_or("tool");
                        body.push_str(&format!("[{name} returned: {content}]\n"));
                    }
                }
            }
        }
    }
    format!("{role}: {}", body.trim_end())
}

fn oversized_note(message: &Message) -> String {
    let role = match message.role {
        Role::User => "user message",
        Role::Assistant => "assistant message",
    };
    let tokens_k = estimate_message_tokens(message).div_ceil(1000);
    format!("[Large {role} (~{tokens_k}k tokens) omitted]")
}

/// Per-message token ceiling for a chunk: the base share of the call
/// budget, shrinking toward the minimum as the average message grows.
fn chunk_ratio(messages: &[Message]) -> f64 {
    if messages.is_empty() {
        return CHUNK_RATIO_BASE;
    }
    let avg = estimate_total_tokens(messages) as f64 / messages.len() as f64;
    if avg <= 1000.0 {
        CHUNK_RATIO_BASE
    } else {
        (CHUNK_RATIO_BASE * 1000.0 / avg).max(CHUNK_RATIO_MIN)
    }
}

/// Split messages into `parts` chunks of roughly equal token share.
fn split_by_token_share(messages: &[Message], parts: usize) -> Vec<Vec<Message>> {
    let total = estimate_total_tokens(messages);
    let target = total.div_ceil(parts as u64).max(1);

    let mut chunks: Vec<Vec<Message>> = Vec::with_capacity(parts);
    let mut current = Vec::new();
    let mut acc = 0u64;
    for message in messages {
        current.push(message.clone());
        acc += estimate_message_tokens(message);
        if acc >= target && chunks.len() + 1 < parts {
            chunks.push(std::mem::take(&mut current));
            acc = 0;
        }
    }
    if !current.is_empty() {
        chunks.push(current);
    }
    chunks
}

async fn summarize_chunk(
    chunk: &[Message],
    summarizer: &dyn Summarizer,
    max_tokens: u32,
) -> Result<String, ProviderError> {
    let transcript: String = chunk
        .iter()
        .map(render_message)
        .collect::<Vec<_>>()
        .join("\n\n");
    let prompt = format!("{SUMMARIZE_PROMPT}\n\n{transcript}");

    match summarizer.summarize(prompt, max_tokens).await {
        Ok(summary) => Ok(summary),
        Err(err) => {
            // Retry with oversized messages replaced by short notes.
            warn!(error = %err, "Chunk summarization failed, retrying without oversized messages");
            let ceiling = (chunk_ratio(chunk) * f64::from(max_tokens)) as u64;
            let reduced: String = chunk
                .iter()
                .map(|m| {
                    if estimate_message_tokens(m) > ceiling {
                        format!(
                            "{}: {}",
                            match m.role {
                                Role::User => "User",
                                Role::Assistant => "Assistant",
                            },
                            oversized_note(m)
                        )
                    } else {
                        render_message(m)
                    }
                })
                .collect::<Vec<_>>()
                .join("\n\n");
            let prompt = format!("{SUMMARIZE_PROMPT}\n\n{reduced}");
            summarizer.summarize(prompt, max_tokens).await
        }
    }
}

/// Collect read-only and modified file paths from `tool_use` blocks.
fn mine_file_trailer(dropped: &[Message]) -> (Vec<String>, Vec<String>) {
    let mut read = Vec::new();
    let mut modified = Vec::new();
    for message in dropped {
        let MessageContent::Blocks(blocks) = &message.content else {
            continue;
        };
        for block in blocks {
            let ContentBlock::ToolUse { name, input, .. } = block else {
                continue;
            };
            let Some(path) = input.get("path").and_then(|v| v.as_str()) else {
                continue;
            };
            match name.as_str() {
                "read" => {
                    if !read.contains(&path.to_string()) {
                        read.push(path.to_string());
                    }
                }
                "write" | "edit" => {
                    if !modified.contains(&path.to_string()) {
                        modified.push(path.to_string());
                    }
                }
                _ => {}
            }
        }
    }
    read.retain(|p| !modified.contains(p));
    (read, modified)
}

/// Summarize the dropped messages into a compaction summary.
///
/// Returns `None` when there is nothing to summarize.
pub async fn build_compaction_summary(
    dropped: &[Message],
    total_tokens_before: u64,
    summarizer: &dyn Summarizer,
    settings: &CompactionSettings,
) -> Result<Option<CompactionSummary>, ProviderError> {
    if dropped.is_empty() {
        return Ok(None);
    }

    let max_tokens = (f64::from(settings.reserve_tokens) * 0.8) as u32;
    let chunks = if dropped.len() >= settings.min_messages_for_split && settings.parts > 1 {
        split_by_token_share(dropped, settings.parts)
    } else {
        vec![dropped.to_vec()]
    };
    debug!(
        dropped = dropped.len(),
        parts = chunks.len(),
        "Building compaction summary"
    );

    let mut part_summaries = Vec::with_capacity(chunks.len());
    for chunk in &chunks {
        part_summaries.push(summarize_chunk(chunk, summarizer, max_tokens).await?);
    }

    let merged = if part_summaries.len() == 1 {
        part_summaries.pop().unwrap_or_default()
    } else {
        let prompt = format!("{MERGE_PROMPT}\n\n{}", part_summaries.join("\n\n---\n\n"));
        summarizer.summarize(prompt, max_tokens).await?
    };

    let (read_files, modified_files) = mine_file_trailer(dropped);
    let mut text = format!(
        "The conversation history before this point was compacted into the \
following summary:\n\n<summary>\n{merged}\n</summary>"
    );
    if !read_files.is_empty() {
        text.push_str(&format!("\n\n<read-files>\n{}\n</read-files>", read_files.join("\n")));
    }
    if !modified_files.is_empty() {
        text.push_str(&format!(
            "\n\n<modified-files>\n{}\n</modified-files>",
            modified_files.join("\n")
        ));
    }

    Ok(Some(CompactionSummary {
        summary_chars: merged.chars().count(),
        dropped_messages: dropped.len(),
        tokens_before: total_tokens_before,
        text,
    }))
}
