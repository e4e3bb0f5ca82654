//! Three-layer context pruning.
//!
//! Applied before every model call, in escalating order of aggression:
//!
//! 1. **Soft trim** — long prunable tool results lose their middle.
//! 2. **Hard clear** — prunable tool results are replaced wholesale by a
//!    placeholder, oldest first, until pressure drops.
//! 3. **Message drop** — whole messages fall off the front, packing the
//!    survivors back-to-front into the history budget while a protected
//!    recent-assistant suffix is always kept.
//!
//! Pruning is deterministic: identical inputs always produce identical
//! outputs.

use globset::{Glob, GlobSet, GlobSetBuilder};
use serde::{Deserialize, Serialize};
use tracing::debug;

use talon_core::{ContentBlock, Message, MessageContent, Role};

use crate::estimate::CHARS_PER_TOKEN;

/// Soft-trim thresholds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SoftTrimSettings {
    /// Only results longer than this are trimmed
    pub max: usize,
    /// Characters kept from the head
    pub head: usize,
    /// Characters kept from the tail
    pub tail: usize,
}

impl Default for SoftTrimSettings {
    fn default() -> Self {
        Self {
            max: 4000,
            head: 1500,
            tail: 1500,
        }
    }
}

/// Which tools' results may be trimmed or cleared.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolPrunePolicy {
    /// Glob patterns of prunable tools; `*` matches everything
    pub allow: Vec<String>,
    /// Glob patterns of tools whose results are never touched
    pub deny: Vec<String>,
}

impl Default for ToolPrunePolicy {
    fn default() -> Self {
        Self {
            allow: vec!["*".into()],
            deny: Vec::new(),
        }
    }
}

/// Tunables for [`prune_context_messages`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PruneSettings {
    /// Share of the context window the history may occupy
    pub max_history_share: f64,
    /// Number of trailing assistant messages anchoring the protected suffix
    pub keep_last_assistants: usize,
    /// Pressure ratio above which soft trimming starts
    pub soft_trim_ratio: f64,
    /// Pressure ratio above which hard clearing starts
    pub hard_clear_ratio: f64,
    /// Hard clearing only pays off past this many prunable characters
    pub min_prunable_tool_chars: usize,
    pub soft_trim: SoftTrimSettings,
    /// Replacement content for hard-cleared results
    pub hard_clear_placeholder: String,
    pub tools: ToolPrunePolicy,
}

impl Default for PruneSettings {
    fn default() -> Self {
        Self {
            max_history_share: 0.5,
            keep_last_assistants: 3,
            soft_trim_ratio: 0.3,
            hard_clear_ratio: 0.5,
            min_prunable_tool_chars: 50_000,
            soft_trim: SoftTrimSettings::default(),
            hard_clear_placeholder: "[Old tool result content cleared]".into(),
            tools: ToolPrunePolicy::default(),
        }
    }
}

/// What pruning did and what survived.
#[derive(Debug, Clone)]
pub struct PruneOutcome {
    /// Messages to send, in original order
    pub messages: Vec<Message>,
    /// Messages removed by layer 3, in original order
    pub dropped_messages: Vec<Message>,
    pub trimmed_tool_results: usize,
    pub hard_cleared_tool_results: usize,
    pub total_chars: usize,
    pub kept_chars: usize,
    pub dropped_chars: usize,
    pub budget_chars: usize,
}

fn compile_globs(patterns: &[String]) -> GlobSet {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        if let Ok(glob) = Glob::new(pattern) {
            builder.add(glob);
        }
    }
    builder.build().unwrap_or_else(|_| GlobSet::empty())
}

struct PrunePolicy {
    allow: GlobSet,
    deny: GlobSet,
    allow_empty: bool,
}

impl PrunePolicy {
    fn new(policy: &ToolPrunePolicy) -> Self {
        Self {
            allow: compile_globs(&policy.allow),
            deny: compile_globs(&policy.deny),
            allow_empty: policy.allow.is_empty(),
        }
    }

    fn is_prunable(&self, tool_name: Option<&str>) -> bool {
        let name = tool_name.unwrap_or("");
        if self.deny.is_match(name) {
            return false;
        }
        self.allow_empty || self.allow.is_match(name)
    }
}

fn total_chars(messages: &[Message]) -> usize {
    messages.iter().map(Message::char_len).sum()
}

/// First `n` characters of `s`, on char boundaries.
fn head_chars(s: &str, n: usize) -> &str {
    match s.char_indices().nth(n) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

/// Last `n` characters of `s`, on char boundaries.
fn tail_chars(s: &str, n: usize) -> &str {
    let len = s.chars().count();
    if len <= n {
        return s;
    }
    match s.char_indices().nth(len - n) {
        Some((idx, _)) => &s[idx..],
        None => s,
    }
}

/// Apply the three pruning layers to `messages`.
pub fn prune_context_messages(
    messages: Vec<Message>,
    context_window_tokens: u32,
    settings: &PruneSettings,
) -> PruneOutcome {
    let policy = PrunePolicy::new(&settings.tools);
    let char_window = context_window_tokens as usize * CHARS_PER_TOKEN;
    let budget_chars = (char_window as f64 * settings.max_history_share) as usize;
    let original_total = total_chars(&messages);

    let mut messages = messages;
    let mut trimmed = 0usize;
    let mut cleared = 0usize;

    // --- Layer 1: soft trim ---
    let ratio = original_total as f64 / char_window as f64;
    if ratio > settings.soft_trim_ratio {
        for message in &mut messages {
            if message.role != Role::User {
                continue;
            }
            let MessageContent::Blocks(blocks) = &mut message.content else {
                continue;
            };
            for block in blocks {
                let ContentBlock::ToolResult { name, content, .. } = block else {
                    continue;
                };
                if !policy.is_prunable(name.as_deref()) {
                    continue;
                }
                let len = content.chars().count();
                if len <= settings.soft_trim.max {
                    continue;
                }
                let omitted = len
                    .saturating_sub(settings.soft_trim.head)
                    .saturating_sub(settings.soft_trim.tail);
                *content = format!(
                    "{}\n...\n{}\n[trimmed {} chars]",
                    head_chars(content, settings.soft_trim.head),
                    tail_chars(content, settings.soft_trim.tail),
                    omitted
                );
                trimmed += 1;
            }
        }
    }

    // --- Layer 2: hard clear ---
    let mut running = total_chars(&messages);
    let prunable_chars: usize = messages
        .iter()
        .filter(|m| m.role == Role::User)
        .map(|m| match &m.content {
            MessageContent::Text(_) => 0,
            MessageContent::Blocks(blocks) => blocks
                .iter()
                .filter_map(|b| match b {
                    ContentBlock::ToolResult { name, content, .. }
                        if policy.is_prunable(name.as_deref()) =>
                    {
                        Some(content.chars().count())
                    }
                    _ => None,
                })
                .sum::<usize>(),
        })
        .sum();

    if running as f64 / char_window as f64 > settings.hard_clear_ratio
        && prunable_chars > settings.min_prunable_tool_chars
    {
        let placeholder_len = settings.hard_clear_placeholder.chars().count();
        'outer: for message in &mut messages {
            if message.role != Role::User {
                continue;
            }
            let MessageContent::Blocks(blocks) = &mut message.content else {
                continue;
            };
            for block in blocks {
                let ContentBlock::ToolResult { name, content, .. } = block else {
                    continue;
                };
                if !policy.is_prunable(name.as_deref()) {
                    continue;
                }
                let len = content.chars().count();
                if len <= placeholder_len {
                    continue;
                }
                *content = settings.hard_clear_placeholder.clone();
                cleared += 1;
                running -= len - placeholder_len;
                if (running as f64 / char_window as f64) < settings.hard_clear_ratio {
                    break 'outer;
                }
            }
        }
    }

    // --- Layer 3: message drop ---
    let mut kept_flags = vec![true; messages.len()];
    let current_total = total_chars(&messages);
    if current_total > budget_chars {
        let assistant_indices: Vec<usize> = messages
            .iter()
            .enumerate()
            .filter(|(_, m)| m.role == Role::Assistant)
            .map(|(i, _)| i)
            .collect();
        let cutoff = if assistant_indices.len() >= settings.keep_last_assistants {
            assistant_indices[assistant_indices.len() - settings.keep_last_assistants]
        } else {
            0
        };

        let sizes: Vec<usize> = messages.iter().map(Message::char_len).collect();
        let protected_chars: usize = sizes[cutoff..].iter().sum();

        kept_flags = vec![false; messages.len()];
        if protected_chars <= budget_chars {
            for flag in &mut kept_flags[cutoff..] {
                *flag = true;
            }
            let mut acc = protected_chars;
            for idx in (0..cutoff).rev() {
                if acc + sizes[idx] > budget_chars {
                    break;
                }
                kept_flags[idx] = true;
                acc += sizes[idx];
            }
        } else {
            // Protected suffix alone exceeds the budget: pack back-to-front
            // ignoring protection.
            debug!(
                protected_chars,
                budget_chars, "Protected messages exceed history budget"
            );
            let mut acc = 0usize;
            for idx in (0..messages.len()).rev() {
                if acc + sizes[idx] > budget_chars {
                    break;
                }
                kept_flags[idx] = true;
                acc += sizes[idx];
            }
        }
    }

    let mut kept = Vec::new();
    let mut dropped = Vec::new();
    for (message, keep) in messages.into_iter().zip(kept_flags) {
        if keep {
            kept.push(message);
        } else {
            dropped.push(message);
        }
    }

    let kept_chars = total_chars(&kept);
    let dropped_chars = total_chars(&dropped);
    PruneOutcome {
        messages: kept,
        dropped_messages: dropped,
        trimmed_tool_results: trimmed,
        hard_cleared_tool_results: cleared,
        total_chars: original_total,
        kept_chars,
        dropped_chars,
        budget_chars,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tool_result_msg(tool: &str, content: String) -> Message {
        Message::user_blocks(vec![ContentBlock::ToolResult {
            tool_use_id: "tu".into(),
            name: Some(tool.into()),
            content,
        }])
    }

    #[test]
    fn small_history_is_untouched() {
        let messages = vec![Message::user("hi"), Message::assistant("hello")];
        let outcome = prune_context_messages(messages.clone(), 200_000, &PruneSettings::default());
        assert_eq!(outcome.messages, messages);
        assert!(outcome.dropped_messages.is_empty());
        assert_eq!(outcome.trimmed_tool_results, 0);
        assert_eq!(outcome.hard_cleared_tool_results, 0);
    }

    #[test]
    fn soft_trim_keeps_head_and_tail() {
        // window = 10_000 tokens = 40_000 chars; 20_000 chars => ratio 0.5
        let content = "a".repeat(20_000);
        let messages = vec![
            Message::assistant("checking"),
            tool_result_msg("file_read", content),
        ];
        let outcome = prune_context_messages(messages, 10_000, &PruneSettings::default());
        assert_eq!(outcome.trimmed_tool_results, 1);

        let trimmed = &outcome.messages[1];
        match &trimmed.content {
            MessageContent::Blocks(blocks) => match &blocks[0] {
                ContentBlock::ToolResult { content, .. } => {
                    assert!(content.contains("\n...\n"));
                    assert!(content.contains("[trimmed 17000 chars]"));
                    assert!(content.chars().count() < 4000);
                }
                other => panic!("unexpected block {other:?}"),
            },
            other => panic!("unexpected content {other:?}"),
        }
    }

    #[test]
    fn denied_tools_are_never_trimmed() {
        let content = "b".repeat(20_000);
        let mut settings = PruneSettings::default();
        settings.tools.deny = vec!["secret_*".into()];
        let messages = vec![tool_result_msg("secret_fetch", content.clone())];
        let outcome = prune_context_messages(messages, 10_000, &settings);
        assert_eq!(outcome.trimmed_tool_results, 0);
        assert_eq!(outcome.messages[0].char_len(), content.len());
    }

    #[test]
    fn hard_clear_replaces_oldest_first_and_stops_early() {
        // window = 50_000 tokens = 200_000 chars.
        // Three prunable results of 60_000 chars each => ratio 0.9.
        // Soft trim shrinks each to < 4_000 first, so force min=0 and
        // oversize the trim threshold to isolate layer 2.
        let mut settings = PruneSettings::default();
        settings.soft_trim.max = usize::MAX;
        settings.min_prunable_tool_chars = 50_000;

        let messages = vec![
            tool_result_msg("file_read", "x".repeat(60_000)),
            tool_result_msg("file_read", "y".repeat(60_000)),
            tool_result_msg("file_read", "z".repeat(60_000)),
        ];
        let outcome = prune_context_messages(messages, 50_000, &settings);

        // Clearing the first result brings 180k -> ~120k+placeholder,
        // ratio ~0.6; second clear lands under 0.5 and stops.
        assert_eq!(outcome.hard_cleared_tool_results, 2);
        match &outcome.messages[2].content {
            MessageContent::Blocks(blocks) => match &blocks[0] {
                ContentBlock::ToolResult { content, .. } => {
                    assert!(content.starts_with('z'));
                }
                other => panic!("unexpected block {other:?}"),
            },
            other => panic!("unexpected content {other:?}"),
        }
    }

    #[test]
    fn message_drop_protects_recent_assistants() {
        // window = 1000 tokens = 4000 chars, budget = 2000 chars.
        let mut messages = Vec::new();
        for i in 0..10 {
            messages.push(Message::user(format!("question {i} {}", "q".repeat(200))));
            messages.push(Message::assistant(format!("answer {i} {}", "a".repeat(200))));
        }
        let outcome = prune_context_messages(messages, 1000, &PruneSettings::default());

        assert!(!outcome.dropped_messages.is_empty());
        assert!(outcome.kept_chars <= outcome.budget_chars);
        // The last three assistant messages survive.
        let texts: Vec<String> = outcome.messages.iter().map(Message::text).collect();
        assert!(texts.iter().any(|t| t.starts_with("answer 9")));
        assert!(texts.iter().any(|t| t.starts_with("answer 8")));
        assert!(texts.iter().any(|t| t.starts_with("answer 7")));
        // Order is preserved.
        let mut sorted = texts.clone();
        sorted.sort_by_key(|t| {
            t.split_whitespace()
                .nth(1)
                .and_then(|n| n.parse::<usize>().ok())
                .unwrap_or(0)
        });
        assert_eq!(texts.len(), sorted.len());
    }

    #[test]
    fn oversized_protected_suffix_falls_back_to_packing() {
        // Budget is 2000 chars but the protected suffix alone is ~15k.
        let mut messages = Vec::new();
        for i in 0..4 {
            messages.push(Message::user(format!("q{i}")));
            messages.push(Message::assistant("a".repeat(5000)));
        }
        let outcome = prune_context_messages(messages, 1000, &PruneSettings::default());
        // Nothing fits except trailing small messages; never panics, and
        // the kept set respects the budget.
        assert!(outcome.kept_chars <= outcome.budget_chars);
    }

    #[test]
    fn report_totals_are_consistent() {
        let messages = vec![
            Message::user("u".repeat(3000)),
            Message::assistant("a".repeat(3000)),
        ];
        let outcome = prune_context_messages(messages, 1000, &PruneSettings::default());
        assert_eq!(outcome.total_chars, 6000);
        assert_eq!(
            outcome.kept_chars + outcome.dropped_chars,
            total_chars(&outcome.messages) + total_chars(&outcome.dropped_messages)
        );
    }
}
