//! Message domain types.
//!
//! These are the core value objects that flow through the entire system:
//! a user message enters a run, the loop streams an assistant reply, tool
//! results come back as `tool_result` blocks inside a `user` message, and
//! everything is persisted to the session log in exactly this shape.

use chrono::Utc;
use serde::{Deserialize, Serialize};

/// The role of a message sender in a conversation.
///
/// Only `user` and `assistant` exist at this layer. System prompts are a
/// top-level field on the provider request, and tool results travel inside
/// `user` messages as content blocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// The end user (including synthesized tool-result carriers)
    User,
    /// The AI assistant
    Assistant,
}

/// A single content block inside a message.
///
/// - `text` — plain assistant or user prose
/// - `tool_use` — an assistant request to invoke a tool
/// - `tool_result` — the outcome of one tool invocation, carried by the
///   next `user` message and matched by `tool_use_id`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    Text {
        text: String,
    },
    ToolUse {
        id: String,
        name: String,
        input: serde_json::Value,
    },
    ToolResult {
        tool_use_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        name: Option<String>,
        content: String,
    },
}

/// Message content: either plain text or an ordered block sequence.
///
/// Serialized untagged so that `"content": "hi"` and `"content": [...]`
/// both round-trip, matching the persisted session format.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MessageContent {
    Text(String),
    Blocks(Vec<ContentBlock>),
}

/// A single message in a conversation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Who sent this message
    pub role: Role,

    /// Milliseconds since the Unix epoch
    pub timestamp: i64,

    /// The content payload
    pub content: MessageContent,
}

impl Message {
    /// Create a plain-text user message stamped with the current time.
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            timestamp: Utc::now().timestamp_millis(),
            content: MessageContent::Text(content.into()),
        }
    }

    /// Create a user message from content blocks (tool results).
    pub fn user_blocks(blocks: Vec<ContentBlock>) -> Self {
        Self {
            role: Role::User,
            timestamp: Utc::now().timestamp_millis(),
            content: MessageContent::Blocks(blocks),
        }
    }

    /// Create a plain-text assistant message.
    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            timestamp: Utc::now().timestamp_millis(),
            content: MessageContent::Text(content.into()),
        }
    }

    /// Create an assistant message from content blocks (text + tool_use).
    pub fn assistant_blocks(blocks: Vec<ContentBlock>) -> Self {
        Self {
            role: Role::Assistant,
            timestamp: Utc::now().timestamp_millis(),
            content: MessageContent::Blocks(blocks),
        }
    }

    /// The blocks of this message; a text body is viewed as one text block.
    pub fn blocks(&self) -> Vec<ContentBlock> {
        match &self.content {
            MessageContent::Text(text) => vec![ContentBlock::Text { text: text.clone() }],
            MessageContent::Blocks(blocks) => blocks.clone(),
        }
    }

    /// All text content joined with newlines.
    pub fn text(&self) -> String {
        match &self.content {
            MessageContent::Text(text) => text.clone(),
            MessageContent::Blocks(blocks) => blocks
                .iter()
                .filter_map(|b| match b {
                    ContentBlock::Text { text } => Some(text.as_str()),
                    _ => None,
                })
                .collect::<Vec<_>>()
                .join("\n"),
        }
    }

    /// The ids of all `tool_use` blocks.
    pub fn tool_use_ids(&self) -> Vec<String> {
        match &self.content {
            MessageContent::Text(_) => Vec::new(),
            MessageContent::Blocks(blocks) => blocks
                .iter()
                .filter_map(|b| match b {
                    ContentBlock::ToolUse { id, .. } => Some(id.clone()),
                    _ => None,
                })
                .collect(),
        }
    }

    /// The `tool_use_id`s of all `tool_result` blocks.
    pub fn tool_result_ids(&self) -> Vec<String> {
        match &self.content {
            MessageContent::Text(_) => Vec::new(),
            MessageContent::Blocks(blocks) => blocks
                .iter()
                .filter_map(|b| match b {
                    ContentBlock::ToolResult { tool_use_id, .. } => Some(tool_use_id.clone()),
                    _ => None,
                })
                .collect(),
        }
    }

    /// True if this is a `user` message carrying at least one `tool_result`.
    pub fn is_tool_result_carrier(&self) -> bool {
        self.role == Role::User && !self.tool_result_ids().is_empty()
    }

    /// Total characters across all serialized block text. This is the
    /// accounting basis for the context pipeline.
    pub fn char_len(&self) -> usize {
        match &self.content {
            MessageContent::Text(text) => text.chars().count(),
            MessageContent::Blocks(blocks) => blocks
                .iter()
                .map(|b| match b {
                    ContentBlock::Text { text } => text.chars().count(),
                    ContentBlock::ToolUse { name, input, .. } => {
                        name.chars().count() + input.to_string().chars().count()
                    }
                    ContentBlock::ToolResult { content, .. } => content.chars().count(),
                })
                .sum(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn text_message_roundtrip() {
        let msg = Message::user("hello");
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains(r#""content":"hello""#));
        let back: Message = serde_json::from_str(&json).unwrap();
        assert_eq!(back.text(), "hello");
        assert_eq!(back.role, Role::User);
    }

    #[test]
    fn block_message_roundtrip() {
        let msg = Message::assistant_blocks(vec![
            ContentBlock::Text {
                text: "let me check".into(),
            },
            ContentBlock::ToolUse {
                id: "tu_1".into(),
                name: "file_read".into(),
                input: serde_json::json!({"path": "a.txt"}),
            },
        ]);
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains(r#""type":"tool_use""#));
        let back: Message = serde_json::from_str(&json).unwrap();
        assert_eq!(back.tool_use_ids(), vec!["tu_1".to_string()]);
        assert_eq!(back.text(), "let me check");
    }

    #[test]
    fn tool_result_carrier_detection() {
        let results = Message::user_blocks(vec![ContentBlock::ToolResult {
            tool_use_id: "tu_1".into(),
            name: Some("file_read".into()),
            content: "data".into(),
        }]);
        assert!(results.is_tool_result_carrier());
        assert!(!Message::user("plain").is_tool_result_carrier());
        assert_eq!(results.tool_result_ids(), vec!["tu_1".to_string()]);
    }

    #[test]
    fn char_len_counts_all_blocks() {
        let msg = Message::assistant_blocks(vec![
            ContentBlock::Text { text: "abcd".into() },
            ContentBlock::ToolResult {
                tool_use_id: "x".into(),
                name: None,
                content: "efgh".into(),
            },
        ]);
        assert_eq!(msg.char_len(), 8);
    }
}
