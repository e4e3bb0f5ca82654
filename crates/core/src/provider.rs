//! Provider trait — the abstraction over LLM backends.
//!
//! A Provider knows how to send a conversation to an LLM and stream the
//! reply back as typed events. The agent loop consumes the event channel
//! and never sees provider wire formats.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::ProviderError;
use crate::message::Message;

/// A resolved model definition, passed through from configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelDef {
    /// Provider family (e.g. "anthropic")
    pub provider: String,

    /// Model id as the provider expects it
    pub id: String,

    /// Override the provider's default endpoint
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,

    /// Extra headers sent with every request
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub headers: HashMap<String, String>,
}

impl ModelDef {
    pub fn new(provider: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            provider: provider.into(),
            id: id.into(),
            base_url: None,
            headers: HashMap::new(),
        }
    }
}

/// Reasoning effort forwarded to providers that support it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReasoningEffort {
    Minimal,
    Low,
    Medium,
    High,
    Xhigh,
}

/// Per-call streaming options.
#[derive(Debug, Clone)]
pub struct StreamOptions {
    /// Maximum tokens to generate
    pub max_tokens: Option<u32>,

    /// Cooperative cancellation; the provider must abort mid-stream
    pub signal: CancellationToken,

    /// API key, if the provider needs one
    pub api_key: Option<String>,

    /// Sampling temperature
    pub temperature: Option<f32>,

    /// Reasoning effort
    pub reasoning: Option<ReasoningEffort>,
}

impl Default for StreamOptions {
    fn default() -> Self {
        Self {
            max_tokens: None,
            signal: CancellationToken::new(),
            api_key: None,
            temperature: None,
            reasoning: None,
        }
    }
}

/// A tool definition sent to the LLM so it knows what tools it can call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDefinition {
    /// The tool name
    pub name: String,

    /// Description of what the tool does
    pub description: String,

    /// JSON Schema describing the tool's input
    pub input_schema: serde_json::Value,
}

/// The conversation context for one provider call.
#[derive(Debug, Clone, Default)]
pub struct ProviderContext {
    /// System prompt, sent as a top-level field
    pub system_prompt: Option<String>,

    /// The message sequence
    pub messages: Vec<Message>,

    /// Tools the model may call
    pub tools: Vec<ToolDefinition>,
}

/// A completed tool call accumulated from the stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCallData {
    pub id: String,
    pub name: String,
    pub arguments: serde_json::Value,
}

/// One typed event in a streaming provider response.
///
/// The stream ends when the channel closes; an `error` event means the
/// call failed and must be raised by the consumer.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamEvent {
    TextDelta { delta: String },
    TextEnd { content: String },
    ThinkingDelta { delta: String },
    ThinkingEnd,
    ToolCallStart,
    ToolCallEnd { tool_call: ToolCallData },
    Error { error_message: String },
}

/// The core Provider trait.
///
/// `stream` returns a receiver of typed events; the call has settled once
/// the channel closes. `complete` is the non-streaming variant used for
/// internal calls (compaction summarization).
#[async_trait]
pub trait Provider: Send + Sync {
    /// The provider family name (e.g. "anthropic").
    fn name(&self) -> &str;

    /// Start a streaming completion.
    async fn stream(
        &self,
        model: &ModelDef,
        context: &ProviderContext,
        opts: &StreamOptions,
    ) -> std::result::Result<mpsc::Receiver<StreamEvent>, ProviderError>;

    /// Run a completion to the end and return the full text.
    async fn complete(
        &self,
        model: &ModelDef,
        context: &ProviderContext,
        opts: &StreamOptions,
    ) -> std::result::Result<String, ProviderError> {
        let mut rx = self.stream(model, context, opts).await?;
        let mut text = String::new();
        while let Some(event) = rx.recv().await {
            match event {
                StreamEvent::TextEnd { content } => {
                    text = content;
                }
                StreamEvent::Error { error_message } => {
                    return Err(ProviderError::Stream(error_message));
                }
                _ => {}
            }
        }
        Ok(text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stream_event_serialization() {
        let event = StreamEvent::ToolCallEnd {
            tool_call: ToolCallData {
                id: "tu_1".into(),
                name: "shell".into(),
                arguments: serde_json::json!({"command": "ls"}),
            },
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains(r#""type":"tool_call_end""#));
        assert!(json.contains(r#""name":"shell""#));
    }

    #[test]
    fn reasoning_effort_wire_names() {
        assert_eq!(
            serde_json::to_string(&ReasoningEffort::Xhigh).unwrap(),
            r#""xhigh""#
        );
        let back: ReasoningEffort = serde_json::from_str(r#""minimal""#).unwrap();
        assert_eq!(back, ReasoningEffort::Minimal);
    }
}
