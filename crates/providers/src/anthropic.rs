//! Anthropic native provider implementation.
//!
//! Uses Anthropic's Messages API directly.
//!
//! Features:
//! - `x-api-key` header authentication (not Bearer)
//! - `anthropic-version` header
//! - System prompt as top-level field
//! - Native tool use with `tool_use` / `tool_result` content blocks
//! - Streaming via SSE with `content_block_delta` events
//! - Extended thinking forwarded as thinking deltas
//! - Mid-stream abort through the caller's cancellation token

use async_trait::async_trait;
use futures::StreamExt;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

use talon_core::error::ProviderError;
use talon_core::{
    ContentBlock, Message, MessageContent, ModelDef, Provider, ProviderContext, ReasoningEffort,
    Role, StreamEvent, StreamOptions, ToolCallData, ToolDefinition,
};

const ANTHROPIC_VERSION: &str = "2023-06-01";
const DEFAULT_BASE_URL: &str = "https://api.anthropic.com";
const DEFAULT_MAX_TOKENS: u32 = 8192;

/// Anthropic native Messages API provider.
pub struct AnthropicProvider {
    client: reqwest::Client,
}

impl AnthropicProvider {
    pub fn new() -> Self {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(300))
            .build()
            .expect("Failed to create HTTP client");
        Self { client }
    }

    /// Convert messages to Anthropic API format with content blocks.
    fn to_api_messages(messages: &[Message]) -> Vec<Value> {
        let mut result = Vec::with_capacity(messages.len());
        for msg in messages {
            let role = match msg.role {
                Role::User => "user",
                Role::Assistant => "assistant",
            };
            let content = match &msg.content {
                MessageContent::Text(text) => json!(text),
                MessageContent::Blocks(blocks) => {
                    let api_blocks: Vec<Value> = blocks
                        .iter()
                        .map(|block| match block {
                            ContentBlock::Text { text } => json!({
                                "type": "text",
                                "text": text,
                            }),
                            ContentBlock::ToolUse { id, name, input } => json!({
                                "type": "tool_use",
                                "id": id,
                                "name": name,
                                "input": input,
                            }),
                            ContentBlock::ToolResult {
                                tool_use_id,
                                content,
                                ..
                            } => json!({
                                "type": "tool_result",
                                "tool_use_id": tool_use_id,
                                "content": content,
                            }),
                        })
                        .collect();
                    json!(api_blocks)
                }
            };
            result.push(json!({ "role": role, "content": content }));
        }
        result
    }

    fn to_api_tools(tools: &[ToolDefinition]) -> Vec<Value> {
        tools
            .iter()
            .map(|t| {
                json!({
                    "name": t.name,
                    "description": t.description,
                    "input_schema": t.input_schema,
                })
            })
            .collect()
    }

    fn build_body(
        model: &ModelDef,
        context: &ProviderContext,
        opts: &StreamOptions,
        stream: bool,
    ) -> Value {
        let mut body = json!({
            "model": model.id,
            "messages": Self::to_api_messages(&context.messages),
            "max_tokens": opts.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS),
        });
        if stream {
            body["stream"] = json!(true);
        }
        if let Some(system) = &context.system_prompt {
            body["system"] = json!(system);
        }
        if !context.tools.is_empty() {
            body["tools"] = json!(Self::to_api_tools(&context.tools));
        }
        if let Some(temperature) = opts.temperature {
            body["temperature"] = json!(temperature);
        }
        if let Some(reasoning) = opts.reasoning {
            // Map reasoning effort onto a thinking budget.
            let budget = match reasoning {
                ReasoningEffort::Minimal => 0,
                ReasoningEffort::Low => 2_048,
                ReasoningEffort::Medium => 8_192,
                ReasoningEffort::High => 16_384,
                ReasoningEffort::Xhigh => 32_768,
            };
            if budget > 0 {
                body["thinking"] = json!({
                    "type": "enabled",
                    "budget_tokens": budget,
                });
            }
        }
        body
    }

    async fn send(
        &self,
        model: &ModelDef,
        opts: &StreamOptions,
        body: &Value,
        accept: &str,
    ) -> Result<reqwest::Response, ProviderError> {
        let base = model
            .base_url
            .as_deref()
            .unwrap_or(DEFAULT_BASE_URL)
            .trim_end_matches('/');
        let url = format!("{base}/v1/messages");

        let mut request = self
            .client
            .post(&url)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .header("Content-Type", "application/json")
            .header("Accept", accept);
        if let Some(api_key) = &opts.api_key {
            request = request.header("x-api-key", api_key);
        }
        for (name, value) in &model.headers {
            request = request.header(name, value);
        }

        let response = request
            .json(body)
            .send()
            .await
            .map_err(|e| ProviderError::Network(e.to_string()))?;

        let status = response.status().as_u16();
        if status == 429 {
            let detail = response.text().await.unwrap_or_default();
            return Err(ProviderError::RateLimited(format!("429: {detail}")));
        }
        if status == 401 || status == 403 {
            return Err(ProviderError::AuthenticationFailed(
                "Invalid Anthropic API key".into(),
            ));
        }
        if status != 200 {
            let error_body = response.text().await.unwrap_or_default();
            warn!(status, body = %error_body, "Anthropic API error");
            return Err(ProviderError::Api {
                status_code: status,
                message: error_body,
            });
        }
        Ok(response)
    }
}

impl Default for AnthropicProvider {
    fn default() -> Self {
        Self::new()
    }
}

/// Per-stream accumulation for the current content block.
#[derive(Default)]
struct BlockAccumulator {
    text: String,
    thinking: bool,
    tool_id: String,
    tool_name: String,
    tool_args: String,
    in_tool_use: bool,
    in_text: bool,
}

impl BlockAccumulator {
    async fn finish(&mut self, tx: &mpsc::Sender<StreamEvent>) {
        if self.in_text {
            let _ = tx
                .send(StreamEvent::TextEnd {
                    content: std::mem::take(&mut self.text),
                })
                .await;
            self.in_text = false;
        }
        if self.thinking {
            let _ = tx.send(StreamEvent::ThinkingEnd).await;
            self.thinking = false;
        }
        if self.in_tool_use {
            let arguments: Value =
                serde_json::from_str(&self.tool_args).unwrap_or_else(|_| json!({}));
            let _ = tx
                .send(StreamEvent::ToolCallEnd {
                    tool_call: ToolCallData {
                        id: std::mem::take(&mut self.tool_id),
                        name: std::mem::take(&mut self.tool_name),
                        arguments,
                    },
                })
                .await;
            self.in_tool_use = false;
            self.tool_args.clear();
        }
    }
}

/// Handle one parsed SSE payload. Returns `true` when the stream is done.
async fn handle_sse_event(
    event: &Value,
    acc: &mut BlockAccumulator,
    tx: &mpsc::Sender<StreamEvent>,
) -> bool {
    match event["type"].as_str().unwrap_or("") {
        "content_block_start" => {
            acc.finish(tx).await;
            let block = &event["content_block"];
            match block["type"].as_str().unwrap_or("") {
                "tool_use" => {
                    acc.in_tool_use = true;
                    acc.tool_id = block["id"].as_str().unwrap_or("").to_string();
                    acc.tool_name = block["name"].as_str().unwrap_or("").to_string();
                    acc.tool_args.clear();
                    let _ = tx.send(StreamEvent::ToolCallStart).await;
                }
                "thinking" => acc.thinking = true,
                _ => acc.in_text = true,
            }
        }
        "content_block_delta" => {
            let delta = &event["delta"];
            match delta["type"].as_str().unwrap_or("") {
                "text_delta" => {
                    if let Some(text) = delta["text"].as_str() {
                        acc.in_text = true;
                        acc.text.push_str(text);
                        let _ = tx
                            .send(StreamEvent::TextDelta {
                                delta: text.to_string(),
                            })
                            .await;
                    }
                }
                "input_json_delta" => {
                    if let Some(partial) = delta["partial_json"].as_str() {
                        acc.tool_args.push_str(partial);
                    }
                }
                "thinking_delta" => {
                    if let Some(thinking) = delta["thinking"].as_str() {
                        let _ = tx
                            .send(StreamEvent::ThinkingDelta {
                                delta: thinking.to_string(),
                            })
                            .await;
                    }
                }
                _ => {}
            }
        }
        "content_block_stop" => acc.finish(tx).await,
        "error" => {
            let message = event["error"]["message"]
                .as_str()
                .unwrap_or("provider stream error")
                .to_string();
            let _ = tx.send(StreamEvent::Error { error_message: message }).await;
            return true;
        }
        "message_stop" => {
            acc.finish(tx).await;
            return true;
        }
        _ => {}
    }
    false
}

#[async_trait]
impl Provider for AnthropicProvider {
    fn name(&self) -> &str {
        "anthropic"
    }

    async fn stream(
        &self,
        model: &ModelDef,
        context: &ProviderContext,
        opts: &StreamOptions,
    ) -> Result<mpsc::Receiver<StreamEvent>, ProviderError> {
        let body = Self::build_body(model, context, opts, true);
        debug!(model = %model.id, messages = context.messages.len(), "Sending streaming request");
        let response = self.send(model, opts, &body, "text/event-stream").await?;

        let (tx, rx) = mpsc::channel(64);
        let signal = opts.signal.clone();
        tokio::spawn(async move {
            let mut byte_stream = response.bytes_stream();
            let mut buffer = String::new();
            let mut acc = BlockAccumulator::default();

            loop {
                let chunk = tokio::select! {
                    chunk = byte_stream.next() => chunk,
                    () = signal.cancelled() => {
                        let _ = tx
                            .send(StreamEvent::Error {
                                error_message: "operation aborted".into(),
                            })
                            .await;
                        return;
                    }
                };
                let Some(chunk_result) = chunk else {
                    // Stream ended without message_stop; flush what we have.
                    acc.finish(&tx).await;
                    return;
                };
                let bytes = match chunk_result {
                    Ok(bytes) => bytes,
                    Err(err) => {
                        let _ = tx
                            .send(StreamEvent::Error {
                                error_message: err.to_string(),
                            })
                            .await;
                        return;
                    }
                };
                buffer.push_str(&String::from_utf8_lossy(&bytes));

                while let Some(line_end) = buffer.find('\n') {
                    let line = buffer[..line_end].trim_end_matches('\r').to_string();
                    buffer = buffer[line_end + 1..].to_string();

                    if line.is_empty() || line.starts_with(':') || line.starts_with("event: ") {
                        continue;
                    }
                    let Some(data) = line.strip_prefix("data: ") else {
                        continue;
                    };
                    let data = data.trim();
                    if data.is_empty() {
                        continue;
                    }
                    let event: Value = match serde_json::from_str(data) {
                        Ok(v) => v,
                        Err(err) => {
                            trace!(error = %err, data, "Ignoring unparseable Anthropic SSE");
                            continue;
                        }
                    };
                    if handle_sse_event(&event, &mut acc, &tx).await {
                        return;
                    }
                }
            }
        });

        Ok(rx)
    }

    async fn complete(
        &self,
        model: &ModelDef,
        context: &ProviderContext,
        opts: &StreamOptions,
    ) -> Result<String, ProviderError> {
        let body = Self::build_body(model, context, opts, false);
        debug!(model = %model.id, "Sending completion request");
        let response = self.send(model, opts, &body, "application/json").await?;

        let parsed: Value = response.json().await.map_err(|e| ProviderError::Api {
            status_code: 200,
            message: format!("Failed to parse Anthropic response: {e}"),
        })?;

        let mut text = String::new();
        if let Some(blocks) = parsed["content"].as_array() {
            for block in blocks {
                if block["type"].as_str() == Some("text") {
                    if let Some(t) = block["text"].as_str() {
                        text.push_str(t);
                    }
                }
            }
        }
        Ok(text)
    }
}
