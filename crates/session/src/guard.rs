//! Tool-result invariant enforcement.
//!
//! Every `tool_use` block an assistant message puts in the log must be
//! answered by a matching `tool_result` before any other `user` message.
//! Providers reject histories that violate this, so the guard decorates
//! the session log and synthesizes error results for anything left
//! dangling — including calls orphaned by a crash in a previous process.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use talon_core::error::SessionError;
use talon_core::{ContentBlock, Message, Role};

use crate::log::SessionLog;

/// Placeholder content for a synthesized result.
pub const MISSING_TOOL_RESULT_TEXT: &str =
    "missing tool result in session history; synthetic error result inserted";

/// Per-session record of tool calls awaiting results, in call order.
#[derive(Default)]
struct PendingCalls {
    calls: Vec<(String, Option<String>)>,
}

impl PendingCalls {
    fn record(&mut self, id: String, name: Option<String>) {
        if !self.calls.iter().any(|(existing, _)| *existing == id) {
            self.calls.push((id, name));
        }
    }

    fn resolve(&mut self, id: &str) {
        self.calls.retain(|(existing, _)| existing != id);
    }

    fn drain(&mut self) -> Vec<(String, Option<String>)> {
        std::mem::take(&mut self.calls)
    }

    fn is_empty(&self) -> bool {
        self.calls.is_empty()
    }
}

/// Decorator over a [`SessionLog`] that keeps the tool-result invariant.
pub struct ToolResultGuard {
    inner: Arc<dyn SessionLog>,
    pending: Mutex<HashMap<String, PendingCalls>>,
}

impl ToolResultGuard {
    /// Wrap a log with guard semantics. Installing over an already-guarded
    /// log returns it unchanged, so double installation cannot double-wrap.
    pub fn install(log: Arc<dyn SessionLog>) -> Arc<ToolResultGuard> {
        if let Some(guard) = Arc::clone(&log).as_guard() {
            return guard;
        }
        Arc::new(Self {
            inner: log,
            pending: Mutex::new(HashMap::new()),
        })
    }

    /// Synthesize results for every pending call and persist them as one
    /// `user` message. Called in the outermost finally of every run.
    pub async fn flush_pending(&self, session_key: &str) -> Result<(), SessionError> {
        let drained = {
            let mut pending = self.pending.lock().await;
            match pending.get_mut(session_key) {
                Some(calls) if !calls.is_empty() => calls.drain(),
                _ => return Ok(()),
            }
        };

        warn!(
            session = session_key,
            count = drained.len(),
            "Synthesizing missing tool results"
        );
        let blocks: Vec<ContentBlock> = drained
            .into_iter()
            .map(|(id, name)| ContentBlock::ToolResult {
                tool_use_id: id,
                name,
                content: MISSING_TOOL_RESULT_TEXT.into(),
            })
            .collect();
        self.inner
            .append(session_key, Message::user_blocks(blocks))
            .await?;
        Ok(())
    }

    /// Rebuild the pending set from a loaded history (crash recovery).
    async fn seed_pending(&self, session_key: &str, messages: &[Message]) {
        let mut calls = PendingCalls::default();
        for message in messages {
            match message.role {
                Role::Assistant => {
                    for block in message.blocks() {
                        if let ContentBlock::ToolUse { id, name, .. } = block {
                            calls.record(id, Some(name));
                        }
                    }
                }
                Role::User => {
                    for id in message.tool_result_ids() {
                        calls.resolve(&id);
                    }
                }
            }
        }
        if !calls.is_empty() {
            debug!(
                session = session_key,
                count = calls.calls.len(),
                "Recovered unmatched tool calls from session history"
            );
        }
        let mut pending = self.pending.lock().await;
        pending.insert(session_key.to_string(), calls);
    }
}

#[async_trait]
impl SessionLog for ToolResultGuard {
    async fn load(&self, session_key: &str) -> Result<Vec<Message>, SessionError> {
        let messages = self.inner.load(session_key).await?;
        self.seed_pending(session_key, &messages).await;
        Ok(messages)
    }

    async fn append(
        &self,
        session_key: &str,
        message: Message,
    ) -> Result<String, SessionError> {
        if message.is_tool_result_carrier() {
            let mut pending = self.pending.lock().await;
            let calls = pending.entry(session_key.to_string()).or_default();
            for id in message.tool_result_ids() {
                calls.resolve(&id);
            }
        } else {
            let needs_flush = {
                let pending = self.pending.lock().await;
                pending
                    .get(session_key)
                    .map(|calls| !calls.is_empty())
                    .unwrap_or(false)
            };
            if needs_flush {
                self.flush_pending(session_key).await?;
            }
        }

        let id = self.inner.append(session_key, message.clone()).await?;

        if message.role == Role::Assistant {
            let mut pending = self.pending.lock().await;
            let calls = pending.entry(session_key.to_string()).or_default();
            for block in message.blocks() {
                if let ContentBlock::ToolUse { id, name, .. } = block {
                    calls.record(id, Some(name));
                }
            }
        }
        Ok(id)
    }

    async fn append_compaction(
        &self,
        session_key: &str,
        summary: String,
        first_kept_entry_id: String,
        tokens_before: u64,
    ) -> Result<String, SessionError> {
        self.inner
            .append_compaction(session_key, summary, first_kept_entry_id, tokens_before)
            .await
    }

    async fn resolve_message_entry_id(
        &self,
        session_key: &str,
        message: &Message,
    ) -> Option<String> {
        self.inner.resolve_message_entry_id(session_key, message).await
    }

    async fn clear(&self, session_key: &str) -> Result<(), SessionError> {
        self.pending.lock().await.remove(session_key);
        self.inner.clear(session_key).await
    }

    async fn list(&self) -> Result<Vec<String>, SessionError> {
        self.inner.list().await
    }

    fn as_guard(self: Arc<Self>) -> Option<Arc<ToolResultGuard>> {
        Some(self)
    }
}
