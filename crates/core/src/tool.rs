//! Tool trait — the abstraction over agent capabilities.
//!
//! Tools are what give the agent the ability to act in the world:
//! execute shell commands, read/write files, spawn subagents. The loop
//! only requires this interface; implementations live in `talon-tools`.

use async_trait::async_trait;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::error::ToolError;
use crate::provider::ToolDefinition;

/// Execution context handed to every tool invocation.
///
/// Carries the run's composed cancellation token: a long-running tool must
/// observe it, and the loop converts an abort into an error result.
#[derive(Clone)]
pub struct ToolContext {
    /// Directory the tool may operate in
    pub workspace_dir: PathBuf,

    /// The session this invocation belongs to
    pub session_key: String,

    /// Normalized agent id
    pub agent_id: String,

    /// Composed per-run cancellation token
    pub cancel: CancellationToken,

    /// Opaque extras for tool implementations; typed structs everywhere
    /// else, a map only at this boundary
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

impl ToolContext {
    pub fn new(workspace_dir: impl Into<PathBuf>, session_key: impl Into<String>) -> Self {
        Self {
            workspace_dir: workspace_dir.into(),
            session_key: session_key.into(),
            agent_id: "main".into(),
            cancel: CancellationToken::new(),
            metadata: serde_json::Map::new(),
        }
    }
}

/// The core Tool trait.
///
/// `execute` returns the string fed back to the model as a `tool_result`;
/// a returned error is converted by the loop into an error result string
/// and never aborts the run.
#[async_trait]
pub trait Tool: Send + Sync {
    /// The unique name of this tool (e.g. "shell", "file_read").
    fn name(&self) -> &str;

    /// A description of what this tool does (sent to the LLM).
    fn description(&self) -> &str;

    /// JSON Schema describing this tool's input.
    fn input_schema(&self) -> serde_json::Value;

    /// Execute the tool with the given input.
    async fn execute(
        &self,
        input: serde_json::Value,
        ctx: &ToolContext,
    ) -> std::result::Result<String, ToolError>;

    /// Convert this tool into a ToolDefinition for sending to the LLM.
    fn to_definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: self.name().to_string(),
            description: self.description().to_string(),
            input_schema: self.input_schema(),
        }
    }
}

/// A registry of available tools.
///
/// The agent loop uses this to:
/// 1. Get tool definitions to send to the LLM
/// 2. Look up and execute tools when the LLM requests them
#[derive(Default, Clone)]
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
    order: Vec<String>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a tool. Replaces any existing tool with the same name.
    pub fn register(&mut self, tool: Arc<dyn Tool>) {
        let name = tool.name().to_string();
        if self.tools.insert(name.clone(), tool).is_none() {
            self.order.push(name);
        }
    }

    /// Get a tool by name.
    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).cloned()
    }

    /// All tool definitions, in registration order.
    pub fn definitions(&self) -> Vec<ToolDefinition> {
        self.order
            .iter()
            .filter_map(|name| self.tools.get(name))
            .map(|t| t.to_definition())
            .collect()
    }

    /// Number of registered tools.
    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    /// A copy of this registry restricted by allow/deny name lists.
    /// An empty allow list means "allow everything not denied".
    pub fn filtered(&self, allow: &[String], deny: &[String]) -> Self {
        let mut out = Self::new();
        for name in &self.order {
            if deny.iter().any(|d| d == name) {
                continue;
            }
            if !allow.is_empty() && !allow.iter().any(|a| a == name) {
                continue;
            }
            if let Some(tool) = self.tools.get(name) {
                out.register(Arc::clone(tool));
            }
        }
        out
    }
}
