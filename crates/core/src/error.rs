//! Error types for the Talon domain.
//!
//! Uses `thiserror` for ergonomic error definitions.
//! Each bounded context has its own error variant.

use thiserror::Error;

/// The top-level error type for all Talon operations.
#[derive(Debug, Error)]
pub enum Error {
    // --- Provider errors ---
    #[error("Provider error: {0}")]
    Provider(#[from] ProviderError),

    // --- Session errors ---
    #[error("Session error: {0}")]
    Session(#[from] SessionError),

    // --- Tool errors ---
    #[error("Tool error: {0}")]
    Tool(#[from] ToolError),

    // --- Agent loop errors ---
    #[error("Agent error: {0}")]
    Agent(#[from] AgentError),

    // --- Configuration errors ---
    #[error("Configuration error: {message}")]
    Config { message: String },

    // --- Serialization ---
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    // --- Generic ---
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Result type alias using our Error.
pub type Result<T> = std::result::Result<T, Error>;

// --- Bounded context errors ---

#[derive(Debug, Clone, Error)]
pub enum ProviderError {
    #[error("API request failed: {message} (status: {status_code})")]
    Api { status_code: u16, message: String },

    #[error("Rate limited by provider: {0}")]
    RateLimited(String),

    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),

    #[error("Stream error: {0}")]
    Stream(String),

    #[error("Network error: {0}")]
    Network(String),
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("Timed out acquiring session lock {path}")]
    LockTimeout { path: String },

    #[error("Session I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("Session file corrupt: {0}")]
    Corrupt(String),

    #[error("Unknown session: {0}")]
    NotFound(String),
}

#[derive(Debug, Error)]
pub enum ToolError {
    #[error("Unknown tool: {0}")]
    UnknownTool(String),

    #[error("Invalid arguments: {0}")]
    InvalidArguments(String),

    #[error("Permission denied for {tool_name}: {reason}")]
    PermissionDenied { tool_name: String, reason: String },

    #[error("Execution failed: {0}")]
    ExecutionFailed(String),

    #[error("Tool execution aborted")]
    Aborted,
}

#[derive(Debug, Error)]
pub enum AgentError {
    #[error("Context window too small: {tokens} tokens (minimum {min})")]
    ContextWindowTooSmall { tokens: u32, min: u32 },

    #[error("Context overflow: {0}")]
    ContextOverflow(String),

    #[error("operation aborted")]
    Cancelled,

    #[error("Cannot spawn a subagent from subagent session {session_key}")]
    SubagentSpawnRejected { session_key: String },
}

/// Classify a provider failure message as a transient rate-limit error.
///
/// Matched by substring because providers disagree on shape: some surface a
/// 429 status, others embed the phrase in a stream error payload.
pub fn is_rate_limit_error(message: &str) -> bool {
    let lower = message.to_lowercase();
    lower.contains("429")
        || lower.contains("rate limit")
        || lower.contains("too many requests")
        || lower.contains("quota")
}

/// Classify a provider failure message as a context-window overflow.
pub fn is_context_overflow_error(message: &str) -> bool {
    let lower = message.to_lowercase();
    lower.contains("context length")
        || lower.contains("too long")
        || lower.contains("maximum context")
}
