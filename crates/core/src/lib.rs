//! # Talon Core
//!
//! Domain types, traits, and error definitions for the Talon agent runtime.
//! This crate has **zero framework dependencies** — it defines the domain
//! model that all other crates implement against.
//!
//! ## Design Philosophy
//!
//! Every subsystem is defined as a trait here. Implementations live in their
//! respective crates. This enables:
//! - Swapping implementations via configuration
//! - Easy testing with mock/stub implementations
//! - Clean dependency graph (all crates depend inward on core)

pub mod error;
pub mod event;
pub mod message;
pub mod provider;
pub mod session_key;
pub mod tool;

// Re-export key types at crate root for ergonomics
pub use error::{Error, Result};
pub use event::{AgentEvent, EventQueue, EventSink, RunResult, SubscriberRegistry, Subscription};
pub use message::{ContentBlock, Message, MessageContent, Role};
pub use provider::{
    ModelDef, Provider, ProviderContext, ReasoningEffort, StreamEvent, StreamOptions,
    ToolCallData, ToolDefinition,
};
pub use session_key::{SessionKey, SessionKind};
pub use tool::{Tool, ToolContext, ToolRegistry};
