//! # Talon Providers
//!
//! Concrete LLM backends implementing the core `Provider` trait. The
//! runtime only ever sees typed stream events; everything wire-level
//! stays in here.

pub mod anthropic;

pub use anthropic::AnthropicProvider;
