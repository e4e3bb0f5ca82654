//! Configuration loading, validation, and management for Talon.
//!
//! Loads configuration from `~/.talon/config.toml` with environment
//! variable overrides. Validates all settings at startup.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

use talon_core::{ModelDef, ReasoningEffort};

/// The root configuration structure.
///
/// Maps directly to `~/.talon/config.toml`.
#[derive(Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// Provider API key (env `TALON_API_KEY` / `ANTHROPIC_API_KEY` override)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,

    /// Provider family
    #[serde(default = "default_provider")]
    pub provider: String,

    /// Model id, passed through to the provider
    #[serde(default = "default_model")]
    pub model: String,

    /// Override the provider's default endpoint
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,

    /// Extra headers sent with every provider request
    #[serde(default)]
    pub headers: HashMap<String, String>,

    /// Agent id; normalized, forms part of every session key
    #[serde(default = "default_agent_id")]
    pub agent_id: String,

    /// System prompt for every run
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_prompt: Option<String>,

    /// Tool names to register; empty means all built-ins
    #[serde(default)]
    pub tools: Vec<String>,

    /// Allow/deny filter applied to the registry before each run
    #[serde(default)]
    pub tool_policy: ToolPolicyConfig,

    /// Sandbox switches for the built-in tools
    #[serde(default)]
    pub sandbox: SandboxConfig,

    /// Sampling temperature
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,

    /// Reasoning effort forwarded to the provider
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasoning: Option<ReasoningEffort>,

    /// Hard cap on loop turns per run
    #[serde(default = "default_max_turns")]
    pub max_turns: u32,

    /// Context window handed to the pruning pipeline
    #[serde(default = "default_context_tokens")]
    pub context_tokens: u32,

    /// Global lane concurrency
    #[serde(default = "default_max_concurrent_runs")]
    pub max_concurrent_runs: usize,

    /// Module toggles
    #[serde(default)]
    pub enable_memory: bool,
    #[serde(default = "default_true")]
    pub enable_context: bool,
    #[serde(default)]
    pub enable_skills: bool,
    #[serde(default)]
    pub enable_heartbeat: bool,

    /// Session files directory (default `~/.talon/sessions`)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_dir: Option<PathBuf>,

    /// Tool workspace directory (default: current directory)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workspace_dir: Option<PathBuf>,
}

/// Allow/deny lists for the tool registry.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ToolPolicyConfig {
    #[serde(default)]
    pub allow: Vec<String>,
    #[serde(default)]
    pub deny: Vec<String>,
}

/// Sandbox switches for built-in tools.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_true")]
    pub allow_exec: bool,
    #[serde(default = "default_true")]
    pub allow_write: bool,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            allow_exec: true,
            allow_write: true,
        }
    }
}

fn default_provider() -> String {
    "anthropic".into()
}
fn default_model() -> String {
    "claude-sonnet-4-5".into()
}
fn default_agent_id() -> String {
    "main".into()
}
fn default_max_turns() -> u32 {
    20
}
fn default_context_tokens() -> u32 {
    200_000
}
fn default_max_concurrent_runs() -> usize {
    4
}
fn default_true() -> bool {
    true
}

/// Redact a secret for Debug output.
fn redact(s: &Option<String>) -> &'static str {
    match s {
        Some(_) => "[REDACTED]",
        None => "None",
    }
}

impl std::fmt::Debug for AppConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppConfig")
            .field("api_key", &redact(&self.api_key))
            .field("provider", &self.provider)
            .field("model", &self.model)
            .field("agent_id", &self.agent_id)
            .field("max_turns", &self.max_turns)
            .field("context_tokens", &self.context_tokens)
            .field("max_concurrent_runs", &self.max_concurrent_runs)
            .finish_non_exhaustive()
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        toml::from_str("").expect("empty config must deserialize with defaults")
    }
}

/// Errors from loading or validating configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {reason}")]
    Read { path: String, reason: String },

    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

impl AppConfig {
    /// Default config file location: `~/.talon/config.toml`.
    pub fn default_path() -> PathBuf {
        std::env::var_os("HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".talon")
            .join("config.toml")
    }

    /// Load from a file (missing file yields defaults), apply env
    /// overrides, and validate.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let mut config = if path.exists() {
            let raw = std::fs::read_to_string(path).map_err(|e| ConfigError::Read {
                path: path.display().to_string(),
                reason: e.to_string(),
            })?;
            toml::from_str(&raw)?
        } else {
            Self::default()
        };
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(key) = std::env::var("TALON_API_KEY") {
            self.api_key = Some(key);
        } else if self.api_key.is_none() {
            if let Ok(key) = std::env::var("ANTHROPIC_API_KEY") {
                self.api_key = Some(key);
            }
        }
        if let Ok(model) = std::env::var("TALON_MODEL") {
            self.model = model;
        }
        if let Ok(agent_id) = std::env::var("TALON_AGENT_ID") {
            self.agent_id = agent_id;
        }
    }

    /// Check invariants that would otherwise fail deep inside a run.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.model.trim().is_empty() {
            return Err(ConfigError::Invalid("model must not be empty".into()));
        }
        if self.max_concurrent_runs == 0 {
            return Err(ConfigError::Invalid(
                "max_concurrent_runs must be at least 1".into(),
            ));
        }
        if self.max_turns == 0 {
            return Err(ConfigError::Invalid("max_turns must be at least 1".into()));
        }
        if let Some(t) = self.temperature {
            if !(0.0..=2.0).contains(&t) {
                return Err(ConfigError::Invalid(format!(
                    "temperature {t} outside 0.0..=2.0"
                )));
            }
        }
        Ok(())
    }

    /// The resolved model definition for providers.
    pub fn model_def(&self) -> ModelDef {
        ModelDef {
            provider: self.provider.clone(),
            id: self.model.clone(),
            base_url: self.base_url.clone(),
            headers: self.headers.clone(),
        }
    }

    /// Resolved session directory.
    pub fn session_dir(&self) -> PathBuf {
        self.session_dir.clone().unwrap_or_else(|| {
            Self::default_path()
                .parent()
                .map(Path::to_path_buf)
                .unwrap_or_else(|| PathBuf::from(".talon"))
                .join("sessions")
        })
    }

    /// Resolved workspace directory.
    pub fn workspace_dir(&self) -> PathBuf {
        self.workspace_dir
            .clone()
            .or_else(|| std::env::current_dir().ok())
            .unwrap_or_else(|| PathBuf::from("."))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let config = AppConfig::default();
        assert_eq!(config.provider, "anthropic");
        assert_eq!(config.max_turns, 20);
        assert_eq!(config.context_tokens, 200_000);
        assert_eq!(config.max_concurrent_runs, 4);
        assert!(config.enable_context);
        assert!(!config.enable_memory);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn parses_a_full_config() {
        let raw = r#"
            model = "claude-opus-4-1"
            agent_id = "helper"
            max_turns = 10
            context_tokens = 100000
            reasoning = "high"

            [tool_policy]
            deny = ["shell"]

            [sandbox]
            allow_exec = false
        "#;
        let config: AppConfig = toml::from_str(raw).unwrap();
        assert_eq!(config.model, "claude-opus-4-1");
        assert_eq!(config.agent_id, "helper");
        assert_eq!(config.reasoning, Some(ReasoningEffort::High));
        assert_eq!(config.tool_policy.deny, vec!["shell"]);
        assert!(!config.sandbox.allow_exec);
        assert!(config.sandbox.allow_write);
    }

    #[test]
    fn missing_file_loads_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = AppConfig::load(&dir.path().join("nope.toml")).unwrap();
        assert_eq!(config.provider, "anthropic");
    }

    #[test]
    fn validation_rejects_zero_lanes() {
        let config: AppConfig = toml::from_str("max_concurrent_runs = 0").unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn validation_rejects_wild_temperature() {
        let config: AppConfig = toml::from_str("temperature = 9.5").unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn debug_redacts_api_key() {
        let mut config = AppConfig::default();
        config.api_key = Some("sk-secret".into());
        let output = format!("{config:?}");
        assert!(!output.contains("sk-secret"));
        assert!(output.contains("[REDACTED]"));
    }

    #[test]
    fn model_def_carries_connection_settings() {
        let mut config = AppConfig::default();
        config.base_url = Some("https://proxy.example.com".into());
        config.headers.insert("x-team".into(), "core".into());
        let model = config.model_def();
        assert_eq!(model.provider, "anthropic");
        assert_eq!(model.base_url.as_deref(), Some("https://proxy.example.com"));
        assert_eq!(model.headers.get("x-team").map(String::as_str), Some("core"));
    }
}
