//! Session key parsing.
//!
//! A session is keyed by a string of form `agent:<agentId>:session:<id>`
//! for interactive sessions or `agent:<agentId>:subagent:<uuid>` for
//! spawned subagents. The kind matters: subagent sessions may not spawn
//! further subagents.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// The kind of conversation a session key addresses.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionKind {
    Session,
    Subagent,
}

/// A parsed session key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionKey {
    pub agent_id: String,
    pub kind: SessionKind,
    pub id: String,
}

impl SessionKey {
    /// Build a main-session key for the given agent and conversation id.
    pub fn session(agent_id: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            agent_id: normalize_agent_id(&agent_id.into()),
            kind: SessionKind::Session,
            id: id.into(),
        }
    }

    /// Build a fresh subagent key under the given agent.
    pub fn subagent(agent_id: impl Into<String>) -> Self {
        Self {
            agent_id: normalize_agent_id(&agent_id.into()),
            kind: SessionKind::Subagent,
            id: Uuid::new_v4().to_string(),
        }
    }

    /// Parse `agent:<agentId>:session:<id>` / `agent:<agentId>:subagent:<id>`.
    pub fn parse(key: &str) -> Option<Self> {
        let mut parts = key.splitn(4, ':');
        if parts.next()? != "agent" {
            return None;
        }
        let agent_id = parts.next()?;
        let kind = match parts.next()? {
            "session" => SessionKind::Session,
            "subagent" => SessionKind::Subagent,
            _ => return None,
        };
        let id = parts.next()?;
        if agent_id.is_empty() || id.is_empty() {
            return None;
        }
        Some(Self {
            agent_id: agent_id.to_string(),
            kind,
            id: id.to_string(),
        })
    }

    pub fn is_subagent(&self) -> bool {
        self.kind == SessionKind::Subagent
    }
}

impl std::fmt::Display for SessionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let kind = match self.kind {
            SessionKind::Session => "session",
            SessionKind::Subagent => "subagent",
        };
        write!(f, "agent:{}:{}:{}", self.agent_id, kind, self.id)
    }
}

/// Lowercase and strip anything that is not `[a-z0-9_-]`.
pub fn normalize_agent_id(raw: &str) -> String {
    let normalized: String = raw
        .to_lowercase()
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == '_' || *c == '-')
        .collect();
    if normalized.is_empty() {
        "main".into()
    } else {
        normalized
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_and_display_roundtrip() {
        let key = SessionKey::session("main", "cli");
        let text = key.to_string();
        assert_eq!(text, "agent:main:session:cli");
        assert_eq!(SessionKey::parse(&text).unwrap(), key);
    }

    #[test]
    fn parse_rejects_malformed_keys() {
        assert!(SessionKey::parse("agent:main:session").is_none());
        assert!(SessionKey::parse("user:main:session:x").is_none());
        assert!(SessionKey::parse("agent:main:channel:x").is_none());
        assert!(SessionKey::parse("agent::session:x").is_none());
    }

    #[test]
    fn subagent_keys_are_flagged() {
        let key = SessionKey::subagent("main");
        assert!(key.is_subagent());
        assert!(SessionKey::parse(&key.to_string()).unwrap().is_subagent());
    }

    #[test]
    fn agent_ids_are_normalized() {
        assert_eq!(normalize_agent_id("My Agent!"), "myagent");
        assert_eq!(normalize_agent_id(""), "main");
        assert_eq!(normalize_agent_id("dev_bot-2"), "dev_bot-2");
    }
}
