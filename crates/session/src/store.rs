//! JSONL session store.
//!
//! One file per session at `<base>/<url-encoded sessionKey>.jsonl`. The
//! first line is the `session` header; every further line is a `message`
//! or `compaction` entry linked to its parent. File creation is deferred
//! until the session has produced an assistant turn, so abandoned empty
//! sessions leave no files; the first physical write rewrites the whole
//! file once, after which writes are pure appends.

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use talon_core::error::SessionError;
use talon_core::{Message, Role};

use crate::entry::{
    new_entry_id, CompactionEntry, MessageEntry, SessionEntry, SessionHeader,
    SESSION_FORMAT_VERSION,
};
use crate::lock::SessionLock;
use crate::log::SessionLog;

/// In-memory state for one session file.
struct SessionState {
    file_path: PathBuf,
    header: SessionHeader,
    entries: Vec<SessionEntry>,
    by_id: HashMap<String, usize>,
    leaf_id: Option<String>,
    /// False until the header has been written; the first persisted append
    /// rewrites the whole file, then writes switch to pure appends.
    flushed: bool,
    has_assistant: bool,
}

impl SessionState {
    fn new(file_path: PathBuf) -> Self {
        Self {
            file_path,
            header: SessionHeader {
                version: SESSION_FORMAT_VERSION,
                id: new_entry_id(&|_| false),
                timestamp: Utc::now().timestamp_millis(),
                cwd: std::env::current_dir()
                    .map(|p| p.display().to_string())
                    .unwrap_or_default(),
            },
            entries: Vec::new(),
            by_id: HashMap::new(),
            leaf_id: None,
            flushed: false,
            has_assistant: false,
        }
    }

    fn push_entry(&mut self, entry: SessionEntry) {
        if let Some(id) = entry.id() {
            self.by_id.insert(id.to_string(), self.entries.len());
            self.leaf_id = Some(id.to_string());
        }
        if let SessionEntry::Message(m) = &entry {
            if m.message.role == Role::Assistant {
                self.has_assistant = true;
            }
        }
        self.entries.push(entry);
    }

    fn fresh_id(&self) -> String {
        new_entry_id(&|candidate| self.by_id.contains_key(candidate))
    }

    /// Ordered entry indices from the root to the current leaf.
    fn path_indices(&self) -> Vec<usize> {
        let mut path = Vec::new();
        let mut cursor = self.leaf_id.clone();
        while let Some(id) = cursor {
            let Some(&idx) = self.by_id.get(&id) else {
                warn!(entry = %id, "Dangling parent link in session; truncating path");
                break;
            };
            path.push(idx);
            cursor = self.entries[idx].parent_id().map(str::to_string);
        }
        path.reverse();
        path
    }

    /// Replay the path into the live message sequence, substituting the
    /// last compaction summary for everything before its kept suffix.
    fn live_messages(&self) -> Vec<Message> {
        let path = self.path_indices();

        let mut compaction: Option<&CompactionEntry> = None;
        for &idx in &path {
            if let SessionEntry::Compaction(c) = &self.entries[idx] {
                compaction = Some(c);
            }
        }

        let start = compaction
            .and_then(|c| {
                path.iter()
                    .position(|&idx| self.entries[idx].id() == Some(c.first_kept_entry_id.as_str()))
            })
            .unwrap_or(0);

        let mut messages = Vec::new();
        if let Some(c) = compaction {
            messages.push(Message {
                role: Role::User,
                timestamp: c.timestamp,
                content: talon_core::MessageContent::Text(c.summary.clone()),
            });
        }
        for &idx in &path[start..] {
            if let SessionEntry::Message(m) = &self.entries[idx] {
                messages.push(m.message.clone());
            }
        }
        messages
    }
}

/// File-backed session store. Cheap to clone; all clones share state.
#[derive(Clone)]
pub struct SessionStore {
    base_dir: PathBuf,
    sessions: Arc<Mutex<HashMap<String, Arc<Mutex<SessionState>>>>>,
}

impl SessionStore {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
            sessions: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    fn file_path(&self, session_key: &str) -> PathBuf {
        let encoded = urlencoding::encode(session_key).into_owned();
        self.base_dir.join(format!("{encoded}.jsonl"))
    }

    async fn state_for(
        &self,
        session_key: &str,
    ) -> Result<Arc<Mutex<SessionState>>, SessionError> {
        let mut sessions = self.sessions.lock().await;
        if let Some(state) = sessions.get(session_key) {
            return Ok(Arc::clone(state));
        }

        let path = self.file_path(session_key);
        let state = if tokio::fs::try_exists(&path).await.unwrap_or(false) {
            load_state(&path).await?
        } else {
            SessionState::new(path)
        };
        let state = Arc::new(Mutex::new(state));
        sessions.insert(session_key.to_string(), Arc::clone(&state));
        Ok(state)
    }

    /// Persist one freshly pushed entry, honoring deferred file creation.
    async fn persist_last(&self, state: &mut SessionState) -> Result<(), SessionError> {
        if !state.has_assistant {
            return Ok(());
        }

        let _lock = SessionLock::acquire(&state.file_path).await?;
        if state.flushed {
            let entry = state
                .entries
                .last()
                .ok_or_else(|| SessionError::Corrupt("append with no entries".into()))?;
            append_line(&state.file_path, entry).await?;
        } else {
            rewrite_file(state).await?;
            state.flushed = true;
        }
        Ok(())
    }
}

#[async_trait]
impl SessionLog for SessionStore {
    async fn load(&self, session_key: &str) -> Result<Vec<Message>, SessionError> {
        let state = self.state_for(session_key).await?;
        let state = state.lock().await;
        Ok(state.live_messages())
    }

    async fn append(
        &self,
        session_key: &str,
        message: Message,
    ) -> Result<String, SessionError> {
        let state = self.state_for(session_key).await?;
        let mut state = state.lock().await;

        let id = state.fresh_id();
        let entry = SessionEntry::Message(MessageEntry {
            id: id.clone(),
            parent_id: state.leaf_id.clone(),
            timestamp: Utc::now().timestamp_millis(),
            message,
        });
        state.push_entry(entry);
        self.persist_last(&mut state).await?;
        Ok(id)
    }

    async fn append_compaction(
        &self,
        session_key: &str,
        summary: String,
        first_kept_entry_id: String,
        tokens_before: u64,
    ) -> Result<String, SessionError> {
        let state = self.state_for(session_key).await?;
        let mut state = state.lock().await;

        let id = state.fresh_id();
        let entry = SessionEntry::Compaction(CompactionEntry {
            id: id.clone(),
            parent_id: state.leaf_id.clone(),
            timestamp: Utc::now().timestamp_millis(),
            summary,
            first_kept_entry_id,
            tokens_before,
        });
        state.push_entry(entry);
        self.persist_last(&mut state).await?;
        Ok(id)
    }

    async fn resolve_message_entry_id(
        &self,
        session_key: &str,
        message: &Message,
    ) -> Option<String> {
        let state = self.state_for(session_key).await.ok()?;
        let state = state.lock().await;
        state.entries.iter().rev().find_map(|entry| match entry {
            SessionEntry::Message(m) if m.message == *message => Some(m.id.clone()),
            _ => None,
        })
    }

    async fn clear(&self, session_key: &str) -> Result<(), SessionError> {
        let mut sessions = self.sessions.lock().await;
        sessions.remove(session_key);
        let path = self.file_path(session_key);
        if tokio::fs::try_exists(&path).await.unwrap_or(false) {
            let _lock = SessionLock::acquire(&path).await?;
            tokio::fs::remove_file(&path).await?;
        }
        Ok(())
    }

    async fn list(&self) -> Result<Vec<String>, SessionError> {
        let mut keys = Vec::new();
        let mut dir = match tokio::fs::read_dir(&self.base_dir).await {
            Ok(dir) => dir,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(keys),
            Err(err) => return Err(SessionError::Io(err)),
        };
        while let Some(item) = dir.next_entry().await? {
            let name = item.file_name().to_string_lossy().into_owned();
            let Some(stem) = name.strip_suffix(".jsonl") else {
                continue;
            };
            match urlencoding::decode(stem) {
                Ok(key) => keys.push(key.into_owned()),
                Err(_) => warn!(file = %name, "Undecodable session file name"),
            }
        }
        keys.sort();
        Ok(keys)
    }
}

/// Parse a session file, tolerating truncated/malformed lines and unknown
/// entry types. A file without a `session` header is treated as a legacy
/// flat message list and migrated on the next write.
async fn load_state(path: &Path) -> Result<SessionState, SessionError> {
    let raw = tokio::fs::read_to_string(path).await?;
    let mut state = SessionState::new(path.to_path_buf());
    let mut saw_header = false;

    for (line_no, line) in raw.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let value: Value = match serde_json::from_str(line) {
            Ok(v) => v,
            Err(err) => {
                debug!(line = line_no + 1, error = %err, "Skipping malformed session line");
                continue;
            }
        };

        let entry_type = value
            .get("type")
            .and_then(Value::as_str)
            .map(str::to_string);
        match entry_type.as_deref() {
            Some("session") | Some("message") | Some("compaction") => {
                match serde_json::from_value::<SessionEntry>(value) {
                    Ok(SessionEntry::Session(header)) => {
                        state.header = header;
                        saw_header = true;
                    }
                    Ok(entry) => state.push_entry(entry),
                    Err(err) => {
                        debug!(line = line_no + 1, error = %err, "Skipping undecodable entry");
                    }
                }
            }
            Some(other) => {
                debug!(line = line_no + 1, entry_type = other, "Skipping unknown entry type");
            }
            None => {
                // Legacy flat format: the line is a bare message.
                match serde_json::from_value::<Message>(value) {
                    Ok(message) => {
                        let id = state.fresh_id();
                        let entry = SessionEntry::Message(MessageEntry {
                            id,
                            parent_id: state.leaf_id.clone(),
                            timestamp: message.timestamp,
                            message,
                        });
                        state.push_entry(entry);
                    }
                    Err(err) => {
                        debug!(line = line_no + 1, error = %err, "Skipping unrecognized line");
                    }
                }
            }
        }
    }

    // Legacy files stay unflushed so the next write performs the migration
    // rewrite with a fresh header.
    state.flushed = saw_header;
    Ok(state)
}

async fn rewrite_file(state: &SessionState) -> Result<(), SessionError> {
    if let Some(parent) = state.file_path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let mut buf = String::new();
    let header = SessionEntry::Session(state.header.clone());
    buf.push_str(&serde_json::to_string(&header).map_err(corrupt)?);
    buf.push('\n');
    for entry in &state.entries {
        buf.push_str(&serde_json::to_string(entry).map_err(corrupt)?);
        buf.push('\n');
    }

    let tmp = PathBuf::from(format!("{}.tmp", state.file_path.display()));
    tokio::fs::write(&tmp, buf.as_bytes()).await?;
    tokio::fs::rename(&tmp, &state.file_path).await?;
    Ok(())
}

async fn append_line(path: &Path, entry: &SessionEntry) -> Result<(), SessionError> {
    let mut line = serde_json::to_string(entry).map_err(corrupt)?;
    line.push('\n');
    let mut file = tokio::fs::OpenOptions::new()
        .append(true)
        .create(true)
        .open(path)
        .await?;
    file.write_all(line.as_bytes()).await?;
    file.flush().await?;
    Ok(())
}

fn corrupt(err: serde_json::Error) -> SessionError {
    SessionError::Corrupt(err.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use talon_core::ContentBlock;

    const KEY: &str = "agent:main:session:test";

    fn store(dir: &tempfile::TempDir) -> SessionStore {
        SessionStore::new(dir.path())
    }

    #[tokio::test]
    async fn empty_session_creates_no_file() {
        let dir = tempfile::tempdir().unwrap();
        let s = store(&dir);

        s.append(KEY, Message::user("hi")).await.unwrap();
        assert!(!s.file_path(KEY).exists());
        assert_eq!(s.load(KEY).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn first_assistant_turn_flushes_whole_file() {
        let dir = tempfile::tempdir().unwrap();
        let s = store(&dir);

        s.append(KEY, Message::user("hi")).await.unwrap();
        s.append(KEY, Message::assistant("hello")).await.unwrap();

        let raw = std::fs::read_to_string(s.file_path(KEY)).unwrap();
        let lines: Vec<&str> = raw.lines().collect();
        assert_eq!(lines.len(), 3);
        assert!(lines[0].contains(r#""type":"session""#));
        assert!(lines[1].contains(r#""content":"hi""#));
        assert!(lines[2].contains(r#""content":"hello""#));
    }

    #[tokio::test]
    async fn later_appends_are_single_lines() {
        let dir = tempfile::tempdir().unwrap();
        let s = store(&dir);

        s.append(KEY, Message::user("a")).await.unwrap();
        s.append(KEY, Message::assistant("b")).await.unwrap();
        s.append(KEY, Message::user("c")).await.unwrap();

        let raw = std::fs::read_to_string(s.file_path(KEY)).unwrap();
        assert_eq!(raw.lines().count(), 4);
    }

    #[tokio::test]
    async fn reload_walks_parent_chain() {
        let dir = tempfile::tempdir().unwrap();
        {
            let s = store(&dir);
            s.append(KEY, Message::user("one")).await.unwrap();
            s.append(KEY, Message::assistant("two")).await.unwrap();
            s.append(KEY, Message::user("three")).await.unwrap();
        }

        // Fresh store, same directory: state must come from disk.
        let s = store(&dir);
        let messages = s.load(KEY).await.unwrap();
        let texts: Vec<String> = messages.iter().map(Message::text).collect();
        assert_eq!(texts, vec!["one", "two", "three"]);
    }

    #[tokio::test]
    async fn truncated_last_line_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        {
            let s = store(&dir);
            s.append(KEY, Message::user("one")).await.unwrap();
            s.append(KEY, Message::assistant("two")).await.unwrap();
        }
        let path = store(&dir).file_path(KEY);
        let mut raw = std::fs::read_to_string(&path).unwrap();
        raw.push_str("{\"type\":\"message\",\"id\":\"zzz");
        std::fs::write(&path, raw).unwrap();

        let s = store(&dir);
        assert_eq!(s.load(KEY).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn unknown_entry_types_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        {
            let s = store(&dir);
            s.append(KEY, Message::assistant("kept")).await.unwrap();
        }
        let path = store(&dir).file_path(KEY);
        let mut raw = std::fs::read_to_string(&path).unwrap();
        raw.push_str("{\"type\":\"annotation\",\"id\":\"x1\",\"note\":\"future format\"}\n");
        std::fs::write(&path, raw).unwrap();

        let s = store(&dir);
        let messages = s.load(KEY).await.unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].text(), "kept");
    }

    #[tokio::test]
    async fn legacy_flat_file_is_migrated_on_next_write() {
        let dir = tempfile::tempdir().unwrap();
        let s = store(&dir);
        let path = s.file_path(KEY);
        std::fs::create_dir_all(dir.path()).unwrap();
        let legacy = [
            serde_json::to_string(&Message::user("old one")).unwrap(),
            serde_json::to_string(&Message::assistant("old two")).unwrap(),
        ]
        .join("\n");
        std::fs::write(&path, legacy).unwrap();

        assert_eq!(s.load(KEY).await.unwrap().len(), 2);
        s.append(KEY, Message::assistant("new")).await.unwrap();

        let raw = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = raw.lines().collect();
        assert!(lines[0].contains(r#""type":"session""#));
        assert_eq!(lines.len(), 4);
    }

    #[tokio::test]
    async fn compaction_substitutes_summary_on_load() {
        let dir = tempfile::tempdir().unwrap();
        let s = store(&dir);

        s.append(KEY, Message::user("q1")).await.unwrap();
        s.append(KEY, Message::assistant("a1")).await.unwrap();
        let kept = Message::user("q2");
        let kept_id = s.append(KEY, kept.clone()).await.unwrap();
        s.append(KEY, Message::assistant("a2")).await.unwrap();

        s.append_compaction(KEY, "summary of q1/a1".into(), kept_id, 1000)
            .await
            .unwrap();

        let messages = s.load(KEY).await.unwrap();
        let texts: Vec<String> = messages.iter().map(Message::text).collect();
        assert_eq!(texts, vec!["summary of q1/a1", "q2", "a2"]);

        // And the same after reloading from disk.
        let fresh = store(&dir);
        let texts: Vec<String> = fresh
            .load(KEY)
            .await
            .unwrap()
            .iter()
            .map(Message::text)
            .collect();
        assert_eq!(texts, vec!["summary of q1/a1", "q2", "a2"]);
    }

    #[tokio::test]
    async fn resolve_message_entry_id_finds_persisted_message() {
        let dir = tempfile::tempdir().unwrap();
        let s = store(&dir);

        let msg = Message::user_blocks(vec![ContentBlock::Text { text: "find me".into() }]);
        let id = s.append(KEY, msg.clone()).await.unwrap();
        assert_eq!(s.resolve_message_entry_id(KEY, &msg).await, Some(id));
        assert_eq!(
            s.resolve_message_entry_id(KEY, &Message::user("absent")).await,
            None
        );
    }

    #[tokio::test]
    async fn clear_removes_file_and_state() {
        let dir = tempfile::tempdir().unwrap();
        let s = store(&dir);

        s.append(KEY, Message::assistant("x")).await.unwrap();
        assert!(s.file_path(KEY).exists());
        s.clear(KEY).await.unwrap();
        assert!(!s.file_path(KEY).exists());
        assert!(s.load(KEY).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn list_decodes_session_keys() {
        let dir = tempfile::tempdir().unwrap();
        let s = store(&dir);

        s.append(KEY, Message::assistant("x")).await.unwrap();
        s.append("agent:main:session:other", Message::assistant("y"))
            .await
            .unwrap();

        let keys = s.list().await.unwrap();
        assert_eq!(keys, vec!["agent:main:session:other", KEY]);
    }
}
