//! Per-session steering and follow-up queues.
//!
//! `steer()` pushes raw user text from any task; the loop drains at its
//! delivery boundaries and turns each string into a timestamped user
//! message. One writer (the caller), one reader (the loop, serialized by
//! the session lane), so a plain mutex-guarded deque is enough.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use talon_core::Message;

/// FIFO queues of injected user text, keyed by session.
#[derive(Default, Clone)]
pub struct TextQueues {
    inner: Arc<Mutex<HashMap<String, VecDeque<String>>>>,
}

impl TextQueues {
    pub fn new() -> Self {
        Self::default()
    }

    /// Enqueue; never blocks, never rejects.
    pub fn push(&self, session_key: &str, text: impl Into<String>) {
        let mut inner = self.inner.lock().expect("text queue poisoned");
        inner
            .entry(session_key.to_string())
            .or_default()
            .push_back(text.into());
    }

    /// Drain everything queued for this session, in enqueue order, as
    /// freshly timestamped user messages.
    pub fn drain(&self, session_key: &str) -> Vec<Message> {
        let mut inner = self.inner.lock().expect("text queue poisoned");
        match inner.get_mut(session_key) {
            Some(queue) => queue.drain(..).map(Message::user).collect(),
            None => Vec::new(),
        }
    }

    /// Number of queued entries for this session.
    pub fn len(&self, session_key: &str) -> usize {
        let inner = self.inner.lock().expect("text queue poisoned");
        inner.get(session_key).map_or(0, VecDeque::len)
    }

    pub fn is_empty(&self, session_key: &str) -> bool {
        self.len(session_key) == 0
    }
}
