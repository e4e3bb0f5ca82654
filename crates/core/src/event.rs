//! Run events — the typed stream produced by the agent loop.
//!
//! Every run owns an [`EventStream`]: the loop pushes events synchronously,
//! the orchestrator drains them asynchronously and fans each one out to the
//! registered subscribers. Late subscribers do not receive past events;
//! there is no replay.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

use crate::message::Message;

/// Events emitted by the agent loop during a run.
///
/// Each variant carries the `run_id` it belongs to. Events on a single run
/// are emitted in causal order; across runs no ordering is promised.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentEvent {
    /// The run was admitted and the loop is starting.
    AgentStart { run_id: String },

    /// The run finished normally — exactly one terminal event per run.
    AgentEnd {
        run_id: String,
        final_text: String,
        turns: u32,
        total_tool_calls: u32,
    },

    /// The run failed — exactly one terminal event per run.
    AgentError { run_id: String, error: String },

    /// An inner-loop turn began.
    TurnStart { run_id: String, turn: u32 },

    /// An inner-loop turn completed.
    TurnEnd { run_id: String, turn: u32 },

    /// Partial assistant text from the provider stream.
    MessageDelta { run_id: String, delta: String },

    /// A complete assistant text block.
    MessageEnd { run_id: String, content: String },

    /// Partial reasoning text, forwarded untouched.
    ThinkingDelta { run_id: String, delta: String },

    /// A tool invocation is starting.
    ToolExecutionStart {
        run_id: String,
        tool_use_id: String,
        name: String,
        input: serde_json::Value,
    },

    /// A tool invocation completed (successfully or with an error result).
    ToolExecutionEnd {
        run_id: String,
        tool_use_id: String,
        name: String,
        output: String,
        is_error: bool,
    },

    /// A tool was skipped because a steering message preempted the batch.
    ToolSkipped {
        run_id: String,
        tool_use_id: String,
        name: String,
    },

    /// Queued user messages preempted the remaining tools of a batch.
    Steering { run_id: String, queued: usize },

    /// History was compacted into a summary checkpoint.
    Compaction {
        run_id: String,
        summary_chars: usize,
        dropped_messages: usize,
        tokens_before: u64,
    },

    /// A context-overflow error triggered the in-run compaction retry.
    ContextOverflowCompact { run_id: String },

    /// A transient provider failure is being retried.
    Retry {
        run_id: String,
        attempt: u32,
        delay_ms: u64,
        error: String,
    },

    /// A subagent run completed and reported back.
    SubagentSummary {
        run_id: String,
        subagent_session: String,
        summary: String,
    },

    /// A subagent run failed.
    SubagentError {
        run_id: String,
        subagent_session: String,
        error: String,
    },
}

impl AgentEvent {
    /// The run this event belongs to.
    pub fn run_id(&self) -> &str {
        match self {
            Self::AgentStart { run_id }
            | Self::AgentEnd { run_id, .. }
            | Self::AgentError { run_id, .. }
            | Self::TurnStart { run_id, .. }
            | Self::TurnEnd { run_id, .. }
            | Self::MessageDelta { run_id, .. }
            | Self::MessageEnd { run_id, .. }
            | Self::ThinkingDelta { run_id, .. }
            | Self::ToolExecutionStart { run_id, .. }
            | Self::ToolExecutionEnd { run_id, .. }
            | Self::ToolSkipped { run_id, .. }
            | Self::Steering { run_id, .. }
            | Self::Compaction { run_id, .. }
            | Self::ContextOverflowCompact { run_id }
            | Self::Retry { run_id, .. }
            | Self::SubagentSummary { run_id, .. }
            | Self::SubagentError { run_id, .. } => run_id,
        }
    }

    /// Wire name for this event type.
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::AgentStart { .. } => "agent_start",
            Self::AgentEnd { .. } => "agent_end",
            Self::AgentError { .. } => "agent_error",
            Self::TurnStart { .. } => "turn_start",
            Self::TurnEnd { .. } => "turn_end",
            Self::MessageDelta { .. } => "message_delta",
            Self::MessageEnd { .. } => "message_end",
            Self::ThinkingDelta { .. } => "thinking_delta",
            Self::ToolExecutionStart { .. } => "tool_execution_start",
            Self::ToolExecutionEnd { .. } => "tool_execution_end",
            Self::ToolSkipped { .. } => "tool_skipped",
            Self::Steering { .. } => "steering",
            Self::Compaction { .. } => "compaction",
            Self::ContextOverflowCompact { .. } => "context_overflow_compact",
            Self::Retry { .. } => "retry",
            Self::SubagentSummary { .. } => "subagent_summary",
            Self::SubagentError { .. } => "subagent_error",
        }
    }

    /// True for the two terminal variants.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::AgentEnd { .. } | Self::AgentError { .. })
    }
}

/// The final value of a run, carried alongside the terminal event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunResult {
    pub run_id: String,
    pub text: String,
    pub turns: u32,
    pub tool_calls: u32,
    /// Messages appended to the session during this run.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub messages: Vec<Message>,
}

/// Sending half of a run's event queue.
///
/// `push` is synchronous and never blocks (the queue is unbounded); a
/// dropped receiver is fine — events are then delivered to subscribers
/// only.
#[derive(Clone)]
pub struct EventSink {
    tx: mpsc::UnboundedSender<AgentEvent>,
    subscribers: SubscriberRegistry,
}

impl EventSink {
    /// Push one event: deliver synchronously to subscribers, then enqueue
    /// for the async consumer.
    pub fn push(&self, event: AgentEvent) {
        self.subscribers.deliver(&event);
        let _ = self.tx.send(event);
    }
}

/// Receiving half of a run's event queue.
pub struct EventQueue {
    rx: mpsc::UnboundedReceiver<AgentEvent>,
}

impl EventQueue {
    /// Await the next event; `None` once all sinks are dropped.
    pub async fn next(&mut self) -> Option<AgentEvent> {
        self.rx.recv().await
    }
}

/// Create a connected sink/queue pair backed by a subscriber registry.
pub fn event_stream(subscribers: SubscriberRegistry) -> (EventSink, EventQueue) {
    let (tx, rx) = mpsc::unbounded_channel();
    (EventSink { tx, subscribers }, EventQueue { rx })
}

type Listener = Arc<dyn Fn(&AgentEvent) + Send + Sync>;

#[derive(Default)]
struct RegistryInner {
    listeners: Mutex<HashMap<u64, Listener>>,
    next_id: AtomicU64,
}

/// Registry of synchronous event listeners. Cheap to clone; all clones
/// share the listener set.
///
/// Listeners are invoked in registration order on the pushing task. A
/// panicking listener is caught and logged so it cannot poison other
/// listeners or the loop itself.
#[derive(Default, Clone)]
pub struct SubscriberRegistry {
    inner: Arc<RegistryInner>,
}

impl SubscriberRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a listener; the returned [`Subscription`] unsubscribes on
    /// drop.
    pub fn subscribe(
        &self,
        listener: impl Fn(&AgentEvent) + Send + Sync + 'static,
    ) -> Subscription {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        self.inner
            .listeners
            .lock()
            .expect("subscriber registry poisoned")
            .insert(id, Arc::new(listener));
        Subscription {
            inner: Arc::clone(&self.inner),
            id,
        }
    }

    /// Deliver an event to every listener outside any run's event queue.
    /// Used for cross-run notifications (subagent completion).
    pub fn emit(&self, event: &AgentEvent) {
        self.deliver(event);
    }

    fn deliver(&self, event: &AgentEvent) {
        let listeners: Vec<Listener> = {
            let guard = self
                .inner
                .listeners
                .lock()
                .expect("subscriber registry poisoned");
            guard.values().cloned().collect()
        };
        for listener in listeners {
            if catch_unwind(AssertUnwindSafe(|| listener(event))).is_err() {
                tracing::warn!(event = event.event_type(), "Event listener panicked");
            }
        }
    }
}

/// Handle to a registered listener; unregisters on drop.
pub struct Subscription {
    inner: Arc<RegistryInner>,
    id: u64,
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Ok(mut guard) = self.inner.listeners.lock() {
            guard.remove(&self.id);
        }
    }
}
