//! The orchestrator — public facade over the execution core.
//!
//! Wires together lanes, the guarded session log, the context pipeline,
//! and the loop. Callers get five operations: `run`, `abort`, `steer`,
//! `subscribe`, `reset`, plus subagent spawning. The loop receives plain
//! closures for persistence and queue draining, so there is no cyclic
//! dependency between the loop and this module.

use async_trait::async_trait;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use talon_context::{
    build_compaction_summary, check_context_window, estimate_total_tokens,
    prune_context_messages, should_trigger_compaction, CompactionSettings, PruneSettings,
    Summarizer,
};
use talon_core::error::{AgentError, ProviderError};
use talon_core::event::event_stream;
use talon_core::{
    AgentEvent, Error, EventSink, Message, ModelDef, Provider, ProviderContext, ReasoningEffort,
    RunResult, SessionKey, StreamOptions, SubscriberRegistry, Subscription, ToolContext,
    ToolRegistry,
};
use talon_session::{SessionLog, SessionStore, ToolResultGuard};

use crate::lanes::LaneScheduler;
use crate::loop_runner::{
    run_agent_loop, AgentLoopParams, AppendFn, FetchFn, LoopOutcome, PrepareCompactionFn,
};
use crate::steering::TextQueues;

/// Everything configurable about one orchestrator instance.
#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    /// Normalized agent id; part of every session key
    pub agent_id: String,
    /// Directory holding session JSONL files
    pub session_dir: PathBuf,
    /// Directory tools operate in
    pub workspace_dir: PathBuf,
    pub system_prompt: Option<String>,
    pub model: ModelDef,
    pub api_key: Option<String>,
    pub temperature: Option<f32>,
    pub reasoning: Option<ReasoningEffort>,
    /// Hard cap on loop turns per run
    pub max_turns: u32,
    /// Context window given to the pruning pipeline
    pub context_tokens: u32,
    /// Global lane concurrency
    pub max_concurrent_runs: usize,
    pub prune: PruneSettings,
    pub compaction: CompactionSettings,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self {
            agent_id: "main".into(),
            session_dir: PathBuf::from(".talon/sessions"),
            workspace_dir: PathBuf::from("."),
            system_prompt: None,
            model: ModelDef::new("anthropic", "claude-sonnet-4-5"),
            api_key: None,
            temperature: None,
            reasoning: None,
            max_turns: 20,
            context_tokens: 200_000,
            max_concurrent_runs: 4,
            prune: PruneSettings::default(),
            compaction: CompactionSettings::default(),
        }
    }
}

/// Compaction's model seam, backed by the run's provider.
struct ProviderSummarizer {
    provider: Arc<dyn Provider>,
    model: ModelDef,
    api_key: Option<String>,
    cancel: CancellationToken,
}

#[async_trait]
impl Summarizer for ProviderSummarizer {
    async fn summarize(
        &self,
        prompt: String,
        max_tokens: u32,
    ) -> Result<String, ProviderError> {
        let context = ProviderContext {
            system_prompt: None,
            messages: vec![Message::user(prompt)],
            tools: Vec::new(),
        };
        let opts = StreamOptions {
            max_tokens: Some(max_tokens),
            signal: self.cancel.clone(),
            api_key: self.api_key.clone(),
            temperature: Some(0.2),
            reasoning: None,
        };
        self.provider.complete(&self.model, &context, &opts).await
    }
}

/// The execution core's public surface.
pub struct Orchestrator {
    settings: OrchestratorSettings,
    provider: Arc<dyn Provider>,
    tools: ToolRegistry,
    log: Arc<ToolResultGuard>,
    lanes: LaneScheduler,
    steering: TextQueues,
    follow_up: TextQueues,
    subscribers: SubscriberRegistry,
    runs: Mutex<HashMap<String, CancellationToken>>,
    root_cancel: CancellationToken,
}

impl Orchestrator {
    pub fn new(
        settings: OrchestratorSettings,
        provider: Arc<dyn Provider>,
        tools: ToolRegistry,
    ) -> Self {
        let store = Arc::new(SessionStore::new(&settings.session_dir));
        let log = ToolResultGuard::install(store);
        let lanes = LaneScheduler::new(settings.max_concurrent_runs);
        Self {
            settings,
            provider,
            tools,
            log,
            lanes,
            steering: TextQueues::new(),
            follow_up: TextQueues::new(),
            subscribers: SubscriberRegistry::new(),
            runs: Mutex::new(HashMap::new()),
            root_cancel: CancellationToken::new(),
        }
    }

    /// Register an event listener; delivery is synchronous per event and
    /// listener panics are swallowed.
    pub fn subscribe(
        &self,
        listener: impl Fn(&AgentEvent) + Send + Sync + 'static,
    ) -> Subscription {
        self.subscribers.subscribe(listener)
    }

    /// Queue a mid-flight user message. Non-blocking; order preserved.
    pub fn steer(&self, session_key: &str, text: impl Into<String>) {
        self.steering.push(session_key, text);
    }

    /// Cancel one run, or every active run when `run_id` is `None`.
    /// Idempotent: unknown or finished ids are ignored.
    pub fn abort(&self, run_id: Option<&str>) {
        let runs = self.runs.lock().expect("run registry poisoned");
        match run_id {
            Some(id) => {
                if let Some(token) = runs.get(id) {
                    info!(run = id, "Aborting run");
                    token.cancel();
                }
            }
            None => {
                info!(count = runs.len(), "Aborting all runs");
                for token in runs.values() {
                    token.cancel();
                }
            }
        }
    }

    /// Delete a session's log. Blocked by the session lane while a run for
    /// that session is active.
    pub async fn reset(&self, session_key: &str) -> Result<(), Error> {
        let _permit = self.lanes.admit(session_key).await;
        self.log.clear(session_key).await?;
        Ok(())
    }

    /// Session keys with persisted history.
    pub async fn sessions(&self) -> Result<Vec<String>, Error> {
        Ok(self.log.list().await?)
    }

    /// Run one user message through the loop.
    pub async fn run(&self, session_key: &str, user_text: &str) -> Result<RunResult, Error> {
        self.run_with_cancel(session_key, user_text, None).await
    }

    /// Like [`run`](Self::run), composing the run's token with a caller
    /// token: whichever fires first cancels the run.
    pub async fn run_with_cancel(
        &self,
        session_key: &str,
        user_text: &str,
        caller_token: Option<CancellationToken>,
    ) -> Result<RunResult, Error> {
        check_context_window(self.settings.context_tokens)?;

        let permit = self.lanes.admit(session_key).await;
        let run_id = Uuid::new_v4().simple().to_string()[..8].to_string();
        let cancel = self.root_cancel.child_token();
        if let Some(caller) = caller_token {
            let linked = cancel.clone();
            tokio::spawn(async move {
                tokio::select! {
                    () = caller.cancelled() => linked.cancel(),
                    () = linked.cancelled() => {}
                }
            });
        }
        self.runs
            .lock()
            .expect("run registry poisoned")
            .insert(run_id.clone(), cancel.clone());

        let (sink, mut queue) = event_stream(self.subscribers.clone());
        // Orchestrator-side consumer: trace the causal event order.
        let drain = tokio::spawn(async move {
            while let Some(event) = queue.next().await {
                debug!(run = event.run_id(), event = event.event_type(), "run event");
            }
        });

        sink.push(AgentEvent::AgentStart {
            run_id: run_id.clone(),
        });

        let result = self
            .execute_run(&run_id, session_key, user_text, &sink, &cancel)
            .await;

        // Structured finally: the log must never end with dangling calls.
        if let Err(err) = self.log.flush_pending(session_key).await {
            warn!(session = session_key, error = %err, "Failed to flush pending tool results");
        }
        self.runs
            .lock()
            .expect("run registry poisoned")
            .remove(&run_id);
        // Reap the caller-token watcher, if any.
        cancel.cancel();

        let result = match result {
            Ok(outcome) => {
                sink.push(AgentEvent::AgentEnd {
                    run_id: run_id.clone(),
                    final_text: outcome.final_text.clone(),
                    turns: outcome.turns,
                    total_tool_calls: outcome.total_tool_calls,
                });
                Ok(RunResult {
                    run_id: run_id.clone(),
                    text: outcome.final_text,
                    turns: outcome.turns,
                    tool_calls: outcome.total_tool_calls,
                    messages: outcome.new_messages,
                })
            }
            Err(err) => {
                sink.push(AgentEvent::AgentError {
                    run_id: run_id.clone(),
                    error: err.to_string(),
                });
                Err(err)
            }
        };

        drop(sink);
        let _ = drain.await;
        drop(permit);
        result
    }

    async fn execute_run(
        &self,
        run_id: &str,
        session_key: &str,
        user_text: &str,
        sink: &EventSink,
        cancel: &CancellationToken,
    ) -> Result<LoopOutcome, Error> {
        let mut messages = self.log.load(session_key).await?;

        let user_message = Message::user(user_text);
        self.log.append(session_key, user_message.clone()).await?;
        messages.push(user_message);

        // Pre-flight compaction when the history already crowds the window.
        let prepare_compaction =
            self.make_prepare_compaction(run_id, session_key, sink, cancel);
        let total_tokens = estimate_total_tokens(&messages);
        let mut compaction_summary = None;
        if should_trigger_compaction(
            total_tokens,
            self.settings.context_tokens,
            self.settings.compaction.reserve_tokens,
        ) {
            info!(
                session = session_key,
                total_tokens, "History exceeds reserve threshold; compacting"
            );
            compaction_summary = prepare_compaction(messages.clone()).await?;
        }

        let tool_ctx = ToolContext {
            workspace_dir: self.settings.workspace_dir.clone(),
            session_key: session_key.to_string(),
            agent_id: self.settings.agent_id.clone(),
            cancel: cancel.clone(),
            metadata: serde_json::Map::new(),
        };

        let append_message: AppendFn = {
            let log = Arc::clone(&self.log);
            let key = session_key.to_string();
            Arc::new(move |message: Message| {
                let log = Arc::clone(&log);
                let key = key.clone();
                Box::pin(async move {
                    log.append(&key, message).await?;
                    Ok(())
                })
            })
        };
        let get_steering: FetchFn = {
            let queues = self.steering.clone();
            let key = session_key.to_string();
            Arc::new(move || queues.drain(&key))
        };
        let get_follow_up: FetchFn = {
            let queues = self.follow_up.clone();
            let key = session_key.to_string();
            Arc::new(move || queues.drain(&key))
        };

        run_agent_loop(AgentLoopParams {
            run_id: run_id.to_string(),
            session_key: session_key.to_string(),
            messages,
            compaction_summary,
            system_prompt: self.settings.system_prompt.clone(),
            tools: self.tools.clone(),
            tool_ctx,
            model: self.settings.model.clone(),
            provider: Arc::clone(&self.provider),
            api_key: self.settings.api_key.clone(),
            temperature: self.settings.temperature,
            reasoning: self.settings.reasoning,
            max_turns: self.settings.max_turns,
            context_tokens: self.settings.context_tokens,
            prune_settings: self.settings.prune.clone(),
            events: sink.clone(),
            cancel: cancel.clone(),
            append_message,
            prepare_compaction,
            get_steering,
            get_follow_up: Some(get_follow_up),
        })
        .await
    }

    /// Build the compaction hook shared by the pre-flight check and the
    /// loop's overflow rescue.
    fn make_prepare_compaction(
        &self,
        run_id: &str,
        session_key: &str,
        sink: &EventSink,
        cancel: &CancellationToken,
    ) -> PrepareCompactionFn {
        let log = Arc::clone(&self.log);
        let provider = Arc::clone(&self.provider);
        let model = self.settings.model.clone();
        let api_key = self.settings.api_key.clone();
        let context_tokens = self.settings.context_tokens;
        let prune = self.settings.prune.clone();
        let compaction = self.settings.compaction.clone();
        let key = session_key.to_string();
        let run_id = run_id.to_string();
        let sink = sink.clone();
        let cancel = cancel.clone();

        Arc::new(move |messages: Vec<Message>| {
            let log = Arc::clone(&log);
            let provider = Arc::clone(&provider);
            let model = model.clone();
            let api_key = api_key.clone();
            let prune = prune.clone();
            let compaction = compaction.clone();
            let key = key.clone();
            let run_id = run_id.clone();
            let sink = sink.clone();
            let cancel = cancel.clone();

            Box::pin(async move {
                let total_tokens = estimate_total_tokens(&messages);
                let outcome = prune_context_messages(messages, context_tokens, &prune);
                if outcome.dropped_messages.is_empty() {
                    return Ok(None);
                }
                let Some(first_kept) = outcome.messages.first() else {
                    return Ok(None);
                };
                let Some(first_kept_id) =
                    log.resolve_message_entry_id(&key, first_kept).await
                else {
                    warn!(session = %key, "Cannot pin compaction checkpoint; skipping");
                    return Ok(None);
                };

                let summarizer = ProviderSummarizer {
                    provider,
                    model,
                    api_key,
                    cancel,
                };
                let Some(summary) = build_compaction_summary(
                    &outcome.dropped_messages,
                    total_tokens,
                    &summarizer,
                    &compaction,
                )
                .await?
                else {
                    return Ok(None);
                };

                log.append_compaction(
                    &key,
                    summary.text.clone(),
                    first_kept_id,
                    summary.tokens_before,
                )
                .await?;
                sink.push(AgentEvent::Compaction {
                    run_id,
                    summary_chars: summary.summary_chars,
                    dropped_messages: summary.dropped_messages,
                    tokens_before: summary.tokens_before,
                });
                Ok(Some(summary.to_message()))
            })
        })
    }

    /// Start a subagent run for `task` and report its outcome back to the
    /// parent session as a follow-up message. Rejected when the parent is
    /// itself a subagent session.
    pub fn spawn_subagent(
        self: Arc<Self>,
        parent_session_key: &str,
        task: &str,
    ) -> Result<String, Error> {
        let parent = SessionKey::parse(parent_session_key).ok_or_else(|| {
            Error::Internal(format!("invalid session key: {parent_session_key}"))
        })?;
        if parent.is_subagent() {
            return Err(AgentError::SubagentSpawnRejected {
                session_key: parent_session_key.to_string(),
            }
            .into());
        }

        let sub_key = SessionKey::subagent(parent.agent_id.clone()).to_string();
        let orchestrator = self;
        let parent_key = parent_session_key.to_string();
        let task = task.to_string();
        let sub = sub_key.clone();
        tokio::spawn(async move {
            match orchestrator.run(&sub, &task).await {
                Ok(result) => {
                    orchestrator.follow_up.push(
                        &parent_key,
                        format!("Subagent finished its task:\n{}", result.text),
                    );
                    orchestrator.subscribers.emit(&AgentEvent::SubagentSummary {
                        run_id: result.run_id,
                        subagent_session: sub,
                        summary: result.text,
                    });
                }
                Err(err) => {
                    orchestrator
                        .follow_up
                        .push(&parent_key, format!("Subagent failed: {err}"));
                    orchestrator.subscribers.emit(&AgentEvent::SubagentError {
                        run_id: String::new(),
                        subagent_session: sub,
                        error: err.to_string(),
                    });
                }
            }
        });
        Ok(sub_key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    use talon_core::StreamEvent;

    /// Provider that immediately answers with fixed text.
    struct TextProvider(&'static str);

    #[async_trait]
    impl Provider for TextProvider {
        fn name(&self) -> &str {
            "mock"
        }

        async fn stream(
            &self,
            _model: &ModelDef,
            _context: &ProviderContext,
            _opts: &StreamOptions,
        ) -> Result<mpsc::Receiver<StreamEvent>, ProviderError> {
            let (tx, rx) = mpsc::channel(8);
            let text = self.0.to_string();
            tokio::spawn(async move {
                let _ = tx
                    .send(StreamEvent::TextDelta {
                        delta: text.clone(),
                    })
                    .await;
                let _ = tx.send(StreamEvent::TextEnd { content: text }).await;
            });
            Ok(rx)
        }
    }

    fn orchestrator(dir: &tempfile::TempDir) -> Arc<Orchestrator> {
        let settings = OrchestratorSettings {
            session_dir: dir.path().join("sessions"),
            workspace_dir: dir.path().to_path_buf(),
            ..OrchestratorSettings::default()
        };
        Arc::new(Orchestrator::new(
            settings,
            Arc::new(TextProvider("hello")),
            ToolRegistry::new(),
        ))
    }

    #[tokio::test]
    async fn run_returns_final_text() {
        let dir = tempfile::tempdir().unwrap();
        let orch = orchestrator(&dir);

        let result = orch.run("agent:main:session:a", "hi").await.unwrap();
        assert_eq!(result.text, "hello");
        assert_eq!(result.turns, 1);
        assert_eq!(result.tool_calls, 0);
    }

    #[tokio::test]
    async fn tiny_context_window_fails_before_io() {
        let dir = tempfile::tempdir().unwrap();
        let settings = OrchestratorSettings {
            session_dir: dir.path().join("sessions"),
            context_tokens: 1000,
            ..OrchestratorSettings::default()
        };
        let orch = Orchestrator::new(
            settings,
            Arc::new(TextProvider("x")),
            ToolRegistry::new(),
        );

        let err = orch.run("agent:main:session:a", "hi").await.unwrap_err();
        assert!(matches!(
            err,
            Error::Agent(AgentError::ContextWindowTooSmall { .. })
        ));
        assert!(!dir.path().join("sessions").exists());
    }

    #[tokio::test]
    async fn subagent_spawn_rejected_from_subagent_session() {
        let dir = tempfile::tempdir().unwrap();
        let orch = orchestrator(&dir);

        let sub_key = Arc::clone(&orch)
            .spawn_subagent("agent:main:session:a", "do something")
            .unwrap();
        assert!(sub_key.starts_with("agent:main:subagent:"));

        let err = Arc::clone(&orch)
            .spawn_subagent(&sub_key, "nested")
            .unwrap_err();
        assert!(matches!(
            err,
            Error::Agent(AgentError::SubagentSpawnRejected { .. })
        ));
    }

    #[tokio::test]
    async fn abort_is_idempotent_for_unknown_runs() {
        let dir = tempfile::tempdir().unwrap();
        let orch = orchestrator(&dir);
        orch.abort(Some("nonexistent"));
        orch.abort(None);
    }
}
