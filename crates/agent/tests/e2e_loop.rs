//! End-to-end tests for the execution core.
//!
//! A scripted provider plays back typed stream events, controllable tools
//! slow down or block, and a subscriber records the full event order.

use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;

use talon_agent::{Orchestrator, OrchestratorSettings, SKIPPED_TOOL_RESULT_TEXT};
use talon_core::error::{ProviderError, ToolError};
use talon_core::{
    AgentEvent, ContentBlock, Message, MessageContent, ModelDef, Provider, ProviderContext,
    Role, StreamEvent, StreamOptions, Tool, ToolCallData, ToolContext, ToolRegistry,
};
use talon_session::{SessionLog, SessionStore, MISSING_TOOL_RESULT_TEXT};

// ── Scripted provider ────────────────────────────────────────────────────

enum Script {
    Events(Vec<StreamEvent>),
    Fail(ProviderError),
}

struct ScriptedProvider {
    scripts: Mutex<VecDeque<Script>>,
    completions: Mutex<VecDeque<String>>,
    stream_calls: AtomicUsize,
    /// Delay before any events are sent, to widen race windows.
    delay: Duration,
}

impl ScriptedProvider {
    fn new(scripts: Vec<Script>) -> Self {
        Self {
            scripts: Mutex::new(scripts.into()),
            completions: Mutex::new(VecDeque::new()),
            stream_calls: AtomicUsize::new(0),
            delay: Duration::ZERO,
        }
    }

    fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    fn text(content: &str) -> Script {
        Script::Events(vec![
            StreamEvent::TextDelta {
                delta: content.to_string(),
            },
            StreamEvent::TextEnd {
                content: content.to_string(),
            },
        ])
    }

    fn tool_calls(calls: &[(&str, &str)]) -> Script {
        Script::Events(
            calls
                .iter()
                .map(|(id, name)| StreamEvent::ToolCallEnd {
                    tool_call: ToolCallData {
                        id: (*id).into(),
                        name: (*name).into(),
                        arguments: serde_json::json!({}),
                    },
                })
                .collect(),
        )
    }

    fn calls(&self) -> usize {
        self.stream_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Provider for ScriptedProvider {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn stream(
        &self,
        _model: &ModelDef,
        _context: &ProviderContext,
        _opts: &StreamOptions,
    ) -> Result<mpsc::Receiver<StreamEvent>, ProviderError> {
        self.stream_calls.fetch_add(1, Ordering::SeqCst);
        let script = self
            .scripts
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| ScriptedProvider::text(""));
        let events = match script {
            Script::Events(events) => events,
            Script::Fail(err) => return Err(err),
        };

        let (tx, rx) = mpsc::channel(32);
        let delay = self.delay;
        tokio::spawn(async move {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            for event in events {
                if tx.send(event).await.is_err() {
                    return;
                }
            }
        });
        Ok(rx)
    }

    async fn complete(
        &self,
        _model: &ModelDef,
        _context: &ProviderContext,
        _opts: &StreamOptions,
    ) -> Result<String, ProviderError> {
        Ok(self
            .completions
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| "summarized history".into()))
    }
}

// ── Controllable tools ───────────────────────────────────────────────────

/// Sleeps, then succeeds. Records how many times it ran.
struct SlowTool {
    duration: Duration,
    runs: Arc<AtomicUsize>,
}

#[async_trait]
impl Tool for SlowTool {
    fn name(&self) -> &str {
        "slow"
    }
    fn description(&self) -> &str {
        "test tool"
    }
    fn input_schema(&self) -> serde_json::Value {
        serde_json::json!({"type": "object"})
    }
    async fn execute(
        &self,
        _input: serde_json::Value,
        _ctx: &ToolContext,
    ) -> Result<String, ToolError> {
        tokio::time::sleep(self.duration).await;
        self.runs.fetch_add(1, Ordering::SeqCst);
        Ok("slow done".into())
    }
}

/// Blocks until the run is cancelled.
struct HangTool;

#[async_trait]
impl Tool for HangTool {
    fn name(&self) -> &str {
        "hang"
    }
    fn description(&self) -> &str {
        "test tool"
    }
    fn input_schema(&self) -> serde_json::Value {
        serde_json::json!({"type": "object"})
    }
    async fn execute(
        &self,
        _input: serde_json::Value,
        ctx: &ToolContext,
    ) -> Result<String, ToolError> {
        tokio::select! {
            () = tokio::time::sleep(Duration::from_secs(30)) => Ok("finished".into()),
            () = ctx.cancel.cancelled() => Err(ToolError::Aborted),
        }
    }
}

// ── Harness ──────────────────────────────────────────────────────────────

struct Harness {
    orchestrator: Arc<Orchestrator>,
    events: Arc<Mutex<Vec<AgentEvent>>>,
    session_dir: std::path::PathBuf,
    _dir: tempfile::TempDir,
}

fn harness_with(
    provider: ScriptedProvider,
    tools: ToolRegistry,
    tweak: impl FnOnce(&mut OrchestratorSettings),
) -> (Harness, talon_core::Subscription) {
    let dir = tempfile::tempdir().unwrap();
    let session_dir = dir.path().join("sessions");
    let mut settings = OrchestratorSettings {
        session_dir: session_dir.clone(),
        workspace_dir: dir.path().to_path_buf(),
        ..OrchestratorSettings::default()
    };
    tweak(&mut settings);

    let orchestrator = Arc::new(Orchestrator::new(settings, Arc::new(provider), tools));
    let events: Arc<Mutex<Vec<AgentEvent>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&events);
    let subscription = orchestrator.subscribe(move |event| {
        sink.lock().unwrap().push(event.clone());
    });

    (
        Harness {
            orchestrator,
            events,
            session_dir,
            _dir: dir,
        },
        subscription,
    )
}

impl Harness {
    fn event_types(&self) -> Vec<&'static str> {
        self.events
            .lock()
            .unwrap()
            .iter()
            .map(AgentEvent::event_type)
            .collect()
    }

    async fn persisted(&self, key: &str) -> Vec<Message> {
        SessionStore::new(&self.session_dir).load(key).await.unwrap()
    }
}

fn slow_tools(duration: Duration) -> (ToolRegistry, Arc<AtomicUsize>) {
    let runs = Arc::new(AtomicUsize::new(0));
    let mut tools = ToolRegistry::new();
    tools.register(Arc::new(SlowTool {
        duration,
        runs: Arc::clone(&runs),
    }));
    (tools, runs)
}

// ── S1: happy path ───────────────────────────────────────────────────────

#[tokio::test]
async fn s1_happy_path_events_and_log() {
    let provider = ScriptedProvider::new(vec![ScriptedProvider::text("hello")]);
    let (harness, _sub) = harness_with(provider, ToolRegistry::new(), |_| {});
    let key = "agent:main:session:s1";

    let result = harness.orchestrator.run(key, "hi").await.unwrap();
    assert_eq!(result.text, "hello");
    assert_eq!(result.turns, 1);
    assert_eq!(result.tool_calls, 0);

    assert_eq!(
        harness.event_types(),
        vec![
            "agent_start",
            "turn_start",
            "message_delta",
            "message_end",
            "turn_end",
            "agent_end",
        ]
    );

    // Log: header + user + assistant, one JSON object per line.
    let raw = std::fs::read_to_string(
        harness
            .session_dir
            .join("agent%3Amain%3Asession%3As1.jsonl"),
    )
    .unwrap();
    let lines: Vec<&str> = raw.lines().collect();
    assert_eq!(lines.len(), 3);
    assert!(lines[0].contains(r#""type":"session""#));
    assert!(lines[1].contains(r#""content":"hi""#));
    assert!(lines[2].contains("hello"));

    let messages = harness.persisted(key).await;
    assert_eq!(messages.len(), 2);
    assert_eq!(messages[0].text(), "hi");
    assert_eq!(messages[1].role, Role::Assistant);
    assert_eq!(messages[1].text(), "hello");
}

// ── S2: tool batch preempted by steering ─────────────────────────────────

#[tokio::test]
async fn s2_steering_skips_remaining_tools() {
    let provider = ScriptedProvider::new(vec![
        ScriptedProvider::tool_calls(&[("tu_a", "slow"), ("tu_b", "slow")]),
        ScriptedProvider::text("resumed"),
    ]);
    let (tools, runs) = slow_tools(Duration::from_millis(200));
    let (harness, _sub) = harness_with(provider, tools, |_| {});
    let key = "agent:main:session:s2";

    let orchestrator = Arc::clone(&harness.orchestrator);
    let steer_handle = {
        let orchestrator = Arc::clone(&orchestrator);
        tokio::spawn(async move {
            // Land while tool A is sleeping.
            tokio::time::sleep(Duration::from_millis(80)).await;
            orchestrator.steer(key, "wait");
        })
    };

    let result = orchestrator.run(key, "go").await.unwrap();
    steer_handle.await.unwrap();

    assert_eq!(result.text, "resumed");
    // Only tool A actually ran.
    assert_eq!(runs.load(Ordering::SeqCst), 1);

    let types = harness.event_types();
    assert!(types.contains(&"tool_skipped"));
    assert!(types.contains(&"steering"));

    let messages = harness.persisted(key).await;
    // user "go", assistant [A,B], user [result A, skip B], user "wait", assistant "resumed"
    assert_eq!(messages.len(), 5);
    match &messages[2].content {
        MessageContent::Blocks(blocks) => {
            assert_eq!(blocks.len(), 2);
            match (&blocks[0], &blocks[1]) {
                (
                    ContentBlock::ToolResult {
                        tool_use_id: a,
                        content: result_a,
                        ..
                    },
                    ContentBlock::ToolResult {
                        tool_use_id: b,
                        content: result_b,
                        ..
                    },
                ) => {
                    assert_eq!(a, "tu_a");
                    assert_eq!(result_a, "slow done");
                    assert_eq!(b, "tu_b");
                    assert_eq!(result_b, SKIPPED_TOOL_RESULT_TEXT);
                }
                other => panic!("unexpected blocks {other:?}"),
            }
        }
        other => panic!("unexpected content {other:?}"),
    }
    assert_eq!(messages[3].text(), "wait");
}

// ── S3: crash recovery ───────────────────────────────────────────────────

#[tokio::test]
async fn s3_crashed_run_gets_synthetic_results() {
    let provider = ScriptedProvider::new(vec![ScriptedProvider::text("picking up")]);
    let (harness, _sub) = harness_with(provider, ToolRegistry::new(), |_| {});
    let key = "agent:main:session:s3";

    // A previous process persisted an assistant tool call, then died.
    {
        let store = SessionStore::new(&harness.session_dir);
        store.append(key, Message::user("run it")).await.unwrap();
        store
            .append(
                key,
                Message::assistant_blocks(vec![ContentBlock::ToolUse {
                    id: "x1".into(),
                    name: "shell".into(),
                    input: serde_json::json!({"command": "ls"}),
                }]),
            )
            .await
            .unwrap();
    }

    harness.orchestrator.run(key, "continue").await.unwrap();

    let messages = harness.persisted(key).await;
    // user, assistant(tool_use x1), synthetic results, user "continue", assistant
    assert_eq!(messages.len(), 5);
    assert_eq!(messages[2].tool_result_ids(), vec!["x1".to_string()]);
    match &messages[2].content {
        MessageContent::Blocks(blocks) => match &blocks[0] {
            ContentBlock::ToolResult { content, .. } => {
                assert_eq!(content, MISSING_TOOL_RESULT_TEXT);
            }
            other => panic!("unexpected block {other:?}"),
        },
        other => panic!("unexpected content {other:?}"),
    }
    assert_eq!(messages[3].text(), "continue");
}

// ── S4: reserve-triggered compaction ─────────────────────────────────────

#[tokio::test]
async fn s4_compaction_persists_checkpoint() {
    let provider = ScriptedProvider::new(vec![ScriptedProvider::text("done")]);
    let (harness, _sub) = harness_with(provider, ToolRegistry::new(), |settings| {
        // Small window: reserve exceeds it, so any history triggers.
        settings.context_tokens = 8_000;
    });
    let key = "agent:main:session:s4";

    // Seed enough history that pruning will drop a prefix.
    {
        let store = SessionStore::new(&harness.session_dir);
        for i in 0..10 {
            store
                .append(key, Message::user(format!("q{i} {}", "x".repeat(3000))))
                .await
                .unwrap();
            store
                .append(key, Message::assistant(format!("a{i} {}", "y".repeat(3000))))
                .await
                .unwrap();
        }
    }

    let result = harness.orchestrator.run(key, "summarize").await.unwrap();
    assert_eq!(result.text, "done");

    let compaction_events: Vec<AgentEvent> = harness
        .events
        .lock()
        .unwrap()
        .iter()
        .filter(|e| e.event_type() == "compaction")
        .cloned()
        .collect();
    assert_eq!(compaction_events.len(), 1);
    match &compaction_events[0] {
        AgentEvent::Compaction {
            summary_chars,
            dropped_messages,
            ..
        } => {
            assert!(*summary_chars > 0);
            assert!(*dropped_messages > 0);
        }
        other => panic!("unexpected event {other:?}"),
    }

    // A compaction entry with a valid checkpoint is on disk.
    let raw = std::fs::read_to_string(
        harness
            .session_dir
            .join("agent%3Amain%3Asession%3As4.jsonl"),
    )
    .unwrap();
    assert!(raw.contains(r#""type":"compaction""#));
    assert!(raw.contains(r#""firstKeptEntryId""#));

    // The reloaded live context starts with the synthetic summary.
    let messages = harness.persisted(key).await;
    assert!(messages[0]
        .text()
        .starts_with("The conversation history before this point was compacted"));
    assert!(messages[0].text().contains("<summary>"));
}

// ── S5: abort mid-tool ───────────────────────────────────────────────────

#[tokio::test]
async fn s5_abort_cancels_tool_and_repairs_log() {
    let provider = ScriptedProvider::new(vec![ScriptedProvider::tool_calls(&[(
        "tu_hang", "hang",
    )])]);
    let mut tools = ToolRegistry::new();
    tools.register(Arc::new(HangTool));
    let (harness, _sub) = harness_with(provider, tools, |_| {});
    let key = "agent:main:session:s5";

    let orchestrator = Arc::clone(&harness.orchestrator);
    let abort_handle = {
        let orchestrator = Arc::clone(&orchestrator);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(150)).await;
            orchestrator.abort(None);
        })
    };

    let started = std::time::Instant::now();
    let err = orchestrator.run(key, "hang forever").await.unwrap_err();
    abort_handle.await.unwrap();

    assert!(err.to_string().contains("operation aborted"));
    assert!(started.elapsed() < Duration::from_secs(10));

    let types = harness.event_types();
    assert_eq!(types.last(), Some(&"agent_error"));
    assert_eq!(types.iter().filter(|t| **t == "agent_error").count(), 1);

    // The guard closed the dangling call.
    let messages = harness.persisted(key).await;
    let last = messages.last().unwrap();
    assert_eq!(last.role, Role::User);
    assert_eq!(last.tool_result_ids(), vec!["tu_hang".to_string()]);
}

// ── S6: same-session serialization ───────────────────────────────────────

#[tokio::test]
async fn s6_same_session_runs_serialize() {
    let provider = ScriptedProvider::new(vec![
        ScriptedProvider::text("first"),
        ScriptedProvider::text("second"),
    ])
    .with_delay(Duration::from_millis(100));
    let (harness, _sub) = harness_with(provider, ToolRegistry::new(), |_| {});
    let key = "agent:main:session:s6";

    let orchestrator_a = Arc::clone(&harness.orchestrator);
    let orchestrator_b = Arc::clone(&harness.orchestrator);
    let a = tokio::spawn(async move { orchestrator_a.run(key, "A").await });
    tokio::time::sleep(Duration::from_millis(10)).await;
    let b = tokio::spawn(async move { orchestrator_b.run(key, "B").await });

    a.await.unwrap().unwrap();
    b.await.unwrap().unwrap();

    let types = harness.event_types();
    let first_end = types.iter().position(|t| *t == "agent_end").unwrap();
    let second_start = types
        .iter()
        .enumerate()
        .filter(|(_, t)| **t == "agent_start")
        .map(|(i, _)| i)
        .nth(1)
        .unwrap();
    assert!(
        second_start > first_end,
        "run B started before run A ended: {types:?}"
    );
}

// ── Retry policy ─────────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn rate_limits_retry_up_to_three_attempts() {
    let provider = ScriptedProvider::new(vec![
        Script::Fail(ProviderError::RateLimited("429 too many requests".into())),
        Script::Fail(ProviderError::RateLimited("429 too many requests".into())),
        ScriptedProvider::text("after retry"),
    ]);
    let (harness, _sub) = harness_with(provider, ToolRegistry::new(), |_| {});
    let key = "agent:main:session:retry";

    let result = harness.orchestrator.run(key, "hi").await.unwrap();
    assert_eq!(result.text, "after retry");

    let types = harness.event_types();
    assert_eq!(types.iter().filter(|t| **t == "retry").count(), 2);
}

#[tokio::test(start_paused = true)]
async fn fourth_rate_limit_failure_surfaces() {
    let provider = Arc::new(ScriptedProvider::new(vec![
        Script::Fail(ProviderError::RateLimited("rate limit".into())),
        Script::Fail(ProviderError::RateLimited("rate limit".into())),
        Script::Fail(ProviderError::RateLimited("rate limit".into())),
        ScriptedProvider::text("never reached"),
    ]));
    let dir = tempfile::tempdir().unwrap();
    let settings = OrchestratorSettings {
        session_dir: dir.path().join("sessions"),
        workspace_dir: dir.path().to_path_buf(),
        ..OrchestratorSettings::default()
    };
    let orchestrator = Orchestrator::new(settings, Arc::clone(&provider) as Arc<dyn Provider>, ToolRegistry::new());

    let err = orchestrator
        .run("agent:main:session:retry4", "hi")
        .await
        .unwrap_err();
    assert!(err.to_string().to_lowercase().contains("rate limit"));
    assert_eq!(provider.calls(), 3);
}

// ── Non-retryable stream errors surface immediately ──────────────────────

#[tokio::test]
async fn stream_errors_do_not_retry() {
    let provider = Arc::new(ScriptedProvider::new(vec![Script::Events(vec![
        StreamEvent::Error {
            error_message: "backend exploded".into(),
        },
    ])]));
    let dir = tempfile::tempdir().unwrap();
    let settings = OrchestratorSettings {
        session_dir: dir.path().join("sessions"),
        workspace_dir: dir.path().to_path_buf(),
        ..OrchestratorSettings::default()
    };
    let orchestrator = Orchestrator::new(settings, Arc::clone(&provider) as Arc<dyn Provider>, ToolRegistry::new());

    let err = orchestrator
        .run("agent:main:session:boom", "hi")
        .await
        .unwrap_err();
    assert!(err.to_string().contains("backend exploded"));
    assert_eq!(provider.calls(), 1);
}

// ── Overflow auto-compaction ─────────────────────────────────────────────

fn seeded_overflow_harness(
    scripts: Vec<Script>,
) -> (Harness, talon_core::Subscription, &'static str) {
    let provider = ScriptedProvider::new(scripts);
    let (harness, sub) = harness_with(provider, ToolRegistry::new(), |settings| {
        // Large window so the pre-flight check stays quiet; a tiny history
        // share so pruning drops plenty when compaction asks.
        settings.prune.max_history_share = 0.01;
    });
    (harness, sub, "agent:main:session:overflow")
}

async fn seed_pairs(session_dir: &std::path::Path, key: &str, pairs: usize) {
    let store = SessionStore::new(session_dir);
    for i in 0..pairs {
        store
            .append(key, Message::user(format!("q{i} {}", "x".repeat(3000))))
            .await
            .unwrap();
        store
            .append(key, Message::assistant(format!("a{i} {}", "y".repeat(3000))))
            .await
            .unwrap();
    }
}

#[tokio::test]
async fn context_overflow_compacts_once_and_retries() {
    let (harness, _sub, key) = seeded_overflow_harness(vec![
        Script::Fail(ProviderError::Api {
            status_code: 400,
            message: "prompt exceeds maximum context length".into(),
        }),
        ScriptedProvider::text("recovered"),
    ]);
    seed_pairs(&harness.session_dir, key, 10).await;

    let result = harness.orchestrator.run(key, "go").await.unwrap();
    assert_eq!(result.text, "recovered");

    let types = harness.event_types();
    assert_eq!(
        types
            .iter()
            .filter(|t| **t == "context_overflow_compact")
            .count(),
        1
    );
    assert_eq!(types.iter().filter(|t| **t == "compaction").count(), 1);

    let raw = std::fs::read_to_string(
        harness
            .session_dir
            .join("agent%3Amain%3Asession%3Aoverflow.jsonl"),
    )
    .unwrap();
    assert!(raw.contains(r#""type":"compaction""#));
}

#[tokio::test]
async fn second_overflow_in_one_run_surfaces() {
    let (harness, _sub, key) = seeded_overflow_harness(vec![
        Script::Fail(ProviderError::Api {
            status_code: 400,
            message: "prompt exceeds maximum context length".into(),
        }),
        Script::Fail(ProviderError::Api {
            status_code: 400,
            message: "prompt exceeds maximum context length".into(),
        }),
    ]);
    seed_pairs(&harness.session_dir, key, 10).await;

    let err = harness.orchestrator.run(key, "go").await.unwrap_err();
    assert!(err.to_string().contains("maximum context length"));

    let types = harness.event_types();
    // One rescue attempt, not two.
    assert_eq!(
        types
            .iter()
            .filter(|t| **t == "context_overflow_compact")
            .count(),
        1
    );
    assert_eq!(types.last(), Some(&"agent_error"));
}

// ── Follow-up hook ───────────────────────────────────────────────────────

#[tokio::test]
async fn subagent_completion_feeds_follow_up() {
    let provider = ScriptedProvider::new(vec![
        ScriptedProvider::text("child result"),
        ScriptedProvider::text("parent acknowledges"),
        ScriptedProvider::text("noted the report"),
    ]);
    let (harness, _sub) = harness_with(provider, ToolRegistry::new(), |_| {});
    let parent = "agent:main:session:parent";

    let sub_key = Arc::clone(&harness.orchestrator)
        .spawn_subagent(parent, "investigate")
        .unwrap();
    assert!(sub_key.starts_with("agent:main:subagent:"));

    // Wait for the subagent's run to finish and enqueue its report.
    let deadline = std::time::Instant::now() + Duration::from_secs(5);
    loop {
        let done = harness
            .events
            .lock()
            .unwrap()
            .iter()
            .any(|e| e.event_type() == "subagent_summary");
        if done {
            break;
        }
        assert!(std::time::Instant::now() < deadline, "subagent never finished");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    // The parent's next run answers, then re-enters the loop once the
    // follow-up boundary hands it the report.
    let result = harness.orchestrator.run(parent, "anything new?").await.unwrap();
    assert_eq!(result.text, "noted the report");
    assert_eq!(result.turns, 2);

    let messages = harness.persisted(parent).await;
    assert!(messages
        .iter()
        .any(|m| m.text().contains("child result")));
}
