//! The agent reasoning loop.
//!
//! Two nested levels:
//!
//! - The **inner loop** runs turns: inject pending user messages, prune
//!   the context, stream one assistant reply, execute its tool calls, and
//!   check for steering between tools. It ends when a turn produced no
//!   tool calls and nothing is pending.
//! - The **outer loop** consults the optional follow-up hook and re-enters
//!   the inner loop with whatever it returns (subagent completion
//!   reports); absent or empty, the run is over.
//!
//! The loop persists through an injected `append_message` closure and
//! never touches the session store directly, so the tool-result guard
//! sees every write.

use futures::future::BoxFuture;
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use talon_context::{prune_context_messages, PruneSettings};
use talon_core::error::{is_context_overflow_error, is_rate_limit_error, AgentError, ProviderError};
use talon_core::{
    AgentEvent, ContentBlock, Error, EventSink, Message, ModelDef, Provider, ProviderContext,
    ReasoningEffort, StreamEvent, StreamOptions, ToolCallData, ToolContext, ToolRegistry,
};

/// Result content for tools preempted by steering.
pub const SKIPPED_TOOL_RESULT_TEXT: &str = "Skipped due to queued user message.";

const MAX_STREAM_ATTEMPTS: u32 = 3;
const RETRY_BACKOFF_INITIAL_MS: u64 = 300;
const RETRY_BACKOFF_CAP_MS: u64 = 30_000;

/// Async persistence hook; the orchestrator wires this to the guarded log.
pub type AppendFn = Arc<dyn Fn(Message) -> BoxFuture<'static, Result<(), Error>> + Send + Sync>;

/// Compaction hook: given the full live history, summarize, persist the
/// checkpoint, and return the synthetic summary message.
pub type PrepareCompactionFn =
    Arc<dyn Fn(Vec<Message>) -> BoxFuture<'static, Result<Option<Message>, Error>> + Send + Sync>;

/// Queue-drain hook for steering / follow-up messages.
pub type FetchFn = Arc<dyn Fn() -> Vec<Message> + Send + Sync>;

/// Everything one run of the loop needs. Plain data plus closures; the
/// loop holds no references back into the orchestrator.
pub struct AgentLoopParams {
    pub run_id: String,
    pub session_key: String,
    /// Live history including the triggering user message
    pub messages: Vec<Message>,
    /// Synthetic summary message from a prior or pre-run compaction
    pub compaction_summary: Option<Message>,
    pub system_prompt: Option<String>,
    pub tools: ToolRegistry,
    pub tool_ctx: ToolContext,
    pub model: ModelDef,
    pub provider: Arc<dyn Provider>,
    pub api_key: Option<String>,
    pub temperature: Option<f32>,
    pub reasoning: Option<ReasoningEffort>,
    pub max_turns: u32,
    pub context_tokens: u32,
    pub prune_settings: PruneSettings,
    pub events: EventSink,
    pub cancel: CancellationToken,
    pub append_message: AppendFn,
    pub prepare_compaction: PrepareCompactionFn,
    pub get_steering: FetchFn,
    pub get_follow_up: Option<FetchFn>,
}

/// What the loop hands back to the orchestrator.
pub struct LoopOutcome {
    pub final_text: String,
    pub turns: u32,
    pub total_tool_calls: u32,
    /// Messages appended during this run, in order
    pub new_messages: Vec<Message>,
}

struct LoopState {
    messages: Vec<Message>,
    compaction_summary: Option<Message>,
    turns: u32,
    total_tool_calls: u32,
    final_text: String,
    overflow_compaction_tried: bool,
    new_messages: Vec<Message>,
}

/// Run the loop to completion. The caller owns terminal events and the
/// guard flush; this function only returns.
pub async fn run_agent_loop(params: AgentLoopParams) -> Result<LoopOutcome, Error> {
    let mut state = LoopState {
        messages: params.messages.clone(),
        compaction_summary: params.compaction_summary.clone(),
        turns: 0,
        total_tool_calls: 0,
        final_text: String::new(),
        overflow_compaction_tried: false,
        new_messages: Vec::new(),
    };

    // Delivery boundary 1: steering queued before the run began.
    let mut pending = (params.get_steering)();

    'outer: loop {
        let mut has_tools = true;

        while has_tools || !pending.is_empty() {
            if state.turns >= params.max_turns {
                debug!(run = %params.run_id, turns = state.turns, "Max turns reached");
                break 'outer;
            }
            if params.cancel.is_cancelled() {
                return Err(AgentError::Cancelled.into());
            }

            state.turns += 1;
            params.events.push(AgentEvent::TurnStart {
                run_id: params.run_id.clone(),
                turn: state.turns,
            });

            for message in pending.drain(..) {
                (params.append_message)(message.clone()).await?;
                state.new_messages.push(message.clone());
                state.messages.push(message);
            }

            let (blocks, tool_calls) = stream_turn(&params, &mut state).await?;

            let assistant = Message::assistant_blocks(blocks);
            (params.append_message)(assistant.clone()).await?;
            state.new_messages.push(assistant.clone());
            state.messages.push(assistant.clone());

            if tool_calls.is_empty() {
                state.final_text = assistant.text();
                has_tools = false;
                params.events.push(AgentEvent::TurnEnd {
                    run_id: params.run_id.clone(),
                    turn: state.turns,
                });
                // Delivery boundary 3: after an assistant turn without tools.
                pending = (params.get_steering)();
                continue;
            }

            has_tools = true;
            state.total_tool_calls += tool_calls.len() as u32;

            let (results, steering) = execute_tool_batch(&params, &tool_calls).await?;
            let tool_message = Message::user_blocks(results);
            (params.append_message)(tool_message.clone()).await?;
            state.new_messages.push(tool_message.clone());
            state.messages.push(tool_message);

            params.events.push(AgentEvent::TurnEnd {
                run_id: params.run_id.clone(),
                turn: state.turns,
            });

            pending = match steering {
                Some(messages) => messages,
                None => (params.get_steering)(),
            };
        }

        if let Some(get_follow_up) = &params.get_follow_up {
            let follow_up = get_follow_up();
            if !follow_up.is_empty() {
                debug!(
                    run = %params.run_id,
                    count = follow_up.len(),
                    "Re-entering loop with follow-up messages"
                );
                pending = follow_up;
                continue 'outer;
            }
        }
        break;
    }

    Ok(LoopOutcome {
        final_text: state.final_text,
        turns: state.turns,
        total_tool_calls: state.total_tool_calls,
        new_messages: state.new_messages,
    })
}

/// One streamed assistant reply, with rate-limit retries and a single
/// overflow-compaction rescue per run.
async fn stream_turn(
    params: &AgentLoopParams,
    state: &mut LoopState,
) -> Result<(Vec<ContentBlock>, Vec<ToolCallData>), Error> {
    loop {
        let pruned = prune_context_messages(
            state.messages.clone(),
            params.context_tokens,
            &params.prune_settings,
        );
        let mut model_messages = Vec::with_capacity(pruned.messages.len() + 1);
        if let Some(summary) = &state.compaction_summary {
            model_messages.push(summary.clone());
        }
        model_messages.extend(pruned.messages);

        match stream_with_retry(params, model_messages).await {
            Ok(result) => {
                if params.cancel.is_cancelled() {
                    return Err(AgentError::Cancelled.into());
                }
                return Ok(result);
            }
            Err(err) => {
                if params.cancel.is_cancelled() {
                    return Err(AgentError::Cancelled.into());
                }
                let text = err.to_string();
                if !is_context_overflow_error(&text) {
                    return Err(err.into());
                }
                if !state.overflow_compaction_tried {
                    state.overflow_compaction_tried = true;
                    params.events.push(AgentEvent::ContextOverflowCompact {
                        run_id: params.run_id.clone(),
                    });
                    warn!(run = %params.run_id, "Context overflow; attempting auto-compaction");
                    if let Some(summary) =
                        (params.prepare_compaction)(state.messages.clone()).await?
                    {
                        state.compaction_summary = Some(summary);
                        continue;
                    }
                }
                return Err(AgentError::ContextOverflow(text).into());
            }
        }
    }
}

fn retry_delay_ms(attempt: u32) -> u64 {
    let base = RETRY_BACKOFF_INITIAL_MS.saturating_mul(10u64.saturating_pow(attempt - 1));
    let capped = base.min(RETRY_BACKOFF_CAP_MS);
    // ±10% jitter so synchronized retries spread out.
    let factor = rand::rng().random_range(0.9..=1.1);
    (capped as f64 * factor) as u64
}

/// Call the provider, retrying rate-limit failures up to the attempt cap.
async fn stream_with_retry(
    params: &AgentLoopParams,
    model_messages: Vec<Message>,
) -> Result<(Vec<ContentBlock>, Vec<ToolCallData>), ProviderError> {
    let context = ProviderContext {
        system_prompt: params.system_prompt.clone(),
        messages: model_messages,
        tools: params.tools.definitions(),
    };
    let opts = StreamOptions {
        max_tokens: None,
        signal: params.cancel.clone(),
        api_key: params.api_key.clone(),
        temperature: params.temperature,
        reasoning: params.reasoning,
    };

    let mut attempt = 1u32;
    loop {
        match consume_stream(params, &context, &opts).await {
            Ok(result) => return Ok(result),
            Err(err) => {
                if params.cancel.is_cancelled() {
                    return Err(err);
                }
                let text = err.to_string();
                if attempt >= MAX_STREAM_ATTEMPTS || !is_rate_limit_error(&text) {
                    return Err(err);
                }
                let delay_ms = retry_delay_ms(attempt);
                params.events.push(AgentEvent::Retry {
                    run_id: params.run_id.clone(),
                    attempt,
                    delay_ms,
                    error: text,
                });
                tokio::select! {
                    () = tokio::time::sleep(Duration::from_millis(delay_ms)) => {}
                    () = params.cancel.cancelled() => return Err(err),
                }
                attempt += 1;
            }
        }
    }
}

/// Drain one provider stream into assistant blocks and tool calls.
async fn consume_stream(
    params: &AgentLoopParams,
    context: &ProviderContext,
    opts: &StreamOptions,
) -> Result<(Vec<ContentBlock>, Vec<ToolCallData>), ProviderError> {
    let mut rx = params.provider.stream(&params.model, context, opts).await?;

    let mut blocks: Vec<ContentBlock> = Vec::new();
    let mut tool_calls: Vec<ToolCallData> = Vec::new();

    while let Some(event) = rx.recv().await {
        match event {
            StreamEvent::TextDelta { delta } => {
                params.events.push(AgentEvent::MessageDelta {
                    run_id: params.run_id.clone(),
                    delta,
                });
            }
            StreamEvent::TextEnd { content } => {
                params.events.push(AgentEvent::MessageEnd {
                    run_id: params.run_id.clone(),
                    content: content.clone(),
                });
                blocks.push(ContentBlock::Text { text: content });
            }
            StreamEvent::ThinkingDelta { delta } => {
                params.events.push(AgentEvent::ThinkingDelta {
                    run_id: params.run_id.clone(),
                    delta,
                });
            }
            StreamEvent::ThinkingEnd | StreamEvent::ToolCallStart => {}
            StreamEvent::ToolCallEnd { tool_call } => {
                blocks.push(ContentBlock::ToolUse {
                    id: tool_call.id.clone(),
                    name: tool_call.name.clone(),
                    input: tool_call.arguments.clone(),
                });
                tool_calls.push(tool_call);
            }
            StreamEvent::Error { error_message } => {
                return Err(ProviderError::Stream(error_message));
            }
        }
    }

    Ok((blocks, tool_calls))
}

/// Execute a batch of tool calls sequentially, checking steering after
/// each one. On preemption, the remaining calls get synthesized skip
/// results so the tool-result invariant holds.
async fn execute_tool_batch(
    params: &AgentLoopParams,
    tool_calls: &[ToolCallData],
) -> Result<(Vec<ContentBlock>, Option<Vec<Message>>), Error> {
    let mut results: Vec<ContentBlock> = Vec::with_capacity(tool_calls.len());
    let mut steering: Option<Vec<Message>> = None;

    for (index, call) in tool_calls.iter().enumerate() {
        params.events.push(AgentEvent::ToolExecutionStart {
            run_id: params.run_id.clone(),
            tool_use_id: call.id.clone(),
            name: call.name.clone(),
            input: call.arguments.clone(),
        });

        let (output, is_error) = execute_single_tool(params, call).await;

        params.events.push(AgentEvent::ToolExecutionEnd {
            run_id: params.run_id.clone(),
            tool_use_id: call.id.clone(),
            name: call.name.clone(),
            output: output.clone(),
            is_error,
        });
        results.push(ContentBlock::ToolResult {
            tool_use_id: call.id.clone(),
            name: Some(call.name.clone()),
            content: output,
        });

        if params.cancel.is_cancelled() {
            return Err(AgentError::Cancelled.into());
        }

        // Delivery boundary 2: after each individual tool.
        let drained = (params.get_steering)();
        if !drained.is_empty() {
            for skipped in &tool_calls[index + 1..] {
                params.events.push(AgentEvent::ToolSkipped {
                    run_id: params.run_id.clone(),
                    tool_use_id: skipped.id.clone(),
                    name: skipped.name.clone(),
                });
                results.push(ContentBlock::ToolResult {
                    tool_use_id: skipped.id.clone(),
                    name: Some(skipped.name.clone()),
                    content: SKIPPED_TOOL_RESULT_TEXT.into(),
                });
            }
            params.events.push(AgentEvent::Steering {
                run_id: params.run_id.clone(),
                queued: drained.len(),
            });
            steering = Some(drained);
            break;
        }
    }

    Ok((results, steering))
}

/// Run one tool; a thrown error becomes an error result string, never a
/// loop failure.
async fn execute_single_tool(params: &AgentLoopParams, call: &ToolCallData) -> (String, bool) {
    let Some(tool) = params.tools.get(&call.name) else {
        return (format!("执行错误: unknown tool '{}'", call.name), true);
    };
    match tool.execute(call.arguments.clone(), &params.tool_ctx).await {
        Ok(output) => (output, false),
        Err(err) => (format!("执行错误: {err}"), true),
    }
}
