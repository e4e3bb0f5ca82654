//! # Talon Agent
//!
//! The execution core: turning one user message into a sequence of model
//! calls and tool executions.
//!
//! 1. **Admit** the run through the session and global lanes
//! 2. **Persist** the user message to the guarded session log
//! 3. **Compact** the history if it crowds the context window
//! 4. **Loop**: stream the LLM, execute tools, honor steering and
//!    cancellation, persist everything, emit events
//!
//! The loop continues until the LLM responds with text only (no tool
//! calls), nothing is pending, and no follow-up arrives — or the turn cap
//! or a cancellation stops it.

pub mod lanes;
pub mod loop_runner;
pub mod orchestrator;
pub mod steering;

pub use lanes::{LanePermit, LaneScheduler};
pub use loop_runner::{
    run_agent_loop, AgentLoopParams, AppendFn, FetchFn, LoopOutcome, PrepareCompactionFn,
    SKIPPED_TOOL_RESULT_TEXT,
};
pub use orchestrator::{Orchestrator, OrchestratorSettings};
pub use steering::TextQueues;
