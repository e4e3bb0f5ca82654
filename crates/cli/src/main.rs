//! Talon CLI — the main entry point.
//!
//! Commands:
//! - `chat`     — Send one message (or read lines from stdin)
//! - `sessions` — List persisted sessions
//! - `reset`    — Delete a session's history

use std::io::Write as _;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing::error;

use talon_agent::{Orchestrator, OrchestratorSettings};
use talon_config::AppConfig;
use talon_core::session_key::normalize_agent_id;
use talon_core::{AgentEvent, SessionKey};
use talon_providers::AnthropicProvider;
use talon_tools::default_registry;

#[derive(Parser)]
#[command(name = "talon", about = "Talon — LLM agent execution core", version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Config file path (default: ~/.talon/config.toml)
    #[arg(short, long, global = true)]
    config: Option<std::path::PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Chat with the agent
    Chat {
        /// Send a single message instead of reading lines from stdin
        #[arg(short, long)]
        message: Option<String>,

        /// Conversation id within the agent's sessions
        #[arg(short, long, default_value = "cli")]
        session: String,
    },

    /// List persisted sessions
    Sessions,

    /// Delete a session's history
    Reset {
        /// Conversation id to reset
        session: String,
    },
}

fn build_orchestrator(config: &AppConfig) -> Arc<Orchestrator> {
    let settings = OrchestratorSettings {
        agent_id: normalize_agent_id(&config.agent_id),
        session_dir: config.session_dir(),
        workspace_dir: config.workspace_dir(),
        system_prompt: config.system_prompt.clone(),
        model: config.model_def(),
        api_key: config.api_key.clone(),
        temperature: config.temperature,
        reasoning: config.reasoning,
        max_turns: config.max_turns,
        context_tokens: config.context_tokens,
        max_concurrent_runs: config.max_concurrent_runs,
        ..OrchestratorSettings::default()
    };

    let mut tools = default_registry();
    if !config.sandbox.allow_exec {
        tools = tools.filtered(&[], &["shell".into()]);
    }
    if !config.sandbox.allow_write {
        tools = tools.filtered(&[], &["write".into()]);
    }
    let tools = tools.filtered(&config.tool_policy.allow, &config.tool_policy.deny);

    Arc::new(Orchestrator::new(
        settings,
        Arc::new(AnthropicProvider::new()),
        tools,
    ))
}

async fn chat_once(orchestrator: &Orchestrator, session_key: &str, text: &str) {
    // Print assistant text as it streams.
    let _subscription = orchestrator.subscribe(|event| match event {
        AgentEvent::MessageDelta { delta, .. } => {
            print!("{delta}");
            let _ = std::io::stdout().flush();
        }
        AgentEvent::MessageEnd { .. } => println!(),
        AgentEvent::ToolExecutionStart { name, .. } => {
            eprintln!("[tool: {name}]");
        }
        _ => {}
    });

    if let Err(err) = orchestrator.run(session_key, text).await {
        error!(error = %err, "Run failed");
        eprintln!("error: {err}");
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let filter = if cli.verbose { "debug" } else { "warn" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(filter)),
        )
        .with_writer(std::io::stderr)
        .init();

    let config_path = cli
        .config
        .unwrap_or_else(AppConfig::default_path);
    let config = match AppConfig::load(&config_path) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("error: {err}");
            std::process::exit(1);
        }
    };

    let orchestrator = build_orchestrator(&config);
    let agent_id = normalize_agent_id(&config.agent_id);

    match cli.command {
        Commands::Chat { message, session } => {
            let key = SessionKey::session(agent_id, session).to_string();
            match message {
                Some(text) => chat_once(&orchestrator, &key, &text).await,
                None => {
                    let stdin = std::io::stdin();
                    let mut line = String::new();
                    loop {
                        print!("> ");
                        let _ = std::io::stdout().flush();
                        line.clear();
                        match stdin.read_line(&mut line) {
                            Ok(0) => break,
                            Ok(_) => {
                                let text = line.trim();
                                if text.is_empty() {
                                    continue;
                                }
                                if text == "/quit" {
                                    break;
                                }
                                chat_once(&orchestrator, &key, text).await;
                            }
                            Err(_) => break,
                        }
                    }
                }
            }
        }
        Commands::Sessions => match orchestrator.sessions().await {
            Ok(keys) => {
                for key in keys {
                    println!("{key}");
                }
            }
            Err(err) => eprintln!("error: {err}"),
        },
        Commands::Reset { session } => {
            let key = SessionKey::session(agent_id, session).to_string();
            match orchestrator.reset(&key).await {
                Ok(()) => println!("reset {key}"),
                Err(err) => eprintln!("error: {err}"),
            }
        }
    }
}
