// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
mod cli;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use cli::{parse_line, Cli, ReplCommand, HELP_TEXT};
use tern_core::{Agent, AgentEvent, Conversation, ConversationSnapshot, TaskTool};
use tern_model::{AnthropicClient, CircuitBreaker, ModelClient, RetryPolicy, RetryingClient};
use tern_tools::{builtin_registry, Harness, PermissionGate, SessionState, ToolCategory};

/// Interval of the background-task reaping sweep.
const REAPER_INTERVAL: Duration = Duration::from_secs(60);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let mut config = tern_config::load(cli.config.as_deref())?;
    if let Some(model) = &cli.model {
        config.model.name = model.clone();
    }
    let workdir = match &cli.workdir {
        Some(dir) => dir.clone(),
        None => std::env::current_dir().context("resolving current directory")?,
    };

    let model_cfg = Arc::new(config.model.clone());
    let agent_cfg = Arc::new(config.agent.clone());
    // Every model call goes through the retry controller and a per-endpoint
    // circuit breaker wrapped around the raw streaming client.
    let client: Arc<dyn ModelClient> = Arc::new(RetryingClient::new(
        Arc::new(AnthropicClient::new(&model_cfg)?),
        RetryPolicy::from_config(&config.retry),
        Arc::new(CircuitBreaker::new(&config.circuit)),
    ));
    let state = Arc::new(SessionState::new(
        config.exec.clone(),
        config.tools.clone(),
    ));

    // All builtin tools plus the Task sub-agent launcher; network tools are
    // switched off under TERN_NO_NETWORK / NETWORK_RESTRICTED.
    let mut registry = builtin_registry(std::env::var("TERN_SEARCH_API_KEY").ok())
        .map_err(|e| anyhow::anyhow!("tool registry: {e}"))?;
    registry
        .register(
            TaskTool::new(
                client.clone(),
                agent_cfg.clone(),
                model_cfg.clone(),
                config.tools.clone(),
            ),
            ToolCategory::Agent,
        )
        .map_err(|e| anyhow::anyhow!("tool registry: {e}"))?;
    registry
        .register_alias("task", "Task")
        .map_err(|e| anyhow::anyhow!("tool registry: {e}"))?;
    if !config.tools.network_enabled {
        registry.set_category_enabled(ToolCategory::Network, false);
    }

    let gate = Arc::new(PermissionGate::from_config(&config.tools));
    let harness = Harness::new(Arc::new(registry), gate);

    let shutdown = CancellationToken::new();
    state
        .background
        .clone()
        .run_reaper(REAPER_INTERVAL, shutdown.clone());

    let mut agent = Agent::new(
        client,
        harness,
        state,
        agent_cfg,
        model_cfg,
        workdir,
    );

    let result = match &cli.prompt {
        Some(prompt) => run_once(&mut agent, prompt).await,
        None => run_repl(&mut agent).await,
    };
    shutdown.cancel();
    result
}

fn init_logging(verbose: bool) {
    let default_filter = if verbose { "debug" } else { "warn" };
    let ansi = match (
        std::env::var_os("NO_COLOR"),
        std::env::var_os("FORCE_COLOR"),
    ) {
        (_, Some(_)) => true,
        (Some(_), None) => false,
        (None, None) => true,
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)),
        )
        .with_ansi(ansi)
        .with_writer(std::io::stderr)
        .init();
}

/// Submit one prompt and exit; used by `--prompt`.
async fn run_once(agent: &mut Agent, prompt: &str) -> anyhow::Result<()> {
    let cancel = CancellationToken::new();
    let (tx, rx) = mpsc::channel(256);
    let printer = spawn_printer(rx);
    let result = agent.submit(prompt, tx, cancel).await;
    let _ = printer.await;
    result
}

/// Line-based REPL over stdin.
async fn run_repl(agent: &mut Agent) -> anyhow::Result<()> {
    println!("tern — model {}; /help for commands", agent.conversation().model);
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        let Some(line) = lines.next_line().await? else {
            return Ok(()); // EOF
        };
        let Some(command) = parse_line(&line) else {
            continue;
        };
        match command {
            ReplCommand::Quit => return Ok(()),
            ReplCommand::Help => println!("{HELP_TEXT}"),
            ReplCommand::Clear => {
                agent.conversation_mut().clear();
                println!("(history cleared)");
            }
            ReplCommand::History => print_history(agent.conversation()),
            ReplCommand::Tokens => {
                let conv = agent.conversation();
                println!(
                    "~{} tokens across {} messages",
                    conv.token_count(),
                    conv.len()
                );
            }
            ReplCommand::Model(None) => println!("model: {}", agent.conversation().model),
            ReplCommand::Model(Some(name)) => {
                agent.set_model(name.clone());
                println!("model set to {name}");
            }
            ReplCommand::Save(path) => match save_conversation(agent.conversation(), &path) {
                Ok(()) => println!("saved to {}", path.display()),
                Err(e) => eprintln!("save failed: {e}"),
            },
            ReplCommand::Load(path) => match load_conversation(&path) {
                Ok(conv) => {
                    println!(
                        "loaded {} messages (~{} tokens)",
                        conv.len(),
                        conv.token_count()
                    );
                    *agent.conversation_mut() = conv;
                }
                Err(e) => eprintln!("load failed: {e}"),
            },
            ReplCommand::Reset => {
                agent.conversation_mut().clear();
                let _ = agent
                    .conversation_mut()
                    .set_state(tern_core::ConversationState::Idle);
                println!("(reset)");
            }
            ReplCommand::Unknown(msg) => eprintln!("{msg}"),
            ReplCommand::Submit(text) => {
                let cancel = CancellationToken::new();
                let watcher = {
                    let cancel = cancel.clone();
                    tokio::spawn(async move {
                        if tokio::signal::ctrl_c().await.is_ok() {
                            cancel.cancel();
                        }
                    })
                };
                let (tx, rx) = mpsc::channel(256);
                let printer = spawn_printer(rx);
                if let Err(e) = agent.submit(&text, tx, cancel).await {
                    eprintln!("error: {e}");
                }
                let _ = printer.await;
                watcher.abort();
            }
        }
    }
}

/// Render agent events to stdout as they arrive.
fn spawn_printer(mut rx: mpsc::Receiver<AgentEvent>) -> tokio::task::JoinHandle<()> {
    use std::io::Write;
    tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            match event {
                AgentEvent::TextDelta(text) => {
                    print!("{text}");
                    let _ = std::io::stdout().flush();
                }
                AgentEvent::TextComplete(_) => println!(),
                AgentEvent::ToolCallStarted {
                    tool_name, input, ..
                } => {
                    println!("⚙ {tool_name} {input}");
                }
                AgentEvent::ToolProgress { message, .. } => {
                    println!("  … {message}");
                }
                AgentEvent::ToolCallFinished {
                    tool_name,
                    is_error,
                    ..
                } => {
                    if is_error {
                        println!("  ✗ {tool_name} failed");
                    }
                }
                AgentEvent::ContextCompacted {
                    tokens_before,
                    tokens_after,
                    ..
                } => {
                    eprintln!("(context compacted: ~{tokens_before} → ~{tokens_after} tokens)");
                }
                AgentEvent::Aborted { .. } => {
                    eprintln!("(cancelled)");
                }
                AgentEvent::Error(msg) => eprintln!("error: {msg}"),
                AgentEvent::TokenUsage { .. } | AgentEvent::TurnComplete => {}
            }
        }
    })
}

fn print_history(conv: &Conversation) {
    for record in conv.records() {
        let text = record.message.text();
        let line = text.lines().next().unwrap_or("");
        let preview: String = line.chars().take(100).collect();
        println!(
            "[{:>9?}] {}{}",
            record.message.role,
            preview,
            if text.len() > preview.len() { " …" } else { "" }
        );
    }
}

fn save_conversation(conv: &Conversation, path: &PathBuf) -> anyhow::Result<()> {
    let json = serde_json::to_string_pretty(&conv.snapshot())?;
    std::fs::write(path, json).with_context(|| format!("writing {}", path.display()))?;
    Ok(())
}

fn load_conversation(path: &PathBuf) -> anyhow::Result<Conversation> {
    let text =
        std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    let snapshot: ConversationSnapshot = serde_json::from_str(&text)?;
    Ok(Conversation::from_snapshot(snapshot))
}
