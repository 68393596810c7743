// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use clap::Parser;
use std::path::PathBuf;

/// An interactive AI coding agent core.
///
/// Without `--prompt`, starts a line-based REPL.  Free text is submitted to
/// the agent; `/` commands control the session (see `/help`).
#[derive(Parser, Debug)]
#[command(name = "tern", version, about)]
pub struct Cli {
    /// Explicit config file (merged over the discovered config layers)
    #[arg(long, short = 'c')]
    pub config: Option<PathBuf>,

    /// Working directory for tool execution (default: current directory)
    #[arg(long, short = 'C')]
    pub workdir: Option<PathBuf>,

    /// Model name override
    #[arg(long, short = 'm')]
    pub model: Option<String>,

    /// Run a single prompt non-interactively and exit
    #[arg(long, short = 'p')]
    pub prompt: Option<String>,

    /// Verbose logging to stderr
    #[arg(long, short = 'v')]
    pub verbose: bool,
}

/// A parsed REPL input line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplCommand {
    Help,
    Clear,
    History,
    Tokens,
    Model(Option<String>),
    Save(PathBuf),
    Load(PathBuf),
    Reset,
    Quit,
    /// Free text submitted to the agent.
    Submit(String),
    Unknown(String),
}

/// Classify one input line.  Anything not starting with `/` is a prompt.
pub fn parse_line(line: &str) -> Option<ReplCommand> {
    let line = line.trim();
    if line.is_empty() {
        return None;
    }
    if !line.starts_with('/') {
        return Some(ReplCommand::Submit(line.to_string()));
    }
    let mut parts = line.splitn(2, char::is_whitespace);
    let command = parts.next().unwrap_or_default();
    let arg = parts.next().map(str::trim).filter(|a| !a.is_empty());
    Some(match command {
        "/help" => ReplCommand::Help,
        "/clear" => ReplCommand::Clear,
        "/history" => ReplCommand::History,
        "/tokens" => ReplCommand::Tokens,
        "/model" => ReplCommand::Model(arg.map(str::to_string)),
        "/save" => match arg {
            Some(path) => ReplCommand::Save(PathBuf::from(path)),
            None => ReplCommand::Unknown("/save requires a file path".into()),
        },
        "/load" => match arg {
            Some(path) => ReplCommand::Load(PathBuf::from(path)),
            None => ReplCommand::Unknown("/load requires a file path".into()),
        },
        "/reset" => ReplCommand::Reset,
        "/quit" | "/exit" => ReplCommand::Quit,
        other => ReplCommand::Unknown(format!("unknown command: {other}")),
    })
}

pub const HELP_TEXT: &str = "\
commands:
  /help           show this help
  /clear          drop the conversation history
  /history        list the conversation so far
  /tokens         show the current token estimate
  /model [name]   show or switch the model
  /save <file>    checkpoint the conversation to a file
  /load <file>    restore a checkpointed conversation
  /reset          clear history and recover from an error state
  /quit           exit
anything else is sent to the agent; Ctrl-C cancels the current turn.";

// ─── Unit tests ──────────────────────────────────────────────────────────────
