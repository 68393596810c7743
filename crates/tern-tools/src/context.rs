// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use tern_config::{ExecConfig, ToolsConfig};
use tern_exec::{BackgroundSupervisor, Executor, ShellSessionPool};

use crate::hooks::HookBus;

/// A progress event forwarded to the dispatch caller while a tool runs.
/// Progress events always precede the invocation's terminal result.
#[derive(Debug, Clone)]
pub struct ToolProgress {
    pub call_id: String,
    pub message: String,
}

/// Process-wide state shared by tool invocations within one agent session:
/// the subprocess supervisor, the shell pool, and the read-history set that
/// Write consults for its overwrite guard.  Injected, never global.
pub struct SessionState {
    pub executor: Executor,
    pub background: Arc<BackgroundSupervisor>,
    pub shells: ShellSessionPool,
    pub tools: ToolsConfig,
    read_history: Mutex<HashSet<PathBuf>>,
}

impl SessionState {
    pub fn new(exec: ExecConfig, tools: ToolsConfig) -> Self {
        Self {
            executor: Executor::new(exec.clone()),
            background: Arc::new(BackgroundSupervisor::new(exec.clone())),
            shells: ShellSessionPool::new(exec),
            tools,
            read_history: Mutex::new(HashSet::new()),
        }
    }

    /// Record that a file's current content has been observed this session.
    pub fn record_read(&self, path: &Path) {
        self.read_history
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(path.to_path_buf());
    }

    pub fn was_read(&self, path: &Path) -> bool {
        self.read_history
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains(path)
    }
}

/// Per-invocation bundle passed into every tool.  Lives for exactly one
/// tool invocation.
#[derive(Clone)]
pub struct ExecutionContext {
    pub session_id: String,
    pub workdir: PathBuf,
    pub env: Vec<(String, String)>,
    pub cancel: CancellationToken,
    pub state: Arc<SessionState>,
    pub hooks: Arc<HookBus>,
    progress: Option<mpsc::Sender<ToolProgress>>,
}

impl ExecutionContext {
    pub fn new(session_id: impl Into<String>, workdir: PathBuf, state: Arc<SessionState>) -> Self {
        Self {
            session_id: session_id.into(),
            workdir,
            env: Vec::new(),
            cancel: CancellationToken::new(),
            state,
            hooks: Arc::new(HookBus::new()),
            progress: None,
        }
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn with_hooks(mut self, hooks: Arc<HookBus>) -> Self {
        self.hooks = hooks;
        self
    }

    pub fn with_progress(mut self, tx: mpsc::Sender<ToolProgress>) -> Self {
        self.progress = Some(tx);
        self
    }

    /// Emit a progress event.  A missing or closed sink drops the event;
    /// progress is advisory and never blocks the tool.
    pub async fn emit_progress(&self, call_id: &str, message: impl Into<String>) {
        if let Some(tx) = &self.progress {
            let _ = tx
                .send(ToolProgress {
                    call_id: call_id.to_string(),
                    message: message.into(),
                })
                .await;
        }
    }

    /// Resolve a possibly-relative path against the invocation workdir.
    pub fn resolve_path(&self, path: &str) -> PathBuf {
        let p = Path::new(path);
        if p.is_absolute() {
            p.to_path_buf()
        } else {
            self.workdir.join(p)
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
