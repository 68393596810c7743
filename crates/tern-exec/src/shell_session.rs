// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::num::NonZeroUsize;
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};

use lru::LruCache;
use tokio::io::AsyncWriteExt;
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::Mutex;
use tracing::{debug, warn};
use uuid::Uuid;

use tern_config::ExecConfig;

use crate::buffer::{shared_buffer, snapshot_lossy, SharedBuffer};
use crate::error::ExecError;
use crate::foreground::pump;

/// How often the sentinel scan polls the output buffer.
const POLL_INTERVAL: Duration = Duration::from_millis(25);

/// Quiescence window used only when the shell dies before printing the
/// sentinel: after this long with no new bytes, return what accumulated.
const QUIESCENT_WINDOW: Duration = Duration::from_millis(100);

/// Result of one command executed in a persistent session.
#[derive(Debug, Clone)]
pub struct SessionExec {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: Option<i32>,
}

struct ShellSession {
    child: Child,
    stdin: ChildStdin,
    stdout: SharedBuffer,
    stderr: SharedBuffer,
    history: Vec<String>,
}

struct PoolEntry {
    session: Arc<Mutex<ShellSession>>,
    last_used: Instant,
}

/// Pool of long-lived interactive shells keyed by session id.
///
/// Commands are terminated by echoing a UUID sentinel and scanning the
/// output for it, which is robust against commands that produce periodic
/// output (a quiescence heuristic alone would fire early on those).
/// The pool is bounded: inserting past capacity evicts the least recently
/// used session, and sessions idle beyond the configured timeout are
/// terminated on the next pool access.
pub struct ShellSessionPool {
    config: ExecConfig,
    sessions: Mutex<LruCache<String, PoolEntry>>,
}

impl ShellSessionPool {
    pub fn new(config: ExecConfig) -> Self {
        let cap =
            NonZeroUsize::new(config.max_shell_sessions).unwrap_or(NonZeroUsize::MIN);
        Self {
            config,
            sessions: Mutex::new(LruCache::new(cap)),
        }
    }

    /// Run a command in the session's shell, creating the session if needed.
    pub async fn execute(
        &self,
        session_id: &str,
        command: &str,
    ) -> Result<SessionExec, ExecError> {
        let handle = {
            let mut pool = self.sessions.lock().await;
            self.evict_idle_locked(&mut pool);
            if let Some(entry) = pool.get_mut(session_id) {
                entry.last_used = Instant::now();
                entry.session.clone()
            } else {
                let session = Arc::new(Mutex::new(spawn_shell(&self.config)?));
                let entry = PoolEntry {
                    session: session.clone(),
                    last_used: Instant::now(),
                };
                if let Some((evicted_id, evicted)) = pool.push(session_id.to_string(), entry) {
                    // push() returns the LRU victim when the pool is full.
                    if evicted_id != session_id {
                        debug!(session_id = %evicted_id, "evicting LRU shell session");
                        terminate(evicted);
                    }
                }
                session
            }
        };

        let mut session = handle.lock().await;
        session.history.push(command.to_string());
        self.run_in_session(&mut session, command).await
    }

    /// Terminate sessions idle beyond the configured timeout.
    pub async fn evict_idle(&self) -> usize {
        let mut pool = self.sessions.lock().await;
        self.evict_idle_locked(&mut pool)
    }

    /// Command history of a live session, oldest first.
    pub async fn history(&self, session_id: &str) -> Option<Vec<String>> {
        let mut pool = self.sessions.lock().await;
        let session = pool.get(session_id)?.session.clone();
        drop(pool);
        let session = session.lock().await;
        Some(session.history.clone())
    }

    /// Drop one session, terminating its shell.  Returns false if absent.
    pub async fn remove(&self, session_id: &str) -> bool {
        let mut pool = self.sessions.lock().await;
        match pool.pop(session_id) {
            Some(entry) => {
                terminate(entry);
                true
            }
            None => false,
        }
    }

    pub async fn len(&self) -> usize {
        self.sessions.lock().await.len()
    }

    fn evict_idle_locked(&self, pool: &mut LruCache<String, PoolEntry>) -> usize {
        let timeout = Duration::from_secs(self.config.shell_idle_timeout_secs);
        let expired: Vec<String> = pool
            .iter()
            .filter(|(_, e)| e.last_used.elapsed() >= timeout)
            .map(|(id, _)| id.clone())
            .collect();
        for id in &expired {
            if let Some(entry) = pool.pop(id) {
                debug!(session_id = %id, "terminating idle shell session");
                terminate(entry);
            }
        }
        expired.len()
    }

    async fn run_in_session(
        &self,
        session: &mut ShellSession,
        command: &str,
    ) -> Result<SessionExec, ExecError> {
        // Sequential commands per session: the previous output is no longer
        // needed once a new command starts.
        session
            .stdout
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
        session
            .stderr
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clear();

        let sentinel = format!("__TERN_DONE_{}", Uuid::new_v4().simple());
        let script = format!("{command}\necho {sentinel} $?\n");
        session
            .stdin
            .write_all(script.as_bytes())
            .await
            .map_err(|e| ExecError::Session(format!("stdin write failed: {e}")))?;
        session
            .stdin
            .flush()
            .await
            .map_err(|e| ExecError::Session(format!("stdin flush failed: {e}")))?;

        let deadline = Instant::now() + Duration::from_millis(self.config.timeout_ms);
        let mut last_len = 0u64;
        let mut quiet_since = Instant::now();

        loop {
            let raw = snapshot_lossy(&session.stdout);
            if let Some((output, exit_code)) = split_at_sentinel(&raw, &sentinel) {
                return Ok(SessionExec {
                    stdout: output,
                    stderr: snapshot_lossy(&session.stderr),
                    exit_code,
                });
            }

            let total = session
                .stdout
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .total_bytes_written();
            if total != last_len {
                last_len = total;
                quiet_since = Instant::now();
            }

            // Fallback: the shell died before the sentinel could print.
            if session.child.try_wait().ok().flatten().is_some()
                && quiet_since.elapsed() >= QUIESCENT_WINDOW
            {
                warn!("shell session exited mid-command");
                return Ok(SessionExec {
                    stdout: raw,
                    stderr: snapshot_lossy(&session.stderr),
                    exit_code: None,
                });
            }

            if Instant::now() >= deadline {
                return Err(ExecError::Session(format!(
                    "command did not complete within {}ms",
                    self.config.timeout_ms
                )));
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }
}

fn spawn_shell(config: &ExecConfig) -> Result<ShellSession, ExecError> {
    let mut cmd = Command::new("bash");
    cmd.stdin(Stdio::piped());
    cmd.stdout(Stdio::piped());
    cmd.stderr(Stdio::piped());
    cmd.kill_on_drop(true);
    #[cfg(unix)]
    unsafe {
        cmd.pre_exec(|| {
            libc::setsid();
            Ok(())
        });
    }
    let mut child = cmd.spawn()?;
    let stdin = child
        .stdin
        .take()
        .ok_or_else(|| ExecError::Session("no stdin handle".into()))?;
    let stdout = shared_buffer(config.buffer_capacity);
    let stderr = shared_buffer(config.buffer_capacity);
    if let Some(r) = child.stdout.take() {
        pump(r, stdout.clone());
    }
    if let Some(r) = child.stderr.take() {
        pump(r, stderr.clone());
    }
    Ok(ShellSession {
        child,
        stdin,
        stdout,
        stderr,
        history: Vec::new(),
    })
}

fn terminate(entry: PoolEntry) {
    tokio::spawn(async move {
        let mut session = entry.session.lock().await;
        let _ = session.child.start_kill();
    });
}

/// Find the sentinel line; return the output preceding it and the parsed
/// exit status from `<sentinel> <code>`.
fn split_at_sentinel(raw: &str, sentinel: &str) -> Option<(String, Option<i32>)> {
    for (i, line) in raw.lines().enumerate() {
        if let Some(rest) = line.strip_prefix(sentinel) {
            let exit_code = rest.trim().parse::<i32>().ok();
            let output = raw.lines().take(i).collect::<Vec<_>>().join("\n");
            return Some((output, exit_code));
        }
    }
    None
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
