// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use regex::Regex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

use tern_config::ExecConfig;

use crate::buffer::{shared_buffer, snapshot_lossy, SharedBuffer};
use crate::error::ExecError;
use crate::foreground::{build_command, escalate, pump, signal_name};

/// Lifecycle of a background task.  All non-`Running` states are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskStatus {
    Running,
    Completed,
    Failed,
    Killed,
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Running => write!(f, "running"),
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
            Self::Killed => write!(f, "killed"),
        }
    }
}

struct TaskEntry {
    command: String,
    status: TaskStatus,
    pid: Option<u32>,
    started_at: DateTime<Utc>,
    ended_at: Option<DateTime<Utc>>,
    /// Monotonic end marker used by the reaper; wall-clock `ended_at` is
    /// for display only.
    ended_instant: Option<Instant>,
    exit_code: Option<i32>,
    signal: Option<String>,
    spawned_by: String,
    duration_ms: Option<u64>,
    stdout: SharedBuffer,
    stderr: SharedBuffer,
    kill: CancellationToken,
}

/// Metadata view of a task, without its buffers.
#[derive(Debug, Clone)]
pub struct TaskSummary {
    pub id: String,
    pub command: String,
    pub status: TaskStatus,
    pub pid: Option<u32>,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub exit_code: Option<i32>,
    pub signal: Option<String>,
    pub spawned_by: String,
    pub duration_ms: Option<u64>,
}

/// Snapshot returned by output retrieval.  Non-destructive and idempotent:
/// the underlying buffers are never drained.
#[derive(Debug, Clone)]
pub struct TaskOutput {
    pub status: TaskStatus,
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub stdout_lines: usize,
    pub stderr_lines: usize,
    pub timestamp: DateTime<Utc>,
}

/// Shared table of background tasks.
///
/// Spawning returns immediately with a task id; a monitor task streams
/// output into the bounded buffers and records the terminal state on exit.
/// Buffers are retained after exit so output stays retrievable until the
/// reaper removes the task.
pub struct BackgroundSupervisor {
    config: ExecConfig,
    tasks: Arc<Mutex<HashMap<String, TaskEntry>>>,
}

impl BackgroundSupervisor {
    pub fn new(config: ExecConfig) -> Self {
        Self {
            config,
            tasks: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Spawn a command in the background and return its task id.
    pub fn spawn(
        &self,
        command: &str,
        workdir: Option<&Path>,
        env: &[(String, String)],
        spawned_by: &str,
    ) -> Result<String, ExecError> {
        let mut child = build_command(command, workdir, env).spawn()?;
        let id = format!("bash_{}", &Uuid::new_v4().simple().to_string()[..8]);
        let pid = child.id();

        let stdout = shared_buffer(self.config.buffer_capacity);
        let stderr = shared_buffer(self.config.buffer_capacity);
        let out_pump = child.stdout.take().map(|r| pump(r, stdout.clone()));
        let err_pump = child.stderr.take().map(|r| pump(r, stderr.clone()));

        let kill = CancellationToken::new();
        let entry = TaskEntry {
            command: command.to_string(),
            status: TaskStatus::Running,
            pid,
            started_at: Utc::now(),
            ended_at: None,
            ended_instant: None,
            exit_code: None,
            signal: None,
            spawned_by: spawned_by.to_string(),
            duration_ms: None,
            stdout,
            stderr,
            kill: kill.clone(),
        };
        self.lock().insert(id.clone(), entry);
        debug!(task_id = %id, ?pid, command, "background task started");

        let tasks = Arc::clone(&self.tasks);
        let task_id = id.clone();
        let grace = Duration::from_millis(self.config.kill_grace_ms);
        let start = Instant::now();
        tokio::spawn(async move {
            enum Ended {
                Exited(std::io::Result<std::process::ExitStatus>),
                Killed,
            }
            let ended = tokio::select! {
                biased;
                _ = kill.cancelled() => Ended::Killed,
                status = child.wait() => Ended::Exited(status),
            };
            let (status, killed) = match ended {
                Ended::Exited(status) => (status.ok(), false),
                Ended::Killed => (escalate(&mut child, grace).await, true),
            };
            if let Some(h) = out_pump {
                let _ = h.await;
            }
            if let Some(h) = err_pump {
                let _ = h.await;
            }

            let mut map = tasks.lock().unwrap_or_else(|e| e.into_inner());
            if let Some(entry) = map.get_mut(&task_id) {
                entry.ended_at = Some(Utc::now());
                entry.ended_instant = Some(Instant::now());
                entry.duration_ms = Some(start.elapsed().as_millis() as u64);
                entry.pid = None;
                if killed {
                    // Synthetic exit state for a supervisor-initiated kill.
                    entry.status = TaskStatus::Killed;
                    entry.exit_code = Some(-1);
                    entry.signal = Some("SIGKILL".to_string());
                } else {
                    entry.exit_code = status.as_ref().and_then(|s| s.code());
                    entry.signal = status.as_ref().and_then(signal_name);
                    entry.status = if entry.exit_code == Some(0) {
                        TaskStatus::Completed
                    } else {
                        TaskStatus::Failed
                    };
                }
                debug!(task_id = %task_id, status = %entry.status, "background task ended");
            }
        });

        Ok(id)
    }

    /// Snapshot a task's output.  The optional filter regex is applied to
    /// complete lines *before* the byte cap, so truncation can never split
    /// a line under the filter's feet.
    pub fn output(&self, id: &str, filter: Option<&str>) -> Result<TaskOutput, ExecError> {
        let filter = filter
            .map(|f| Regex::new(f).map_err(|e| ExecError::BadFilter(e.to_string())))
            .transpose()?;

        let map = self.lock();
        let entry = map.get(id).ok_or_else(|| ExecError::UnknownTask(id.into()))?;

        let (stdout, stdout_lines) = render_stream(
            &snapshot_lossy(&entry.stdout),
            filter.as_ref(),
            self.config.output_cap_bytes,
        );
        let (stderr, stderr_lines) = render_stream(
            &snapshot_lossy(&entry.stderr),
            filter.as_ref(),
            self.config.output_cap_bytes,
        );
        Ok(TaskOutput {
            status: entry.status,
            exit_code: entry.exit_code,
            stdout,
            stderr,
            stdout_lines,
            stderr_lines,
            timestamp: Utc::now(),
        })
    }

    /// Request termination of a running task.  The monitor escalates
    /// SIGTERM → SIGKILL and records the `Killed` terminal state.
    /// Non-running tasks are left untouched and reported as a failure.
    pub fn kill(&self, id: &str) -> Result<(), ExecError> {
        let map = self.lock();
        let entry = map.get(id).ok_or_else(|| ExecError::UnknownTask(id.into()))?;
        if entry.status != TaskStatus::Running {
            return Err(ExecError::NotRunning(id.into()));
        }
        entry.kill.cancel();
        Ok(())
    }

    pub fn get(&self, id: &str) -> Option<TaskSummary> {
        self.lock().get(id).map(|e| summarize(id, e))
    }

    pub fn list(&self) -> Vec<TaskSummary> {
        let map = self.lock();
        let mut out: Vec<TaskSummary> = map.iter().map(|(id, e)| summarize(id, e)).collect();
        out.sort_by(|a, b| a.started_at.cmp(&b.started_at));
        out
    }

    /// Remove non-running tasks that ended more than `max_age` ago.
    /// Returns the number of tasks removed.
    pub fn reap_older_than(&self, max_age: Duration) -> usize {
        let mut map = self.lock();
        let before = map.len();
        map.retain(|id, e| {
            let expired = e.status != TaskStatus::Running
                && e.ended_instant
                    .map(|t| t.elapsed() >= max_age)
                    .unwrap_or(false);
            if expired {
                debug!(task_id = %id, "reaping expired background task");
            }
            !expired
        });
        before - map.len()
    }

    /// Reap with the configured retention window.
    pub fn reap_expired(&self) -> usize {
        self.reap_older_than(Duration::from_secs(self.config.task_retention_secs))
    }

    /// Run the periodic reaping sweep until the token is cancelled.
    pub fn run_reaper(self: Arc<Self>, interval: Duration, cancel: CancellationToken) {
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = tokio::time::sleep(interval) => {
                        let n = self.reap_expired();
                        if n > 0 {
                            debug!(reaped = n, "background task sweep");
                        }
                    }
                }
            }
        });
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, TaskEntry>> {
        self.tasks.lock().unwrap_or_else(|e| {
            warn!("background task table lock poisoned");
            e.into_inner()
        })
    }
}

fn summarize(id: &str, e: &TaskEntry) -> TaskSummary {
    TaskSummary {
        id: id.to_string(),
        command: e.command.clone(),
        status: e.status,
        pid: e.pid,
        started_at: e.started_at,
        ended_at: e.ended_at,
        exit_code: e.exit_code,
        signal: e.signal.clone(),
        spawned_by: e.spawned_by.clone(),
        duration_ms: e.duration_ms,
    }
}

/// Normalize line endings, apply the optional per-line filter, then cap the
/// result at `cap_bytes` keeping the tail, with an explicit marker.
fn render_stream(raw: &str, filter: Option<&Regex>, cap_bytes: usize) -> (String, usize) {
    let normalized = raw.replace("\r\n", "\n");
    let lines: Vec<&str> = match filter {
        Some(re) => normalized.lines().filter(|l| re.is_match(l)).collect(),
        None => normalized.lines().collect(),
    };
    let line_count = lines.len();
    let joined = lines.join("\n");
    if joined.len() <= cap_bytes {
        return (joined, line_count);
    }
    // Keep the tail: recent output matters most.  Cut at a line boundary,
    // nudging forward off any multi-byte character the cap landed inside.
    let omitted = joined.len() - cap_bytes;
    let mut tail_start = joined.len() - cap_bytes;
    while tail_start < joined.len() && !joined.is_char_boundary(tail_start) {
        tail_start += 1;
    }
    let tail = match joined[tail_start..].find('\n') {
        Some(nl) => &joined[tail_start + nl + 1..],
        None => &joined[tail_start..],
    };
    (
        format!("[... {omitted} bytes truncated ...]\n{tail}"),
        line_count,
    )
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
