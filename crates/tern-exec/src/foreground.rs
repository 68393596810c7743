// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::path::PathBuf;
use std::process::Stdio;
use std::time::{Duration, Instant};

use regex::Regex;
use tokio::io::AsyncReadExt;
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use tern_config::ExecConfig;

use crate::buffer::{shared_buffer, snapshot_lossy, SharedBuffer};
use crate::error::ExecError;

/// Why a foreground execution ended.  Recorded distinctly so a caller can
/// tell a deadline kill from an external cancellation; the wire-level
/// `timed_out` / `killed` booleans are derived, never stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminationReason {
    Exited,
    TimedOut,
    Cancelled,
    KilledByCaller,
}

/// One foreground execution request.
#[derive(Debug, Clone)]
pub struct ExecRequest {
    pub command: String,
    pub workdir: Option<PathBuf>,
    /// Environment overrides layered on top of the inherited process env.
    pub env: Vec<(String, String)>,
    /// Wall-clock deadline.  `None` uses the configured default;
    /// `Some(Duration::ZERO)` disables the deadline entirely.
    pub timeout: Option<Duration>,
}

impl ExecRequest {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            workdir: None,
            env: Vec::new(),
            timeout: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ExecResult {
    pub exit_code: Option<i32>,
    pub signal: Option<String>,
    pub stdout: String,
    pub stderr: String,
    pub duration: Duration,
    pub termination: TerminationReason,
}

impl ExecResult {
    pub fn timed_out(&self) -> bool {
        self.termination == TerminationReason::TimedOut
    }

    /// True when the process was terminated by the supervisor rather than
    /// exiting on its own.
    pub fn killed(&self) -> bool {
        !matches!(self.termination, TerminationReason::Exited)
    }
}

/// Foreground subprocess executor with deadline and signal escalation.
pub struct Executor {
    config: ExecConfig,
    danger: Vec<Regex>,
}

impl Executor {
    pub fn new(config: ExecConfig) -> Self {
        let danger = config
            .danger_patterns
            .iter()
            .filter_map(|p| match Regex::new(p) {
                Ok(re) => Some(re),
                Err(e) => {
                    warn!(pattern = %p, error = %e, "invalid danger pattern; skipping");
                    None
                }
            })
            .collect();
        Self { config, danger }
    }

    pub fn config(&self) -> &ExecConfig {
        &self.config
    }

    /// Reject catastrophic commands before spawn.  This is a safety net
    /// against common mistakes, not a security boundary.
    pub fn validate_command(&self, command: &str) -> Result<(), ExecError> {
        for re in &self.danger {
            if re.is_match(command) {
                return Err(ExecError::Rejected(format!(
                    "matches danger pattern `{}`",
                    re.as_str()
                )));
            }
        }
        Ok(())
    }

    /// Run a command to completion, under deadline and cancellation.
    ///
    /// Deadline expiry and cancellation both escalate SIGTERM → SIGKILL
    /// after the configured grace period and still resolve with an
    /// [`ExecResult`]; only spawn-level problems return `Err`.
    pub async fn run(
        &self,
        req: ExecRequest,
        cancel: CancellationToken,
    ) -> Result<ExecResult, ExecError> {
        self.validate_command(&req.command)?;
        let timeout = effective_timeout(req.timeout, &self.config);
        let grace = Duration::from_millis(self.config.kill_grace_ms);

        debug!(command = %req.command, ?timeout, "spawning foreground command");
        let mut child = build_command(&req.command, req.workdir.as_deref(), &req.env).spawn()?;

        let stdout_buf = shared_buffer(self.config.buffer_capacity);
        let stderr_buf = shared_buffer(self.config.buffer_capacity);
        let out_pump = child.stdout.take().map(|r| pump(r, stdout_buf.clone()));
        let err_pump = child.stderr.take().map(|r| pump(r, stderr_buf.clone()));

        let start = Instant::now();
        enum Waited {
            Exited(std::io::Result<std::process::ExitStatus>),
            Deadline,
            Cancelled,
        }
        let waited = tokio::select! {
            biased;
            _ = cancel.cancelled() => Waited::Cancelled,
            status = child.wait() => Waited::Exited(status),
            _ = deadline(timeout) => Waited::Deadline,
        };

        let (status, termination) = match waited {
            Waited::Exited(status) => (status.ok(), TerminationReason::Exited),
            Waited::Deadline => {
                warn!(command = %req.command, "deadline exceeded; escalating");
                (escalate(&mut child, grace).await, TerminationReason::TimedOut)
            }
            Waited::Cancelled => {
                debug!(command = %req.command, "cancelled; escalating");
                (escalate(&mut child, grace).await, TerminationReason::Cancelled)
            }
        };

        if let Some(h) = out_pump {
            let _ = h.await;
        }
        if let Some(h) = err_pump {
            let _ = h.await;
        }

        Ok(ExecResult {
            exit_code: status.as_ref().and_then(|s| s.code()),
            signal: status.as_ref().and_then(signal_name),
            stdout: snapshot_lossy(&stdout_buf),
            stderr: snapshot_lossy(&stderr_buf),
            duration: start.elapsed(),
            termination,
        })
    }
}

/// Resolve the effective deadline: `None` request → configured default,
/// zero → no deadline, anything else clamped to the configured ceiling.
fn effective_timeout(requested: Option<Duration>, config: &ExecConfig) -> Option<Duration> {
    let ceiling = Duration::from_millis(config.max_timeout_ms);
    match requested {
        None => Some(Duration::from_millis(config.timeout_ms).min(ceiling)),
        Some(d) if d.is_zero() => None,
        Some(d) => Some(d.min(ceiling)),
    }
}

async fn deadline(timeout: Option<Duration>) {
    match timeout {
        Some(d) => tokio::time::sleep(d).await,
        None => std::future::pending().await,
    }
}

/// Build the `bash -c` command with terminal isolation.
pub(crate) fn build_command(
    command: &str,
    workdir: Option<&std::path::Path>,
    env: &[(String, String)],
) -> Command {
    let mut cmd = Command::new("bash");
    cmd.arg("-c").arg(command);
    cmd.stdin(Stdio::null());
    cmd.stdout(Stdio::piped());
    cmd.stderr(Stdio::piped());
    // If the supervising future is dropped, tokio SIGKILLs the child before
    // releasing the handle; stragglers never outlive the supervisor.
    cmd.kill_on_drop(true);
    // setsid() detaches the child from the controlling terminal so it
    // cannot open /dev/tty behind the captured pipes.
    #[cfg(unix)]
    unsafe {
        cmd.pre_exec(|| {
            libc::setsid();
            Ok(())
        });
    }
    if let Some(wd) = workdir {
        cmd.current_dir(wd);
    }
    for (k, v) in env {
        cmd.env(k, v);
    }
    cmd
}

/// Copy a child stream into a shared bounded buffer until EOF.
pub(crate) fn pump<R>(mut reader: R, buf: SharedBuffer) -> JoinHandle<()>
where
    R: tokio::io::AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut chunk = [0u8; 8192];
        loop {
            match reader.read(&mut chunk).await {
                Ok(0) | Err(_) => break,
                Ok(n) => buf
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .write(&chunk[..n]),
            }
        }
    })
}

/// SIGTERM, then SIGKILL after the grace period if the process lingers.
pub(crate) async fn escalate(
    child: &mut Child,
    grace: Duration,
) -> Option<std::process::ExitStatus> {
    #[cfg(unix)]
    if let Some(pid) = child.id() {
        unsafe {
            libc::kill(pid as i32, libc::SIGTERM);
        }
    }
    match tokio::time::timeout(grace, child.wait()).await {
        Ok(Ok(status)) => Some(status),
        _ => {
            let _ = child.start_kill();
            child.wait().await.ok()
        }
    }
}

#[cfg(unix)]
pub(crate) fn signal_name(status: &std::process::ExitStatus) -> Option<String> {
    use std::os::unix::process::ExitStatusExt;
    status.signal().map(|n| match n {
        libc::SIGHUP => "SIGHUP".to_string(),
        libc::SIGINT => "SIGINT".to_string(),
        libc::SIGKILL => "SIGKILL".to_string(),
        libc::SIGTERM => "SIGTERM".to_string(),
        libc::SIGSEGV => "SIGSEGV".to_string(),
        other => format!("SIG{other}"),
    })
}

#[cfg(not(unix))]
pub(crate) fn signal_name(_status: &std::process::ExitStatus) -> Option<String> {
    None
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
