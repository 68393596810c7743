// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::debug;

use tern_exec::{ExecRequest, TerminationReason};

use crate::context::ExecutionContext;
use crate::tool::{OutputCategory, Tool, ToolCall, ToolOutput};

pub struct BashTool;

#[async_trait]
impl Tool for BashTool {
    fn name(&self) -> &str {
        "Bash"
    }

    fn description(&self) -> &str {
        "Executes a shell command via bash -c and returns stdout + stderr.\n\n\
         - timeout is in milliseconds (default 120000); values above the\n\
           configured ceiling (600000 by default) are clamped.  On expiry\n\
           the process receives SIGTERM, then SIGKILL after a grace period.\n\
         - run_in_background=true returns a task id immediately; retrieve\n\
           output with BashOutput and stop the task with KillShell.\n\
         - Output is captured into a bounded buffer; only the most recent\n\
           portion of very long output is retained.\n\n\
         Prefer the dedicated tools over shell equivalents:\n\
         - Read files with Read, not cat/head/tail\n\
         - Search content with Grep, not grep/rg\n\
         - Edit files with Edit, not sed/awk\n\
         Quote paths containing spaces. Chain dependent commands with '&&';\n\
         avoid commands that require a TTY."
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "command": {
                    "type": "string",
                    "description": "The command to execute"
                },
                "timeout": {
                    "type": "integer",
                    "description": "Timeout in milliseconds (0 disables; clamped to the configured ceiling)"
                },
                "run_in_background": {
                    "type": "boolean",
                    "description": "Run the command as a background task"
                },
                "session": {
                    "type": "string",
                    "description": "Run in a named persistent shell session; state (cwd, env) carries over between calls"
                },
                "workdir": {
                    "type": "string",
                    "description": "Working directory (default: session working directory)"
                }
            },
            "required": ["command"],
            "additionalProperties": false
        })
    }

    fn output_category(&self) -> OutputCategory {
        OutputCategory::HeadTail
    }

    fn validate(&self, input: &Value) -> Vec<String> {
        let mut violations = Vec::new();
        if input["command"]
            .as_str()
            .map(|c| c.trim().is_empty())
            .unwrap_or(false)
        {
            violations.push("command must not be empty".to_string());
        }
        // The timeout ceiling lives in ExecConfig and is enforced by the
        // executor's clamp, so an operator-raised limit is honored here too.
        if input["run_in_background"].as_bool() == Some(true)
            && input.get("session").map(|s| !s.is_null()).unwrap_or(false)
        {
            violations.push("run_in_background and session are mutually exclusive".to_string());
        }
        violations
    }

    async fn execute(&self, call: &ToolCall, ctx: &ExecutionContext) -> ToolOutput {
        let command = match call.input["command"].as_str() {
            Some(c) => c.to_string(),
            None => return ToolOutput::err(&call.id, "missing 'command'"),
        };
        let workdir = call.input["workdir"]
            .as_str()
            .map(|w| ctx.resolve_path(w))
            .unwrap_or_else(|| ctx.workdir.clone());
        let background = call.input["run_in_background"].as_bool().unwrap_or(false);

        debug!(command = %command, background, "Bash tool");

        // Danger validation applies to both modes, before any spawn.
        if let Err(e) = ctx.state.executor.validate_command(&command) {
            return ToolOutput::err(&call.id, e.to_string());
        }

        // Persistent shell session: the command runs in a long-lived shell
        // keyed by name, so cwd and environment persist between calls.
        if let Some(session) = call.input["session"].as_str() {
            return match ctx.state.shells.execute(session, &command).await {
                Ok(r) => {
                    let mut content = r.stdout;
                    if !r.stderr.is_empty() {
                        if !content.is_empty() {
                            content.push('\n');
                        }
                        content.push_str("[stderr]\n");
                        content.push_str(&r.stderr);
                    }
                    match r.exit_code {
                        Some(0) | None => ToolOutput::ok(&call.id, content),
                        Some(code) => {
                            ToolOutput::err(&call.id, format!("[exit {code}]\n{content}"))
                        }
                    }
                }
                Err(e) => ToolOutput::err(&call.id, e.to_string()),
            };
        }

        if background {
            return match ctx.state.background.spawn(
                &command,
                Some(&workdir),
                &ctx.env,
                &ctx.session_id,
            ) {
                Ok(task_id) => ToolOutput::ok(
                    &call.id,
                    format!(
                        "Started background task {task_id}.\n\
                         Use BashOutput with bash_id=\"{task_id}\" to read its output, \
                         and KillShell to stop it."
                    ),
                ),
                Err(e) => ToolOutput::err(&call.id, format!("spawn error: {e}")),
            };
        }

        ctx.emit_progress(&call.id, format!("$ {command}")).await;

        let mut req = ExecRequest::new(&command);
        req.workdir = Some(workdir);
        req.env = ctx.env.clone();
        req.timeout = call.input["timeout"].as_u64().map(Duration::from_millis);

        let result = match ctx.state.executor.run(req, ctx.cancel.clone()).await {
            Ok(r) => r,
            Err(e) => return ToolOutput::err(&call.id, e.to_string()),
        };

        let mut content = String::new();
        if !result.stdout.is_empty() {
            content.push_str(&result.stdout);
        }
        if !result.stderr.is_empty() {
            if !content.is_empty() {
                content.push('\n');
            }
            content.push_str("[stderr]\n");
            content.push_str(&result.stderr);
        }

        match result.termination {
            TerminationReason::TimedOut => ToolOutput::err(
                &call.id,
                format!(
                    "command timed out after {}ms (killed with {})\n{content}",
                    result.duration.as_millis(),
                    result.signal.as_deref().unwrap_or("signal"),
                ),
            ),
            TerminationReason::Cancelled => {
                ToolOutput::err(&call.id, format!("command cancelled\n{content}"))
            }
            TerminationReason::KilledByCaller => {
                ToolOutput::err(&call.id, format!("command killed\n{content}"))
            }
            TerminationReason::Exited => {
                let code = result.exit_code.unwrap_or(-1);
                if code == 0 {
                    if content.is_empty() {
                        content = "[exit 0]".to_string();
                    }
                    ToolOutput::ok(&call.id, content)
                } else {
                    ToolOutput::err(&call.id, format!("[exit {code}]\n{content}"))
                }
            }
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::SessionState;
    use std::path::PathBuf;
    use std::sync::Arc;
    use tern_config::{ExecConfig, ToolsConfig};
    use tern_exec::TaskStatus;

    fn ctx() -> ExecutionContext {
        ExecutionContext::new(
            "sess-bash",
            PathBuf::from("/tmp"),
            Arc::new(SessionState::new(
                ExecConfig::default(),
                ToolsConfig::default(),
            )),
        )
    }

    fn call(input: Value) -> ToolCall {
        ToolCall {
            id: "b1".into(),
            name: "Bash".into(),
            input,
        }
    }

    #[tokio::test]
    async fn foreground_captures_output() {
        let out = BashTool.execute(&call(json!({"command": "echo hi"})), &ctx()).await;
        assert!(!out.is_error, "{}", out.content);
        assert!(out.content.contains("hi"));
    }

    #[tokio::test]
    async fn nonzero_exit_is_an_error_with_code() {
        let out = BashTool
            .execute(&call(json!({"command": "echo boom >&2; exit 3"})), &ctx())
            .await;
        assert!(out.is_error);
        assert!(out.content.contains("[exit 3]"));
        assert!(out.content.contains("boom"));
    }

    #[tokio::test]
    async fn timeout_reports_timed_out() {
        let out = BashTool
            .execute(
                &call(json!({"command": "sleep 5", "timeout": 100})),
                &ctx(),
            )
            .await;
        assert!(out.is_error);
        assert!(out.content.contains("timed out"), "{}", out.content);
        assert!(
            out.content.contains("SIGTERM") || out.content.contains("SIGKILL"),
            "{}",
            out.content
        );
    }

    #[tokio::test]
    async fn dangerous_command_is_rejected() {
        let out = BashTool
            .execute(&call(json!({"command": "rm -rf / "})), &ctx())
            .await;
        assert!(out.is_error);
        assert!(out.content.contains("rejected"));
    }

    #[tokio::test]
    async fn background_returns_task_id_immediately() {
        let c = ctx();
        let out = BashTool
            .execute(
                &call(json!({
                    "command": "printf 'a\\nb\\nc\\n'; sleep 0.1",
                    "run_in_background": true
                })),
                &c,
            )
            .await;
        assert!(!out.is_error, "{}", out.content);
        let task_id = out
            .content
            .split_whitespace()
            .find(|w| w.starts_with("bash_"))
            .unwrap()
            .trim_end_matches('.')
            .to_string();

        // Poll the supervisor until the task completes.
        for _ in 0..100 {
            if let Some(s) = c.state.background.get(&task_id) {
                if s.status != TaskStatus::Running {
                    break;
                }
            }
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        }
        let output = c.state.background.output(&task_id, None).unwrap();
        assert_eq!(output.status, TaskStatus::Completed);
        assert_eq!(output.exit_code, Some(0));
        assert!(output.stdout.contains("a\nb\nc"));
    }

    #[test]
    fn oversized_timeout_is_left_to_the_executor_clamp() {
        // No validation rejection: the executor clamps to ExecConfig's
        // ceiling, which an operator may have raised.
        let v = BashTool.validate(&json!({"command": "ls", "timeout": 700_000}));
        assert!(v.is_empty(), "{v:?}");
    }

    #[test]
    fn background_and_session_are_mutually_exclusive() {
        let v = BashTool.validate(&json!({
            "command": "ls",
            "run_in_background": true,
            "session": "main"
        }));
        assert!(v.iter().any(|x| x.contains("mutually exclusive")));
    }

    #[tokio::test]
    async fn named_session_preserves_state_between_calls() {
        let c = ctx();
        let export = call(json!({"command": "export BASH_TOOL_MARK=kept", "session": "s1"}));
        let out = BashTool.execute(&export, &c).await;
        assert!(!out.is_error, "{}", out.content);
        let echo = call(json!({"command": "echo $BASH_TOOL_MARK", "session": "s1"}));
        let out = BashTool.execute(&echo, &c).await;
        assert!(out.content.contains("kept"), "{}", out.content);
    }
}
