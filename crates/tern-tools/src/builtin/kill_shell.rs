// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::debug;

use crate::context::ExecutionContext;
use crate::tool::{Tool, ToolCall, ToolOutput};

pub struct KillShellTool;

#[async_trait]
impl Tool for KillShellTool {
    fn name(&self) -> &str {
        "KillShell"
    }

    fn description(&self) -> &str {
        "Stops a running background task by its id.  The task receives\n\
         SIGTERM, then SIGKILL after a grace period; its status becomes\n\
         'killed' and its captured output remains retrievable with\n\
         BashOutput.  Killing a task that already finished is reported as a\n\
         failure and changes nothing."
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "shell_id": {
                    "type": "string",
                    "description": "Task id returned by Bash"
                }
            },
            "required": ["shell_id"],
            "additionalProperties": false
        })
    }

    async fn execute(&self, call: &ToolCall, ctx: &ExecutionContext) -> ToolOutput {
        let shell_id = match call.input["shell_id"].as_str() {
            Some(id) => id,
            None => return ToolOutput::err(&call.id, "missing 'shell_id'"),
        };
        debug!(shell_id, "KillShell tool");
        match ctx.state.background.kill(shell_id) {
            Ok(()) => ToolOutput::ok(&call.id, format!("kill requested for task {shell_id}")),
            Err(e) => ToolOutput::err(&call.id, e.to_string()),
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
    use std::time::Duration;
    use tern_config::{ExecConfig, ToolsConfig};
    use tern_exec::TaskStatus;

    fn ctx() -> ExecutionContext {
        ExecutionContext::new(
            "s",
            PathBuf::from("/tmp"),
            Arc::new(SessionState::new(
                ExecConfig::default(),
                ToolsConfig::default(),
            )),
        )
    }

    fn call(input: Value) -> ToolCall {
        ToolCall {
            id: "k1".into(),
            name: "KillShell".into(),
            input,
        }
    }

    #[tokio::test]
    async fn kills_a_running_task() {
        let c = ctx();
        let id = c
            .state
            .background
            .spawn("sleep 30", None, &[], "s")
            .unwrap();
        let out = KillShellTool
            .execute(&call(json!({"shell_id": id})), &c)
            .await;
        assert!(!out.is_error, "{}", out.content);

        for _ in 0..100 {
            if c.state.background.get(&id).unwrap().status == TaskStatus::Killed {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("task never transitioned to killed");
    }

    #[tokio::test]
    async fn killing_a_finished_task_fails() {
        let c = ctx();
        let id = c.state.background.spawn("true", None, &[], "s").unwrap();
        for _ in 0..100 {
            if c.state.background.get(&id).unwrap().status != TaskStatus::Running {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        let out = KillShellTool
            .execute(&call(json!({"shell_id": id})), &c)
            .await;
        assert!(out.is_error);
        assert!(out.content.contains("not running"));
    }

    #[tokio::test]
    async fn unknown_task_fails() {
        let out = KillShellTool
            .execute(&call(json!({"shell_id": "bash_nope"})), &ctx())
            .await;
        assert!(out.is_error);
    }
}
