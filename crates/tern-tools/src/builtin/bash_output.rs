// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::debug;

use crate::context::ExecutionContext;
use crate::tool::{OutputCategory, Tool, ToolCall, ToolOutput};

pub struct BashOutputTool;

#[async_trait]
impl Tool for BashOutputTool {
    fn name(&self) -> &str {
        "BashOutput"
    }

    fn description(&self) -> &str {
        "Retrieves output from a background task started by Bash with\n\
         run_in_background=true.  Non-destructive: reading the output does\n\
         not consume it.  The optional filter is a regex applied to complete\n\
         lines before any truncation."
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "bash_id": {
                    "type": "string",
                    "description": "Task id returned by Bash"
                },
                "filter": {
                    "type": "string",
                    "description": "Optional regex; only matching lines are returned"
                }
            },
            "required": ["bash_id"],
            "additionalProperties": false
        })
    }

    fn read_only(&self) -> bool {
        true
    }

    fn output_category(&self) -> OutputCategory {
        OutputCategory::HeadTail
    }

    async fn execute(&self, call: &ToolCall, ctx: &ExecutionContext) -> ToolOutput {
        let bash_id = match call.input["bash_id"].as_str() {
            Some(id) => id,
            None => return ToolOutput::err(&call.id, "missing 'bash_id'"),
        };
        let filter = call.input["filter"].as_str();

        debug!(bash_id, ?filter, "BashOutput tool");

        let out = match ctx.state.background.output(bash_id, filter) {
            Ok(o) => o,
            Err(e) => return ToolOutput::err(&call.id, e.to_string()),
        };

        let mut content = format!("status: {}", out.status);
        if let Some(code) = out.exit_code {
            content.push_str(&format!("\nexit code: {code}"));
        }
        if !out.stdout.is_empty() {
            content.push_str(&format!("\n[stdout] ({} lines)\n{}", out.stdout_lines, out.stdout));
        }
        if !out.stderr.is_empty() {
            content.push_str(&format!("\n[stderr] ({} lines)\n{}", out.stderr_lines, out.stderr));
        }
        ToolOutput::ok(&call.id, content)
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
