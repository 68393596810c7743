// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::path::Path;

use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::debug;
use uuid::Uuid;

use crate::context::ExecutionContext;
use crate::tool::{Tool, ToolCall, ToolOutput};

pub struct WriteTool;

#[async_trait]
impl Tool for WriteTool {
    fn name(&self) -> &str {
        "Write"
    }

    fn description(&self) -> &str {
        "Writes a file to the local filesystem, replacing any existing file.\n\
         - file_path must be absolute and its parent directory must exist.\n\
         - Overwriting a file that was not Read earlier in this session is\n\
           refused unless force is set; read it first to prove you have seen\n\
           its current content.\n\
         - The write is atomic (temp file + rename)."
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "file_path": {
                    "type": "string",
                    "description": "Absolute path of the file to write"
                },
                "content": {
                    "type": "string",
                    "description": "Full content to write"
                },
                "force": {
                    "type": "boolean",
                    "description": "Overwrite even if the file was not read this session"
                }
            },
            "required": ["file_path", "content"],
            "additionalProperties": false
        })
    }

    fn conflict_key(&self, input: &Value) -> Option<String> {
        input["file_path"].as_str().map(String::from)
    }

    fn validate(&self, input: &Value) -> Vec<String> {
        match input["file_path"].as_str() {
            Some(p) if !p.starts_with('/') => {
                vec![format!("file_path must be absolute, got: {p}")]
            }
            _ => Vec::new(),
        }
    }

    async fn execute(&self, call: &ToolCall, ctx: &ExecutionContext) -> ToolOutput {
        let path_str = match call.input["file_path"].as_str() {
            Some(p) => p,
            None => return ToolOutput::err(&call.id, "missing 'file_path'"),
        };
        let content = match call.input["content"].as_str() {
            Some(c) => c,
            None => return ToolOutput::err(&call.id, "missing 'content'"),
        };
        let force = call.input["force"].as_bool().unwrap_or(false);
        let path = Path::new(path_str);

        debug!(path = %path.display(), bytes = content.len(), "Write tool");

        let existed = path.exists();
        if existed && !force && !ctx.state.was_read(path) {
            return ToolOutput::err(
                &call.id,
                format!(
                    "refusing to overwrite {} — it was not read in this session; \
                     Read it first or pass force=true",
                    path.display()
                ),
            );
        }

        match atomic_write(path, content.as_bytes()).await {
            Ok(()) => {
                // The session now knows this file's content.
                ctx.state.record_read(path);
                let verb = if existed { "replaced" } else { "created" };
                ToolOutput::ok(
                    &call.id,
                    format!("{verb} {} ({} bytes)", path.display(), content.len()),
                )
            }
            Err(e) => ToolOutput::err(&call.id, format!("write error: {e}")),
        }
    }
}

/// Write via a temp file in the same directory, then rename over the
/// target.  Rename within one filesystem is atomic, so readers never see a
/// half-written file.
pub(crate) async fn atomic_write(path: &Path, content: &[u8]) -> std::io::Result<()> {
    let parent = path.parent().ok_or_else(|| {
        std::io::Error::new(std::io::ErrorKind::InvalidInput, "path has no parent")
    })?;
    let name = path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("unnamed");
    let tmp = parent.join(format!(".{name}.{}.tmp", Uuid::new_v4().simple()));
    tokio::fs::write(&tmp, content).await?;
    match tokio::fs::rename(&tmp, path).await {
        Ok(()) => Ok(()),
        Err(e) => {
            let _ = tokio::fs::remove_file(&tmp).await;
            Err(e)
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
