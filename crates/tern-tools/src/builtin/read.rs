// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::debug;

use crate::context::ExecutionContext;
use crate::tool::{OutputCategory, Tool, ToolCall, ToolOutput};

/// Default number of lines returned when the caller does not specify a limit.
const DEFAULT_LINE_LIMIT: usize = 2000;

const IMAGE_EXTENSIONS: [&str; 7] = ["png", "jpg", "jpeg", "gif", "webp", "bmp", "tiff"];

pub struct ReadTool;

#[async_trait]
impl Tool for ReadTool {
    fn name(&self) -> &str {
        "Read"
    }

    fn description(&self) -> &str {
        "Reads a file from the local filesystem.\n\
         - file_path must be absolute.\n\
         - Text is returned with 1-indexed line numbers; long lines are\n\
           truncated at the configured per-line limit.\n\
         - offset (starting line) and limit (line count) paginate large files.\n\
         - Images and binary files are classified rather than dumped;\n\
           notebooks (.ipynb) are rendered as a cell listing.\n\
         Reading a file records it for this session, which is what allows a\n\
         later Write to overwrite it."
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "file_path": {
                    "type": "string",
                    "description": "Absolute path to the file to read"
                },
                "offset": {
                    "type": "integer",
                    "description": "1-indexed line number to start reading from (default 1)"
                },
                "limit": {
                    "type": "integer",
                    "description": "Maximum number of lines to return (default 2000)"
                }
            },
            "required": ["file_path"],
            "additionalProperties": false
        })
    }

    fn read_only(&self) -> bool {
        true
    }

    fn output_category(&self) -> OutputCategory {
        OutputCategory::FileContent
    }

    fn validate(&self, input: &Value) -> Vec<String> {
        let mut violations = Vec::new();
        if let Some(p) = input["file_path"].as_str() {
            if !p.starts_with('/') {
                violations.push(format!("file_path must be absolute, got: {p}"));
            }
        }
        if input["offset"].as_i64().map(|o| o < 1).unwrap_or(false) {
            violations.push("offset must be >= 1".to_string());
        }
        violations
    }

    async fn execute(&self, call: &ToolCall, ctx: &ExecutionContext) -> ToolOutput {
        let path_str = match call.input["file_path"].as_str() {
            Some(p) => p,
            None => return ToolOutput::err(&call.id, "missing 'file_path'"),
        };
        let path = std::path::Path::new(path_str);
        let offset = call.input["offset"].as_u64().unwrap_or(1).max(1) as usize;
        let limit = call.input["limit"]
            .as_u64()
            .unwrap_or(DEFAULT_LINE_LIMIT as u64) as usize;

        debug!(path = %path.display(), offset, limit, "Read tool");

        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or("")
            .to_lowercase();

        // Image classification: report, don't dump bytes into context.
        if IMAGE_EXTENSIONS.contains(&ext.as_str()) {
            return match tokio::fs::metadata(path).await {
                Ok(meta) => {
                    ctx.state.record_read(path);
                    ToolOutput::ok(
                        &call.id,
                        format!("[image file: image/{ext}, {} bytes]", meta.len()),
                    )
                }
                Err(e) => ToolOutput::err(&call.id, format!("read error: {e}")),
            };
        }

        let bytes = match tokio::fs::read(path).await {
            Ok(b) => b,
            Err(e) => return ToolOutput::err(&call.id, format!("read error: {e}")),
        };
        ctx.state.record_read(path);

        // Notebooks get a structural rendering instead of raw JSON.
        if ext == "ipynb" {
            return match render_notebook(&bytes) {
                Ok(listing) => ToolOutput::ok(&call.id, listing),
                Err(e) => ToolOutput::err(&call.id, format!("notebook parse error: {e}")),
            };
        }

        if is_binary(&bytes) {
            return ToolOutput::ok(&call.id, format!("[binary file: {} bytes]", bytes.len()));
        }

        let line_limit = ctx.state.tools.read_line_limit;
        let text = String::from_utf8_lossy(&bytes);
        let all_lines: Vec<&str> = text.lines().collect();
        let total = all_lines.len();
        let start = offset - 1;

        let mut out = String::new();
        let mut shown = 0usize;
        for (i, line) in all_lines.iter().enumerate().skip(start).take(limit) {
            let rendered = if line.len() > line_limit {
                let mut cut = line_limit;
                while cut > 0 && !line.is_char_boundary(cut) {
                    cut -= 1;
                }
                format!("{}... [line truncated]", &line[..cut])
            } else {
                (*line).to_string()
            };
            out.push_str(&format!("{:>6}\t{}\n", i + 1, rendered));
            shown += 1;
        }

        if shown == 0 {
            return ToolOutput::ok(
                &call.id,
                format!("(file has {total} lines; offset {offset} is past the end)"),
            );
        }
        let last = start + shown;
        if last < total {
            out.push_str(&format!(
                "... [{} more lines; continue with offset={}]\n",
                total - last,
                last + 1
            ));
        }
        ToolOutput::ok(&call.id, out)
    }
}

/// NUL byte in the leading sample means binary.
fn is_binary(bytes: &[u8]) -> bool {
    bytes.iter().take(8192).any(|&b| b == 0)
}

/// Render a Jupyter notebook as an indexed cell listing.
fn render_notebook(bytes: &[u8]) -> Result<String, String> {
    let nb: Value = serde_json::from_slice(bytes).map_err(|e| e.to_string())?;
    let cells = nb["cells"]
        .as_array()
        .ok_or_else(|| "no cells array".to_string())?;
    let mut out = format!("[notebook: {} cells]\n", cells.len());
    for (i, cell) in cells.iter().enumerate() {
        let kind = cell["cell_type"].as_str().unwrap_or("unknown");
        let id = cell["id"].as_str().unwrap_or("-");
        let source = cell_source(cell);
        let preview: String = source.lines().take(12).collect::<Vec<_>>().join("\n");
        out.push_str(&format!("── cell {i} ({kind}, id={id}) ──\n{preview}\n"));
        let hidden = source.lines().count().saturating_sub(12);
        if hidden > 0 {
            out.push_str(&format!("... [{hidden} more lines]\n"));
        }
    }
    Ok(out)
}

/// Notebook cell source is either a string or an array of line strings.
pub(crate) fn cell_source(cell: &Value) -> String {
    match &cell["source"] {
        Value::String(s) => s.clone(),
        Value::Array(lines) => lines
            .iter()
            .filter_map(|l| l.as_str())
            .collect::<Vec<_>>()
            .join(""),
        _ => String::new(),
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
