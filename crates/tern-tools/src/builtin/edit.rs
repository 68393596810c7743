// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::path::Path;

use async_trait::async_trait;
use serde_json::{json, Value};
use similar::TextDiff;
use tracing::debug;

use crate::builtin::write::atomic_write;
use crate::context::ExecutionContext;
use crate::tool::{Tool, ToolCall, ToolOutput};

/// One exact-substring replacement against an in-memory buffer.
///
/// `old_string` must appear exactly once unless `replace_all` is set;
/// ambiguity is an error so the model adds more context instead of the
/// tool guessing which occurrence was meant.
fn apply_replacement(
    content: &str,
    old_string: &str,
    new_string: &str,
    replace_all: bool,
) -> Result<(String, usize), String> {
    let occurrences = content.matches(old_string).count();
    if occurrences == 0 {
        return Err(format!("old_string not found in file: {old_string:?}"));
    }
    if occurrences > 1 && !replace_all {
        return Err(format!(
            "old_string appears {occurrences} times; provide a larger unique \
             snippet or set replace_all=true"
        ));
    }
    let replaced = if replace_all {
        content.replace(old_string, new_string)
    } else {
        content.replacen(old_string, new_string, 1)
    };
    Ok((replaced, occurrences))
}

fn unified_diff(path: &Path, old: &str, new: &str) -> String {
    let name = path.display().to_string();
    TextDiff::from_lines(old, new)
        .unified_diff()
        .context_radius(3)
        .header(&name, &name)
        .to_string()
}

fn common_validate(input: &Value) -> Vec<String> {
    let mut violations = Vec::new();
    if let Some(p) = input["file_path"].as_str() {
        if !p.starts_with('/') {
            violations.push(format!("file_path must be absolute, got: {p}"));
        }
    }
    violations
}

pub struct EditTool;

#[async_trait]
impl Tool for EditTool {
    fn name(&self) -> &str {
        "Edit"
    }

    fn description(&self) -> &str {
        "Performs an exact string replacement in a file.\n\
         - old_string must match the file content exactly, including\n\
           whitespace and indentation.\n\
         - Fails if old_string is absent, or ambiguous without replace_all.\n\
         - Returns a unified diff of the change."
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "file_path": {
                    "type": "string",
                    "description": "Absolute path of the file to modify"
                },
                "old_string": {
                    "type": "string",
                    "description": "Exact text to replace"
                },
                "new_string": {
                    "type": "string",
                    "description": "Replacement text"
                },
                "replace_all": {
                    "type": "boolean",
                    "description": "Replace every occurrence (default false)"
                }
            },
            "required": ["file_path", "old_string", "new_string"],
            "additionalProperties": false
        })
    }

    fn conflict_key(&self, input: &Value) -> Option<String> {
        input["file_path"].as_str().map(String::from)
    }

    fn validate(&self, input: &Value) -> Vec<String> {
        let mut violations = common_validate(input);
        if let (Some(old), Some(new)) =
            (input["old_string"].as_str(), input["new_string"].as_str())
        {
            if old.is_empty() {
                violations.push("old_string must not be empty".to_string());
            }
            if old == new {
                violations.push("old_string and new_string are identical".to_string());
            }
        }
        violations
    }

    async fn execute(&self, call: &ToolCall, _ctx: &ExecutionContext) -> ToolOutput {
        let path_str = match call.input["file_path"].as_str() {
            Some(p) => p,
            None => return ToolOutput::err(&call.id, "missing 'file_path'"),
        };
        let old_string = call.input["old_string"].as_str().unwrap_or_default();
        let new_string = call.input["new_string"].as_str().unwrap_or_default();
        let replace_all = call.input["replace_all"].as_bool().unwrap_or(false);
        let path = Path::new(path_str);

        debug!(path = %path.display(), replace_all, "Edit tool");

        let content = match tokio::fs::read_to_string(path).await {
            Ok(c) => c,
            Err(e) => return ToolOutput::err(&call.id, format!("read error: {e}")),
        };
        let (updated, count) =
            match apply_replacement(&content, old_string, new_string, replace_all) {
                Ok(r) => r,
                Err(e) => return ToolOutput::err(&call.id, e),
            };
        if let Err(e) = atomic_write(path, updated.as_bytes()).await {
            return ToolOutput::err(&call.id, format!("write error: {e}"));
        }
        ToolOutput::ok(
            &call.id,
            format!(
                "replaced {count} occurrence(s)\n{}",
                unified_diff(path, &content, &updated)
            ),
        )
    }
}

pub struct MultiEditTool;

#[async_trait]
impl Tool for MultiEditTool {
    fn name(&self) -> &str {
        "MultiEdit"
    }

    fn description(&self) -> &str {
        "Applies several exact string replacements to one file in sequence.\n\
         Each edit operates on the buffer produced by the previous one; if\n\
         any edit fails to match, the whole batch is rejected and the file\n\
         is left untouched."
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "file_path": {
                    "type": "string",
                    "description": "Absolute path of the file to modify"
                },
                "edits": {
                    "type": "array",
                    "description": "Replacements applied in order",
                    "items": {
                        "type": "object",
                        "properties": {
                            "old_string": { "type": "string" },
                            "new_string": { "type": "string" },
                            "replace_all": { "type": "boolean" }
                        },
                        "required": ["old_string", "new_string"]
                    }
                }
            },
            "required": ["file_path", "edits"],
            "additionalProperties": false
        })
    }

    fn conflict_key(&self, input: &Value) -> Option<String> {
        input["file_path"].as_str().map(String::from)
    }

    fn validate(&self, input: &Value) -> Vec<String> {
        let mut violations = common_validate(input);
        match input["edits"].as_array() {
            Some(edits) if edits.is_empty() => {
                violations.push("edits must not be empty".to_string());
            }
            Some(edits) => {
                for (i, edit) in edits.iter().enumerate() {
                    if edit["old_string"].as_str().unwrap_or("").is_empty() {
                        violations.push(format!("edits[{i}].old_string must not be empty"));
                    }
                }
            }
            None => {}
        }
        violations
    }

    async fn execute(&self, call: &ToolCall, _ctx: &ExecutionContext) -> ToolOutput {
        let path_str = match call.input["file_path"].as_str() {
            Some(p) => p,
            None => return ToolOutput::err(&call.id, "missing 'file_path'"),
        };
        let edits = match call.input["edits"].as_array() {
            Some(e) => e,
            None => return ToolOutput::err(&call.id, "missing 'edits'"),
        };
        let path = Path::new(path_str);

        debug!(path = %path.display(), edits = edits.len(), "MultiEdit tool");

        let original = match tokio::fs::read_to_string(path).await {
            Ok(c) => c,
            Err(e) => return ToolOutput::err(&call.id, format!("read error: {e}")),
        };

        // All edits are applied against one in-memory buffer; nothing is
        // written unless every one of them matched.
        let mut buffer = original.clone();
        for (i, edit) in edits.iter().enumerate() {
            let old = edit["old_string"].as_str().unwrap_or_default();
            let new = edit["new_string"].as_str().unwrap_or_default();
            let all = edit["replace_all"].as_bool().unwrap_or(false);
            match apply_replacement(&buffer, old, new, all) {
                Ok((next, _)) => buffer = next,
                Err(e) => {
                    return ToolOutput::err(&call.id, format!("edit {} of {} failed: {e}", i + 1, edits.len()));
                }
            }
        }

        if let Err(e) = atomic_write(path, buffer.as_bytes()).await {
            return ToolOutput::err(&call.id, format!("write error: {e}"));
        }
        ToolOutput::ok(
            &call.id,
            format!(
                "applied {} edits\n{}",
                edits.len(),
                unified_diff(path, &original, &buffer)
            ),
        )
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
