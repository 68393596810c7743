// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::path::Path;

use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::debug;
use uuid::Uuid;

use crate::builtin::write::atomic_write;
use crate::context::ExecutionContext;
use crate::tool::{Tool, ToolCall, ToolOutput};

pub struct NotebookEditTool;

#[async_trait]
impl Tool for NotebookEditTool {
    fn name(&self) -> &str {
        "NotebookEdit"
    }

    fn description(&self) -> &str {
        "Edits a Jupyter notebook (.ipynb).\n\
         - Address a cell by cell_id or by 0-based cell_index (one of the\n\
           two, never both).\n\
         - edit_mode: replace (default) rewrites the cell source; insert\n\
           adds a new cell after the addressed one (or at the top with\n\
           cell_index=-1); delete removes the cell.\n\
         Cell metadata and execution counts are preserved on replace."
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "notebook_path": {
                    "type": "string",
                    "description": "Absolute path to the .ipynb file"
                },
                "cell_id": {
                    "type": "string",
                    "description": "Id of the cell to edit"
                },
                "cell_index": {
                    "type": "integer",
                    "description": "0-based index of the cell to edit"
                },
                "new_source": {
                    "type": "string",
                    "description": "New cell source (replace / insert)"
                },
                "cell_type": {
                    "type": "string",
                    "description": "code or markdown (insert only; default code)"
                },
                "edit_mode": {
                    "type": "string",
                    "description": "replace | insert | delete (default replace)"
                }
            },
            "required": ["notebook_path"],
            "additionalProperties": false
        })
    }

    fn conflict_key(&self, input: &Value) -> Option<String> {
        input["notebook_path"].as_str().map(String::from)
    }

    fn validate(&self, input: &Value) -> Vec<String> {
        let mut violations = Vec::new();
        if let Some(p) = input["notebook_path"].as_str() {
            if !p.starts_with('/') {
                violations.push(format!("notebook_path must be absolute, got: {p}"));
            }
        }
        let mode = input["edit_mode"].as_str().unwrap_or("replace");
        if !["replace", "insert", "delete"].contains(&mode) {
            violations.push(format!("unknown edit_mode: {mode}"));
        }
        let has_id = input.get("cell_id").map(|v| !v.is_null()).unwrap_or(false);
        let has_index = input.get("cell_index").map(|v| !v.is_null()).unwrap_or(false);
        if has_id && has_index {
            violations.push("cell_id and cell_index are mutually exclusive".to_string());
        }
        if !has_id && !has_index {
            violations.push("one of cell_id or cell_index is required".to_string());
        }
        if mode != "delete" && input["new_source"].as_str().is_none() {
            violations.push(format!("new_source is required for edit_mode={mode}"));
        }
        if let Some(t) = input["cell_type"].as_str() {
            if !["code", "markdown"].contains(&t) {
                violations.push(format!("unknown cell_type: {t}"));
            }
        }
        violations
    }

    async fn execute(&self, call: &ToolCall, _ctx: &ExecutionContext) -> ToolOutput {
        let path_str = match call.input["notebook_path"].as_str() {
            Some(p) => p,
            None => return ToolOutput::err(&call.id, "missing 'notebook_path'"),
        };
        let path = Path::new(path_str);
        let mode = call.input["edit_mode"].as_str().unwrap_or("replace");

        debug!(path = %path.display(), mode, "NotebookEdit tool");

        let bytes = match tokio::fs::read(path).await {
            Ok(b) => b,
            Err(e) => return ToolOutput::err(&call.id, format!("read error: {e}")),
        };
        let mut nb: Value = match serde_json::from_slice(&bytes) {
            Ok(v) => v,
            Err(e) => return ToolOutput::err(&call.id, format!("notebook parse error: {e}")),
        };
        let Some(cells) = nb["cells"].as_array_mut() else {
            return ToolOutput::err(&call.id, "notebook has no cells array");
        };

        // Resolve the addressed cell.  For insert, cell_index = -1 means
        // "insert at the top" and no existing cell is required.
        let index = match locate_cell(cells, &call.input, mode) {
            Ok(i) => i,
            Err(e) => return ToolOutput::err(&call.id, e),
        };

        let summary = match mode {
            "replace" => {
                let source = call.input["new_source"].as_str().unwrap_or_default();
                let cell = &mut cells[index];
                cell["source"] = source_lines(source);
                format!(
                    "replaced source of cell {index} ({})",
                    cell["cell_type"].as_str().unwrap_or("unknown")
                )
            }
            "insert" => {
                let source = call.input["new_source"].as_str().unwrap_or_default();
                let cell_type = call.input["cell_type"].as_str().unwrap_or("code");
                let mut cell = json!({
                    "cell_type": cell_type,
                    "id": Uuid::new_v4().simple().to_string(),
                    "metadata": {},
                    "source": source_lines(source),
                });
                if cell_type == "code" {
                    cell["execution_count"] = Value::Null;
                    cell["outputs"] = json!([]);
                }
                cells.insert(index, cell);
                format!("inserted {cell_type} cell at index {index}")
            }
            "delete" => {
                let removed = cells.remove(index);
                format!(
                    "deleted cell {index} ({})",
                    removed["cell_type"].as_str().unwrap_or("unknown")
                )
            }
            other => return ToolOutput::err(&call.id, format!("unknown edit_mode: {other}")),
        };

        let serialized = match serde_json::to_string_pretty(&nb) {
            Ok(s) => s,
            Err(e) => return ToolOutput::err(&call.id, format!("serialize error: {e}")),
        };
        match atomic_write(path, serialized.as_bytes()).await {
            Ok(()) => ToolOutput::ok(&call.id, summary),
            Err(e) => ToolOutput::err(&call.id, format!("write error: {e}")),
        }
    }
}

/// Find the target position: by id, or by index.  For insert mode the
/// returned position is where the new cell goes (after the addressed cell,
/// or 0 for cell_index = -1).
fn locate_cell(cells: &[Value], input: &Value, mode: &str) -> Result<usize, String> {
    if let Some(id) = input["cell_id"].as_str() {
        let found = cells
            .iter()
            .position(|c| c["id"].as_str() == Some(id))
            .ok_or_else(|| format!("no cell with id {id:?}"))?;
        return Ok(if mode == "insert" { found + 1 } else { found });
    }
    let index = input["cell_index"]
        .as_i64()
        .ok_or_else(|| "cell_index must be an integer".to_string())?;
    if mode == "insert" {
        if index == -1 {
            return Ok(0);
        }
        let index = usize::try_from(index).map_err(|_| "cell_index out of range".to_string())?;
        if index >= cells.len() {
            return Err(format!("cell_index {index} out of range (0..{})", cells.len()));
        }
        return Ok(index + 1);
    }
    let index = usize::try_from(index).map_err(|_| "cell_index out of range".to_string())?;
    if index >= cells.len() {
        return Err(format!("cell_index {index} out of range (0..{})", cells.len()));
    }
    Ok(index)
}

/// nbformat stores source as an array of lines, each keeping its newline.
fn source_lines(source: &str) -> Value {
    if source.is_empty() {
        return json!([]);
    }
    let mut lines: Vec<String> = source
        .split_inclusive('\n')
        .map(str::to_string)
        .collect();
    if lines.is_empty() {
        lines.push(source.to_string());
    }
    json!(lines)
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::SessionState;
    use std::path::PathBuf;
    use std::sync::Arc;
    use tern_config::{ExecConfig, ToolsConfig};

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

    fn notebook() -> Value {
        json!({
            "cells": [
                {"cell_type": "markdown", "id": "intro", "metadata": {"tags": ["keep"]},
                 "source": ["# Title\n"]},
                {"cell_type": "code", "id": "calc", "metadata": {},
                 "execution_count": 7, "outputs": [], "source": ["x = 1\n"]},
            ],
            "metadata": {"kernelspec": {"name": "python3"}},
            "nbformat": 4,
            "nbformat_minor": 5
        })
    }

    fn write_notebook(dir: &tempfile::TempDir) -> PathBuf {
        let p = dir.path().join("nb.ipynb");
        std::fs::write(&p, serde_json::to_vec(&notebook()).unwrap()).unwrap();
        p
    }

    fn call(input: Value) -> ToolCall {
        ToolCall {
            id: "n1".into(),
            name: "NotebookEdit".into(),
            input,
        }
    }

    fn read_back(p: &Path) -> Value {
        serde_json::from_slice(&std::fs::read(p).unwrap()).unwrap()
    }

    // ── Replace ───────────────────────────────────────────────────────────────

    #[tokio::test]
    async fn replace_by_id_preserves_metadata_and_execution_count() {
        let dir = tempfile::tempdir().unwrap();
        let p = write_notebook(&dir);
        let out = NotebookEditTool
            .execute(
                &call(json!({
                    "notebook_path": p.to_str().unwrap(),
                    "cell_id": "calc",
                    "new_source": "x = 2\ny = 3\n"
                })),
                &ctx(),
            )
            .await;
        assert!(!out.is_error, "{}", out.content);
        let nb = read_back(&p);
        let cell = &nb["cells"][1];
        assert_eq!(cell["source"][0], "x = 2\n");
        assert_eq!(cell["source"][1], "y = 3\n");
        assert_eq!(cell["execution_count"], 7);
        assert_eq!(cell["id"], "calc");
    }

    #[tokio::test]
    async fn replace_by_index() {
        let dir = tempfile::tempdir().unwrap();
        let p = write_notebook(&dir);
        let out = NotebookEditTool
            .execute(
                &call(json!({
                    "notebook_path": p.to_str().unwrap(),
                    "cell_index": 0,
                    "new_source": "# New Title\n"
                })),
                &ctx(),
            )
            .await;
        assert!(!out.is_error, "{}", out.content);
        let nb = read_back(&p);
        assert_eq!(nb["cells"][0]["source"][0], "# New Title\n");
        assert_eq!(nb["cells"][0]["metadata"]["tags"][0], "keep");
    }

    // ── Insert ────────────────────────────────────────────────────────────────

    #[tokio::test]
    async fn insert_after_addressed_cell() {
        let dir = tempfile::tempdir().unwrap();
        let p = write_notebook(&dir);
        let out = NotebookEditTool
            .execute(
                &call(json!({
                    "notebook_path": p.to_str().unwrap(),
                    "cell_id": "intro",
                    "edit_mode": "insert",
                    "cell_type": "code",
                    "new_source": "import os\n"
                })),
                &ctx(),
            )
            .await;
        assert!(!out.is_error, "{}", out.content);
        let nb = read_back(&p);
        let cells = nb["cells"].as_array().unwrap();
        assert_eq!(cells.len(), 3);
        assert_eq!(cells[1]["cell_type"], "code");
        assert_eq!(cells[1]["source"][0], "import os\n");
        assert!(cells[1]["outputs"].as_array().unwrap().is_empty());
    }

    #[tokio::test]
    async fn insert_at_top_with_negative_index() {
        let dir = tempfile::tempdir().unwrap();
        let p = write_notebook(&dir);
        let out = NotebookEditTool
            .execute(
                &call(json!({
                    "notebook_path": p.to_str().unwrap(),
                    "cell_index": -1,
                    "edit_mode": "insert",
                    "cell_type": "markdown",
                    "new_source": "preamble"
                })),
                &ctx(),
            )
            .await;
        assert!(!out.is_error, "{}", out.content);
        let nb = read_back(&p);
        assert_eq!(nb["cells"][0]["cell_type"], "markdown");
        assert_eq!(nb["cells"][0]["source"][0], "preamble");
    }

    // ── Delete ────────────────────────────────────────────────────────────────

    #[tokio::test]
    async fn delete_by_id_removes_the_cell() {
        let dir = tempfile::tempdir().unwrap();
        let p = write_notebook(&dir);
        let out = NotebookEditTool
            .execute(
                &call(json!({
                    "notebook_path": p.to_str().unwrap(),
                    "cell_id": "intro",
                    "edit_mode": "delete"
                })),
                &ctx(),
            )
            .await;
        assert!(!out.is_error, "{}", out.content);
        let nb = read_back(&p);
        let cells = nb["cells"].as_array().unwrap();
        assert_eq!(cells.len(), 1);
        assert_eq!(cells[0]["id"], "calc");
    }

    // ── Validation ────────────────────────────────────────────────────────────

    #[test]
    fn id_and_index_together_are_rejected() {
        let v = NotebookEditTool.validate(&json!({
            "notebook_path": "/nb.ipynb",
            "cell_id": "a",
            "cell_index": 0,
            "new_source": "x"
        }));
        assert!(v.iter().any(|x| x.contains("mutually exclusive")));
    }

    #[test]
    fn replace_without_new_source_is_rejected() {
        let v = NotebookEditTool.validate(&json!({
            "notebook_path": "/nb.ipynb",
            "cell_index": 0
        }));
        assert!(v.iter().any(|x| x.contains("new_source")));
    }

    #[tokio::test]
    async fn unknown_cell_id_is_a_soft_error() {
        let dir = tempfile::tempdir().unwrap();
        let p = write_notebook(&dir);
        let out = NotebookEditTool
            .execute(
                &call(json!({
                    "notebook_path": p.to_str().unwrap(),
                    "cell_id": "ghost",
                    "new_source": "x"
                })),
                &ctx(),
            )
            .await;
        assert!(out.is_error);
        assert!(out.content.contains("no cell with id"));
    }
}
