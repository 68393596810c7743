// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use async_trait::async_trait;
use serde_json::Value;

use crate::context::ExecutionContext;

/// A single tool invocation requested by the model.
#[derive(Debug, Clone)]
pub struct ToolCall {
    /// Opaque identifier from the model's tool_use block (forwarded verbatim)
    pub id: String,
    pub name: String,
    /// Parsed JSON input object
    pub input: Value,
}

/// The result of executing a tool.
#[derive(Debug, Clone)]
pub struct ToolOutput {
    pub call_id: String,
    pub content: String,
    /// If true, the tool execution failed non-fatally (returned error message).
    pub is_error: bool,
}

impl ToolOutput {
    /// Successful plain-text result.
    pub fn ok(call_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            call_id: call_id.into(),
            content: content.into(),
            is_error: false,
        }
    }

    /// Error result containing a plain-text error message.
    pub fn err(call_id: impl Into<String>, msg: impl Into<String>) -> Self {
        Self {
            call_id: call_id.into(),
            content: msg.into(),
            is_error: true,
        }
    }
}

/// Describes the shape of a tool's text output for context-aware truncation.
///
/// When a tool result exceeds the configured token cap, the agent uses this
/// category to pick the right extraction strategy.  Each tool declares its
/// own category; the agent never hard-codes tool names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OutputCategory {
    /// Terminal / process output: keep head and tail lines so both the
    /// command preamble and the final result are visible.
    HeadTail,
    /// Ordered match list: keep the leading matches.
    MatchList,
    /// File content: keep head and tail windows with a separator.
    FileContent,
    /// Generic text: hard-truncate at the nearest line boundary.
    #[default]
    Generic,
}

/// Trait that every built-in and user-defined tool must implement.
///
/// Capability probes have defaults so a minimal tool only implements the
/// identity methods, the schema, and `execute`.  The dispatch harness probes
/// the optional behaviors and applies defaults (no extra validation, no
/// conflict key, identity result mapping).
#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;
    fn description(&self) -> &str;
    /// JSON Schema for the input object.
    fn input_schema(&self) -> Value;

    /// True when the tool never mutates anything observable.
    fn read_only(&self) -> bool {
        false
    }

    /// Whether the parallel executor may batch this tool with others.
    fn concurrency_safe(&self) -> bool {
        self.read_only()
    }

    /// The writable resource this invocation claims, if any.  The parallel
    /// executor serializes invocations that claim the same key.
    fn conflict_key(&self, _input: &Value) -> Option<String> {
        None
    }

    /// Tool-specific semantic checks beyond the schema (absolute paths,
    /// mutually exclusive flags).  Returns the list of violations.
    fn validate(&self, _input: &Value) -> Vec<String> {
        Vec::new()
    }

    /// Output shape hint for context-aware truncation.
    fn output_category(&self) -> OutputCategory {
        OutputCategory::Generic
    }

    /// Execute the tool.  Soft failures are reported via
    /// [`ToolOutput::err`]; progress events go through the context sink and
    /// always precede the returned result.
    async fn execute(&self, call: &ToolCall, ctx: &ExecutionContext) -> ToolOutput;

    /// Map the raw output into the text embedded in the tool_result block.
    /// The default is the identity mapping.
    fn format_result(&self, output: &ToolOutput) -> String {
        output.content.clone()
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
