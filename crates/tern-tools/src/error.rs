// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use serde_json::Value;

/// Pipeline phase in which a dispatch error originated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchPhase {
    Resolve,
    Validate,
    Permission,
    Invoke,
    Format,
}

impl std::fmt::Display for DispatchPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Resolve => write!(f, "resolve"),
            Self::Validate => write!(f, "validate"),
            Self::Permission => write!(f, "permission"),
            Self::Invoke => write!(f, "invoke"),
            Self::Format => write!(f, "format"),
        }
    }
}

/// Typed error surfaced by the dispatch harness.  Each variant knows the
/// phase it originates from; inputs embedded in messages are redacted.
#[derive(Debug, thiserror::Error)]
pub enum ToolError {
    #[error("invalid parameters for {tool}: {}", violations.join("; "))]
    InvalidParameters { tool: String, violations: Vec<String> },

    #[error("permission denied for {tool}: {reason}")]
    PermissionDenied { tool: String, reason: String },

    #[error("tool not found: {name}")]
    ToolNotFound { name: String },

    #[error("forbidden path for {tool}: {path}")]
    ForbiddenPath { tool: String, path: String },

    #[error("{tool} timed out")]
    Timeout { tool: String },

    #[error("{tool} cancelled")]
    Cancelled { tool: String },

    #[error("{tool} failed: {message}")]
    ExecutionFailed { tool: String, message: String },
}

impl ToolError {
    pub fn phase(&self) -> DispatchPhase {
        match self {
            Self::ToolNotFound { .. } => DispatchPhase::Resolve,
            Self::InvalidParameters { .. } => DispatchPhase::Validate,
            Self::PermissionDenied { .. } | Self::ForbiddenPath { .. } => DispatchPhase::Permission,
            Self::Timeout { .. } | Self::Cancelled { .. } | Self::ExecutionFailed { .. } => {
                DispatchPhase::Invoke
            }
        }
    }

    pub fn tool_name(&self) -> &str {
        match self {
            Self::InvalidParameters { tool, .. }
            | Self::PermissionDenied { tool, .. }
            | Self::ForbiddenPath { tool, .. }
            | Self::Timeout { tool }
            | Self::Cancelled { tool }
            | Self::ExecutionFailed { tool, .. } => tool,
            Self::ToolNotFound { name } => name,
        }
    }
}

/// Case-insensitive substrings that mark a parameter as sensitive.
const SENSITIVE_KEY_MARKERS: [&str; 5] = ["password", "token", "key", "secret", "credential"];

pub const REDACTION_MARKER: &str = "[redacted]";

/// Replace the values of sensitive-looking keys before an input enters an
/// error record or a log line.  Applies recursively to nested objects and
/// arrays; key names themselves are preserved.
pub fn redact_input(input: &Value) -> Value {
    match input {
        Value::Object(map) => {
            let mut out = serde_json::Map::with_capacity(map.len());
            for (k, v) in map {
                let lowered = k.to_lowercase();
                if SENSITIVE_KEY_MARKERS.iter().any(|m| lowered.contains(m)) {
                    out.insert(k.clone(), Value::String(REDACTION_MARKER.into()));
                } else {
                    out.insert(k.clone(), redact_input(v));
                }
            }
            Value::Object(out)
        }
        Value::Array(items) => Value::Array(items.iter().map(redact_input).collect()),
        other => other.clone(),
    }
}

/// Strip the user's home-directory prefix from a path for display in error
/// records and stack frames.
pub fn strip_home_prefix(path: &str) -> String {
    if let Some(home) = std::env::var_os("HOME") {
        let home = home.to_string_lossy();
        if !home.is_empty() {
            if let Some(rest) = path.strip_prefix(home.as_ref()) {
                return format!("~{rest}");
            }
        }
    }
    path.to_string()
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
