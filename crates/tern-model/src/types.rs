use std::pin::Pin;

use async_trait::async_trait;
use futures::Stream;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::error::ApiError;

// ─── Message types ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    System,
    Tool,
}

/// A single tagged content block inside a message.
///
/// These are the four wire variants the model API understands.  Tool results
/// ride inside user-role messages; images are stored as raw base64 with their
/// media type and expanded to the provider's `source` shape at request time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    Text {
        text: String,
    },
    Image {
        media_type: String,
        data: String,
    },
    ToolUse {
        id: String,
        name: String,
        input: serde_json::Value,
    },
    ToolResult {
        tool_use_id: String,
        content: String,
        #[serde(default, skip_serializing_if = "std::ops::Not::not")]
        is_error: bool,
    },
}

impl ContentBlock {
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text { text: text.into() }
    }

    pub fn tool_result(tool_use_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self::ToolResult {
            tool_use_id: tool_use_id.into(),
            content: content.into(),
            is_error: false,
        }
    }

    pub fn tool_error(tool_use_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self::ToolResult {
            tool_use_id: tool_use_id.into(),
            content: content.into(),
            is_error: true,
        }
    }
}

/// A message in wire format: role plus an ordered list of content blocks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: Vec<ContentBlock>,
}

impl Message {
    pub fn user(text: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: vec![ContentBlock::text(text)],
        }
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: vec![ContentBlock::text(text)],
        }
    }

    pub fn system(text: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: vec![ContentBlock::text(text)],
        }
    }

    /// User-role message carrying one or more tool results (the tool-loop
    /// reply shape).
    pub fn tool_results(blocks: Vec<ContentBlock>) -> Self {
        Self {
            role: Role::User,
            content: blocks,
        }
    }

    /// The concatenated text of all `Text` blocks.
    pub fn text(&self) -> String {
        self.content
            .iter()
            .filter_map(|b| match b {
                ContentBlock::Text { text } => Some(text.as_str()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("")
    }

    /// All `ToolUse` blocks in this message, in order.
    pub fn tool_uses(&self) -> Vec<(&str, &str, &serde_json::Value)> {
        self.content
            .iter()
            .filter_map(|b| match b {
                ContentBlock::ToolUse { id, name, input } => {
                    Some((id.as_str(), name.as_str(), input))
                }
                _ => None,
            })
            .collect()
    }

    /// True when any block is a `ToolResult`.
    pub fn has_tool_results(&self) -> bool {
        self.content
            .iter()
            .any(|b| matches!(b, ContentBlock::ToolResult { .. }))
    }
}

/// A tool schema provided to the model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolSchema {
    pub name: String,
    pub description: String,
    /// JSON Schema of the input object
    pub input_schema: serde_json::Value,
}

// ─── Requests and streamed events ─────────────────────────────────────────────

/// Request sent to the model API.
#[derive(Debug, Clone, Default)]
pub struct CompletionRequest {
    pub model: String,
    pub messages: Vec<Message>,
    pub system: Option<String>,
    pub tools: Vec<ToolSchema>,
    pub max_tokens: u32,
    pub temperature: Option<f32>,
    pub top_p: Option<f32>,
    pub top_k: Option<u32>,
    pub stop_sequences: Vec<String>,
}

/// Why the model stopped generating.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    EndTurn,
    ToolUse,
    MaxTokens,
    StopSequence,
    #[serde(untagged)]
    Other(String),
}

impl StopReason {
    pub fn parse(s: &str) -> Self {
        match s {
            "end_turn" => Self::EndTurn,
            "tool_use" => Self::ToolUse,
            "max_tokens" => Self::MaxTokens,
            "stop_sequence" => Self::StopSequence,
            other => Self::Other(other.to_string()),
        }
    }
}

/// Token usage for one completion, merged incrementally from
/// `message_start` and `message_delta` events.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    pub input_tokens: u32,
    pub output_tokens: u32,
}

/// Kind of a streamed content block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockType {
    Text,
    ToolUse,
}

/// A typed event emitted by the streaming engine.
///
/// For a successful completion the sequence is: `MessageStart`, then per
/// block `BlockStart` / deltas / `BlockStop` (block indices may interleave),
/// `UsageUpdate`s, and exactly one terminal `MessageStop`.  A cancelled
/// stream terminates with `Cancelled` instead; a malformed payload yields a
/// `ParseError` and the stream continues.
#[derive(Debug, Clone)]
pub enum StreamEvent {
    MessageStart,
    BlockStart {
        index: u32,
        block_type: BlockType,
    },
    TextDelta {
        index: u32,
        text: String,
    },
    /// A fragment of a tool_use block's input JSON.
    JsonDelta {
        index: u32,
        partial: String,
    },
    BlockStop {
        index: u32,
    },
    UsageUpdate {
        usage: Usage,
    },
    /// Terminal event: the fully assembled message.
    MessageStop {
        content: Vec<ContentBlock>,
        usage: Usage,
        stop_reason: Option<StopReason>,
    },
    /// A payload that could not be parsed; the stream continues.
    ParseError {
        message: String,
    },
    /// Terminal event: the caller's cancellation token tripped.
    Cancelled,
}

pub type EventStream = Pin<Box<dyn Stream<Item = Result<StreamEvent, ApiError>> + Send>>;

/// A streaming model API client.
#[async_trait]
pub trait ModelClient: Send + Sync {
    /// Human-readable client name for status display.
    fn name(&self) -> &str;

    /// Model identifier as reported to users.
    fn model_name(&self) -> &str;

    /// Send a completion request and return the typed event stream.
    /// Tripping `cancel` aborts the underlying read and terminates the
    /// stream with a `Cancelled` event.
    async fn stream(
        &self,
        req: CompletionRequest,
        cancel: CancellationToken,
    ) -> Result<EventStream, ApiError>;
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    // ── Construction ─────────────────────────────────────────────────────────

    #[test]
    fn message_user_sets_role_and_text() {
        let m = Message::user("hello");
        assert_eq!(m.role, Role::User);
        assert_eq!(m.text(), "hello");
    }

    #[test]
    fn tool_results_message_is_user_role() {
        let m = Message::tool_results(vec![ContentBlock::tool_result("tu_1", "ok")]);
        assert_eq!(m.role, Role::User);
        assert!(m.has_tool_results());
    }

    #[test]
    fn tool_uses_extracts_blocks_in_order() {
        let m = Message {
            role: Role::Assistant,
            content: vec![
                ContentBlock::text("let me check"),
                ContentBlock::ToolUse {
                    id: "a".into(),
                    name: "Read".into(),
                    input: serde_json::json!({"file_path": "/x"}),
                },
                ContentBlock::ToolUse {
                    id: "b".into(),
                    name: "Grep".into(),
                    input: serde_json::json!({"pattern": "y"}),
                },
            ],
        };
        let uses = m.tool_uses();
        assert_eq!(uses.len(), 2);
        assert_eq!(uses[0].0, "a");
        assert_eq!(uses[1].1, "Grep");
    }

    // ── Wire serialization ────────────────────────────────────────────────────

    #[test]
    fn tool_use_block_serializes_with_type_tag() {
        let b = ContentBlock::ToolUse {
            id: "tu_1".into(),
            name: "Bash".into(),
            input: serde_json::json!({"command": "ls"}),
        };
        let json = serde_json::to_value(&b).unwrap();
        assert_eq!(json["type"], "tool_use");
        assert_eq!(json["id"], "tu_1");
        assert_eq!(json["input"]["command"], "ls");
    }

    #[test]
    fn tool_result_omits_is_error_when_false() {
        let b = ContentBlock::tool_result("tu_1", "fine");
        let json = serde_json::to_string(&b).unwrap();
        assert!(!json.contains("is_error"), "{json}");
        assert!(json.contains("tool_use_id"));
    }

    #[test]
    fn tool_result_includes_is_error_when_true() {
        let b = ContentBlock::tool_error("tu_1", "boom");
        let json = serde_json::to_value(&b).unwrap();
        assert_eq!(json["is_error"], true);
    }

    #[test]
    fn message_round_trips_through_json() {
        let m = Message {
            role: Role::Assistant,
            content: vec![
                ContentBlock::text("t"),
                ContentBlock::ToolUse {
                    id: "i".into(),
                    name: "n".into(),
                    input: serde_json::json!({}),
                },
            ],
        };
        let json = serde_json::to_string(&m).unwrap();
        let back: Message = serde_json::from_str(&json).unwrap();
        assert_eq!(back, m);
    }

    // ── Stop reason ───────────────────────────────────────────────────────────

    #[test]
    fn stop_reason_parses_known_values() {
        assert_eq!(StopReason::parse("end_turn"), StopReason::EndTurn);
        assert_eq!(StopReason::parse("tool_use"), StopReason::ToolUse);
        assert_eq!(StopReason::parse("max_tokens"), StopReason::MaxTokens);
    }

    #[test]
    fn stop_reason_preserves_unknown_values() {
        assert_eq!(
            StopReason::parse("pause_turn"),
            StopReason::Other("pause_turn".into())
        );
    }
}
