// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::collections::BTreeMap;

use serde_json::Value;
use tracing::warn;

use crate::error::ApiError;
use crate::types::{BlockType, ContentBlock, StopReason, StreamEvent, Usage};

/// In-flight state for one content block slot.
#[derive(Debug)]
enum BlockState {
    Text {
        text: String,
    },
    ToolUse {
        id: String,
        name: String,
        /// Accumulated `input_json_delta` fragments; parsed at block stop.
        partial_json: String,
        input: Option<Value>,
    },
}

/// Content-block state machine.
///
/// Consumes parsed model events (`message_start`, `content_block_*`,
/// `message_delta`, `message_stop`, `ping`, `error`) and emits the external
/// [`StreamEvent`] sequence.  Blocks are keyed by index; the map is ordered
/// so finalization reassembles content in index order even when blocks
/// complete out of order.
#[derive(Debug, Default)]
pub struct StreamAssembler {
    blocks: BTreeMap<u32, BlockState>,
    usage: Usage,
    stop_reason: Option<StopReason>,
}

impl StreamAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Process one model event and return the external events it produces.
    /// A wire-level `error` event terminates the stream as `Err`.
    pub fn feed(&mut self, v: &Value) -> Result<Vec<StreamEvent>, ApiError> {
        let event_type = v["type"].as_str().unwrap_or("");
        match event_type {
            "message_start" => {
                if let Some(usage) = v["message"].get("usage") {
                    self.usage.input_tokens = usage["input_tokens"].as_u64().unwrap_or(0) as u32;
                    self.usage.output_tokens = usage["output_tokens"].as_u64().unwrap_or(0) as u32;
                }
                Ok(vec![StreamEvent::MessageStart])
            }
            "content_block_start" => {
                let index = v["index"].as_u64().unwrap_or(0) as u32;
                let block = &v["content_block"];
                let (state, block_type) = match block["type"].as_str().unwrap_or("") {
                    "tool_use" => (
                        BlockState::ToolUse {
                            id: block["id"].as_str().unwrap_or("").to_string(),
                            name: block["name"].as_str().unwrap_or("").to_string(),
                            partial_json: String::new(),
                            input: None,
                        },
                        BlockType::ToolUse,
                    ),
                    _ => (
                        BlockState::Text {
                            text: block["text"].as_str().unwrap_or("").to_string(),
                        },
                        BlockType::Text,
                    ),
                };
                self.blocks.insert(index, state);
                Ok(vec![StreamEvent::BlockStart { index, block_type }])
            }
            "content_block_delta" => {
                let index = v["index"].as_u64().unwrap_or(0) as u32;
                let delta = &v["delta"];
                match delta["type"].as_str().unwrap_or("") {
                    "text_delta" => {
                        let text = delta["text"].as_str().unwrap_or("").to_string();
                        if let Some(BlockState::Text { text: buf }) = self.blocks.get_mut(&index) {
                            buf.push_str(&text);
                        }
                        Ok(vec![StreamEvent::TextDelta { index, text }])
                    }
                    "input_json_delta" => {
                        let partial = delta["partial_json"].as_str().unwrap_or("").to_string();
                        if let Some(BlockState::ToolUse { partial_json, .. }) =
                            self.blocks.get_mut(&index)
                        {
                            partial_json.push_str(&partial);
                        }
                        Ok(vec![StreamEvent::JsonDelta { index, partial }])
                    }
                    other => {
                        // Unknown delta variants (thinking, signatures) are
                        // not part of the assembled content.
                        warn!(delta_type = other, "ignoring unknown delta type");
                        Ok(vec![])
                    }
                }
            }
            "content_block_stop" => {
                let index = v["index"].as_u64().unwrap_or(0) as u32;
                let mut events = Vec::new();
                if let Some(BlockState::ToolUse {
                    partial_json,
                    input,
                    name,
                    ..
                }) = self.blocks.get_mut(&index)
                {
                    let raw = if partial_json.is_empty() {
                        "{}"
                    } else {
                        partial_json.as_str()
                    };
                    match serde_json::from_str::<Value>(raw) {
                        Ok(parsed) => *input = Some(parsed),
                        Err(e) => {
                            // The block is poisoned but the stream survives;
                            // the tool_use will carry an empty input object.
                            events.push(StreamEvent::ParseError {
                                message: format!("tool_use '{name}' input: {e}"),
                            });
                            *input = Some(Value::Object(Default::default()));
                        }
                    }
                }
                events.push(StreamEvent::BlockStop { index });
                Ok(events)
            }
            "message_delta" => {
                if let Some(reason) = v["delta"]["stop_reason"].as_str() {
                    self.stop_reason = Some(StopReason::parse(reason));
                }
                if let Some(usage) = v.get("usage") {
                    if let Some(out) = usage["output_tokens"].as_u64() {
                        self.usage.output_tokens = out as u32;
                    }
                    if let Some(inp) = usage["input_tokens"].as_u64() {
                        self.usage.input_tokens = inp as u32;
                    }
                }
                Ok(vec![StreamEvent::UsageUpdate { usage: self.usage }])
            }
            "message_stop" => {
                let content = self.finalize();
                Ok(vec![StreamEvent::MessageStop {
                    content,
                    usage: self.usage,
                    stop_reason: self.stop_reason.clone(),
                }])
            }
            "error" => {
                let message = v["error"]["message"]
                    .as_str()
                    .unwrap_or("unknown stream error")
                    .to_string();
                let kind = v["error"]["type"].as_str().unwrap_or("");
                Err(match kind {
                    "overloaded_error" => ApiError::Overloaded { message },
                    "rate_limit_error" => ApiError::RateLimit {
                        message,
                        reset_after: None,
                    },
                    _ => ApiError::ServerTransient {
                        status: 500,
                        message,
                    },
                })
            }
            "ping" => Ok(vec![]),
            other => {
                warn!(event_type = other, "ignoring unknown stream event type");
                Ok(vec![])
            }
        }
    }

    /// Assemble the final content blocks in index order.
    fn finalize(&mut self) -> Vec<ContentBlock> {
        let blocks = std::mem::take(&mut self.blocks);
        blocks
            .into_values()
            .map(|state| match state {
                BlockState::Text { text } => ContentBlock::Text { text },
                BlockState::ToolUse {
                    id, name, input, ..
                } => ContentBlock::ToolUse {
                    id,
                    name,
                    input: input.unwrap_or_else(|| Value::Object(Default::default())),
                },
            })
            .collect()
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
