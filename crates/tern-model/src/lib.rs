// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
pub mod circuit;
pub mod client;
pub mod error;
pub mod retry;
pub mod sse;
pub mod stream;
pub mod types;

pub use circuit::{CircuitBreaker, CircuitRegistry, CircuitState, CircuitStats};
pub use client::AnthropicClient;
pub use error::{ApiError, ErrorKind};
pub use retry::{retry_async, RetryPolicy, RetryingClient};
pub use sse::{SseDecoder, SseEvent, SseFrame};
pub use stream::StreamAssembler;
pub use types::{
    BlockType, CompletionRequest, ContentBlock, EventStream, Message, ModelClient, Role,
    StopReason, StreamEvent, ToolSchema, Usage,
};
