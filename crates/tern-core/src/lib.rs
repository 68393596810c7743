// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
mod agent;
mod compact;
mod conversation;
mod estimate;
mod events;
mod task_tool;

pub use agent::Agent;
pub use compact::{maybe_compact, smart_truncate, CompactionOutcome, CompactorConfig};
pub use conversation::{
    Conversation, ConversationError, ConversationSnapshot, ConversationState, HistoryFilter,
    MessageRecord,
};
pub use estimate::{estimate_block, estimate_document, estimate_message, estimate_text};
pub use events::AgentEvent;
pub use task_tool::TaskTool;
