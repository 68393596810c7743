// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use tern_model::{ContentBlock, Message, Role};

use crate::estimate::estimate_message;

/// Conversation lifecycle.
///
/// ```text
/// idle ──receive-input──► waiting ──validated──► processing
/// processing ──stream-start──► streaming ──stream-end──► idle
/// {waiting, processing, streaming} ──failure──► error
/// error ──reset──► idle            anywhere ──terminate──► terminated
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConversationState {
    Idle,
    Waiting,
    Processing,
    Streaming,
    Error,
    Terminated,
}

impl ConversationState {
    pub fn can_transition(self, to: ConversationState) -> bool {
        use ConversationState::*;
        if self == Terminated {
            return false;
        }
        match (self, to) {
            (_, Terminated) => true,
            (Idle, Waiting) => true,
            (Waiting, Processing) => true,
            (Processing, Streaming) => true,
            (Streaming, Idle) => true,
            (Waiting | Processing | Streaming, Error) => true,
            (Error, Idle) => true,
            _ => false,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConversationError {
    #[error("invalid state transition: {from:?} -> {to:?}")]
    InvalidTransition {
        from: ConversationState,
        to: ConversationState,
    },
    #[error("message sequence violation: {0}")]
    SequenceViolation(String),
}

/// One stored message: the wire message plus bookkeeping the API never sees.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageRecord {
    pub id: String,
    pub message: Message,
    pub timestamp: DateTime<Utc>,
    pub token_estimate: usize,
    #[serde(default)]
    pub metadata: Value,
}

impl MessageRecord {
    pub fn new(message: Message) -> Self {
        let token_estimate = estimate_message(&message);
        Self {
            id: Uuid::new_v4().to_string(),
            message,
            timestamp: Utc::now(),
            token_estimate,
            metadata: Value::Null,
        }
    }

    pub fn with_metadata(mut self, metadata: Value) -> Self {
        self.metadata = metadata;
        self
    }
}

/// Role/time filter for read-only history views.
#[derive(Debug, Clone, Default)]
pub struct HistoryFilter {
    pub role: Option<Role>,
    pub since: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
}

/// Serialized form used by `/save` and `/load`; the Message schema inside
/// records round-trips losslessly.
#[derive(Debug, Serialize, Deserialize)]
pub struct ConversationSnapshot {
    pub id: String,
    pub model: String,
    pub system_prompt: Option<String>,
    pub records: Vec<MessageRecord>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Append-only message log with incremental token accounting and a state
/// machine.  Single-writer in normal operation (the agent loop).
#[derive(Debug)]
pub struct Conversation {
    pub id: String,
    pub model: String,
    records: Vec<MessageRecord>,
    system_prompt: Option<String>,
    state: ConversationState,
    token_count: usize,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Conversation {
    pub fn new(model: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            model: model.into(),
            records: Vec::new(),
            system_prompt: None,
            state: ConversationState::Idle,
            token_count: 0,
            created_at: now,
            updated_at: now,
        }
    }

    // ── Message log ──────────────────────────────────────────────────────────

    /// Validate the sequence invariants and append.  Plain-string content is
    /// normalized into a single text block by the `Message` constructors
    /// callers use.
    pub fn push_message(&mut self, message: Message) -> Result<&MessageRecord, ConversationError> {
        self.push_record(MessageRecord::new(message))
    }

    pub fn push_record(
        &mut self,
        record: MessageRecord,
    ) -> Result<&MessageRecord, ConversationError> {
        self.check_sequence(&record.message)?;
        self.token_count += record.token_estimate;
        self.updated_at = Utc::now();
        self.records.push(record);
        let last = self.records.len() - 1;
        Ok(&self.records[last])
    }

    fn check_sequence(&self, message: &Message) -> Result<(), ConversationError> {
        if self.records.is_empty() {
            if !matches!(message.role, Role::User | Role::System) {
                return Err(ConversationError::SequenceViolation(format!(
                    "first message must be user or system, got {:?}",
                    message.role
                )));
            }
        } else {
            // Assistant turns always alternate with user turns.  Repeated
            // user messages are tolerated (tool results and correction
            // prompts both ride in user-role messages).
            let prev = &self.records[self.records.len() - 1].message;
            if message.role == Role::Assistant && prev.role == Role::Assistant {
                return Err(ConversationError::SequenceViolation(
                    "assistant message cannot directly follow an assistant message".into(),
                ));
            }
        }

        // Every tool_result must reference a tool_use seen earlier.
        for block in &message.content {
            if let ContentBlock::ToolResult { tool_use_id, .. } = block {
                if !self.has_tool_use(tool_use_id) {
                    return Err(ConversationError::SequenceViolation(format!(
                        "tool_result references unknown tool_use id {tool_use_id:?}"
                    )));
                }
            }
        }
        Ok(())
    }

    fn has_tool_use(&self, id: &str) -> bool {
        self.records.iter().any(|r| {
            r.message
                .content
                .iter()
                .any(|b| matches!(b, ContentBlock::ToolUse { id: tid, .. } if tid == id))
        })
    }

    pub fn records(&self) -> &[MessageRecord] {
        &self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Messages in wire format, internal metadata stripped.
    pub fn wire_messages(&self) -> Vec<Message> {
        self.records.iter().map(|r| r.message.clone()).collect()
    }

    /// Read-only view with optional role/time filters.
    pub fn history(&self, filter: &HistoryFilter) -> Vec<&MessageRecord> {
        self.records
            .iter()
            .filter(|r| filter.role.map_or(true, |role| r.message.role == role))
            .filter(|r| filter.since.map_or(true, |t| r.timestamp >= t))
            .filter(|r| filter.until.map_or(true, |t| r.timestamp <= t))
            .collect()
    }

    // ── Token accounting ─────────────────────────────────────────────────────

    pub fn token_count(&self) -> usize {
        self.token_count
    }

    /// Recompute from scratch (after compaction rewrote the record list).
    pub fn recalculate_tokens(&mut self) {
        self.token_count = self.records.iter().map(|r| r.token_estimate).sum();
    }

    /// Replace the record list wholesale.  Used by the compactor and by
    /// `/load`; the caller is responsible for the new list's coherence.
    pub fn replace_records(&mut self, records: Vec<MessageRecord>) {
        self.records = records;
        self.recalculate_tokens();
        self.updated_at = Utc::now();
    }

    // ── System prompt / state ────────────────────────────────────────────────

    pub fn set_system_prompt(&mut self, prompt: impl Into<String>) {
        self.system_prompt = Some(prompt.into());
    }

    pub fn system_prompt(&self) -> Option<&str> {
        self.system_prompt.as_deref()
    }

    pub fn state(&self) -> ConversationState {
        self.state
    }

    pub fn set_state(&mut self, to: ConversationState) -> Result<(), ConversationError> {
        if !self.state.can_transition(to) {
            return Err(ConversationError::InvalidTransition {
                from: self.state,
                to,
            });
        }
        self.state = to;
        Ok(())
    }

    // ── Checkpointing ────────────────────────────────────────────────────────

    pub fn snapshot(&self) -> ConversationSnapshot {
        ConversationSnapshot {
            id: self.id.clone(),
            model: self.model.clone(),
            system_prompt: self.system_prompt.clone(),
            records: self.records.clone(),
            created_at: self.created_at,
            updated_at: self.updated_at,
        }
    }

    pub fn from_snapshot(snapshot: ConversationSnapshot) -> Self {
        let mut conv = Self {
            id: snapshot.id,
            model: snapshot.model,
            records: snapshot.records,
            system_prompt: snapshot.system_prompt,
            state: ConversationState::Idle,
            token_count: 0,
            created_at: snapshot.created_at,
            updated_at: snapshot.updated_at,
        };
        conv.recalculate_tokens();
        conv
    }

    /// Drop all messages, keeping identity and system prompt.
    pub fn clear(&mut self) {
        self.records.clear();
        self.token_count = 0;
        self.updated_at = Utc::now();
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
