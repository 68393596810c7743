// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;

use futures::StreamExt;
use serde_json::json;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use tern_config::{AgentConfig, ModelConfig};
use tern_model::{
    CompletionRequest, ContentBlock, Message, ModelClient, StopReason, StreamEvent, ToolSchema,
};
use tern_tools::{ExecutionContext, Harness, SessionState, ToolCall, ToolProgress};

use crate::compact::{maybe_compact, smart_truncate, CompactorConfig};
use crate::conversation::{Conversation, ConversationState, MessageRecord};
use crate::events::AgentEvent;

/// Outcome of one streamed model call.
enum Turn {
    Completed {
        content: Vec<ContentBlock>,
        stop_reason: Option<StopReason>,
    },
    Cancelled {
        partial_text: String,
    },
}

/// The top-level coordinator: alternates model streaming with tool dispatch
/// until the model returns without further tool calls.  Owns the
/// conversation; everything else is injected.
pub struct Agent {
    conversation: Conversation,
    client: Arc<dyn ModelClient>,
    harness: Harness,
    state: Arc<SessionState>,
    agent_cfg: Arc<AgentConfig>,
    model_cfg: Arc<ModelConfig>,
    compactor: CompactorConfig,
    workdir: PathBuf,
}

impl Agent {
    pub fn new(
        client: Arc<dyn ModelClient>,
        harness: Harness,
        state: Arc<SessionState>,
        agent_cfg: Arc<AgentConfig>,
        model_cfg: Arc<ModelConfig>,
        workdir: PathBuf,
    ) -> Self {
        let compactor = CompactorConfig::from_agent(&agent_cfg);
        let mut conversation = Conversation::new(model_cfg.name.clone());
        if let Some(prompt) = &agent_cfg.system_prompt {
            conversation.set_system_prompt(prompt.clone());
        }
        Self {
            conversation,
            client,
            harness,
            state,
            agent_cfg,
            model_cfg,
            compactor,
            workdir,
        }
    }

    pub fn conversation(&self) -> &Conversation {
        &self.conversation
    }

    pub fn conversation_mut(&mut self) -> &mut Conversation {
        &mut self.conversation
    }

    pub fn session_state(&self) -> &Arc<SessionState> {
        &self.state
    }

    /// Switch the model used for subsequent completions.
    pub fn set_model(&mut self, model: impl Into<String>) {
        self.conversation.model = model.into();
    }

    /// Push a user message, run the agent loop, and stream events through
    /// the sender.  A trip of `cancel` during streaming or tool execution
    /// aborts the turn; any partial assistant text is still committed to
    /// the conversation with a cancelled marker.
    pub async fn submit(
        &mut self,
        user_input: &str,
        tx: mpsc::Sender<AgentEvent>,
        cancel: CancellationToken,
    ) -> anyhow::Result<()> {
        if cancel.is_cancelled() {
            let _ = tx
                .send(AgentEvent::Aborted {
                    partial_text: String::new(),
                })
                .await;
            return Ok(());
        }

        // A previous failed turn leaves the conversation in Error; a new
        // submission implicitly resets it.
        if self.conversation.state() == ConversationState::Error {
            self.conversation.set_state(ConversationState::Idle)?;
        }
        self.conversation.set_state(ConversationState::Waiting)?;
        self.conversation.push_message(Message::user(user_input))?;
        self.conversation.set_state(ConversationState::Processing)?;
        self.check_compaction(&tx).await;

        match self.run_loop(&tx, &cancel).await {
            Ok(()) => Ok(()),
            Err(e) => {
                let _ = self.conversation.set_state(ConversationState::Error);
                let _ = tx.send(AgentEvent::Error(e.to_string())).await;
                Err(e)
            }
        }
    }

    /// The main loop: model call → optional tool calls → repeat.
    async fn run_loop(
        &mut self,
        tx: &mpsc::Sender<AgentEvent>,
        cancel: &CancellationToken,
    ) -> anyhow::Result<()> {
        let mut rounds = 0u32;

        loop {
            rounds += 1;
            if rounds > self.agent_cfg.max_tool_rounds {
                // Give the model one final tool-free turn to summarise
                // instead of stopping abruptly.
                self.conversation.push_message(Message::user(format!(
                    "You have reached the maximum tool-call budget ({} rounds). \
                     Do not call any more tools; summarise what was completed \
                     and what remains.",
                    self.agent_cfg.max_tool_rounds
                )))?;
                match self.stream_turn(tx, cancel, false).await? {
                    Turn::Completed { content, .. } => {
                        let text = text_of(&content);
                        if !content.is_empty() {
                            self.push_assistant(content)?;
                        }
                        if !text.is_empty() {
                            let _ = tx.send(AgentEvent::TextComplete(text)).await;
                        }
                    }
                    Turn::Cancelled { partial_text } => {
                        self.commit_cancelled(&partial_text)?;
                        let _ = tx.send(AgentEvent::Aborted { partial_text }).await;
                        return Ok(());
                    }
                }
                let _ = tx.send(AgentEvent::TurnComplete).await;
                let _ = self.conversation.set_state(ConversationState::Idle);
                return Ok(());
            }

            let turn = self.stream_turn(tx, cancel, true).await?;
            let (content, _stop_reason) = match turn {
                Turn::Cancelled { partial_text } => {
                    self.commit_cancelled(&partial_text)?;
                    let _ = tx.send(AgentEvent::Aborted { partial_text }).await;
                    return Ok(());
                }
                Turn::Completed {
                    content,
                    stop_reason,
                } => (content, stop_reason),
            };

            let text = text_of(&content);
            let tool_uses: Vec<(String, String, serde_json::Value)> = content
                .iter()
                .filter_map(|b| match b {
                    ContentBlock::ToolUse { id, name, input } => {
                        Some((id.clone(), name.clone(), input.clone()))
                    }
                    _ => None,
                })
                .collect();

            if !content.is_empty() {
                self.push_assistant(content)?;
            }
            if !text.is_empty() {
                let _ = tx.send(AgentEvent::TextComplete(text)).await;
            }

            if tool_uses.is_empty() {
                let _ = tx.send(AgentEvent::TurnComplete).await;
                let _ = self.conversation.set_state(ConversationState::Idle);
                return Ok(());
            }

            let results = self.dispatch_tools(&tool_uses, tx, cancel).await;
            self.conversation
                .push_message(Message::tool_results(results))?;

            // Mid-loop budget gate: a single large tool result must not ride
            // unchecked into the next model call.
            self.check_compaction(tx).await;
        }
    }

    /// One streamed model call.  Returns the assembled content, or the
    /// accumulated partial text when the stream was cancelled.
    async fn stream_turn(
        &mut self,
        tx: &mpsc::Sender<AgentEvent>,
        cancel: &CancellationToken,
        with_tools: bool,
    ) -> anyhow::Result<Turn> {
        let tools: Vec<ToolSchema> = if with_tools {
            self.harness
                .registry()
                .schemas()
                .into_iter()
                .map(|s| ToolSchema {
                    name: s.name,
                    description: s.description,
                    input_schema: s.input_schema,
                })
                .collect()
        } else {
            Vec::new()
        };

        let req = CompletionRequest {
            model: self.conversation.model.clone(),
            messages: self.conversation.wire_messages(),
            system: self.conversation.system_prompt().map(str::to_string),
            tools,
            max_tokens: self.model_cfg.max_tokens,
            temperature: self.model_cfg.temperature,
            top_p: self.model_cfg.top_p,
            top_k: self.model_cfg.top_k,
            stop_sequences: self.model_cfg.stop_sequences.clone(),
        };

        self.walk_to_streaming()?;
        let mut stream = self.client.stream(req, cancel.clone()).await?;

        let mut partial_text = String::new();
        while let Some(event) = stream.next().await {
            match event? {
                StreamEvent::TextDelta { text, .. } if !text.is_empty() => {
                    partial_text.push_str(&text);
                    let _ = tx.send(AgentEvent::TextDelta(text)).await;
                }
                StreamEvent::UsageUpdate { usage } => {
                    let _ = tx
                        .send(AgentEvent::TokenUsage {
                            input: usage.input_tokens,
                            output: usage.output_tokens,
                            context_total: self.conversation.token_count(),
                        })
                        .await;
                }
                StreamEvent::MessageStop {
                    content,
                    stop_reason,
                    ..
                } => {
                    let _ = self.conversation.set_state(ConversationState::Idle);
                    return Ok(Turn::Completed {
                        content,
                        stop_reason,
                    });
                }
                StreamEvent::Cancelled => {
                    let _ = self.conversation.set_state(ConversationState::Idle);
                    return Ok(Turn::Cancelled { partial_text });
                }
                StreamEvent::ParseError { message } => {
                    warn!(error = %message, "poison event in model stream");
                    let _ = tx.send(AgentEvent::Error(message)).await;
                }
                _ => {}
            }
        }
        anyhow::bail!("model stream ended without message_stop")
    }

    /// Dispatch the turn's tool calls and build the result blocks.
    ///
    /// Reconciliation: every tool-use id starts in `in_progress` and moves
    /// to exactly one of resolved/errored.  Any id left over at the end —
    /// a batch slot lost to cancellation — gets a synthetic error result so
    /// the log never carries an unanswered tool_use.
    async fn dispatch_tools(
        &mut self,
        uses: &[(String, String, serde_json::Value)],
        tx: &mpsc::Sender<AgentEvent>,
        cancel: &CancellationToken,
    ) -> Vec<ContentBlock> {
        let mut in_progress: HashSet<String> = uses.iter().map(|(id, _, _)| id.clone()).collect();
        let mut resolved: HashSet<String> = HashSet::new();
        let mut errored: HashSet<String> = HashSet::new();

        let calls: Vec<ToolCall> = uses
            .iter()
            .map(|(id, name, input)| {
                ToolCall {
                    id: id.clone(),
                    name: name.clone(),
                    input: input.clone(),
                }
            })
            .collect();
        for call in &calls {
            let _ = tx
                .send(AgentEvent::ToolCallStarted {
                    call_id: call.id.clone(),
                    tool_name: call.name.clone(),
                    input: call.input.clone(),
                })
                .await;
        }

        // Progress events flow to the caller while the batch runs.
        let (ptx, mut prx) = mpsc::channel::<ToolProgress>(64);
        let forward_tx = tx.clone();
        let forwarder = tokio::spawn(async move {
            while let Some(p) = prx.recv().await {
                let _ = forward_tx
                    .send(AgentEvent::ToolProgress {
                        call_id: p.call_id,
                        message: p.message,
                    })
                    .await;
            }
        });

        let ctx = ExecutionContext::new(
            self.conversation.id.clone(),
            self.workdir.clone(),
            self.state.clone(),
        )
        .with_cancel(cancel.clone())
        .with_progress(ptx);
        let results = self.harness.dispatch_batch(calls, &ctx).await;
        drop(ctx);
        let _ = forwarder.await;

        let cap = self.agent_cfg.tool_result_token_cap;
        let mut blocks = Vec::with_capacity(uses.len());
        for ((id, name, _), result) in uses.iter().zip(results) {
            match result {
                Ok(r) => {
                    let content = smart_truncate(&r.content, r.category, cap);
                    let _ = tx
                        .send(AgentEvent::ToolCallFinished {
                            call_id: id.clone(),
                            tool_name: r.tool_name.clone(),
                            output: content.clone(),
                            is_error: r.is_error,
                        })
                        .await;
                    if r.is_error {
                        errored.insert(id.clone());
                    } else {
                        resolved.insert(id.clone());
                    }
                    blocks.push(ContentBlock::ToolResult {
                        tool_use_id: id.clone(),
                        content,
                        is_error: r.is_error,
                    });
                }
                Err(e) => {
                    let message = e.to_string();
                    let _ = tx
                        .send(AgentEvent::ToolCallFinished {
                            call_id: id.clone(),
                            tool_name: name.clone(),
                            output: message.clone(),
                            is_error: true,
                        })
                        .await;
                    errored.insert(id.clone());
                    blocks.push(ContentBlock::tool_error(id.clone(), message));
                }
            }
            in_progress.remove(id);
        }

        for id in in_progress {
            warn!(call_id = %id, "tool call never resolved; synthesizing cancellation");
            blocks.push(ContentBlock::tool_error(
                id,
                "tool invocation cancelled before completion",
            ));
        }
        debug_assert_eq!(resolved.intersection(&errored).count(), 0);
        blocks
    }

    fn push_assistant(&mut self, content: Vec<ContentBlock>) -> anyhow::Result<()> {
        self.conversation.push_message(Message {
            role: tern_model::Role::Assistant,
            content,
        })?;
        Ok(())
    }

    /// Commit cancelled partial output so the log stays coherent.
    fn commit_cancelled(&mut self, partial_text: &str) -> anyhow::Result<()> {
        if !partial_text.is_empty() {
            self.conversation.push_record(
                MessageRecord::new(Message::assistant(partial_text))
                    .with_metadata(json!({"cancelled": true})),
            )?;
        }
        let _ = self.conversation.set_state(ConversationState::Idle);
        Ok(())
    }

    async fn check_compaction(&mut self, tx: &mpsc::Sender<AgentEvent>) {
        if let Some(outcome) = maybe_compact(&mut self.conversation, &self.compactor) {
            let _ = tx
                .send(AgentEvent::ContextCompacted {
                    tokens_before: outcome.tokens_before,
                    tokens_after: outcome.tokens_after,
                    boundary: outcome.boundary,
                })
                .await;
        }
    }

    /// Advance the state machine to Streaming along legal edges.
    fn walk_to_streaming(&mut self) -> anyhow::Result<()> {
        loop {
            match self.conversation.state() {
                ConversationState::Streaming => return Ok(()),
                ConversationState::Idle => {
                    self.conversation.set_state(ConversationState::Waiting)?
                }
                ConversationState::Waiting => {
                    self.conversation.set_state(ConversationState::Processing)?
                }
                ConversationState::Processing => {
                    self.conversation.set_state(ConversationState::Streaming)?
                }
                other => anyhow::bail!("cannot stream from state {other:?}"),
            }
        }
    }
}

fn text_of(content: &[ContentBlock]) -> String {
    content
        .iter()
        .filter_map(|b| match b {
            ContentBlock::Text { text } => Some(text.as_str()),
            _ => None,
        })
        .collect::<Vec<_>>()
        .join("")
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
