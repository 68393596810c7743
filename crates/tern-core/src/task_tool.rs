// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tracing::debug;

use tern_config::{AgentConfig, ModelConfig, ToolsConfig};
use tern_model::ModelClient;
use tern_tools::{
    builtin_registry_for, ExecutionContext, Harness, PermissionGate, Tool, ToolCall, ToolOutput,
};

use crate::agent::Agent;
use crate::events::AgentEvent;

/// Launches a sub-agent: a nested agent loop with its own tool subset and
/// conversation, sharing the parent's session state (background tasks,
/// read history).  Returns the sub-agent's final textual output.
pub struct TaskTool {
    client: Arc<dyn ModelClient>,
    agent_cfg: Arc<AgentConfig>,
    model_cfg: Arc<ModelConfig>,
    tools_cfg: ToolsConfig,
    depth: Arc<AtomicUsize>,
}

impl TaskTool {
    pub fn new(
        client: Arc<dyn ModelClient>,
        agent_cfg: Arc<AgentConfig>,
        model_cfg: Arc<ModelConfig>,
        tools_cfg: ToolsConfig,
    ) -> Self {
        Self {
            client,
            agent_cfg,
            model_cfg,
            tools_cfg,
            depth: Arc::new(AtomicUsize::new(0)),
        }
    }
}

#[async_trait]
impl Tool for TaskTool {
    fn name(&self) -> &str {
        "Task"
    }

    fn description(&self) -> &str {
        "Spawns a sub-agent to complete a focused task and returns its final\n\
         text output.  The sub-agent runs its own model/tool loop with the\n\
         standard tool set (but cannot spawn further Task agents beyond the\n\
         depth limit).  subagent_type 'search' uses the configured search\n\
         model when one is set."
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "prompt": {
                    "type": "string",
                    "description": "Task description for the sub-agent"
                },
                "subagent_type": {
                    "type": "string",
                    "description": "general (default) or search"
                }
            },
            "required": ["prompt"],
            "additionalProperties": false
        })
    }

    fn validate(&self, input: &Value) -> Vec<String> {
        match input["subagent_type"].as_str() {
            Some(t) if !["general", "search"].contains(&t) => {
                vec![format!("unknown subagent_type: {t}")]
            }
            _ => Vec::new(),
        }
    }

    async fn execute(&self, call: &ToolCall, ctx: &ExecutionContext) -> ToolOutput {
        let prompt = match call.input["prompt"].as_str() {
            Some(p) => p.to_string(),
            None => return ToolOutput::err(&call.id, "missing 'prompt'"),
        };
        let subagent_type = call.input["subagent_type"].as_str().unwrap_or("general");

        let current = self.depth.load(Ordering::Relaxed);
        if current >= self.agent_cfg.subagent_max_depth {
            return ToolOutput::err(
                &call.id,
                format!(
                    "maximum sub-agent depth ({}) reached",
                    self.agent_cfg.subagent_max_depth
                ),
            );
        }
        self.depth.fetch_add(1, Ordering::Relaxed);
        debug!(prompt = %prompt, subagent_type, depth = current + 1, "spawning sub-agent");

        let registry = match builtin_registry_for(&self.tools_cfg, None) {
            Ok(r) => r,
            Err(e) => {
                self.depth.fetch_sub(1, Ordering::Relaxed);
                return ToolOutput::err(&call.id, format!("sub-agent registry error: {e}"));
            }
        };
        let gate = Arc::new(PermissionGate::from_config(&self.tools_cfg));
        let harness = Harness::new(registry, gate);

        let mut agent = Agent::new(
            self.client.clone(),
            harness,
            ctx.state.clone(),
            self.agent_cfg.clone(),
            self.model_cfg.clone(),
            ctx.workdir.clone(),
        );
        if subagent_type == "search" {
            if let Some(model) = &self.model_cfg.search_model {
                agent.set_model(model.clone());
            }
        }

        // Collect on a separate task: the event channel must drain while the
        // sub-agent runs, or a long transcript would wedge it.
        let (tx, mut rx) = mpsc::channel::<AgentEvent>(64);
        let collector = tokio::spawn(async move {
            let mut text = String::new();
            while let Some(event) = rx.recv().await {
                if let AgentEvent::TextComplete(t) = event {
                    if !text.is_empty() {
                        text.push('\n');
                    }
                    text.push_str(&t);
                }
            }
            text
        });

        let submit_result = agent.submit(&prompt, tx, ctx.cancel.clone()).await;
        let text = collector.await.unwrap_or_default();
        self.depth.fetch_sub(1, Ordering::Relaxed);

        match submit_result {
            Ok(()) if text.is_empty() => {
                ToolOutput::ok(&call.id, "(sub-agent produced no text output)")
            }
            Ok(()) => ToolOutput::ok(&call.id, text),
            Err(e) => ToolOutput::err(&call.id, format!("sub-agent error: {e}")),
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
