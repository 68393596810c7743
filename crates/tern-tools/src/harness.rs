// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tracing::{debug, warn};

use crate::context::ExecutionContext;
use crate::error::{redact_input, ToolError};
use crate::hooks::{HookBus, HookEvent};
use crate::permission::{Decision, PermissionGate};
use crate::registry::ToolRegistry;
use crate::tool::{OutputCategory, Tool, ToolCall};

/// Consulted when the permission gate answers `ask`.
#[async_trait]
pub trait ApprovalHandler: Send + Sync {
    /// Return true to let the invocation proceed.
    async fn approve(&self, tool: &str, input: &Value, reason: &str) -> bool;
}

/// The formatted outcome of one dispatched invocation, ready to embed as a
/// tool_result content block.
#[derive(Debug, Clone)]
pub struct DispatchResult {
    pub call_id: String,
    pub tool_name: String,
    pub content: String,
    pub is_error: bool,
    pub category: OutputCategory,
}

/// The unifying execution pipeline every tool call traverses:
/// resolve → validate → permission → pre-hook → invoke → post-hook → format.
///
/// Resolve/validate/permission failures surface as typed errors to the
/// caller; failures inside the tool come back as a result with `is_error`
/// set, mirroring the tool-loop protocol.
#[derive(Clone)]
pub struct Harness {
    registry: Arc<ToolRegistry>,
    gate: Arc<PermissionGate>,
    hooks: Arc<HookBus>,
    approver: Option<Arc<dyn ApprovalHandler>>,
}

impl Harness {
    pub fn new(registry: Arc<ToolRegistry>, gate: Arc<PermissionGate>) -> Self {
        Self {
            registry,
            gate,
            hooks: Arc::new(HookBus::new()),
            approver: None,
        }
    }

    pub fn with_hooks(mut self, hooks: Arc<HookBus>) -> Self {
        self.hooks = hooks;
        self
    }

    pub fn with_approver(mut self, approver: Arc<dyn ApprovalHandler>) -> Self {
        self.approver = Some(approver);
        self
    }

    pub fn registry(&self) -> &Arc<ToolRegistry> {
        &self.registry
    }

    /// Dispatch a single invocation through all pipeline phases.
    pub async fn dispatch(
        &self,
        call: &ToolCall,
        ctx: &ExecutionContext,
    ) -> Result<DispatchResult, ToolError> {
        // Phase 1: resolve (alias-aware).
        let tool = self.registry.get(&call.name)?;
        let tool_name = tool.name().to_string();

        // Phase 2: validate — schema shape plus tool-specific checks.
        // No side effects may occur before this passes.
        let violations = validate_input(tool.as_ref(), &call.input);
        if !violations.is_empty() {
            debug!(tool = %tool_name, input = %redact_input(&call.input), "validation failed");
            return Err(ToolError::InvalidParameters {
                tool: tool_name,
                violations,
            });
        }

        // Phase 3: permission.
        let mut input = call.input.clone();
        match self.gate.check(&tool_name, &input) {
            Decision::Allow => {}
            Decision::AllowUpdated(updated) => {
                // A substituted input must satisfy the same contract the
                // original was checked against.
                let violations = validate_input(tool.as_ref(), &updated);
                if !violations.is_empty() {
                    return Err(ToolError::InvalidParameters {
                        tool: tool_name,
                        violations,
                    });
                }
                input = updated;
            }
            Decision::ForbiddenPath(reason) => {
                return Err(ToolError::ForbiddenPath {
                    tool: tool_name,
                    path: reason,
                });
            }
            Decision::Deny(reason) => {
                return Err(ToolError::PermissionDenied {
                    tool: tool_name,
                    reason,
                });
            }
            Decision::Ask(reason) => match &self.approver {
                Some(approver) => {
                    if !approver.approve(&tool_name, &input, &reason).await {
                        return Err(ToolError::PermissionDenied {
                            tool: tool_name,
                            reason: "declined by user".into(),
                        });
                    }
                }
                None => {
                    return Err(ToolError::PermissionDenied {
                        tool: tool_name,
                        reason: format!("{reason} (no interactive approver available)"),
                    });
                }
            },
        }

        // Phase 4: pre-invocation hook.  Handler errors are logged by the
        // bus and never abort the invocation.
        self.hooks.fire(&HookEvent::ToolPre {
            name: tool_name.clone(),
            input: input.clone(),
        });

        // Phase 5: invoke.  Progress events flow through the context sink
        // while we wait; cancellation wins over a result not yet produced.
        let exec_call = ToolCall {
            id: call.id.clone(),
            name: tool_name.clone(),
            input: input.clone(),
        };
        let output = tokio::select! {
            biased;
            _ = ctx.cancel.cancelled() => {
                return Err(ToolError::Cancelled { tool: tool_name });
            }
            out = tool.execute(&exec_call, ctx) => out,
        };

        // Phase 6: post-invocation hook.
        self.hooks.fire(&HookEvent::ToolPost {
            name: tool_name.clone(),
            input,
            content: output.content.clone(),
            is_error: output.is_error,
        });

        // Phase 7: format.
        let content = tool.format_result(&output);
        Ok(DispatchResult {
            call_id: call.id.clone(),
            tool_name,
            content,
            is_error: output.is_error,
            category: tool.output_category(),
        })
    }

    /// Dispatch a batch, in parallel when safe.
    ///
    /// The whole batch runs sequentially unless every involved tool declares
    /// itself concurrency-safe.  Among safe tools, invocations that claim
    /// the same conflict key are serialized in request order; everything
    /// else runs concurrently.  Results come back in request order, and a
    /// panicking tool poisons only its own slot.
    pub async fn dispatch_batch(
        &self,
        calls: Vec<ToolCall>,
        ctx: &ExecutionContext,
    ) -> Vec<Result<DispatchResult, ToolError>> {
        let all_safe = calls.iter().all(|c| {
            self.registry
                .get(&c.name)
                .map(|t| t.concurrency_safe())
                // Unknown tools fail fast in dispatch; they don't force the
                // batch sequential.
                .unwrap_or(true)
        });

        if !all_safe || calls.len() <= 1 {
            let mut out = Vec::with_capacity(calls.len());
            for call in &calls {
                out.push(self.dispatch_spawned(call.clone(), ctx).await);
            }
            return out;
        }

        // Lanes: one per conflict key, one per keyless call.
        let mut key_lanes: HashMap<String, usize> = HashMap::new();
        let mut lanes: Vec<Vec<(usize, ToolCall)>> = Vec::new();
        for (index, call) in calls.into_iter().enumerate() {
            let key = self
                .registry
                .get(&call.name)
                .ok()
                .and_then(|t| t.conflict_key(&call.input));
            match key {
                Some(k) => {
                    let lane = *key_lanes.entry(k).or_insert_with(|| {
                        lanes.push(Vec::new());
                        lanes.len() - 1
                    });
                    lanes[lane].push((index, call));
                }
                None => lanes.push(vec![(index, call)]),
            }
        }

        let total: usize = lanes.iter().map(Vec::len).sum();
        let lane_futures = lanes.into_iter().map(|lane| {
            let harness = self.clone();
            let ctx = ctx.clone();
            async move {
                let mut results = Vec::with_capacity(lane.len());
                for (index, call) in lane {
                    results.push((index, harness.dispatch_spawned(call, &ctx).await));
                }
                results
            }
        });

        let mut slots: Vec<Option<Result<DispatchResult, ToolError>>> =
            (0..total).map(|_| None).collect();
        for lane_results in futures::future::join_all(lane_futures).await {
            for (index, result) in lane_results {
                slots[index] = Some(result);
            }
        }
        slots
            .into_iter()
            .map(|s| {
                s.unwrap_or_else(|| {
                    Err(ToolError::ExecutionFailed {
                        tool: "unknown".into(),
                        message: "batch slot never resolved".into(),
                    })
                })
            })
            .collect()
    }

    /// Run one dispatch on its own task so a panicking tool cannot take the
    /// batch down with it.
    async fn dispatch_spawned(
        &self,
        call: ToolCall,
        ctx: &ExecutionContext,
    ) -> Result<DispatchResult, ToolError> {
        let harness = self.clone();
        let ctx = ctx.clone();
        let tool_name = call.name.clone();
        match tokio::spawn(async move { harness.dispatch(&call, &ctx).await }).await {
            Ok(result) => result,
            Err(e) => {
                warn!(tool = %tool_name, error = %e, "tool task panicked");
                Err(ToolError::ExecutionFailed {
                    tool: tool_name,
                    message: format!("tool task panicked: {e}"),
                })
            }
        }
    }
}

/// Schema-shape validation plus the tool's own semantic checks.
fn validate_input(tool: &dyn Tool, input: &Value) -> Vec<String> {
    let mut violations = validate_against_schema(&tool.input_schema(), input);
    violations.extend(tool.validate(input));
    violations
}

/// Minimal JSON-schema check: object shape, required keys, declared
/// property types, and `additionalProperties: false`.
fn validate_against_schema(schema: &Value, input: &Value) -> Vec<String> {
    let mut violations = Vec::new();
    let obj = match input.as_object() {
        Some(o) => o,
        None => return vec!["input must be a JSON object".to_string()],
    };

    if let Some(required) = schema["required"].as_array() {
        for key in required.iter().filter_map(|v| v.as_str()) {
            if !obj.contains_key(key) {
                violations.push(format!("missing required parameter '{key}'"));
            }
        }
    }

    let properties = schema["properties"].as_object();
    if let Some(props) = properties {
        for (key, value) in obj {
            let Some(declared) = props.get(key) else {
                if schema["additionalProperties"] == Value::Bool(false) {
                    violations.push(format!("unexpected parameter '{key}'"));
                }
                continue;
            };
            let ok = match declared["type"].as_str() {
                Some("string") => value.is_string(),
                Some("integer") => value.is_i64() || value.is_u64(),
                Some("number") => value.is_number(),
                Some("boolean") => value.is_boolean(),
                Some("array") => value.is_array(),
                Some("object") => value.is_object(),
                _ => true,
            };
            if !ok {
                violations.push(format!(
                    "parameter '{key}' must be of type {}",
                    declared["type"].as_str().unwrap_or("unknown")
                ));
            }
        }
    }
    violations
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::SessionState;
    use crate::registry::ToolCategory;
    use crate::tool::ToolOutput;
    use serde_json::json;
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicI32, AtomicU32, Ordering};
    use std::time::Duration;
    use tern_config::{ExecConfig, PermissionMode, ToolsConfig};

    struct ProbeTool {
        name: &'static str,
        safe: bool,
        key: Option<&'static str>,
        delay_ms: u64,
        calls: Arc<AtomicU32>,
        in_flight: Arc<AtomicI32>,
        max_in_flight: Arc<AtomicI32>,
        panic: bool,
    }

    impl ProbeTool {
        fn named(name: &'static str) -> Self {
            Self {
                name,
                safe: true,
                key: None,
                delay_ms: 0,
                calls: Arc::new(AtomicU32::new(0)),
                in_flight: Arc::new(AtomicI32::new(0)),
                max_in_flight: Arc::new(AtomicI32::new(0)),
                panic: false,
            }
        }
    }

    #[async_trait]
    impl Tool for ProbeTool {
        fn name(&self) -> &str {
            self.name
        }
        fn description(&self) -> &str {
            "probe"
        }
        fn input_schema(&self) -> Value {
            json!({
                "type": "object",
                "properties": {
                    "target": { "type": "string" },
                    "count": { "type": "integer" }
                },
                "required": ["target"],
                "additionalProperties": false
            })
        }
        fn concurrency_safe(&self) -> bool {
            self.safe
        }
        fn conflict_key(&self, _input: &Value) -> Option<String> {
            self.key.map(String::from)
        }
        fn validate(&self, input: &Value) -> Vec<String> {
            if input["target"].as_str() == Some("invalid") {
                vec!["target may not be 'invalid'".to_string()]
            } else {
                Vec::new()
            }
        }
        async fn execute(&self, call: &ToolCall, ctx: &ExecutionContext) -> ToolOutput {
            if self.panic {
                panic!("intentional test panic");
            }
            self.calls.fetch_add(1, Ordering::SeqCst);
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(now, Ordering::SeqCst);
            ctx.emit_progress(&call.id, "working").await;
            if self.delay_ms > 0 {
                tokio::time::sleep(Duration::from_millis(self.delay_ms)).await;
            }
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            ToolOutput::ok(&call.id, format!("done:{}", call.input["target"]))
        }
    }

    fn ctx() -> ExecutionContext {
        ExecutionContext::new(
            "sess",
            PathBuf::from("/tmp"),
            Arc::new(SessionState::new(
                ExecConfig::default(),
                ToolsConfig::default(),
            )),
        )
    }

    fn harness_with(tools: Vec<ProbeTool>, mode: PermissionMode) -> Harness {
        let mut reg = ToolRegistry::new();
        for t in tools {
            reg.register(t, ToolCategory::Filesystem).unwrap();
        }
        let gate = PermissionGate::from_config(&ToolsConfig {
            default_mode: mode,
            ..ToolsConfig::default()
        });
        Harness::new(Arc::new(reg), Arc::new(gate))
    }

    fn call(name: &str, input: Value) -> ToolCall {
        ToolCall {
            id: format!("tu_{name}"),
            name: name.to_string(),
            input,
        }
    }

    // ── Pipeline phases ───────────────────────────────────────────────────────

    #[tokio::test]
    async fn happy_path_returns_formatted_result() {
        let h = harness_with(vec![ProbeTool::named("Probe")], PermissionMode::Allow);
        let r = h
            .dispatch(&call("Probe", json!({"target": "x"})), &ctx())
            .await
            .unwrap();
        assert_eq!(r.tool_name, "Probe");
        assert!(!r.is_error);
        assert!(r.content.contains("done:"));
    }

    #[tokio::test]
    async fn unknown_tool_is_resolve_phase_error() {
        let h = harness_with(vec![], PermissionMode::Allow);
        let e = h
            .dispatch(&call("Nope", json!({})), &ctx())
            .await
            .unwrap_err();
        assert!(matches!(e, ToolError::ToolNotFound { .. }));
    }

    #[tokio::test]
    async fn missing_required_parameter_fails_without_side_effects() {
        let probe = ProbeTool::named("Probe");
        let calls = probe.calls.clone();
        let h = harness_with(vec![probe], PermissionMode::Allow);
        let e = h.dispatch(&call("Probe", json!({})), &ctx()).await.unwrap_err();
        match e {
            ToolError::InvalidParameters { violations, .. } => {
                assert!(violations.iter().any(|v| v.contains("target")));
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(calls.load(Ordering::SeqCst), 0, "tool must not run");
    }

    #[tokio::test]
    async fn wrong_type_and_unexpected_parameter_are_both_reported() {
        let h = harness_with(vec![ProbeTool::named("Probe")], PermissionMode::Allow);
        let e = h
            .dispatch(
                &call("Probe", json!({"target": "x", "count": "three", "stray": 1})),
                &ctx(),
            )
            .await
            .unwrap_err();
        match e {
            ToolError::InvalidParameters { violations, .. } => {
                assert!(violations.iter().any(|v| v.contains("count")));
                assert!(violations.iter().any(|v| v.contains("stray")));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn semantic_violations_combine_with_schema_checks() {
        let h = harness_with(vec![ProbeTool::named("Probe")], PermissionMode::Allow);
        let e = h
            .dispatch(&call("Probe", json!({"target": "invalid"})), &ctx())
            .await
            .unwrap_err();
        match e {
            ToolError::InvalidParameters { violations, .. } => {
                assert!(violations.iter().any(|v| v.contains("may not be")));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn ask_without_approver_is_denied() {
        let h = harness_with(vec![ProbeTool::named("Probe")], PermissionMode::Ask);
        let e = h
            .dispatch(&call("Probe", json!({"target": "x"})), &ctx())
            .await
            .unwrap_err();
        assert!(matches!(e, ToolError::PermissionDenied { .. }));
    }

    struct FixedApprover(bool);

    #[async_trait]
    impl ApprovalHandler for FixedApprover {
        async fn approve(&self, _tool: &str, _input: &Value, _reason: &str) -> bool {
            self.0
        }
    }

    #[tokio::test]
    async fn ask_consults_the_approver() {
        let h = harness_with(vec![ProbeTool::named("Probe")], PermissionMode::Ask)
            .with_approver(Arc::new(FixedApprover(true)));
        assert!(h
            .dispatch(&call("Probe", json!({"target": "x"})), &ctx())
            .await
            .is_ok());

        let h = harness_with(vec![ProbeTool::named("Probe")], PermissionMode::Ask)
            .with_approver(Arc::new(FixedApprover(false)));
        let e = h
            .dispatch(&call("Probe", json!({"target": "x"})), &ctx())
            .await
            .unwrap_err();
        assert!(matches!(e, ToolError::PermissionDenied { .. }));
    }

    #[tokio::test]
    async fn pre_and_post_hooks_fire_in_order() {
        let h = harness_with(vec![ProbeTool::named("Probe")], PermissionMode::Allow);
        let log = Arc::new(std::sync::Mutex::new(Vec::new()));
        let hooks = Arc::new(HookBus::new());
        let l1 = log.clone();
        hooks.register("tool:pre", move |e| {
            l1.lock().unwrap().push(e.kind().to_string());
            Ok(())
        });
        let l2 = log.clone();
        hooks.register("tool:post", move |e| {
            l2.lock().unwrap().push(e.kind().to_string());
            Ok(())
        });
        let h = h.with_hooks(hooks);
        h.dispatch(&call("Probe", json!({"target": "x"})), &ctx())
            .await
            .unwrap();
        assert_eq!(*log.lock().unwrap(), vec!["tool:pre", "tool:post"]);
    }

    #[tokio::test]
    async fn pre_cancelled_context_short_circuits_invoke() {
        let probe = ProbeTool::named("Probe");
        let calls = probe.calls.clone();
        let h = harness_with(vec![probe], PermissionMode::Allow);
        let c = ctx();
        c.cancel.cancel();
        let e = h
            .dispatch(&call("Probe", json!({"target": "x"})), &c)
            .await
            .unwrap_err();
        assert!(matches!(e, ToolError::Cancelled { .. }));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn alias_dispatch_reports_canonical_name() {
        let mut reg = ToolRegistry::new();
        reg.register(ProbeTool::named("Probe"), ToolCategory::Filesystem)
            .unwrap();
        reg.register_alias("probe_tool", "Probe").unwrap();
        let gate = PermissionGate::from_config(&ToolsConfig {
            default_mode: PermissionMode::Allow,
            ..ToolsConfig::default()
        });
        let h = Harness::new(Arc::new(reg), Arc::new(gate));
        let r = h
            .dispatch(&call("probe_tool", json!({"target": "x"})), &ctx())
            .await
            .unwrap();
        assert_eq!(r.tool_name, "Probe");
    }

    #[tokio::test]
    async fn progress_events_precede_the_result() {
        let h = harness_with(vec![ProbeTool::named("Probe")], PermissionMode::Allow);
        let (tx, mut rx) = tokio::sync::mpsc::channel(8);
        let c = ctx().with_progress(tx);
        let r = h
            .dispatch(&call("Probe", json!({"target": "x"})), &c)
            .await
            .unwrap();
        // The progress event was sent before dispatch returned.
        let progress = rx.try_recv().unwrap();
        assert_eq!(progress.message, "working");
        assert!(!r.is_error);
    }

    // ── Parallel batching ─────────────────────────────────────────────────────

    #[tokio::test]
    async fn safe_tools_run_concurrently() {
        let mut a = ProbeTool::named("A");
        a.delay_ms = 60;
        let max = a.max_in_flight.clone();
        let mut b = ProbeTool::named("B");
        b.delay_ms = 60;
        b.in_flight = a.in_flight.clone();
        b.max_in_flight = a.max_in_flight.clone();
        let h = harness_with(vec![a, b], PermissionMode::Allow);
        let results = h
            .dispatch_batch(
                vec![
                    call("A", json!({"target": "1"})),
                    call("B", json!({"target": "2"})),
                ],
                &ctx(),
            )
            .await;
        assert!(results.iter().all(|r| r.is_ok()));
        assert!(max.load(Ordering::SeqCst) >= 2, "expected overlap");
    }

    #[tokio::test]
    async fn one_unsafe_tool_serializes_the_whole_batch() {
        let mut a = ProbeTool::named("A");
        a.delay_ms = 30;
        let mut b = ProbeTool::named("B");
        b.delay_ms = 30;
        b.safe = false;
        b.in_flight = a.in_flight.clone();
        b.max_in_flight = a.max_in_flight.clone();
        let max = a.max_in_flight.clone();
        let h = harness_with(vec![a, b], PermissionMode::Allow);
        let results = h
            .dispatch_batch(
                vec![
                    call("A", json!({"target": "1"})),
                    call("B", json!({"target": "2"})),
                ],
                &ctx(),
            )
            .await;
        assert!(results.iter().all(|r| r.is_ok()));
        assert_eq!(max.load(Ordering::SeqCst), 1, "expected no overlap");
    }

    #[tokio::test]
    async fn same_conflict_key_serializes_those_invocations() {
        let mut a = ProbeTool::named("A");
        a.delay_ms = 30;
        a.key = Some("/shared/file");
        let mut b = ProbeTool::named("B");
        b.delay_ms = 30;
        b.key = Some("/shared/file");
        b.in_flight = a.in_flight.clone();
        b.max_in_flight = a.max_in_flight.clone();
        let max = a.max_in_flight.clone();
        let h = harness_with(vec![a, b], PermissionMode::Allow);
        let results = h
            .dispatch_batch(
                vec![
                    call("A", json!({"target": "1"})),
                    call("B", json!({"target": "2"})),
                ],
                &ctx(),
            )
            .await;
        assert!(results.iter().all(|r| r.is_ok()));
        assert_eq!(max.load(Ordering::SeqCst), 1, "same key must not overlap");
    }

    #[tokio::test]
    async fn batch_results_come_back_in_request_order() {
        let mut a = ProbeTool::named("A");
        a.delay_ms = 50;
        let b = ProbeTool::named("B");
        let h = harness_with(vec![a, b], PermissionMode::Allow);
        let results = h
            .dispatch_batch(
                vec![
                    call("A", json!({"target": "slow"})),
                    call("B", json!({"target": "fast"})),
                ],
                &ctx(),
            )
            .await;
        assert!(results[0].as_ref().unwrap().content.contains("slow"));
        assert!(results[1].as_ref().unwrap().content.contains("fast"));
    }

    #[tokio::test]
    async fn panicking_tool_poisons_only_its_slot() {
        let mut bad = ProbeTool::named("Bad");
        bad.panic = true;
        let good = ProbeTool::named("Good");
        let h = harness_with(vec![bad, good], PermissionMode::Allow);
        let results = h
            .dispatch_batch(
                vec![
                    call("Bad", json!({"target": "x"})),
                    call("Good", json!({"target": "y"})),
                ],
                &ctx(),
            )
            .await;
        assert!(matches!(
            results[0],
            Err(ToolError::ExecutionFailed { .. })
        ));
        assert!(results[1].is_ok());
    }

    // ── Schema helper ─────────────────────────────────────────────────────────

    #[test]
    fn non_object_input_is_a_violation() {
        let v = validate_against_schema(&json!({"type": "object"}), &json!("just a string"));
        assert_eq!(v.len(), 1);
    }

    #[test]
    fn extra_keys_allowed_unless_schema_forbids() {
        let schema = json!({"type": "object", "properties": {"a": {"type": "string"}}});
        assert!(validate_against_schema(&schema, &json!({"a": "x", "b": 1})).is_empty());
    }
}
