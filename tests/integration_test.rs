// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//
// End-to-end scenarios across crate boundaries: the dispatch harness driving
// real subprocesses, the streaming decoder fed hostile chunk splits, and the
// retry/circuit controller under sustained failure.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;

use tern_config::{ExecConfig, PermissionMode, ToolsConfig};
use tern_core::{maybe_compact, CompactorConfig, Conversation, MessageRecord};
use tern_exec::TaskStatus;
use tern_model::{
    ApiError, CircuitBreaker, CircuitState, ContentBlock, Message, SseDecoder, SseFrame,
    StreamAssembler, StreamEvent,
};
use tern_tools::{
    builtin_registry, ExecutionContext, Harness, PermissionGate, SessionState, ToolCall,
};

fn harness() -> (Harness, ExecutionContext) {
    let registry = builtin_registry(None).unwrap();
    let gate = PermissionGate::from_config(&ToolsConfig {
        default_mode: PermissionMode::Allow,
        ..ToolsConfig::default()
    });
    let harness = Harness::new(Arc::new(registry), Arc::new(gate));
    let state = Arc::new(SessionState::new(
        ExecConfig::default(),
        ToolsConfig::default(),
    ));
    let ctx = ExecutionContext::new("itest", PathBuf::from("/tmp"), state);
    (harness, ctx)
}

fn call(name: &str, input: serde_json::Value) -> ToolCall {
    ToolCall {
        id: format!("tu_{name}"),
        name: name.to_string(),
        input,
    }
}

// ── Scenario 1: foreground bash timeout ──────────────────────────────────────

#[tokio::test]
async fn foreground_bash_timeout_kills_and_reports() {
    let (harness, ctx) = harness();
    let started = std::time::Instant::now();
    let result = harness
        .dispatch(
            &call("Bash", json!({"command": "sleep 5", "timeout": 100})),
            &ctx,
        )
        .await
        .unwrap();
    assert!(result.is_error);
    assert!(result.content.contains("timed out"), "{}", result.content);
    assert!(
        result.content.contains("SIGTERM") || result.content.contains("SIGKILL"),
        "{}",
        result.content
    );
    assert!(started.elapsed() >= Duration::from_millis(100));
    assert!(started.elapsed() < Duration::from_secs(5));
}

// ── Scenario 2: background task lifecycle ────────────────────────────────────

#[tokio::test]
async fn background_task_lifecycle_through_the_tools() {
    let (harness, ctx) = harness();

    let spawn = harness
        .dispatch(
            &call(
                "Bash",
                json!({
                    "command": "printf 'a\\nb\\nc\\n'; sleep 0.1",
                    "run_in_background": true
                }),
            ),
            &ctx,
        )
        .await
        .unwrap();
    assert!(!spawn.is_error, "{}", spawn.content);
    let task_id = spawn
        .content
        .split_whitespace()
        .find(|w| w.starts_with("bash_"))
        .expect("task id in response")
        .trim_end_matches('.')
        .to_string();

    // Poll BashOutput until the task completes.
    let mut last = String::new();
    for _ in 0..100 {
        let out = harness
            .dispatch(&call("BashOutput", json!({"bash_id": task_id})), &ctx)
            .await
            .unwrap();
        last = out.content.clone();
        if last.contains("status: completed") {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(last.contains("status: completed"), "{last}");
    assert!(last.contains("exit code: 0"), "{last}");
    assert!(last.contains("a\nb\nc"), "{last}");

    // After the retention window the task is reaped.
    assert_eq!(ctx.state.background.reap_older_than(Duration::ZERO), 1);
    let gone = harness
        .dispatch(&call("BashOutput", json!({"bash_id": task_id})), &ctx)
        .await;
    assert!(gone.is_err() || gone.unwrap().is_error);
}

#[tokio::test]
async fn kill_shell_terminates_a_running_task() {
    let (harness, ctx) = harness();
    let spawn = harness
        .dispatch(
            &call("Bash", json!({"command": "sleep 30", "run_in_background": true})),
            &ctx,
        )
        .await
        .unwrap();
    let task_id = spawn
        .content
        .split_whitespace()
        .find(|w| w.starts_with("bash_"))
        .unwrap()
        .trim_end_matches('.')
        .to_string();

    let kill = harness
        .dispatch(&call("KillShell", json!({"shell_id": task_id})), &ctx)
        .await
        .unwrap();
    assert!(!kill.is_error, "{}", kill.content);

    for _ in 0..100 {
        if ctx.state.background.get(&task_id).unwrap().status == TaskStatus::Killed {
            let summary = ctx.state.background.get(&task_id).unwrap();
            assert_eq!(summary.exit_code, Some(-1));
            assert_eq!(summary.signal.as_deref(), Some("SIGKILL"));
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("task never reached killed");
}

// ── Scenario 3: edit uniqueness enforcement ──────────────────────────────────

#[tokio::test]
async fn edit_refuses_ambiguous_match_then_replace_all_succeeds() {
    let (harness, ctx) = harness();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("dup.txt");
    let path_str = path.to_str().unwrap();

    let write = harness
        .dispatch(
            &call("Write", json!({"file_path": path_str, "content": "foo foo"})),
            &ctx,
        )
        .await
        .unwrap();
    assert!(!write.is_error, "{}", write.content);

    let ambiguous = harness
        .dispatch(
            &call(
                "Edit",
                json!({"file_path": path_str, "old_string": "foo", "new_string": "bar"}),
            ),
            &ctx,
        )
        .await
        .unwrap();
    assert!(ambiguous.is_error);
    assert!(ambiguous.content.contains("appears 2 times"), "{}", ambiguous.content);
    assert_eq!(std::fs::read_to_string(&path).unwrap(), "foo foo");

    let all = harness
        .dispatch(
            &call(
                "Edit",
                json!({
                    "file_path": path_str,
                    "old_string": "foo",
                    "new_string": "bar",
                    "replace_all": true
                }),
            ),
            &ctx,
        )
        .await
        .unwrap();
    assert!(!all.is_error, "{}", all.content);
    assert_eq!(std::fs::read_to_string(&path).unwrap(), "bar bar");
}

// ── Scenario 4: compaction preserves tool pairs ──────────────────────────────

#[tokio::test]
async fn compaction_never_splits_a_tool_pair() {
    let mut conv = Conversation::new("m");
    let mut records = Vec::new();
    for i in 0..30 {
        if i == 14 {
            records.push(MessageRecord::new(Message {
                role: tern_model::Role::Assistant,
                content: vec![ContentBlock::ToolUse {
                    id: "tu_pair".into(),
                    name: "Grep".into(),
                    input: json!({"pattern": "x"}),
                }],
            }));
        } else if i == 15 {
            records.push(MessageRecord::new(Message::tool_results(vec![
                ContentBlock::tool_result("tu_pair", "2 matches"),
            ])));
        } else {
            let text = format!("turn {i} {}", "content that can be summarized ".repeat(10));
            records.push(MessageRecord::new(if i % 2 == 0 {
                Message::user(text)
            } else {
                Message::assistant(text)
            }));
        }
    }
    conv.replace_records(records);

    let outcome = maybe_compact(
        &mut conv,
        &CompactorConfig {
            threshold_tokens: 100,
            min_messages: 10,
            target_ratio: 0.5,
            score_floor: 0,
        },
    )
    .expect("compaction runs");
    assert_ne!(outcome.boundary, 15);

    // The pair either survived adjacent or was summarized as a unit.
    let mut use_pos = None;
    let mut result_pos = None;
    for (i, record) in conv.records().iter().enumerate() {
        for block in &record.message.content {
            match block {
                ContentBlock::ToolUse { id, .. } if id == "tu_pair" => use_pos = Some(i),
                ContentBlock::ToolResult { tool_use_id, .. } if tool_use_id == "tu_pair" => {
                    result_pos = Some(i)
                }
                _ => {}
            }
        }
    }
    match (use_pos, result_pos) {
        (None, None) => {}
        (Some(u), Some(r)) => assert_eq!(r, u + 1),
        other => panic!("tool pair split: {other:?}"),
    }
}

// ── Scenario 5: SSE reassembly across chunk splits ───────────────────────────

#[tokio::test]
async fn sse_stream_split_mid_json_token_reassembles_tool_input() {
    // The wire bytes for a streamed tool call, split at the worst possible
    // place: inside an input_json_delta payload, mid-token.
    let wire = concat!(
        "event: content_block_start\n",
        "data: {\"type\":\"content_block_start\",\"index\":0,",
        "\"content_block\":{\"type\":\"tool_use\",\"id\":\"tu_9\",\"name\":\"Write\"}}\n\n",
        "event: content_block_delta\n",
        "data: {\"type\":\"content_block_delta\",\"index\":0,",
        "\"delta\":{\"type\":\"input_json_delta\",\"partial_json\":\"{\\\"file_pa\"}}\n\n",
        "event: content_block_delta\n",
        "data: {\"type\":\"content_block_delta\",\"index\":0,",
        "\"delta\":{\"type\":\"input_json_delta\",\"partial_json\":\"th\\\": \\\"/tmp/x\\\"}\"}}\n\n",
        "event: content_block_stop\n",
        "data: {\"type\":\"content_block_stop\",\"index\":0}\n\n",
        "event: message_stop\n",
        "data: {\"type\":\"message_stop\"}\n\n",
    )
    .as_bytes();

    // Feed in 7-byte chunks so every line and several JSON tokens split.
    let mut decoder = SseDecoder::new();
    let mut assembler = StreamAssembler::new();
    let mut final_content = None;
    for chunk in wire.chunks(7) {
        for frame in decoder.feed(chunk) {
            let SseFrame::Event(ev) = frame else {
                continue;
            };
            let value: serde_json::Value = serde_json::from_str(&ev.data).unwrap();
            for event in assembler.feed(&value).unwrap() {
                if let StreamEvent::MessageStop { content, .. } = event {
                    final_content = Some(content);
                }
            }
        }
    }

    let content = final_content.expect("message_stop reached");
    match &content[0] {
        ContentBlock::ToolUse { id, name, input } => {
            assert_eq!(id, "tu_9");
            assert_eq!(name, "Write");
            assert_eq!(input["file_path"], "/tmp/x");
        }
        other => panic!("unexpected block: {other:?}"),
    }
}

// ── Scenario 6: circuit half-open probe ──────────────────────────────────────

#[tokio::test]
async fn circuit_opens_probes_and_recloses() {
    let cb = CircuitBreaker::new(&tern_config::CircuitConfig {
        failure_threshold: 3,
        success_threshold: 1,
        reset_timeout_secs: 1,
    });

    // Three consecutive transient failures open the circuit.
    for _ in 0..3 {
        let _: Result<(), _> = cb
            .call(|| async {
                Err(ApiError::ServerTransient {
                    status: 503,
                    message: "unavailable".into(),
                })
            })
            .await;
    }
    assert_eq!(cb.state(), CircuitState::Open);

    // While open, calls short-circuit without executing.
    let result: Result<(), _> = cb.call(|| async { Ok(()) }).await;
    assert!(matches!(result, Err(ApiError::CircuitOpen { .. })));

    // After the reset timeout the next call executes as a probe; its
    // success recloses the circuit.
    tokio::time::sleep(Duration::from_millis(1100)).await;
    let result: Result<i32, ApiError> = cb.call(|| async { Ok(7) }).await;
    assert_eq!(result.unwrap(), 7);
    assert_eq!(cb.state(), CircuitState::Closed);
}
