// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use tern_config::ModelConfig;

use crate::error::ApiError;
use crate::sse::{SseDecoder, SseFrame};
use crate::stream::StreamAssembler;
use crate::types::{
    CompletionRequest, ContentBlock, EventStream, Message, ModelClient, Role, StreamEvent,
};

/// Maximum same-host redirect hops followed before giving up.
const MAX_REDIRECTS: usize = 5;

/// Streaming client for the model messages API.
pub struct AnthropicClient {
    model: String,
    base_url: String,
    api_key: String,
    api_version: String,
    http: reqwest::Client,
}

impl AnthropicClient {
    pub fn new(cfg: &ModelConfig) -> Result<Self, ApiError> {
        let api_key = resolve_api_key(cfg)
            .ok_or_else(|| ApiError::Validation("no API key configured".into()))?;
        // Redirects are handled manually so cross-host hops can surface as a
        // structured result instead of being followed silently.
        let http = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .connect_timeout(Duration::from_secs(15))
            .build()
            .map_err(|e| ApiError::Network(e.to_string()))?;
        Ok(Self {
            model: cfg.name.clone(),
            base_url: cfg.base_url.trim_end_matches('/').to_string(),
            api_key,
            api_version: cfg.api_version.clone(),
            http,
        })
    }

    /// Build the JSON request body for the messages endpoint.
    pub fn request_body(req: &CompletionRequest) -> Value {
        let mut body = json!({
            "model": req.model,
            "messages": wire_messages(&req.messages),
            "max_tokens": req.max_tokens,
            "stream": true,
        });
        if let Some(t) = req.temperature {
            body["temperature"] = json!(t);
        }
        if let Some(p) = req.top_p {
            body["top_p"] = json!(p);
        }
        if let Some(k) = req.top_k {
            body["top_k"] = json!(k);
        }
        if !req.stop_sequences.is_empty() {
            body["stop_sequences"] = json!(req.stop_sequences);
        }
        if let Some(system) = &req.system {
            if !system.is_empty() {
                body["system"] = json!(system);
            }
        }
        if !req.tools.is_empty() {
            let tools: Vec<Value> = req
                .tools
                .iter()
                .map(|t| {
                    json!({
                        "name": t.name,
                        "description": t.description,
                        "input_schema": t.input_schema,
                    })
                })
                .collect();
            body["tools"] = json!(tools);
        }
        body
    }

    /// POST the body, following same-host redirects only.  A cross-host
    /// redirect is returned as a structured error for the caller's policy.
    async fn post_with_redirects(&self, body: &Value) -> Result<reqwest::Response, ApiError> {
        let original = format!("{}/v1/messages", self.base_url);
        let mut url =
            reqwest::Url::parse(&original).map_err(|e| ApiError::Validation(e.to_string()))?;

        for _ in 0..MAX_REDIRECTS {
            let resp = self
                .http
                .post(url.clone())
                .header("x-api-key", &self.api_key)
                .header("anthropic-version", &self.api_version)
                .header("content-type", "application/json")
                .json(body)
                .send()
                .await?;

            if !resp.status().is_redirection() {
                return Ok(resp);
            }

            let status = resp.status().as_u16();
            let location = resp
                .headers()
                .get(reqwest::header::LOCATION)
                .and_then(|v| v.to_str().ok())
                .ok_or_else(|| ApiError::Network("redirect without Location".into()))?;
            let target = url
                .join(location)
                .map_err(|e| ApiError::Network(format!("bad redirect target: {e}")))?;

            if target.host_str() != url.host_str() || target.port_or_known_default() != url.port_or_known_default() {
                return Err(ApiError::CrossHostRedirect {
                    original: url.to_string(),
                    target: target.to_string(),
                    status,
                });
            }
            debug!(from = %url, to = %target, "following same-host redirect");
            url = target;
        }
        Err(ApiError::Network("too many redirects".into()))
    }
}

#[async_trait]
impl ModelClient for AnthropicClient {
    fn name(&self) -> &str {
        "anthropic"
    }

    fn model_name(&self) -> &str {
        &self.model
    }

    async fn stream(
        &self,
        mut req: CompletionRequest,
        cancel: CancellationToken,
    ) -> Result<EventStream, ApiError> {
        if req.model.is_empty() {
            req.model = self.model.clone();
        }
        let body = Self::request_body(&req);

        if cancel.is_cancelled() {
            return Err(ApiError::Cancelled);
        }

        let resp = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(ApiError::Cancelled),
            r = self.post_with_redirects(&body) => r?,
        };

        let status = resp.status();
        if !status.is_success() {
            let reset = parse_rate_limit_reset(resp.headers());
            let text = resp.text().await.unwrap_or_default();
            return Err(ApiError::from_status(status.as_u16(), text, reset));
        }

        // Decode on a supervisor task so the consumer can pull events lazily
        // while cancellation aborts the HTTP read underneath it.
        let (tx, rx) = mpsc::channel::<Result<StreamEvent, ApiError>>(64);
        tokio::spawn(async move {
            let mut body = resp.bytes_stream();
            let mut decoder = SseDecoder::new();
            let mut assembler = StreamAssembler::new();
            loop {
                let chunk = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => {
                        let _ = tx.send(Ok(StreamEvent::Cancelled)).await;
                        return;
                    }
                    chunk = body.next() => chunk,
                };
                let bytes = match chunk {
                    None => return,
                    Some(Err(e)) => {
                        let _ = tx.send(Err(e.into())).await;
                        return;
                    }
                    Some(Ok(b)) => b,
                };
                for frame in decoder.feed(&bytes) {
                    let event = match frame {
                        SseFrame::Done => return,
                        SseFrame::Event(ev) => ev,
                    };
                    let parsed: Value = match serde_json::from_str(&event.data) {
                        Ok(v) => v,
                        Err(e) => {
                            // A complete but malformed payload is a poison
                            // event; report it and keep reading.
                            warn!(error = %e, "unparseable SSE payload");
                            let _ = tx
                                .send(Ok(StreamEvent::ParseError {
                                    message: e.to_string(),
                                }))
                                .await;
                            continue;
                        }
                    };
                    match assembler.feed(&parsed) {
                        Ok(events) => {
                            for e in events {
                                if tx.send(Ok(e)).await.is_err() {
                                    return;
                                }
                            }
                        }
                        Err(api_err) => {
                            let _ = tx.send(Err(api_err)).await;
                            return;
                        }
                    }
                }
            }
        });

        Ok(Box::pin(ReceiverStream::new(rx)))
    }
}

/// Resolve the API key: explicit config value, configured env var, then the
/// conventional environment variables.
fn resolve_api_key(cfg: &ModelConfig) -> Option<String> {
    if let Some(key) = &cfg.api_key {
        return Some(key.clone());
    }
    if let Some(var) = &cfg.api_key_env {
        if let Ok(key) = std::env::var(var) {
            return Some(key);
        }
    }
    std::env::var("TERN_API_KEY")
        .or_else(|_| std::env::var("ANTHROPIC_API_KEY"))
        .ok()
}

/// Extract a reset delay from rate-limit response headers.
/// Recognizes `retry-after` (seconds) and `x-ratelimit-reset-after` (seconds).
fn parse_rate_limit_reset(headers: &reqwest::header::HeaderMap) -> Option<Duration> {
    for name in ["retry-after", "x-ratelimit-reset-after"] {
        if let Some(secs) = headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .and_then(|s| s.trim().parse::<f64>().ok())
        {
            if secs >= 0.0 {
                return Some(Duration::from_secs_f64(secs));
            }
        }
    }
    None
}

/// Convert messages into the wire shape.
///
/// The conversation-level system prompt travels in the top-level `system`
/// field; system-role messages *inside* the log (compaction markers and
/// summaries) ride as user turns so their content stays visible to the
/// model.  Tool-role messages also ride as user turns.  Adjacent turns of
/// the same wire role are merged into one message, since the API requires
/// user/assistant alternation.
fn wire_messages(messages: &[Message]) -> Vec<Value> {
    let mut out: Vec<(&'static str, Vec<Value>)> = Vec::new();
    for m in messages {
        let role = match m.role {
            Role::Assistant => "assistant",
            Role::User | Role::Tool | Role::System => "user",
        };
        let blocks: Vec<Value> = m.content.iter().map(wire_block).collect();
        match out.last_mut() {
            Some((last_role, content)) if *last_role == role => content.extend(blocks),
            _ => out.push((role, blocks)),
        }
    }
    out.into_iter()
        .map(|(role, content)| json!({ "role": role, "content": content }))
        .collect()
}

fn wire_block(block: &ContentBlock) -> Value {
    match block {
        ContentBlock::Text { text } => json!({ "type": "text", "text": text }),
        ContentBlock::Image { media_type, data } => json!({
            "type": "image",
            "source": { "type": "base64", "media_type": media_type, "data": data },
        }),
        ContentBlock::ToolUse { id, name, input } => json!({
            "type": "tool_use", "id": id, "name": name, "input": input,
        }),
        ContentBlock::ToolResult {
            tool_use_id,
            content,
            is_error,
        } => {
            let mut v = json!({
                "type": "tool_result",
                "tool_use_id": tool_use_id,
                "content": content,
            });
            if *is_error {
                v["is_error"] = json!(true);
            }
            v
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ToolSchema;

    // ── Request body ──────────────────────────────────────────────────────────

    #[test]
    fn body_contains_model_messages_and_stream_flag() {
        let req = CompletionRequest {
            model: "m1".into(),
            messages: vec![Message::user("hi")],
            max_tokens: 100,
            ..Default::default()
        };
        let body = AnthropicClient::request_body(&req);
        assert_eq!(body["model"], "m1");
        assert_eq!(body["stream"], true);
        assert_eq!(body["messages"][0]["role"], "user");
        assert_eq!(body["messages"][0]["content"][0]["text"], "hi");
    }

    #[test]
    fn system_prompt_rides_in_the_top_level_field() {
        let req = CompletionRequest {
            model: "m".into(),
            system: Some("be brief".into()),
            messages: vec![Message::user("q")],
            max_tokens: 1,
            ..Default::default()
        };
        let body = AnthropicClient::request_body(&req);
        assert_eq!(body["system"], "be brief");
        assert_eq!(body["messages"].as_array().unwrap().len(), 1);
    }

    #[test]
    fn in_log_system_messages_become_user_turns_and_merge() {
        // Compaction markers are system-role records inside the log; they
        // must stay visible and must not break user/assistant alternation.
        let req = CompletionRequest {
            model: "m".into(),
            max_tokens: 1,
            messages: vec![
                Message::system("[context compacted]"),
                Message::user("next question"),
                Message::assistant("a1"),
            ],
            ..Default::default()
        };
        let body = AnthropicClient::request_body(&req);
        let msgs = body["messages"].as_array().unwrap();
        assert_eq!(msgs.len(), 2, "{msgs:?}");
        assert_eq!(msgs[0]["role"], "user");
        assert_eq!(msgs[0]["content"][0]["text"], "[context compacted]");
        assert_eq!(msgs[0]["content"][1]["text"], "next question");
        assert_eq!(msgs[1]["role"], "assistant");
    }

    #[test]
    fn tools_serialize_with_input_schema() {
        let req = CompletionRequest {
            model: "m".into(),
            max_tokens: 1,
            tools: vec![ToolSchema {
                name: "Read".into(),
                description: "read a file".into(),
                input_schema: json!({"type":"object"}),
            }],
            ..Default::default()
        };
        let body = AnthropicClient::request_body(&req);
        assert_eq!(body["tools"][0]["name"], "Read");
        assert_eq!(body["tools"][0]["input_schema"]["type"], "object");
    }

    #[test]
    fn sampling_params_are_optional() {
        let req = CompletionRequest {
            model: "m".into(),
            max_tokens: 1,
            ..Default::default()
        };
        let body = AnthropicClient::request_body(&req);
        assert!(body.get("temperature").is_none());
        assert!(body.get("top_p").is_none());
        assert!(body.get("stop_sequences").is_none());
    }

    // ── Wire blocks ───────────────────────────────────────────────────────────

    #[test]
    fn image_block_expands_to_base64_source() {
        let v = wire_block(&ContentBlock::Image {
            media_type: "image/png".into(),
            data: "iVBOR".into(),
        });
        assert_eq!(v["source"]["type"], "base64");
        assert_eq!(v["source"]["media_type"], "image/png");
    }

    #[test]
    fn tool_result_rides_in_user_role_message() {
        let msgs = wire_messages(&[Message::tool_results(vec![ContentBlock::tool_result(
            "tu_9", "done",
        )])]);
        assert_eq!(msgs[0]["role"], "user");
        assert_eq!(msgs[0]["content"][0]["type"], "tool_result");
        assert_eq!(msgs[0]["content"][0]["tool_use_id"], "tu_9");
    }

    #[test]
    fn tool_result_error_flag_serializes_only_when_set() {
        let ok = wire_block(&ContentBlock::tool_result("t", "x"));
        assert!(ok.get("is_error").is_none());
        let err = wire_block(&ContentBlock::tool_error("t", "x"));
        assert_eq!(err["is_error"], true);
    }

    // ── Header parsing ────────────────────────────────────────────────────────

    #[test]
    fn retry_after_header_parses_to_duration() {
        let mut headers = reqwest::header::HeaderMap::new();
        headers.insert("retry-after", "30".parse().unwrap());
        assert_eq!(
            parse_rate_limit_reset(&headers),
            Some(Duration::from_secs(30))
        );
    }

    #[test]
    fn ratelimit_reset_after_fractional_seconds() {
        let mut headers = reqwest::header::HeaderMap::new();
        headers.insert("x-ratelimit-reset-after", "1.5".parse().unwrap());
        assert_eq!(
            parse_rate_limit_reset(&headers),
            Some(Duration::from_secs_f64(1.5))
        );
    }

    #[test]
    fn absent_headers_yield_none() {
        let headers = reqwest::header::HeaderMap::new();
        assert_eq!(parse_rate_limit_reset(&headers), None);
    }
}
