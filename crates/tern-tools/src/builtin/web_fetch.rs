// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::debug;

use crate::context::ExecutionContext;
use crate::tool::{Tool, ToolCall, ToolOutput};

/// Maximum same-host redirect hops followed automatically.
const MAX_REDIRECTS: usize = 5;

pub struct WebFetchTool;

#[async_trait]
impl Tool for WebFetchTool {
    fn name(&self) -> &str {
        "WebFetch"
    }

    fn description(&self) -> &str {
        "Fetches a URL and returns its content as readable text.\n\
         - HTML is converted to text; JSON is pretty-printed.\n\
         - Same-host redirects are followed; a cross-host redirect is NOT\n\
           followed — the target is reported so you can decide whether to\n\
           fetch it explicitly.\n\
         - Output is capped; use max_chars to lower the cap.\n\
         Read-only, no authentication, http/https only."
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "url": {
                    "type": "string",
                    "description": "The URL to fetch (http or https)"
                },
                "max_chars": {
                    "type": "integer",
                    "description": "Maximum characters to return"
                }
            },
            "required": ["url"],
            "additionalProperties": false
        })
    }

    fn read_only(&self) -> bool {
        true
    }

    fn validate(&self, input: &Value) -> Vec<String> {
        match input["url"].as_str() {
            Some(u) if !(u.starts_with("http://") || u.starts_with("https://")) => {
                vec![format!("url must be http(s), got: {u}")]
            }
            _ => Vec::new(),
        }
    }

    async fn execute(&self, call: &ToolCall, ctx: &ExecutionContext) -> ToolOutput {
        if !ctx.state.tools.network_enabled {
            return ToolOutput::err(
                &call.id,
                "network tools are disabled (TERN_NO_NETWORK / NETWORK_RESTRICTED)",
            );
        }
        let url = match call.input["url"].as_str() {
            Some(u) => u.to_string(),
            None => return ToolOutput::err(&call.id, "missing 'url'"),
        };
        let max_chars = call.input["max_chars"]
            .as_u64()
            .map(|n| n as usize)
            .unwrap_or(ctx.state.tools.web_fetch_max_chars);

        debug!(url = %url, max_chars, "WebFetch tool");

        match fetch(&url, max_chars).await {
            Ok(content) => ToolOutput::ok(&call.id, content),
            Err(e) => ToolOutput::err(&call.id, format!("fetch error: {e}")),
        }
    }
}

async fn fetch(url: &str, max_chars: usize) -> anyhow::Result<String> {
    let client = reqwest::Client::builder()
        .timeout(std::time::Duration::from_secs(30))
        // Redirects are handled manually so cross-host hops surface as a
        // structured notice instead of being followed silently.
        .redirect(reqwest::redirect::Policy::none())
        .user_agent("tern-agent/0.4")
        .build()?;

    let mut current = reqwest::Url::parse(url)?;
    for _ in 0..MAX_REDIRECTS {
        let resp = client.get(current.clone()).send().await?;
        if resp.status().is_redirection() {
            let status = resp.status().as_u16();
            let location = resp
                .headers()
                .get(reqwest::header::LOCATION)
                .and_then(|v| v.to_str().ok())
                .ok_or_else(|| anyhow::anyhow!("redirect without Location header"))?;
            let target = current.join(location)?;
            if target.host_str() != current.host_str() {
                // Structured cross-host redirect notice; the caller decides.
                return Ok(format!(
                    "[redirect not followed]\nstatus: {status}\noriginal: {current}\ntarget: {target}\n\
                     Fetch the target URL explicitly if it should be trusted."
                ));
            }
            current = target;
            continue;
        }

        let status = resp.status();
        let content_type = resp
            .headers()
            .get("content-type")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_lowercase();
        let body = resp.text().await?;
        if !status.is_success() {
            anyhow::bail!("HTTP {status}: {}", truncate(&body, 500));
        }

        let content = if content_type.contains("html") {
            html2text::from_read(body.as_bytes(), 100)
        } else if content_type.contains("json") {
            match serde_json::from_str::<Value>(&body) {
                Ok(v) => serde_json::to_string_pretty(&v).unwrap_or(body),
                Err(_) => body,
            }
        } else {
            body
        };
        return Ok(truncate(&content, max_chars));
    }
    anyhow::bail!("too many redirects")
}

fn truncate(s: &str, max_chars: usize) -> String {
    if s.len() <= max_chars {
        return s.to_string();
    }
    let mut cut = max_chars;
    while cut > 0 && !s.is_char_boundary(cut) {
        cut -= 1;
    }
    format!(
        "{}...[truncated at {max_chars} chars; total {}]",
        &s[..cut],
        s.len()
    )
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::SessionState;
    use std::path::PathBuf;
    use std::sync::Arc;
    use tern_config::{ExecConfig, ToolsConfig};

    fn ctx_with(network_enabled: bool) -> ExecutionContext {
        ExecutionContext::new(
            "s",
            PathBuf::from("/tmp"),
            Arc::new(SessionState::new(
                ExecConfig::default(),
                ToolsConfig {
                    network_enabled,
                    ..ToolsConfig::default()
                },
            )),
        )
    }

    fn call(input: Value) -> ToolCall {
        ToolCall {
            id: "f1".into(),
            name: "WebFetch".into(),
            input,
        }
    }

    #[tokio::test]
    async fn network_restriction_blocks_the_tool() {
        let out = WebFetchTool
            .execute(&call(json!({"url": "https://example.com"})), &ctx_with(false))
            .await;
        assert!(out.is_error);
        assert!(out.content.contains("disabled"));
    }

    #[test]
    fn non_http_scheme_is_a_validation_violation() {
        let v = WebFetchTool.validate(&json!({"url": "ftp://example.com/x"}));
        assert_eq!(v.len(), 1);
        let v = WebFetchTool.validate(&json!({"url": "https://example.com"}));
        assert!(v.is_empty());
    }

    #[test]
    fn truncate_respects_char_boundaries() {
        let s = "héllo wörld, this is a long string";
        let out = truncate(s, 10);
        assert!(out.contains("truncated"));
        // Must not panic on multibyte boundaries and must keep a prefix.
        assert!(out.starts_with("héll") || out.starts_with("héllo"));
    }

    #[test]
    fn truncate_passes_short_strings_through() {
        assert_eq!(truncate("short", 100), "short");
    }
}
