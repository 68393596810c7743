// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::debug;

use crate::context::ExecutionContext;
use crate::tool::{Tool, ToolCall, ToolOutput};

#[derive(Default)]
pub struct WebSearchTool {
    /// Optional API key override (falls back to env TERN_SEARCH_API_KEY,
    /// then BRAVE_API_KEY)
    pub api_key: Option<String>,
}

#[async_trait]
impl Tool for WebSearchTool {
    fn name(&self) -> &str {
        "WebSearch"
    }

    fn description(&self) -> &str {
        "Real-time web search returning titles, URLs, and snippets.\n\
         count: 1-10 (default 5).  Include the current year in queries for\n\
         recent information.  Cite sources after answering:\n\
         Sources:\n\
         - [Title](URL)"
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "query": {
                    "type": "string",
                    "description": "Search query"
                },
                "count": {
                    "type": "integer",
                    "description": "Number of results to return (default 5, max 10)"
                }
            },
            "required": ["query"],
            "additionalProperties": false
        })
    }

    fn read_only(&self) -> bool {
        true
    }

    async fn execute(&self, call: &ToolCall, ctx: &ExecutionContext) -> ToolOutput {
        if !ctx.state.tools.network_enabled {
            return ToolOutput::err(
                &call.id,
                "network tools are disabled (TERN_NO_NETWORK / NETWORK_RESTRICTED)",
            );
        }
        let query = match call.input["query"].as_str() {
            Some(q) => q.to_string(),
            None => return ToolOutput::err(&call.id, "missing 'query'"),
        };
        let count = call.input["count"].as_u64().unwrap_or(5).clamp(1, 10) as usize;

        debug!(query = %query, count, "WebSearch tool");

        let api_key = self
            .api_key
            .clone()
            .or_else(|| std::env::var("TERN_SEARCH_API_KEY").ok())
            .or_else(|| std::env::var("BRAVE_API_KEY").ok());
        let Some(api_key) = api_key else {
            return ToolOutput::err(
                &call.id,
                "no search API key configured; set TERN_SEARCH_API_KEY or BRAVE_API_KEY",
            );
        };

        match brave_search(&query, count, &api_key).await {
            Ok(results) => ToolOutput::ok(&call.id, results),
            Err(e) => ToolOutput::err(&call.id, format!("search error: {e}")),
        }
    }
}

async fn brave_search(query: &str, count: usize, api_key: &str) -> anyhow::Result<String> {
    let client = reqwest::Client::builder()
        .timeout(std::time::Duration::from_secs(15))
        .user_agent("tern-agent/0.4")
        .build()?;

    let resp = client
        .get("https://api.search.brave.com/res/v1/web/search")
        .query(&[("q", query), ("count", &count.to_string())])
        .header("Accept", "application/json")
        .header("X-Subscription-Token", api_key)
        .send()
        .await?;

    if !resp.status().is_success() {
        anyhow::bail!("search API returned status {}", resp.status());
    }
    let body: Value = resp.json().await?;
    Ok(format_results(&body, count))
}

fn format_results(body: &Value, count: usize) -> String {
    let results = body["web"]["results"].as_array().map(Vec::as_slice).unwrap_or(&[]);
    if results.is_empty() {
        return "(no results)".to_string();
    }
    results
        .iter()
        .take(count)
        .enumerate()
        .map(|(i, r)| {
            let title = r["title"].as_str().unwrap_or("(no title)");
            let url = r["url"].as_str().unwrap_or("");
            let desc = r["description"].as_str().unwrap_or("");
            format!("{}. **{}**\n   {}\n   {}", i + 1, title, url, desc)
        })
        .collect::<Vec<_>>()
        .join("\n\n")
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
