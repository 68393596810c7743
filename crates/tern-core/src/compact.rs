// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::collections::{BTreeMap, HashSet};

use serde_json::Value;
use tracing::debug;

use tern_config::AgentConfig;
use tern_model::{ContentBlock, Message, Role};
use tern_tools::OutputCategory;

use crate::conversation::{Conversation, MessageRecord};

/// Phrases that mark an explicit topic shift in a user message.
const TOPIC_SHIFT_PHRASES: [&str; 5] = [
    "let's move on",
    "new topic",
    "next task",
    "different question",
    "switching to",
];

/// Minimum gap between two messages that counts as a natural break.
const NATURAL_BREAK_GAP_SECS: i64 = 300;

/// Tools whose calls are preserved verbatim: they mutate files or system
/// state, so their exact inputs matter for later turns.
const MUTATING_TOOLS: [&str; 5] = ["Write", "Edit", "MultiEdit", "NotebookEdit", "KillShell"];

#[derive(Debug, Clone)]
pub struct CompactorConfig {
    pub threshold_tokens: usize,
    pub min_messages: usize,
    pub target_ratio: f32,
    pub score_floor: i32,
}

impl CompactorConfig {
    pub fn from_agent(cfg: &AgentConfig) -> Self {
        Self {
            threshold_tokens: cfg.compaction_threshold_tokens,
            min_messages: cfg.compaction_min_messages,
            target_ratio: cfg.compaction_target_ratio,
            score_floor: cfg.compaction_score_floor,
        }
    }
}

impl Default for CompactorConfig {
    fn default() -> Self {
        Self::from_agent(&AgentConfig::default())
    }
}

#[derive(Debug, Clone)]
pub struct CompactionOutcome {
    pub boundary: usize,
    pub summarized_messages: usize,
    pub tokens_before: usize,
    pub tokens_after: usize,
}

/// Compact the conversation if it is over budget.
///
/// Triggers only when `token_count >= threshold` AND the message count has
/// reached the minimum; anything less is a no-op.  The prefix before the
/// chosen boundary is replaced by a deterministic structured summary; the
/// suffix is preserved verbatim (the very same records, ids and timestamps
/// included).  If summarization would not actually shrink the conversation
/// the records are restored untouched.
pub fn maybe_compact(conv: &mut Conversation, cfg: &CompactorConfig) -> Option<CompactionOutcome> {
    if conv.token_count() < cfg.threshold_tokens || conv.len() < cfg.min_messages {
        return None;
    }
    let boundary = select_boundary(conv.records(), cfg)?;
    let tokens_before = conv.token_count();

    let original: Vec<MessageRecord> = conv.records().to_vec();
    let prefix = &original[..boundary];
    let suffix = original[boundary..].to_vec();

    let marker = MessageRecord::new(Message::system(format!(
        "[context compacted: {boundary} earlier messages summarized below]"
    )));
    let mut new_records = vec![marker];
    new_records.extend(summarize(prefix));
    new_records.extend(suffix);

    conv.replace_records(new_records);
    if conv.token_count() >= tokens_before {
        // The summary did not pay for itself (short prefix, dense critical
        // calls).  Restore and try again after more growth.
        debug!("compaction would not reduce tokens; skipped");
        conv.replace_records(original);
        return None;
    }

    let outcome = CompactionOutcome {
        boundary,
        summarized_messages: boundary,
        tokens_before,
        tokens_after: conv.token_count(),
    };
    debug!(
        boundary,
        tokens_before, tokens_after = outcome.tokens_after, "conversation compacted"
    );
    Some(outcome)
}

// ─── Boundary selection ───────────────────────────────────────────────────────

/// Score candidates around the target index and pick the best one; ties
/// break toward the lower index.  Returns `None` when the window is empty
/// or the best score is below the configured floor.
fn select_boundary(records: &[MessageRecord], cfg: &CompactorConfig) -> Option<usize> {
    let len = records.len();
    let target = (len as f32 * cfg.target_ratio).floor() as usize;
    let lo = target.saturating_sub(5).max(10);
    let hi = (target + 5).min(len.saturating_sub(5));
    if lo > hi {
        return None;
    }

    let mut best: Option<(usize, i32)> = None;
    for idx in lo..=hi {
        let score = score_boundary(records, idx);
        match best {
            Some((_, s)) if score <= s => {}
            _ => best = Some((idx, score)),
        }
    }
    let (idx, score) = best?;
    if score < cfg.score_floor {
        debug!(score, floor = cfg.score_floor, "best boundary below floor; skipping");
        return None;
    }
    Some(idx)
}

/// Additive boundary score; the compaction cut happens *before* `idx`.
pub(crate) fn score_boundary(records: &[MessageRecord], idx: usize) -> i32 {
    let mut score = 100;

    let prev = &records[idx - 1].message;
    if prev.role == Role::User && prev.has_tool_results() {
        score += 50;
    } else if prev.role == Role::Assistant {
        score += 30;
    }

    if splits_tool_pair(records, idx) {
        score -= 100;
    }
    if is_natural_break(records, idx) {
        score += 20;
    }
    if near_error(records, idx) {
        score -= 30;
    }
    if topic_change(records, idx) {
        score += 25;
    }
    score
}

/// True when some tool_use before the cut has its tool_result at or after
/// the cut (directly or through a chained group).
fn splits_tool_pair(records: &[MessageRecord], idx: usize) -> bool {
    let mut pending: HashSet<&str> = HashSet::new();
    for record in &records[..idx] {
        for block in &record.message.content {
            match block {
                ContentBlock::ToolUse { id, .. } => {
                    pending.insert(id.as_str());
                }
                ContentBlock::ToolResult { tool_use_id, .. } => {
                    pending.remove(tool_use_id.as_str());
                }
                _ => {}
            }
        }
    }
    if pending.is_empty() {
        return false;
    }
    records[idx..].iter().any(|r| {
        r.message.content.iter().any(|b| {
            matches!(b, ContentBlock::ToolResult { tool_use_id, .. }
                if pending.contains(tool_use_id.as_str()))
        })
    })
}

fn is_natural_break(records: &[MessageRecord], idx: usize) -> bool {
    let prev = &records[idx - 1];
    let Some(cur) = records.get(idx) else {
        return false;
    };
    if prev.message.role == Role::User && cur.message.role == Role::User {
        return true;
    }
    if (cur.timestamp - prev.timestamp).num_seconds() >= NATURAL_BREAK_GAP_SECS {
        return true;
    }
    let text = cur.message.text().to_lowercase();
    TOPIC_SHIFT_PHRASES.iter().any(|p| text.contains(p))
}

/// Any errored tool result within two messages of the cut.
fn near_error(records: &[MessageRecord], idx: usize) -> bool {
    let lo = idx.saturating_sub(2);
    let hi = (idx + 2).min(records.len());
    records[lo..hi].iter().any(|r| {
        r.message
            .content
            .iter()
            .any(|b| matches!(b, ContentBlock::ToolResult { is_error: true, .. }))
    })
}

/// Crude lexical shift detector: near-zero word overlap between the two
/// messages around the cut.
fn topic_change(records: &[MessageRecord], idx: usize) -> bool {
    let Some(cur) = records.get(idx) else {
        return false;
    };
    let words = |m: &Message| -> HashSet<String> {
        m.text()
            .to_lowercase()
            .split_whitespace()
            .filter(|w| w.len() >= 4)
            .map(str::to_string)
            .collect()
    };
    let a = words(&records[idx - 1].message);
    let b = words(&cur.message);
    if a.len() < 3 || b.len() < 3 {
        return false;
    }
    let shared = a.intersection(&b).count();
    let union = a.union(&b).count();
    (shared as f32 / union as f32) < 0.1
}

// ─── Summarization ────────────────────────────────────────────────────────────

struct PrefixStats<'a> {
    user_texts: Vec<&'a str>,
    assistant_texts: Vec<&'a str>,
    /// id → (tool name, input)
    tool_calls: BTreeMap<&'a str, (&'a str, &'a Value)>,
    /// id → (content, is_error)
    tool_results: BTreeMap<&'a str, (&'a str, bool)>,
    tool_frequency: BTreeMap<&'a str, usize>,
    images: usize,
}

fn collect(prefix: &[MessageRecord]) -> PrefixStats<'_> {
    let mut stats = PrefixStats {
        user_texts: Vec::new(),
        assistant_texts: Vec::new(),
        tool_calls: BTreeMap::new(),
        tool_results: BTreeMap::new(),
        tool_frequency: BTreeMap::new(),
        images: 0,
    };
    for record in prefix {
        for block in &record.message.content {
            match block {
                ContentBlock::Text { text } if !text.is_empty() => match record.message.role {
                    Role::User => stats.user_texts.push(text),
                    Role::Assistant => stats.assistant_texts.push(text),
                    _ => {}
                },
                ContentBlock::ToolUse { id, name, input } => {
                    stats.tool_calls.insert(id, (name, input));
                    *stats.tool_frequency.entry(name).or_insert(0) += 1;
                }
                ContentBlock::ToolResult {
                    tool_use_id,
                    content,
                    is_error,
                } => {
                    stats.tool_results.insert(tool_use_id, (content, *is_error));
                }
                ContentBlock::Image { .. } => stats.images += 1,
                _ => {}
            }
        }
    }
    stats
}

/// Deterministic structured summary of the prefix:
/// 1. a system stats block, 2. a tool-usage block, 3. an assistant
/// narrative block, 4. a system block quoting critical tool calls verbatim.
fn summarize(prefix: &[MessageRecord]) -> Vec<MessageRecord> {
    let stats = collect(prefix);
    let errored = stats
        .tool_results
        .values()
        .filter(|(_, is_error)| *is_error)
        .count();
    let prefix_tokens: usize = prefix.iter().map(|r| r.token_estimate).sum();

    // Block 1: counts and reduction estimate.
    let stats_block = format!(
        "[compaction summary]\n\
         messages: {} (user {}, assistant {})\n\
         tool calls: {} ({} errored), images: {}\n\
         original size: ~{} tokens",
        prefix.len(),
        stats.user_texts.len(),
        stats.assistant_texts.len(),
        stats.tool_calls.len(),
        errored,
        stats.images,
        prefix_tokens,
    );

    // Block 2: per-tool frequency plus notable (errored) results.
    let mut tool_lines: Vec<String> = stats
        .tool_frequency
        .iter()
        .map(|(name, count)| format!("- {name}: {count} call(s)"))
        .collect();
    if tool_lines.is_empty() {
        tool_lines.push("- (no tool calls)".to_string());
    }
    for (id, (content, is_error)) in &stats.tool_results {
        if *is_error {
            if let Some((name, _)) = stats.tool_calls.get(id) {
                let first_line = content.lines().next().unwrap_or("");
                tool_lines.push(format!("- {name} failed: {first_line}"));
            }
        }
    }
    let tool_block = format!("[tool usage]\n{}", tool_lines.join("\n"));

    // Block 3: narrative — top topics, key actions, error categories.
    let topics = top_words(&stats.user_texts, 5);
    let actions: Vec<String> = stats
        .tool_calls
        .values()
        .take(7)
        .map(|(name, input)| format!("{name}({})", primary_arg(input)))
        .collect();
    let error_tools: Vec<&str> = stats
        .tool_results
        .iter()
        .filter(|(_, (_, is_error))| *is_error)
        .filter_map(|(id, _)| stats.tool_calls.get(id).map(|(name, _)| *name))
        .collect::<std::collections::BTreeSet<_>>()
        .into_iter()
        .collect();
    let narrative = format!(
        "Earlier conversation, condensed.\n\
         Topics: {}.\n\
         Key actions: {}.\n\
         Errors involved: {}.",
        join_or(&topics, "(none)"),
        join_or(&actions, "(none)"),
        join_or(&error_tools.iter().map(|s| s.to_string()).collect::<Vec<_>>(), "(none)"),
    );

    // Block 4: critical calls verbatim.
    let mut critical_lines: Vec<String> = Vec::new();
    for (id, (name, input)) in &stats.tool_calls {
        let result = stats.tool_results.get(id);
        let is_error = result.map(|(_, e)| *e).unwrap_or(false);
        if !is_critical(name, input, is_error) {
            continue;
        }
        let outcome = match result {
            Some((content, true)) => format!("error: {content}"),
            Some((content, false)) => format!("result: {content}"),
            None => "result: (none recorded)".to_string(),
        };
        critical_lines.push(format!("{name} {input}\n  {outcome}"));
    }
    let critical_block = if critical_lines.is_empty() {
        "[critical tool calls]\n(none)".to_string()
    } else {
        format!("[critical tool calls]\n{}", critical_lines.join("\n"))
    };

    vec![
        MessageRecord::new(Message::system(stats_block)),
        MessageRecord::new(Message::system(tool_block)),
        MessageRecord::new(Message::assistant(narrative)),
        MessageRecord::new(Message::system(critical_block)),
    ]
}

/// File-mutating or system-changing calls, plus anything that errored.
fn is_critical(name: &str, input: &Value, is_error: bool) -> bool {
    if is_error || MUTATING_TOOLS.contains(&name) {
        return true;
    }
    if name == "Bash" {
        let command = input["command"].as_str().unwrap_or("");
        return ["install", "git commit", "git push", "apt", "pip ", "npm ", "cargo install"]
            .iter()
            .any(|p| command.contains(p));
    }
    false
}

fn primary_arg(input: &Value) -> String {
    for key in ["file_path", "command", "pattern", "url", "query", "notebook_path"] {
        if let Some(v) = input[key].as_str() {
            return v.chars().take(60).collect();
        }
    }
    String::new()
}

const STOPWORDS: [&str; 16] = [
    "this", "that", "with", "from", "have", "what", "when", "then", "them", "will", "would",
    "could", "should", "please", "about", "there",
];

fn top_words(texts: &[&str], limit: usize) -> Vec<String> {
    let mut freq: BTreeMap<String, usize> = BTreeMap::new();
    for text in texts {
        for word in text.to_lowercase().split(|c: char| !c.is_alphanumeric()) {
            if word.len() >= 4 && !STOPWORDS.contains(&word) {
                *freq.entry(word.to_string()).or_insert(0) += 1;
            }
        }
    }
    let mut ranked: Vec<(String, usize)> = freq.into_iter().collect();
    // Stable: frequency descending, then alphabetical.
    ranked.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));
    ranked.into_iter().take(limit).map(|(w, _)| w).collect()
}

fn join_or(items: &[String], fallback: &str) -> String {
    if items.is_empty() {
        fallback.to_string()
    } else {
        items.join(", ")
    }
}

// ─── Tool-result truncation ───────────────────────────────────────────────────

/// Deterministic, content-aware tool-result truncation.
///
/// Returns `content` unchanged when it fits within `cap_tokens` (0 disables
/// the cap).  Otherwise applies a category-specific extraction strategy so
/// the most useful portion of the output survives:
/// head+tail for terminal output, leading matches for match lists, balanced
/// head+tail for file content, a plain line-boundary cut for everything
/// else.  Every truncated result ends with an explicit notice.
pub fn smart_truncate(content: &str, category: OutputCategory, cap_tokens: usize) -> String {
    if cap_tokens == 0 {
        return content.to_string();
    }
    let cap_chars = cap_tokens * 4;
    if content.len() <= cap_chars {
        return content.to_string();
    }
    let omitted_bytes = content.len().saturating_sub(cap_chars);
    match category {
        OutputCategory::HeadTail => head_tail_lines(
            content,
            cap_chars,
            &format!("[... {{lines}} lines / {omitted_bytes} bytes omitted ...]"),
        ),
        OutputCategory::MatchList => head_lines(
            content,
            cap_chars,
            &format!("[... {{lines}} more matches omitted ({omitted_bytes} bytes) ...]"),
        ),
        OutputCategory::FileContent => head_tail_lines(
            content,
            cap_chars,
            &format!("[... {{lines}} lines omitted ({omitted_bytes} bytes); use Read with offset/limit to see more ...]"),
        ),
        OutputCategory::Generic => {
            let hard = floor_boundary(content, cap_chars);
            let cut = content[..hard].rfind('\n').map(|p| p + 1).unwrap_or(hard);
            format!(
                "{}\n[... {omitted_bytes} bytes omitted ...]",
                &content[..cut]
            )
        }
    }
}

/// Largest index ≤ `i` that is a UTF-8 character boundary of `s`.
fn floor_boundary(s: &str, i: usize) -> usize {
    let mut i = i.min(s.len());
    while i > 0 && !s.is_char_boundary(i) {
        i -= 1;
    }
    i
}

/// Keep only the leading lines that fit within `cap_chars`.
fn head_lines(content: &str, cap_chars: usize, notice_template: &str) -> String {
    let lines: Vec<&str> = content.lines().collect();
    let mut kept = String::with_capacity(cap_chars);
    let mut kept_count = 0usize;
    for line in &lines {
        let needed = if kept.is_empty() { line.len() } else { line.len() + 1 };
        if kept.len() + needed > cap_chars {
            break;
        }
        if !kept.is_empty() {
            kept.push('\n');
        }
        kept.push_str(line);
        kept_count += 1;
    }
    let omitted = lines.len().saturating_sub(kept_count);
    if omitted == 0 {
        return content[..floor_boundary(content, cap_chars)].to_string();
    }
    let notice = notice_template.replace("{lines}", &omitted.to_string());
    format!("{kept}\n{notice}")
}

/// Keep a head window and a tail window within `cap_chars`, with the notice
/// between them.  The split favors the tail slightly: errors and summaries
/// appear at the end of command output.
fn head_tail_lines(content: &str, cap_chars: usize, notice_template: &str) -> String {
    let lines: Vec<&str> = content.lines().collect();
    let head_budget = cap_chars / 2;
    let tail_budget = cap_chars - head_budget;

    let mut head: Vec<&str> = Vec::new();
    let mut used = 0usize;
    for line in &lines {
        if used + line.len() + 1 > head_budget {
            break;
        }
        head.push(line);
        used += line.len() + 1;
    }

    let mut tail: Vec<&str> = Vec::new();
    let mut used = 0usize;
    for line in lines.iter().rev() {
        if used + line.len() + 1 > tail_budget {
            break;
        }
        tail.push(line);
        used += line.len() + 1;
    }
    tail.reverse();

    // Overlap means the budget actually fits everything line-wise; cut raw.
    if head.len() + tail.len() >= lines.len() {
        return content[..floor_boundary(content, cap_chars)].to_string();
    }
    let omitted = lines.len() - head.len() - tail.len();
    let notice = notice_template.replace("{lines}", &omitted.to_string());
    format!("{}\n{}\n{}", head.join("\n"), notice, tail.join("\n"))
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
