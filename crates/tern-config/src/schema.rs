// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use serde::{Deserialize, Serialize};

/// Serde default helper — returns `true`.
///
/// Used for config fields that should be enabled unless the user explicitly
/// sets them to `false`.  `#[serde(default)]` on a `bool` always falls back
/// to `bool::default()` (i.e. `false`), so a named function is required.
fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub model: ModelConfig,
    #[serde(default)]
    pub agent: AgentConfig,
    #[serde(default)]
    pub exec: ExecConfig,
    #[serde(default)]
    pub tools: ToolsConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub circuit: CircuitConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Model name forwarded to the provider API
    #[serde(default = "default_model_name")]
    pub name: String,
    /// Base URL of the model API endpoint
    #[serde(default = "default_base_url")]
    pub base_url: String,
    /// Environment variable that holds the API key (read at runtime)
    #[serde(default)]
    pub api_key_env: Option<String>,
    /// Explicit API key; prefer api_key_env in config files to avoid secrets
    /// in version-controlled files
    #[serde(default)]
    pub api_key: Option<String>,
    /// Maximum tokens to request in a single completion
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    /// Sampling temperature (0.0–2.0)
    #[serde(default = "default_temperature")]
    pub temperature: Option<f32>,
    /// Nucleus sampling cutoff
    #[serde(default)]
    pub top_p: Option<f32>,
    /// Top-k sampling cutoff
    #[serde(default)]
    pub top_k: Option<u32>,
    /// Sequences at which the model stops generating
    #[serde(default)]
    pub stop_sequences: Vec<String>,
    /// Wire protocol version sent in the version header
    #[serde(default = "default_api_version")]
    pub api_version: String,
    /// Model used by the web-search tool when it differs from the main
    /// model.  Overridable at runtime via the TERN_SEARCH_MODEL env var.
    #[serde(default)]
    pub search_model: Option<String>,
}

fn default_model_name() -> String {
    "claude-sonnet-4-5".into()
}
fn default_base_url() -> String {
    "https://api.anthropic.com".into()
}
fn default_max_tokens() -> u32 {
    8192
}
fn default_temperature() -> Option<f32> {
    Some(0.2)
}
fn default_api_version() -> String {
    "2023-06-01".into()
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            name: "claude-sonnet-4-5".into(),
            base_url: "https://api.anthropic.com".into(),
            // api_key_env is intentionally None here; the client falls
            // through to the conventional ANTHROPIC_API_KEY / TERN_API_KEY
            // lookup when no explicit env var name is configured.
            api_key_env: None,
            api_key: None,
            max_tokens: 8192,
            temperature: Some(0.2),
            top_p: None,
            top_k: None,
            stop_sequences: Vec::new(),
            api_version: default_api_version(),
            search_model: None,
        }
    }
}

fn default_max_tool_rounds() -> u32 {
    200
}
fn default_compaction_threshold_tokens() -> usize {
    150_000
}
fn default_compaction_min_messages() -> usize {
    10
}
fn default_compaction_target_ratio() -> f32 {
    0.5
}
fn default_compaction_score_floor() -> i32 {
    0
}
fn default_tool_result_token_cap() -> usize {
    8_000
}
fn default_subagent_max_depth() -> usize {
    3
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Maximum number of autonomous tool-call rounds before stopping
    #[serde(default = "default_max_tool_rounds")]
    pub max_tool_rounds: u32,
    /// Absolute token count at which microcompaction triggers.
    /// Compaction runs when token_count >= this AND the conversation has at
    /// least `compaction_min_messages` messages.
    #[serde(default = "default_compaction_threshold_tokens")]
    pub compaction_threshold_tokens: usize,
    /// Minimum message count before compaction is considered at all.
    #[serde(default = "default_compaction_min_messages")]
    pub compaction_min_messages: usize,
    /// Fraction of the message list targeted as the compaction boundary.
    /// The scorer searches ±5 messages around floor(len · ratio).
    #[serde(default = "default_compaction_target_ratio")]
    pub compaction_target_ratio: f32,
    /// Minimum boundary score required to compact; below this the run is
    /// skipped and retried after more growth.
    #[serde(default = "default_compaction_score_floor")]
    pub compaction_score_floor: i32,
    /// Maximum tokens allowed for a single tool result before it is
    /// deterministically truncated before entering the conversation.
    /// 0 disables per-result truncation.
    #[serde(default = "default_tool_result_token_cap")]
    pub tool_result_token_cap: usize,
    /// Maximum nesting depth for Task sub-agents.
    #[serde(default = "default_subagent_max_depth")]
    pub subagent_max_depth: usize,
    /// System prompt override; leave None to use the built-in prompt
    #[serde(default)]
    pub system_prompt: Option<String>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            max_tool_rounds: default_max_tool_rounds(),
            compaction_threshold_tokens: default_compaction_threshold_tokens(),
            compaction_min_messages: default_compaction_min_messages(),
            compaction_target_ratio: default_compaction_target_ratio(),
            compaction_score_floor: default_compaction_score_floor(),
            tool_result_token_cap: default_tool_result_token_cap(),
            subagent_max_depth: default_subagent_max_depth(),
            system_prompt: None,
        }
    }
}

fn default_timeout_ms() -> u64 {
    120_000
}
fn default_max_timeout_ms() -> u64 {
    600_000
}
fn default_kill_grace_ms() -> u64 {
    5_000
}
fn default_buffer_capacity() -> usize {
    4 * 1024 * 1024
}
fn default_output_cap_bytes() -> usize {
    30_000
}
fn default_task_retention_secs() -> u64 {
    3600
}
fn default_max_shell_sessions() -> usize {
    10
}
fn default_shell_idle_timeout_secs() -> u64 {
    300
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecConfig {
    /// Default wall-clock deadline for foreground commands, in milliseconds.
    /// A caller-supplied deadline of 0 disables the deadline entirely.
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    /// Hard ceiling on caller-supplied deadlines, in milliseconds.
    #[serde(default = "default_max_timeout_ms")]
    pub max_timeout_ms: u64,
    /// Grace period between SIGTERM and SIGKILL, in milliseconds.
    #[serde(default = "default_kill_grace_ms")]
    pub kill_grace_ms: u64,
    /// Capacity of the per-stream bounded output buffer, in bytes.
    /// Only the most recent bytes are retained once the buffer wraps.
    #[serde(default = "default_buffer_capacity")]
    pub buffer_capacity: usize,
    /// Byte cap applied when background task output is retrieved.
    #[serde(default = "default_output_cap_bytes")]
    pub output_cap_bytes: usize,
    /// How long finished background tasks are retained before the reaper
    /// removes them, in seconds.
    #[serde(default = "default_task_retention_secs")]
    pub task_retention_secs: u64,
    /// Maximum number of persistent shell sessions kept in the pool.
    #[serde(default = "default_max_shell_sessions")]
    pub max_shell_sessions: usize,
    /// Idle timeout after which a persistent shell session is terminated,
    /// in seconds.
    #[serde(default = "default_shell_idle_timeout_secs")]
    pub shell_idle_timeout_secs: u64,
    /// Regex patterns rejected before spawn.  Matched against the full
    /// command string; these catch catastrophic mistakes, not adversaries.
    #[serde(default = "default_danger_patterns")]
    pub danger_patterns: Vec<String>,
}

fn default_danger_patterns() -> Vec<String> {
    [
        r"rm\s+(-[a-zA-Z]*r[a-zA-Z]*f|-[a-zA-Z]*f[a-zA-Z]*r)\s+/\s*$",
        r"rm\s+(-[a-zA-Z]*r[a-zA-Z]*f|-[a-zA-Z]*f[a-zA-Z]*r)\s+/\s",
        r":\s*\(\s*\)\s*\{\s*:\s*\|\s*:\s*&\s*\}\s*;",
        r"mkfs(\.\w+)?\s+/dev/",
        r"dd\s+.*of=/dev/(sd|hd|nvme)",
        r">\s*/dev/(sd|hd|nvme)",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

impl Default for ExecConfig {
    fn default() -> Self {
        Self {
            timeout_ms: default_timeout_ms(),
            max_timeout_ms: default_max_timeout_ms(),
            kill_grace_ms: default_kill_grace_ms(),
            buffer_capacity: default_buffer_capacity(),
            output_cap_bytes: default_output_cap_bytes(),
            task_retention_secs: default_task_retention_secs(),
            max_shell_sessions: default_max_shell_sessions(),
            shell_idle_timeout_secs: default_shell_idle_timeout_secs(),
            danger_patterns: default_danger_patterns(),
        }
    }
}

/// Default decision when no allow/deny rule matches a tool call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum PermissionMode {
    Allow,
    Deny,
    #[default]
    Ask,
}

fn default_read_line_limit() -> usize {
    2000
}
fn default_web_fetch_max_chars() -> usize {
    50_000
}
fn default_forbidden_paths() -> Vec<String> {
    [
        "/etc/shadow",
        "/etc/sudoers",
        "/proc",
        "/sys",
        "~/.ssh",
        "~/.gnupg",
        "~/.aws/credentials",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolsConfig {
    /// Rules that allow a tool call without asking.  Format:
    /// `"ToolName"`, `"Bash(git *)"`, or `"WebFetch(domain:docs.rs)"`.
    #[serde(default)]
    pub allow: Vec<String>,
    /// Rules that deny a tool call outright.  Same format; deny rules take
    /// precedence over allow rules.
    #[serde(default)]
    pub deny: Vec<String>,
    /// Decision applied when no rule matches.
    #[serde(default)]
    pub default_mode: PermissionMode,
    /// Path prefixes that no tool may touch, regardless of rules.
    #[serde(default = "default_forbidden_paths")]
    pub forbidden_paths: Vec<String>,
    /// When non-empty, file tools may only touch paths under these prefixes.
    #[serde(default)]
    pub allowed_paths: Vec<String>,
    /// Per-line character cap applied by the Read tool.
    #[serde(default = "default_read_line_limit")]
    pub read_line_limit: usize,
    /// Character cap for WebFetch results.
    #[serde(default = "default_web_fetch_max_chars")]
    pub web_fetch_max_chars: usize,
    /// Enable network tools (WebFetch, WebSearch).  Forced off when
    /// TERN_NO_NETWORK or NETWORK_RESTRICTED is set in the environment.
    #[serde(default = "default_true")]
    pub network_enabled: bool,
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self {
            allow: Vec::new(),
            deny: Vec::new(),
            default_mode: PermissionMode::default(),
            forbidden_paths: default_forbidden_paths(),
            allowed_paths: Vec::new(),
            read_line_limit: default_read_line_limit(),
            web_fetch_max_chars: default_web_fetch_max_chars(),
            network_enabled: true,
        }
    }
}

/// Backoff jitter mode for the retry controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum JitterMode {
    None,
    #[default]
    Full,
    Decorrelated,
}

/// Delay growth curve between retry attempts.
///
/// `decorrelated` here and `jitter: decorrelated` select the same
/// algorithm; the jitter setting wins when the two disagree, since
/// decorrelated jitter *is* its own curve.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum BackoffCurve {
    /// initial · multiplier^attempt, capped.
    #[default]
    Exponential,
    /// initial · (attempt + 1), capped.
    Linear,
    /// initial · fib(attempt + 1), capped.
    Fibonacci,
    /// Uniformly sampled from [initial, min(cap, previous · 3)].
    Decorrelated,
}

fn default_max_attempts() -> u32 {
    4
}
fn default_initial_delay_ms() -> u64 {
    1_000
}
fn default_max_delay_ms() -> u64 {
    30_000
}
fn default_multiplier() -> f64 {
    2.0
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Total attempts, including the first (so 4 = 1 call + 3 retries).
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Base delay for the first retry, in milliseconds.
    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,
    /// Delay cap, in milliseconds.
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    /// Exponential backoff multiplier.
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,
    /// Delay growth curve.
    #[serde(default)]
    pub strategy: BackoffCurve,
    /// Jitter applied on top of the computed delay.
    #[serde(default)]
    pub jitter: JitterMode,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_delay_ms: default_initial_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            multiplier: default_multiplier(),
            strategy: BackoffCurve::default(),
            jitter: JitterMode::default(),
        }
    }
}

fn default_failure_threshold() -> u32 {
    5
}
fn default_success_threshold() -> u32 {
    2
}
fn default_reset_timeout_secs() -> u64 {
    30
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitConfig {
    /// Consecutive failures that open the circuit.
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    /// Successes required in half-open state to close the circuit again.
    #[serde(default = "default_success_threshold")]
    pub success_threshold: u32,
    /// Seconds the circuit stays open before allowing a half-open probe.
    #[serde(default = "default_reset_timeout_secs")]
    pub reset_timeout_secs: u64,
}

impl Default for CircuitConfig {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            success_threshold: default_success_threshold(),
            reset_timeout_secs: default_reset_timeout_secs(),
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
