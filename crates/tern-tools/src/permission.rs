// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::path::{Component, Path, PathBuf};

use regex::Regex;
use serde_json::Value;

use tern_config::{PermissionMode, ToolsConfig};

/// Input keys that carry filesystem paths subject to path policy.
const PATH_KEYS: [&str; 3] = ["file_path", "path", "notebook_path"];

/// The gate's resolution for one (tool, input) pair.
#[derive(Debug, Clone, PartialEq)]
pub enum Decision {
    Allow,
    /// Allowed, but downstream phases must use the substituted input
    /// (e.g. a normalized path) instead of the original.
    AllowUpdated(Value),
    Deny(String),
    /// The caller must consult the user before proceeding.
    Ask(String),
    /// Path policy violation; maps to the `forbidden_path` error kind.
    ForbiddenPath(String),
}

/// Predicate half of a permission rule.
#[derive(Debug, Clone)]
enum RuleMatcher {
    /// Tool name alone decides.
    Any,
    /// Pattern over `input.command` (`"git *"` matches git subcommands).
    Command(String),
    /// Glob over path-bearing inputs.
    PathGlob(Regex),
    /// Suffix match over the host of `input.url`.
    Domain(String),
}

/// One allow/deny rule: tool name plus an input predicate.
#[derive(Debug, Clone)]
pub struct PermissionRule {
    tool: String,
    matcher: RuleMatcher,
}

impl PermissionRule {
    /// Parse `"Tool"`, `"Tool(git *)"`, `"Tool(/path/glob*)"`, or
    /// `"Tool(domain:docs.rs)"`.  Returns `None` for malformed rules.
    pub fn parse(rule: &str) -> Option<Self> {
        let rule = rule.trim();
        if rule.is_empty() {
            return None;
        }
        let (tool, predicate) = match rule.find('(') {
            Some(open) if rule.ends_with(')') => {
                (&rule[..open], Some(&rule[open + 1..rule.len() - 1]))
            }
            Some(_) => return None,
            None => (rule, None),
        };
        let matcher = match predicate {
            None | Some("") | Some("*") => RuleMatcher::Any,
            Some(p) => {
                if let Some(domain) = p.strip_prefix("domain:") {
                    RuleMatcher::Domain(domain.to_string())
                } else if p.starts_with('/') || p.starts_with("~/") {
                    RuleMatcher::PathGlob(glob_to_regex(p)?)
                } else {
                    RuleMatcher::Command(p.to_string())
                }
            }
        };
        Some(Self {
            tool: tool.to_string(),
            matcher,
        })
    }

    fn matches(&self, tool: &str, input: &Value) -> bool {
        if self.tool != "*" && self.tool != tool {
            return false;
        }
        match &self.matcher {
            RuleMatcher::Any => true,
            RuleMatcher::Command(pattern) => input["command"]
                .as_str()
                .map(|cmd| command_matches(pattern, cmd))
                .unwrap_or(false),
            RuleMatcher::PathGlob(re) => PATH_KEYS
                .iter()
                .filter_map(|k| input[*k].as_str())
                .any(|p| re.is_match(p)),
            RuleMatcher::Domain(domain) => input["url"]
                .as_str()
                .and_then(host_of)
                .map(|h| h == *domain || h.ends_with(&format!(".{domain}")))
                .unwrap_or(false),
        }
    }
}

/// `"git *"` matches "git" and anything under it; a trailing `*` without a
/// space is a plain prefix; otherwise the command must match exactly.
fn command_matches(pattern: &str, command: &str) -> bool {
    if pattern == "*" {
        return true;
    }
    if let Some(prefix) = pattern.strip_suffix(" *") {
        command == prefix || command.starts_with(&format!("{prefix} "))
    } else if let Some(prefix) = pattern.strip_suffix('*') {
        command.starts_with(prefix)
    } else {
        command == pattern
    }
}

fn host_of(url: &str) -> Option<String> {
    let rest = url.split_once("://").map(|(_, r)| r).unwrap_or(url);
    let host = rest.split(['/', '?', '#']).next()?;
    let host = host.rsplit('@').next()?;
    Some(host.split(':').next()?.to_lowercase())
}

/// Convert a simple glob pattern to a [`Regex`].
/// `*` matches anything (including `/`), `?` matches one character.
fn glob_to_regex(pattern: &str) -> Option<Regex> {
    let mut re = String::from("^");
    for ch in pattern.chars() {
        match ch {
            '*' => re.push_str(".*"),
            '?' => re.push('.'),
            c => re.push_str(&regex::escape(&c.to_string())),
        }
    }
    re.push('$');
    Regex::new(&re).ok()
}

/// Lexical path rules: absolute, `..`-free after normalization, outside the
/// forbidden prefixes, and (when a whitelist exists) under an allowed prefix.
#[derive(Debug)]
pub struct PathPolicy {
    forbidden: Vec<PathBuf>,
    allowed: Vec<PathBuf>,
}

impl PathPolicy {
    pub fn from_config(cfg: &ToolsConfig) -> Self {
        Self {
            forbidden: cfg.forbidden_paths.iter().map(|p| expand_home(p)).collect(),
            allowed: cfg.allowed_paths.iter().map(|p| expand_home(p)).collect(),
        }
    }

    /// Lexically normalize a path: resolve `.` and `..` without touching the
    /// filesystem.  A `..` that would escape the root is a violation.
    pub fn normalize(path: &str) -> Result<PathBuf, String> {
        let p = Path::new(path);
        if !p.is_absolute() {
            return Err(format!("path must be absolute: {path}"));
        }
        let mut out = PathBuf::new();
        for comp in p.components() {
            match comp {
                Component::CurDir => {}
                Component::ParentDir => {
                    if !out.pop() || out.as_os_str().is_empty() {
                        return Err(format!("path traversal escapes root: {path}"));
                    }
                }
                other => out.push(other),
            }
        }
        Ok(out)
    }

    /// Normalize and enforce the prefix rules.
    pub fn check(&self, path: &str) -> Result<PathBuf, String> {
        let normalized = Self::normalize(path)?;
        for prefix in &self.forbidden {
            if normalized.starts_with(prefix) {
                return Err(format!("{} is under forbidden prefix {}", normalized.display(), prefix.display()));
            }
        }
        if !self.allowed.is_empty()
            && !self.allowed.iter().any(|p| normalized.starts_with(p))
        {
            return Err(format!(
                "{} is outside the allowed path prefixes",
                normalized.display()
            ));
        }
        Ok(normalized)
    }
}

fn expand_home(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = std::env::var_os("HOME") {
            return PathBuf::from(home).join(rest);
        }
    }
    PathBuf::from(path)
}

/// Resolves allow / deny / ask for a (tool, input) pair.
///
/// Resolution order: path policy, then deny rules (highest precedence),
/// then allow rules, then the configured default mode.  The gate is pure
/// given its configuration; it performs no I/O.
///
/// When the decision is an allow and a path input normalized to a different
/// string, the gate returns `AllowUpdated` with the normalized form so
/// downstream phases operate on canonical paths.
#[derive(Debug)]
pub struct PermissionGate {
    allow_rules: Vec<PermissionRule>,
    deny_rules: Vec<PermissionRule>,
    default_mode: PermissionMode,
    path_policy: PathPolicy,
}

impl PermissionGate {
    pub fn from_config(cfg: &ToolsConfig) -> Self {
        let parse_all = |rules: &[String]| -> Vec<PermissionRule> {
            rules.iter().filter_map(|r| PermissionRule::parse(r)).collect()
        };
        Self {
            allow_rules: parse_all(&cfg.allow),
            deny_rules: parse_all(&cfg.deny),
            default_mode: cfg.default_mode,
            path_policy: PathPolicy::from_config(cfg),
        }
    }

    pub fn path_policy(&self) -> &PathPolicy {
        &self.path_policy
    }

    pub fn check(&self, tool: &str, input: &Value) -> Decision {
        // Path policy first; it cannot be overridden by allow rules.
        let mut updated = input.clone();
        let mut rewrote = false;
        for key in PATH_KEYS {
            if let Some(raw) = input[key].as_str() {
                match self.path_policy.check(raw) {
                    Err(reason) => return Decision::ForbiddenPath(reason),
                    Ok(normalized) => {
                        let normalized = normalized.to_string_lossy().into_owned();
                        if normalized != raw {
                            updated[key] = Value::String(normalized);
                            rewrote = true;
                        }
                    }
                }
            }
        }

        // Rules match the normalized form so a glob cannot be dodged with
        // `.` / `..` segments.
        for rule in &self.deny_rules {
            if rule.matches(tool, &updated) {
                return Decision::Deny(format!("denied by rule for {tool}"));
            }
        }

        let allowed = self.allow_rules.iter().any(|r| r.matches(tool, &updated));
        let decision = if allowed {
            PermissionMode::Allow
        } else {
            self.default_mode
        };
        match decision {
            PermissionMode::Allow if rewrote => Decision::AllowUpdated(updated),
            PermissionMode::Allow => Decision::Allow,
            PermissionMode::Deny => Decision::Deny(format!("no rule allows {tool}")),
            PermissionMode::Ask => Decision::Ask(format!("{tool} requires approval")),
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
