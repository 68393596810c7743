// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use async_trait::async_trait;
use regex::Regex;
use serde_json::{json, Value};
use tracing::debug;
use walkdir::WalkDir;

use crate::context::ExecutionContext;
use crate::tool::{OutputCategory, Tool, ToolCall, ToolOutput};

/// Directories never descended into, on top of the project ignore file.
const DEFAULT_EXCLUSIONS: [&str; 9] = [
    ".git",
    ".hg",
    ".svn",
    "target",
    "node_modules",
    "dist",
    "build",
    ".venv",
    "__pycache__",
];

/// Name of the project-local ignore file read from the working directory.
const IGNORE_FILE: &str = ".ternignore";

/// Per-file byte ceiling for the internal scanner.
const MAX_SCAN_BYTES: u64 = 2 * 1024 * 1024;

const MAX_MATCHES: usize = 500;

pub struct GrepTool;

#[async_trait]
impl Tool for GrepTool {
    fn name(&self) -> &str {
        "Grep"
    }

    fn description(&self) -> &str {
        "Regex content search.\n\
         pattern: full regex. path: file or directory (default: working dir).\n\
         glob: filename filter like '*.rs'. type: language shorthand (rs, py, js, ...).\n\
         output_mode: content (path:line:text, default) | files_with_matches\n\
         (paths only, newest first) | count (path:count).\n\
         VCS metadata, build outputs, and dependency caches are excluded by\n\
         default; a .ternignore file in the working directory adds patterns\n\
         ('#' lines are comments).  Delegates to ripgrep when available."
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "pattern": {
                    "type": "string",
                    "description": "Regular expression to search for"
                },
                "path": {
                    "type": "string",
                    "description": "File or directory to search (default: working directory)"
                },
                "glob": {
                    "type": "string",
                    "description": "Glob filter for file names, e.g. '*.rs'"
                },
                "type": {
                    "type": "string",
                    "description": "File type shorthand: rs, py, js, ts, go, c, cpp, java, rb, sh, md, json, yaml, toml"
                },
                "output_mode": {
                    "type": "string",
                    "description": "content | files_with_matches | count"
                }
            },
            "required": ["pattern"],
            "additionalProperties": false
        })
    }

    fn read_only(&self) -> bool {
        true
    }

    fn output_category(&self) -> OutputCategory {
        OutputCategory::MatchList
    }

    fn validate(&self, input: &Value) -> Vec<String> {
        let mut violations = Vec::new();
        if let Some(p) = input["pattern"].as_str() {
            if let Err(e) = Regex::new(p) {
                violations.push(format!("invalid regex pattern: {e}"));
            }
        }
        if let Some(mode) = input["output_mode"].as_str() {
            if !["content", "files_with_matches", "count"].contains(&mode) {
                violations.push(format!("unknown output_mode: {mode}"));
            }
        }
        violations
    }

    async fn execute(&self, call: &ToolCall, ctx: &ExecutionContext) -> ToolOutput {
        let pattern = match call.input["pattern"].as_str() {
            Some(p) => p.to_string(),
            None => return ToolOutput::err(&call.id, "missing 'pattern'"),
        };
        let root = call.input["path"]
            .as_str()
            .map(|p| ctx.resolve_path(p))
            .unwrap_or_else(|| ctx.workdir.clone());
        let glob = call.input["glob"].as_str().map(str::to_string);
        let file_type = call.input["type"].as_str().map(str::to_string);
        let output_mode = call.input["output_mode"].as_str().unwrap_or("content");

        debug!(pattern = %pattern, root = %root.display(), output_mode, "Grep tool");

        let mut exclusions: Vec<String> =
            DEFAULT_EXCLUSIONS.iter().map(|s| s.to_string()).collect();
        exclusions.extend(load_ignore_file(&ctx.workdir));

        let result = if rg_available().await {
            run_rg(
                &pattern,
                &root,
                glob.as_deref(),
                file_type.as_deref(),
                output_mode,
                &exclusions,
            )
            .await
        } else {
            scan(
                &pattern,
                &root,
                glob.as_deref(),
                file_type.as_deref(),
                output_mode,
                &exclusions,
            )
        };

        match result {
            Ok(out) if out.trim().is_empty() => ToolOutput::ok(&call.id, "(no matches)"),
            Ok(out) => ToolOutput::ok(&call.id, out),
            Err(e) => ToolOutput::err(&call.id, format!("grep error: {e}")),
        }
    }
}

/// Parse the project-local ignore file: one pattern per line, `#` comments.
fn load_ignore_file(workdir: &Path) -> Vec<String> {
    std::fs::read_to_string(workdir.join(IGNORE_FILE))
        .map(|text| {
            text.lines()
                .map(str::trim)
                .filter(|l| !l.is_empty() && !l.starts_with('#'))
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

/// Exclusion patterns compiled once and interpreted identically by both
/// backends: a bare name prunes any directory with that name; a pattern
/// containing `/`, `*`, or `?` matches against the path relative to the
/// search root.
struct ExclusionSet {
    names: Vec<String>,
    path_patterns: Vec<Regex>,
}

impl ExclusionSet {
    fn compile(patterns: &[String]) -> Self {
        let mut names = Vec::new();
        let mut path_patterns = Vec::new();
        for pattern in patterns {
            if pattern.contains(['/', '*', '?']) {
                if let Ok(re) = glob_to_regex(pattern) {
                    path_patterns.push(re);
                }
            } else {
                names.push(pattern.clone());
            }
        }
        Self {
            names,
            path_patterns,
        }
    }

    fn excludes_dir_name(&self, name: &str) -> bool {
        self.names.iter().any(|n| n == name)
    }

    fn excludes_rel_path(&self, rel: &str) -> bool {
        self.path_patterns.iter().any(|re| re.is_match(rel))
    }
}

async fn rg_available() -> bool {
    tokio::process::Command::new("rg")
        .arg("--version")
        .stdin(std::process::Stdio::null())
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::null())
        .status()
        .await
        .map(|s| s.success())
        .unwrap_or(false)
}

async fn run_rg(
    pattern: &str,
    root: &Path,
    glob: Option<&str>,
    file_type: Option<&str>,
    output_mode: &str,
    exclusions: &[String],
) -> anyhow::Result<String> {
    let mut args: Vec<String> = vec!["--color".into(), "never".into(), "--no-heading".into()];
    match output_mode {
        "files_with_matches" => args.push("-l".into()),
        "count" => args.push("-c".into()),
        _ => args.push("-n".into()),
    }
    for ex in exclusions {
        args.push("-g".into());
        args.push(format!("!{ex}"));
    }
    if let Some(g) = glob {
        args.push("-g".into());
        args.push(g.to_string());
    }
    if let Some(t) = file_type {
        if let Some(g) = type_glob(t) {
            args.push("-g".into());
            args.push(g);
        }
    }
    args.push("--".into());
    args.push(pattern.to_string());
    args.push(root.display().to_string());

    let output = tokio::process::Command::new("rg")
        .args(&args)
        .stdin(std::process::Stdio::null())
        .output()
        .await?;
    let stdout = String::from_utf8_lossy(&output.stdout).into_owned();

    if output_mode == "files_with_matches" {
        let mut paths: Vec<String> = stdout.lines().map(str::to_string).collect();
        sort_by_mtime_desc(&mut paths);
        return Ok(cap_lines(paths));
    }
    Ok(cap_lines(stdout.lines().map(str::to_string).collect()))
}

/// Internal scanner used when ripgrep is not installed.  Same output
/// contract: content, files_with_matches (mtime-descending), or count.
fn scan(
    pattern: &str,
    root: &Path,
    glob: Option<&str>,
    file_type: Option<&str>,
    output_mode: &str,
    exclusions: &[String],
) -> anyhow::Result<String> {
    let re = Regex::new(pattern)?;
    let glob_re = glob.map(glob_to_regex).transpose()?;
    let type_ext = file_type.and_then(type_extension);
    let excluded = ExclusionSet::compile(exclusions);

    let mut content_lines: Vec<String> = Vec::new();
    let mut file_hits: Vec<(PathBuf, usize)> = Vec::new();

    let walker = WalkDir::new(root).into_iter().filter_entry(|e| {
        if e.depth() == 0 {
            return true;
        }
        let name = e.file_name().to_string_lossy();
        if e.file_type().is_dir() && excluded.excludes_dir_name(&name) {
            return false;
        }
        let rel = e
            .path()
            .strip_prefix(root)
            .map(|p| p.to_string_lossy().into_owned())
            .unwrap_or_default();
        !excluded.excludes_rel_path(&rel)
    });

    'files: for entry in walker.flatten() {
        if !entry.file_type().is_file() {
            continue;
        }
        let path = entry.path();
        let name = entry.file_name().to_string_lossy();
        if let Some(re) = &glob_re {
            if !re.is_match(&name) {
                continue;
            }
        }
        if let Some(ext) = &type_ext {
            if path.extension().and_then(|e| e.to_str()) != Some(ext) {
                continue;
            }
        }
        if entry.metadata().map(|m| m.len() > MAX_SCAN_BYTES).unwrap_or(true) {
            continue;
        }
        let Ok(bytes) = std::fs::read(path) else {
            continue;
        };
        if bytes.iter().take(4096).any(|&b| b == 0) {
            continue;
        }
        let text = String::from_utf8_lossy(&bytes);
        let mut hits = 0usize;
        for (lineno, line) in text.lines().enumerate() {
            if re.is_match(line) {
                hits += 1;
                if output_mode == "content" {
                    content_lines.push(format!("{}:{}:{}", path.display(), lineno + 1, line));
                    if content_lines.len() >= MAX_MATCHES {
                        break 'files;
                    }
                }
            }
        }
        if hits > 0 {
            file_hits.push((path.to_path_buf(), hits));
        }
    }

    match output_mode {
        "files_with_matches" => {
            let mut paths: Vec<String> = file_hits
                .iter()
                .map(|(p, _)| p.display().to_string())
                .collect();
            sort_by_mtime_desc(&mut paths);
            Ok(cap_lines(paths))
        }
        "count" => Ok(cap_lines(
            file_hits
                .iter()
                .map(|(p, n)| format!("{}:{}", p.display(), n))
                .collect(),
        )),
        _ => Ok(cap_lines(content_lines)),
    }
}

fn cap_lines(mut lines: Vec<String>) -> String {
    if lines.len() > MAX_MATCHES {
        let hidden = lines.len() - MAX_MATCHES;
        lines.truncate(MAX_MATCHES);
        lines.push(format!(
            "... [{hidden} more matches; narrow the pattern or path to see them]"
        ));
    }
    lines.join("\n")
}

/// Most recently modified first; paths that cannot be stat'ed sort last.
fn sort_by_mtime_desc(paths: &mut [String]) {
    let mtime = |p: &str| -> SystemTime {
        std::fs::metadata(p)
            .and_then(|m| m.modified())
            .unwrap_or(SystemTime::UNIX_EPOCH)
    };
    paths.sort_by_key(|p| std::cmp::Reverse(mtime(p)));
}

fn glob_to_regex(pattern: &str) -> Result<Regex, regex::Error> {
    let mut re = String::from("^");
    for ch in pattern.chars() {
        match ch {
            '*' => re.push_str(".*"),
            '?' => re.push('.'),
            c => re.push_str(&regex::escape(&c.to_string())),
        }
    }
    re.push('$');
    Regex::new(&re)
}

fn type_extension(t: &str) -> Option<&'static str> {
    Some(match t {
        "rs" | "rust" => "rs",
        "py" | "python" => "py",
        "js" => "js",
        "ts" => "ts",
        "go" => "go",
        "c" => "c",
        "cpp" => "cpp",
        "java" => "java",
        "rb" | "ruby" => "rb",
        "sh" => "sh",
        "md" => "md",
        "json" => "json",
        "yaml" => "yaml",
        "toml" => "toml",
        _ => return None,
    })
}

fn type_glob(t: &str) -> Option<String> {
    type_extension(t).map(|ext| format!("*.{ext}"))
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
