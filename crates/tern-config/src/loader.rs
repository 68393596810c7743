// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::path::{Path, PathBuf};

use anyhow::Context;
use tracing::debug;

use crate::Config;

/// Where a configuration layer came from.  Layers apply in this order, so
/// a workspace file beats the user config, which beats the system one; an
/// explicit `--config` path beats everything except the environment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LayerSource {
    System,
    User,
    Workspace,
    Explicit,
}

/// Candidate layer files, lowest precedence first.  Both `.yaml` and
/// `.yml` spellings are accepted at every location.
fn layer_candidates(explicit: Option<&Path>) -> Vec<(LayerSource, PathBuf)> {
    let mut candidates = Vec::new();
    for name in ["config.yaml", "config.yml"] {
        candidates.push((LayerSource::System, PathBuf::from("/etc/tern").join(name)));
    }
    if let Some(home) = dirs::home_dir() {
        for name in ["config.yaml", "config.yml"] {
            candidates.push((LayerSource::User, home.join(".config/tern").join(name)));
        }
    }
    if let Some(config_dir) = dirs::config_dir() {
        for name in ["config.yaml", "config.yml"] {
            candidates.push((LayerSource::User, config_dir.join("tern").join(name)));
        }
    }
    for name in [".tern/config.yaml", ".tern/config.yml", ".tern.yaml", ".tern.yml"] {
        candidates.push((LayerSource::Workspace, PathBuf::from(name)));
    }
    if let Some(path) = explicit {
        candidates.push((LayerSource::Explicit, path.to_path_buf()));
    }
    candidates
}

/// Load the configuration: fold every discovered layer lowest-to-highest,
/// then apply the environment overrides, which beat all files.
///
/// Discovered layers that are absent are skipped silently; an explicit
/// `--config` path that cannot be read is an error, since the caller named
/// it deliberately.  A merged document that does not fit the schema is an
/// error rather than a silent fallback to defaults — a typo in a config
/// key should be heard about, not ignored.
pub fn load(explicit: Option<&Path>) -> anyhow::Result<Config> {
    let mut merged: Option<serde_yaml::Value> = None;

    for (source, path) in layer_candidates(explicit) {
        if source != LayerSource::Explicit && !path.is_file() {
            continue;
        }
        let text = std::fs::read_to_string(&path)
            .with_context(|| format!("reading config layer {}", path.display()))?;
        let layer: serde_yaml::Value = serde_yaml::from_str(&text)
            .with_context(|| format!("parsing config layer {}", path.display()))?;
        debug!(?source, path = %path.display(), "applying config layer");
        merged = Some(match merged.take() {
            None => layer,
            Some(base) => overlay(base, layer),
        });
    }

    let mut config = match merged {
        None => Config::default(),
        Some(document) => serde_yaml::from_value(document)
            .context("merged configuration does not match the expected schema")?,
    };
    apply_env(&mut config, |name| std::env::var(name).ok());
    Ok(config)
}

/// Overlay `top` onto `base`, by value.
///
/// Mappings merge key-by-key, recursing into keys present on both sides.
/// Every other pairing resolves to `top`: a higher layer replaces scalars
/// and sequences wholesale, and can replace an entire section by writing a
/// non-mapping value over it.
fn overlay(base: serde_yaml::Value, top: serde_yaml::Value) -> serde_yaml::Value {
    use serde_yaml::Value;
    match (base, top) {
        (Value::Mapping(mut lower), Value::Mapping(upper)) => {
            for (key, value) in upper {
                let resolved = match lower.remove(&key) {
                    Some(existing) => overlay(existing, value),
                    None => value,
                };
                lower.insert(key, resolved);
            }
            Value::Mapping(lower)
        }
        (_, top) => top,
    }
}

/// Environment overrides.  Reading through a lookup function keeps this
/// testable without mutating the process environment.
fn apply_env(config: &mut Config, get: impl Fn(&str) -> Option<String>) {
    // Either restriction variable hard-disables the network tools; the
    // value is irrelevant, presence is the signal.
    if get("TERN_NO_NETWORK").is_some() || get("NETWORK_RESTRICTED").is_some() {
        config.tools.network_enabled = false;
    }
    if let Some(model) = get("TERN_SEARCH_MODEL") {
        let model = model.trim();
        if !model.is_empty() {
            config.model.search_model = Some(model.to_string());
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn yaml(s: &str) -> serde_yaml::Value {
        serde_yaml::from_str(s).unwrap()
    }

    // ── Overlay semantics ─────────────────────────────────────────────────────

    #[test]
    fn higher_layer_replaces_scalars() {
        let merged = overlay(yaml("exec:\n  timeout_ms: 1000"), yaml("exec:\n  timeout_ms: 50"));
        assert_eq!(merged["exec"]["timeout_ms"].as_i64(), Some(50));
    }

    #[test]
    fn sections_merge_key_by_key() {
        let merged = overlay(
            yaml("model:\n  name: base-model\n  max_tokens: 4096"),
            yaml("model:\n  name: override-model"),
        );
        assert_eq!(merged["model"]["name"].as_str(), Some("override-model"));
        assert_eq!(merged["model"]["max_tokens"].as_i64(), Some(4096));
    }

    #[test]
    fn keys_unique_to_either_side_survive() {
        let merged = overlay(yaml("agent:\n  max_tool_rounds: 10"), yaml("tools:\n  allow: []"));
        assert_eq!(merged["agent"]["max_tool_rounds"].as_i64(), Some(10));
        assert!(merged["tools"]["allow"].as_sequence().is_some());
    }

    #[test]
    fn sequences_are_replaced_wholesale_not_appended() {
        let merged = overlay(
            yaml("tools:\n  deny: [\"Bash(rm *)\", \"Bash(dd *)\"]"),
            yaml("tools:\n  deny: [\"WebFetch\"]"),
        );
        let deny = merged["tools"]["deny"].as_sequence().unwrap();
        assert_eq!(deny.len(), 1);
        assert_eq!(deny[0].as_str(), Some("WebFetch"));
    }

    #[test]
    fn a_scalar_can_blank_out_a_whole_section() {
        let merged = overlay(yaml("retry:\n  max_attempts: 9"), yaml("retry: ~"));
        assert!(merged["retry"].is_null());
    }

    // ── Loading ───────────────────────────────────────────────────────────────

    #[test]
    fn explicit_layer_has_the_last_word() {
        use std::io::Write;
        let mut f = tempfile::NamedTempFile::new().unwrap();
        writeln!(f, "model:\n  name: from-explicit\nexec:\n  timeout_ms: 77").unwrap();
        let cfg = load(Some(f.path())).unwrap();
        assert_eq!(cfg.model.name, "from-explicit");
        assert_eq!(cfg.exec.timeout_ms, 77);
        // Untouched sections keep their defaults.
        assert_eq!(cfg.exec.kill_grace_ms, 5_000);
    }

    #[test]
    fn missing_explicit_path_is_an_error() {
        assert!(load(Some(Path::new("/tmp/tern_no_such_config.yaml"))).is_err());
    }

    #[test]
    fn malformed_explicit_layer_is_an_error() {
        use std::io::Write;
        let mut f = tempfile::NamedTempFile::new().unwrap();
        writeln!(f, "model: [this is not a model section]").unwrap();
        assert!(load(Some(f.path())).is_err());
    }

    #[test]
    fn explicit_candidates_come_after_every_discovered_location() {
        let explicit = PathBuf::from("/somewhere/tern.yaml");
        let candidates = layer_candidates(Some(&explicit));
        let (last_source, last_path) = candidates.last().unwrap();
        assert_eq!(*last_source, LayerSource::Explicit);
        assert_eq!(*last_path, explicit);
    }

    // ── Environment overrides ─────────────────────────────────────────────────

    fn env_of<'a>(pairs: &'a [(&'a str, &'a str)]) -> impl Fn(&str) -> Option<String> + 'a {
        move |name| {
            pairs
                .iter()
                .find(|(k, _)| *k == name)
                .map(|(_, v)| v.to_string())
        }
    }

    #[test]
    fn either_restriction_variable_disables_network_tools() {
        for var in ["TERN_NO_NETWORK", "NETWORK_RESTRICTED"] {
            let mut cfg = Config::default();
            assert!(cfg.tools.network_enabled);
            apply_env(&mut cfg, env_of(&[(var, "1")]));
            assert!(!cfg.tools.network_enabled, "{var} should disable network");
        }
    }

    #[test]
    fn restriction_applies_even_with_an_empty_value() {
        let mut cfg = Config::default();
        apply_env(&mut cfg, env_of(&[("TERN_NO_NETWORK", "")]));
        assert!(!cfg.tools.network_enabled);
    }

    #[test]
    fn search_model_override_beats_the_file_value() {
        let mut cfg = Config::default();
        cfg.model.search_model = Some("from-file".into());
        apply_env(&mut cfg, env_of(&[("TERN_SEARCH_MODEL", "from-env")]));
        assert_eq!(cfg.model.search_model.as_deref(), Some("from-env"));
    }

    #[test]
    fn blank_search_model_override_is_ignored() {
        let mut cfg = Config::default();
        cfg.model.search_model = Some("kept".into());
        apply_env(&mut cfg, env_of(&[("TERN_SEARCH_MODEL", "   ")]));
        assert_eq!(cfg.model.search_model.as_deref(), Some("kept"));
    }

    #[test]
    fn no_variables_set_changes_nothing() {
        let mut cfg = Config::default();
        apply_env(&mut cfg, |_| None);
        assert!(cfg.tools.network_enabled);
        assert_eq!(cfg.model.search_model, None);
    }
}
