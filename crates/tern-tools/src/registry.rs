// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;

use crate::error::ToolError;
use crate::tool::Tool;

/// Coarse grouping used for bulk enable/disable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ToolCategory {
    Filesystem,
    Execution,
    Network,
    Notebook,
    Agent,
}

impl std::fmt::Display for ToolCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Filesystem => write!(f, "filesystem"),
            Self::Execution => write!(f, "execution"),
            Self::Network => write!(f, "network"),
            Self::Notebook => write!(f, "notebook"),
            Self::Agent => write!(f, "agent"),
        }
    }
}

/// A registered tool with its bookkeeping flags.
pub struct ToolRecord {
    pub definition: Arc<dyn Tool>,
    pub category: ToolCategory,
    pub enabled: bool,
}

/// Schema metadata exported for the model prompt.
#[derive(Debug, Clone)]
pub struct ToolSchema {
    pub name: String,
    pub description: String,
    pub input_schema: Value,
}

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("tool already registered: {0}")]
    Duplicate(String),
    #[error("alias target not registered: {0}")]
    UnknownCanonical(String),
    #[error("alias already registered: {0}")]
    DuplicateAlias(String),
}

/// Central registry: canonical name → record, alias → canonical name, and
/// a category index for bulk toggles.  Populated at startup, read-mostly
/// afterwards; immutable registrations for the process lifetime.
#[derive(Default)]
pub struct ToolRegistry {
    tools: HashMap<String, ToolRecord>,
    aliases: HashMap<String, String>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a tool under its canonical name.  Duplicates are an error;
    /// unregister first to replace.
    pub fn register(
        &mut self,
        tool: impl Tool + 'static,
        category: ToolCategory,
    ) -> Result<(), RegistryError> {
        let name = tool.name().to_string();
        if self.tools.contains_key(&name) {
            return Err(RegistryError::Duplicate(name));
        }
        self.tools.insert(
            name,
            ToolRecord {
                definition: Arc::new(tool),
                category,
                enabled: true,
            },
        );
        Ok(())
    }

    /// Map an alternate name onto an already-registered canonical name.
    pub fn register_alias(
        &mut self,
        alias: impl Into<String>,
        canonical: &str,
    ) -> Result<(), RegistryError> {
        let alias = alias.into();
        if !self.tools.contains_key(canonical) {
            return Err(RegistryError::UnknownCanonical(canonical.to_string()));
        }
        if self.aliases.contains_key(&alias) || self.tools.contains_key(&alias) {
            return Err(RegistryError::DuplicateAlias(alias));
        }
        self.aliases.insert(alias, canonical.to_string());
        Ok(())
    }

    /// Remove a record and every alias pointing at it.
    pub fn unregister(&mut self, name: &str) -> bool {
        let canonical = self.resolve(name).to_string();
        let removed = self.tools.remove(&canonical).is_some();
        if removed {
            self.aliases.retain(|_, target| *target != canonical);
        }
        removed
    }

    /// Resolve an alias to its canonical name.  Idempotent: resolving an
    /// already-canonical name returns it unchanged.
    pub fn resolve<'a>(&'a self, name: &'a str) -> &'a str {
        self.aliases.get(name).map(String::as_str).unwrap_or(name)
    }

    /// Fetch an enabled tool by name or alias.
    pub fn get(&self, name: &str) -> Result<Arc<dyn Tool>, ToolError> {
        let canonical = self.resolve(name);
        match self.tools.get(canonical) {
            Some(record) if record.enabled => Ok(record.definition.clone()),
            _ => Err(ToolError::ToolNotFound {
                name: name.to_string(),
            }),
        }
    }

    /// Fetch the record regardless of its enabled flag.
    pub fn record(&self, name: &str) -> Option<&ToolRecord> {
        self.tools.get(self.resolve(name))
    }

    /// Toggle one tool.  The record is retained either way.
    pub fn set_enabled(&mut self, name: &str, enabled: bool) -> bool {
        let canonical = self.resolve(name).to_string();
        match self.tools.get_mut(&canonical) {
            Some(record) => {
                record.enabled = enabled;
                true
            }
            None => false,
        }
    }

    /// Toggle every tool in a category; returns how many were touched.
    pub fn set_category_enabled(&mut self, category: ToolCategory, enabled: bool) -> usize {
        let mut touched = 0;
        for record in self.tools.values_mut() {
            if record.category == category {
                record.enabled = enabled;
                touched += 1;
            }
        }
        touched
    }

    /// Prompt-safe schemas of all enabled tools, sorted by name.
    pub fn schemas(&self) -> Vec<ToolSchema> {
        let mut out: Vec<ToolSchema> = self
            .tools
            .values()
            .filter(|r| r.enabled)
            .map(|r| ToolSchema {
                name: r.definition.name().to_string(),
                description: r.definition.description().to_string(),
                input_schema: r.definition.input_schema(),
            })
            .collect();
        out.sort_by(|a, b| a.name.cmp(&b.name));
        out
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tools.keys().cloned().collect();
        names.sort();
        names
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
