// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
pub mod builtin;
pub mod context;
pub mod error;
pub mod harness;
pub mod hooks;
pub mod permission;
pub mod registry;
pub mod tool;

pub use context::{ExecutionContext, SessionState, ToolProgress};
pub use error::{redact_input, DispatchPhase, ToolError};
pub use harness::{ApprovalHandler, DispatchResult, Harness};
pub use hooks::{HookBus, HookEvent};
pub use permission::{Decision, PathPolicy, PermissionGate, PermissionRule};
pub use registry::{RegistryError, ToolCategory, ToolRegistry, ToolSchema};
pub use tool::{OutputCategory, Tool, ToolCall, ToolOutput};

pub use builtin::bash::BashTool;
pub use builtin::bash_output::BashOutputTool;
pub use builtin::edit::{EditTool, MultiEditTool};
pub use builtin::grep::GrepTool;
pub use builtin::kill_shell::KillShellTool;
pub use builtin::notebook_edit::NotebookEditTool;
pub use builtin::read::ReadTool;
pub use builtin::web_fetch::WebFetchTool;
pub use builtin::web_search::WebSearchTool;
pub use builtin::write::WriteTool;

use std::sync::Arc;

/// Register the builtin tool set with its canonical wire names, the
/// snake_case alias table, and category assignments.
pub fn builtin_registry(search_api_key: Option<String>) -> Result<ToolRegistry, RegistryError> {
    let mut reg = ToolRegistry::new();
    reg.register(ReadTool, ToolCategory::Filesystem)?;
    reg.register(WriteTool, ToolCategory::Filesystem)?;
    reg.register(EditTool, ToolCategory::Filesystem)?;
    reg.register(MultiEditTool, ToolCategory::Filesystem)?;
    reg.register(GrepTool, ToolCategory::Filesystem)?;
    reg.register(BashTool, ToolCategory::Execution)?;
    reg.register(BashOutputTool, ToolCategory::Execution)?;
    reg.register(KillShellTool, ToolCategory::Execution)?;
    reg.register(
        WebFetchTool,
        ToolCategory::Network,
    )?;
    reg.register(
        WebSearchTool {
            api_key: search_api_key,
        },
        ToolCategory::Network,
    )?;
    reg.register(NotebookEditTool, ToolCategory::Notebook)?;

    reg.register_alias("read_file", "Read")?;
    reg.register_alias("write_file", "Write")?;
    reg.register_alias("edit_file", "Edit")?;
    reg.register_alias("multi_edit", "MultiEdit")?;
    reg.register_alias("grep", "Grep")?;
    reg.register_alias("bash", "Bash")?;
    reg.register_alias("bash_output", "BashOutput")?;
    reg.register_alias("kill_shell", "KillShell")?;
    reg.register_alias("web_fetch", "WebFetch")?;
    reg.register_alias("web_search", "WebSearch")?;
    reg.register_alias("notebook_edit", "NotebookEdit")?;
    Ok(reg)
}

/// Builtin registry honoring the network restriction: when disabled, the
/// network category is registered but switched off, so the records exist
/// and lookups fail cleanly.
pub fn builtin_registry_for(
    tools: &tern_config::ToolsConfig,
    search_api_key: Option<String>,
) -> Result<Arc<ToolRegistry>, RegistryError> {
    let mut reg = builtin_registry(search_api_key)?;
    if !tools.network_enabled {
        reg.set_category_enabled(ToolCategory::Network, false);
    }
    Ok(Arc::new(reg))
}

#[cfg(test)]
mod registry_wiring_tests {
    use super::*;

    #[test]
    fn builtin_registry_exposes_canonical_names() {
        let reg = builtin_registry(None).unwrap();
        for name in [
            "Read",
            "Write",
            "Edit",
            "MultiEdit",
            "Grep",
            "Bash",
            "BashOutput",
            "KillShell",
            "WebFetch",
            "WebSearch",
            "NotebookEdit",
        ] {
            assert!(reg.get(name).is_ok(), "missing {name}");
        }
    }

    #[test]
    fn snake_case_aliases_resolve() {
        let reg = builtin_registry(None).unwrap();
        assert_eq!(reg.get("read_file").unwrap().name(), "Read");
        assert_eq!(reg.get("bash_output").unwrap().name(), "BashOutput");
    }

    #[test]
    fn network_restriction_disables_only_network_tools() {
        let cfg = tern_config::ToolsConfig {
            network_enabled: false,
            ..tern_config::ToolsConfig::default()
        };
        let reg = builtin_registry_for(&cfg, None).unwrap();
        assert!(reg.get("WebFetch").is_err());
        assert!(reg.get("WebSearch").is_err());
        assert!(reg.get("Read").is_ok());
        assert!(reg.get("Bash").is_ok());
    }
}
