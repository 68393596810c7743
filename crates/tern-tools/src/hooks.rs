// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::sync::{Arc, RwLock};

use serde_json::Value;
use tracing::warn;

/// Events published on the hook bus around every tool invocation.
#[derive(Debug, Clone)]
pub enum HookEvent {
    ToolPre {
        name: String,
        input: Value,
    },
    ToolPost {
        name: String,
        input: Value,
        content: String,
        is_error: bool,
    },
}

impl HookEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::ToolPre { .. } => "tool:pre",
            Self::ToolPost { .. } => "tool:post",
        }
    }
}

type HookFn = dyn Fn(&HookEvent) -> anyhow::Result<()> + Send + Sync;

/// Synchronous hook bus.  Handler errors are logged and never abort the
/// dispatching invocation.
#[derive(Default)]
pub struct HookBus {
    handlers: RwLock<Vec<(String, Arc<HookFn>)>>,
}

impl HookBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler for an event kind (`"tool:pre"` / `"tool:post"`).
    pub fn register<F>(&self, kind: &str, handler: F)
    where
        F: Fn(&HookEvent) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.handlers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push((kind.to_string(), Arc::new(handler)));
    }

    pub fn fire(&self, event: &HookEvent) {
        let handlers = self.handlers.read().unwrap_or_else(|e| e.into_inner());
        for (kind, handler) in handlers.iter() {
            if kind == event.kind() {
                if let Err(e) = handler(event) {
                    warn!(hook = %kind, error = %e, "hook handler failed");
                }
            }
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn pre_event() -> HookEvent {
        HookEvent::ToolPre {
            name: "Read".into(),
            input: json!({"file_path": "/x"}),
        }
    }

    #[test]
    fn registered_handler_receives_matching_events() {
        let bus = HookBus::new();
        let count = Arc::new(AtomicU32::new(0));
        let c = count.clone();
        bus.register("tool:pre", move |_| {
            c.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
        bus.fire(&pre_event());
        bus.fire(&pre_event());
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn handlers_only_see_their_event_kind() {
        let bus = HookBus::new();
        let count = Arc::new(AtomicU32::new(0));
        let c = count.clone();
        bus.register("tool:post", move |_| {
            c.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
        bus.fire(&pre_event());
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn failing_handler_does_not_block_later_handlers() {
        let bus = HookBus::new();
        let count = Arc::new(AtomicU32::new(0));
        bus.register("tool:pre", |_| anyhow::bail!("hook exploded"));
        let c = count.clone();
        bus.register("tool:pre", move |_| {
            c.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
        bus.fire(&pre_event());
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }
}
