// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
pub mod background;
pub mod buffer;
pub mod error;
pub mod foreground;
pub mod shell_session;

pub use background::{BackgroundSupervisor, TaskOutput, TaskStatus, TaskSummary};
pub use buffer::{shared_buffer, BoundedBuffer, SharedBuffer};
pub use error::ExecError;
pub use foreground::{ExecRequest, ExecResult, Executor, TerminationReason};
pub use shell_session::{SessionExec, ShellSessionPool};
