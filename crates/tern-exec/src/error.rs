// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0

/// Errors surfaced by the subprocess supervisor.
#[derive(Debug, thiserror::Error)]
pub enum ExecError {
    /// The command matched a danger pattern and was rejected before spawn.
    #[error("command rejected: {0}")]
    Rejected(String),

    #[error("spawn failed: {0}")]
    Spawn(#[from] std::io::Error),

    #[error("unknown task: {0}")]
    UnknownTask(String),

    /// Kill was requested for a task that is no longer running.
    #[error("task {0} is not running")]
    NotRunning(String),

    #[error("invalid filter regex: {0}")]
    BadFilter(String),

    #[error("shell session error: {0}")]
    Session(String),

    #[error("cancelled")]
    Cancelled,
}
