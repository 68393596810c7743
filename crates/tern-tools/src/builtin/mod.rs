// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
pub mod bash;
pub mod bash_output;
pub mod edit;
pub mod grep;
pub mod kill_shell;
pub mod notebook_edit;
pub mod read;
pub mod web_fetch;
pub mod web_search;
pub mod write;
