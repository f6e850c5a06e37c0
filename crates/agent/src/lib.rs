// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Tether agent: the long-running process on a user's machine. Owns its
//! PTYs, mirrors the default session to the local terminal, and multiplexes
//! every session over one reconnecting broker channel.

pub mod client;
pub mod config;
pub mod history;
pub mod local;
pub mod machine;
pub mod pty;
pub mod run;
pub mod sessions;
