// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Stable machine identifier.
//!
//! A UUID generated on first run and persisted in the state directory. The
//! broker keys agent records on `(user, machine id)`, so the id must survive
//! hostname changes and reinstalls of the binary.

use std::path::{Path, PathBuf};

use anyhow::Context;

const MACHINE_ID_FILE: &str = "machine-id";

/// Resolve the agent state directory.
///
/// Checks the explicit override, then `$XDG_STATE_HOME/tether`, then
/// `$HOME/.local/state/tether`.
pub fn state_dir(explicit: Option<&Path>) -> PathBuf {
    if let Some(dir) = explicit {
        return dir.to_path_buf();
    }
    if let Ok(xdg) = std::env::var("XDG_STATE_HOME") {
        return PathBuf::from(xdg).join("tether");
    }
    if let Ok(home) = std::env::var("HOME") {
        return PathBuf::from(home).join(".local/state/tether");
    }
    PathBuf::from(".tether")
}

/// Load the machine id, creating and persisting one on first run.
pub fn load_or_create(dir: &Path) -> anyhow::Result<String> {
    let path = dir.join(MACHINE_ID_FILE);
    if let Ok(contents) = std::fs::read_to_string(&path) {
        let id = contents.trim();
        if !id.is_empty() {
            return Ok(id.to_owned());
        }
    }

    let id = uuid::Uuid::new_v4().to_string();
    std::fs::create_dir_all(dir)
        .with_context(|| format!("create state dir {}", dir.display()))?;
    std::fs::write(&path, format!("{id}\n"))
        .with_context(|| format!("persist machine id to {}", path.display()))?;
    Ok(id)
}

/// Sixteen random bytes, hex-encoded: the process-instance id the broker
/// uses to tell restarts apart from reconnects.
pub fn new_instance_id() -> String {
    let bytes: [u8; 16] = rand::random();
    let mut out = String::with_capacity(32);
    for byte in bytes {
        out.push_str(&format!("{byte:02x}"));
    }
    out
}

#[cfg(test)]
#[path = "machine_tests.rs"]
mod tests;
