// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Agent presence: online/offline, last heartbeat, process-instance id.
//!
//! The instance id is random per agent process start and lets the broker
//! tell a restart apart from a reconnect of the same process.

use std::collections::HashMap;
use std::sync::RwLock;
use std::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresenceState {
    Online,
    Offline,
}

#[derive(Debug, Clone)]
pub struct PresenceEntry {
    pub state: PresenceState,
    pub last_heartbeat: Instant,
    pub instance_id: String,
}

#[derive(Default)]
pub struct PresenceMap {
    inner: RwLock<HashMap<i64, PresenceEntry>>,
}

impl PresenceMap {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<i64, PresenceEntry>> {
        self.inner.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn set_online(&self, agent_id: i64, instance_id: &str) {
        self.lock().insert(
            agent_id,
            PresenceEntry {
                state: PresenceState::Online,
                last_heartbeat: Instant::now(),
                instance_id: instance_id.to_owned(),
            },
        );
    }

    pub fn set_offline(&self, agent_id: i64) {
        if let Some(entry) = self.lock().get_mut(&agent_id) {
            entry.state = PresenceState::Offline;
        }
    }

    /// Refresh the heartbeat instant. No-op for unknown agents.
    pub fn heartbeat(&self, agent_id: i64) {
        if let Some(entry) = self.lock().get_mut(&agent_id) {
            entry.last_heartbeat = Instant::now();
        }
    }

    pub fn is_online(&self, agent_id: i64) -> bool {
        self.inner
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(&agent_id)
            .is_some_and(|e| e.state == PresenceState::Online)
    }

    pub fn get(&self, agent_id: i64) -> Option<PresenceEntry> {
        self.inner.read().unwrap_or_else(|poisoned| poisoned.into_inner()).get(&agent_id).cloned()
    }
}

#[cfg(test)]
#[path = "presence_tests.rs"]
mod tests;
