// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Session lifecycle: creation, ownership checks, termination, archival.
//!
//! Routing works off the in-memory active map; the store is the durable
//! record. The map is populated on create and lazily re-hydrated from the
//! store so a session created by another broker instance still routes.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use tether_protocol::{epoch_ms, ErrorCode, Payload};

use crate::hub::Hub;
use crate::scrollback::ScrollbackCache;
use crate::store::{SessionKind, SessionRow, SessionStatus, Store};

/// Exit code reported to viewers when a session dies with its agent's
/// transport rather than by its own PTY exiting.
pub const DISCONNECT_EXIT_CODE: i32 = -1;

/// Routing view of an active session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ActiveSession {
    pub agent_id: i64,
    pub user_id: i64,
    pub is_default: bool,
}

pub struct SessionManager {
    store: Arc<Store>,
    scrollback: Arc<ScrollbackCache>,
    hub: Arc<Hub>,
    active: RwLock<HashMap<i64, ActiveSession>>,
}

impl SessionManager {
    pub fn new(store: Arc<Store>, scrollback: Arc<ScrollbackCache>, hub: Arc<Hub>) -> Arc<Self> {
        Arc::new(Self { store, scrollback, hub, active: RwLock::new(HashMap::new()) })
    }

    /// Look up an active session, falling back to the store for sessions
    /// created elsewhere (other broker instance, or before a map eviction).
    pub async fn active(&self, session_id: i64) -> Option<ActiveSession> {
        if let Some(found) = self.active.read().await.get(&session_id) {
            return Some(*found);
        }
        let row = self.store.get_session(session_id).ok().flatten()?;
        if row.status != SessionStatus::Active {
            return None;
        }
        let agent = self.store.get_agent(row.agent_id).ok().flatten()?;
        let entry = ActiveSession {
            agent_id: row.agent_id,
            user_id: agent.user_id,
            is_default: row.kind == SessionKind::Default,
        };
        self.active.write().await.insert(session_id, entry);
        Some(entry)
    }

    /// Ownership check for a session operation: session -> agent -> user.
    ///
    /// Distinguishes "not yours" from "gone": a mismatched owner always gets
    /// the permission error, never a state hint.
    pub async fn authorize(
        &self,
        session_id: i64,
        user_id: i64,
    ) -> Result<ActiveSession, ErrorCode> {
        if let Some(active) = self.active(session_id).await {
            return if active.user_id == user_id {
                Ok(active)
            } else {
                Err(ErrorCode::PermissionDenied)
            };
        }
        // Not active: classify against the durable record.
        let row = self
            .store
            .get_session(session_id)
            .map_err(|_| ErrorCode::Internal)?
            .ok_or(ErrorCode::SessionNotFound)?;
        let agent = self
            .store
            .get_agent(row.agent_id)
            .map_err(|_| ErrorCode::Internal)?
            .ok_or(ErrorCode::SessionNotFound)?;
        if agent.user_id != user_id {
            Err(ErrorCode::PermissionDenied)
        } else {
            Err(ErrorCode::SessionEnded)
        }
    }

    /// Agent registration path: create the default session unless one is
    /// already active, then instruct the agent and inform viewers.
    ///
    /// Idempotent per agent: a second call returns the existing session.
    pub async fn ensure_default(&self, agent_id: i64, user_id: i64) -> anyhow::Result<SessionRow> {
        if let Some(existing) = self.store.find_active_default(agent_id)? {
            self.active.write().await.insert(
                existing.id,
                ActiveSession { agent_id, user_id, is_default: true },
            );
            debug!(agent_id, session_id = existing.id, "default session already active");
            self.notify_create(&existing, user_id).await;
            return Ok(existing);
        }

        let row = self.store.create_session(agent_id, SessionKind::Default, "", epoch_ms())?;
        self.active
            .write()
            .await
            .insert(row.id, ActiveSession { agent_id, user_id, is_default: true });
        info!(agent_id, session_id = row.id, "default session created");
        self.notify_create(&row, user_id).await;
        Ok(row)
    }

    /// Viewer REST path: create a background session on an agent the caller
    /// owns. The agent must be online; `is_default` is never caller-chosen.
    pub async fn create_background(
        &self,
        user_id: i64,
        agent_id: i64,
        working_dir: Option<String>,
    ) -> Result<SessionRow, ErrorCode> {
        let agent = self
            .store
            .get_agent(agent_id)
            .map_err(|_| ErrorCode::Internal)?
            .ok_or(ErrorCode::BadRequest)?;
        if agent.user_id != user_id {
            return Err(ErrorCode::PermissionDenied);
        }
        if !self.hub.presence().is_online(agent_id) {
            return Err(ErrorCode::AgentOffline);
        }

        let working_dir = working_dir.unwrap_or_default();
        let row = self
            .store
            .create_session(agent_id, SessionKind::Background, &working_dir, epoch_ms())
            .map_err(|_| ErrorCode::Internal)?;
        self.active
            .write()
            .await
            .insert(row.id, ActiveSession { agent_id, user_id, is_default: false });
        info!(agent_id, session_id = row.id, "background session created");
        self.notify_create(&row, user_id).await;
        Ok(row)
    }

    /// Fire-and-forget `session:create` toward the agent plus viewer
    /// awareness fan-out. Loss is tolerated; the session record survives.
    async fn notify_create(&self, row: &SessionRow, user_id: i64) {
        let payload = Payload::SessionCreate {
            session_id: row.id,
            working_dir: if row.working_dir.is_empty() {
                None
            } else {
                Some(row.working_dir.clone())
            },
            is_default: row.kind == SessionKind::Default,
        };
        let delivered = self
            .hub
            .send_to_agent(row.agent_id, tether_protocol::Envelope::new(payload.clone()))
            .await;
        if !delivered {
            warn!(session_id = row.id, agent_id = row.agent_id, "session:create not delivered");
        }
        self.hub.fan_to_user(user_id, payload).await;
    }

    /// End a session: evict it from routing, archive its scrollback, mark
    /// the record ended, tell the agent (unless it already knows) and fan
    /// `terminal:exit` to the owning user's viewers.
    pub async fn end_session(
        &self,
        session_id: i64,
        exit_code: i32,
        notify_agent: bool,
    ) -> Result<(), ErrorCode> {
        let entry = self.active.write().await.remove(&session_id);
        let entry = match entry {
            Some(e) => e,
            None => {
                // Already gone from routing; classify for the caller.
                let row = self
                    .store
                    .get_session(session_id)
                    .map_err(|_| ErrorCode::Internal)?
                    .ok_or(ErrorCode::SessionNotFound)?;
                if row.status == SessionStatus::Ended {
                    return Err(ErrorCode::SessionEnded);
                }
                let agent = self
                    .store
                    .get_agent(row.agent_id)
                    .map_err(|_| ErrorCode::Internal)?
                    .ok_or(ErrorCode::SessionNotFound)?;
                ActiveSession {
                    agent_id: row.agent_id,
                    user_id: agent.user_id,
                    is_default: row.kind == SessionKind::Default,
                }
            }
        };

        // Archive off the async path; the blob write can be large.
        let archived = self.scrollback.take(session_id);
        let store = Arc::clone(&self.store);
        let ended_at = epoch_ms();
        let write = tokio::task::spawn_blocking(move || {
            store.end_session(session_id, ended_at, &archived)
        });
        match write.await {
            Ok(Ok(true)) => {}
            Ok(Ok(false)) => return Err(ErrorCode::SessionEnded),
            Ok(Err(e)) => {
                warn!(session_id, err = %e, "failed to archive session");
                return Err(ErrorCode::Internal);
            }
            Err(e) => {
                warn!(session_id, err = %e, "archive task failed");
                return Err(ErrorCode::Internal);
            }
        }
        info!(session_id, exit_code, "session ended");

        if notify_agent {
            let close = tether_protocol::Envelope::new(Payload::SessionClose { session_id });
            self.hub.send_to_agent(entry.agent_id, close).await;
        }
        self.hub
            .fan_to_user(entry.user_id, Payload::TerminalExit { session_id, code: exit_code })
            .await;
        Ok(())
    }

    /// End every active session of an agent (transport drop, shutdown).
    pub async fn end_all_for_agent(&self, agent_id: i64) {
        let sessions: Vec<i64> = {
            let active = self.active.read().await;
            active.iter().filter(|(_, s)| s.agent_id == agent_id).map(|(id, _)| *id).collect()
        };
        // The map may be cold (broker restart mid-flight); sweep the store too.
        let mut all = sessions;
        if let Ok(rows) = self.store.active_sessions(agent_id) {
            for row in rows {
                if !all.contains(&row.id) {
                    all.push(row.id);
                }
            }
        }
        for session_id in all {
            if let Err(e) = self.end_session(session_id, DISCONNECT_EXIT_CODE, false).await {
                debug!(session_id, code = %e, "session already ended during agent teardown");
            }
        }
    }

    /// Sessions for an agent with a per-request preview: the last kilobyte
    /// of live scrollback, base64-encoded. Never cached.
    pub async fn list_with_preview(
        &self,
        user_id: i64,
        agent_id: i64,
        page: u32,
        page_size: u32,
    ) -> Result<(Vec<(SessionRow, Vec<u8>)>, u32), ErrorCode> {
        let agent = self
            .store
            .get_agent(agent_id)
            .map_err(|_| ErrorCode::Internal)?
            .ok_or(ErrorCode::BadRequest)?;
        if agent.user_id != user_id {
            return Err(ErrorCode::PermissionDenied);
        }
        let (rows, total) =
            self.store.list_sessions(agent_id, page, page_size).map_err(|_| ErrorCode::Internal)?;
        let sessions = rows
            .into_iter()
            .map(|row| {
                let preview = if row.status == SessionStatus::Active {
                    self.scrollback.read_tail(row.id, 1024)
                } else {
                    // Ended sessions preview from the archive instead.
                    self.store
                        .archived_log(row.id)
                        .ok()
                        .flatten()
                        .map(|log| {
                            let skip = log.len().saturating_sub(1024);
                            log[skip..].to_vec()
                        })
                        .unwrap_or_default()
                };
                (row, preview)
            })
            .collect();
        Ok((sessions, total))
    }

    /// Fetch one session with its ownership enforced.
    pub async fn get_owned(&self, session_id: i64, user_id: i64) -> Result<SessionRow, ErrorCode> {
        let row = self
            .store
            .get_session(session_id)
            .map_err(|_| ErrorCode::Internal)?
            .ok_or(ErrorCode::SessionNotFound)?;
        let agent = self
            .store
            .get_agent(row.agent_id)
            .map_err(|_| ErrorCode::Internal)?
            .ok_or(ErrorCode::SessionNotFound)?;
        if agent.user_id != user_id {
            return Err(ErrorCode::PermissionDenied);
        }
        Ok(row)
    }
}

#[cfg(test)]
#[path = "session_tests.rs"]
mod tests;
