// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! SQLite store for agent and session records.
//!
//! Single connection, WAL mode, tables created on open. Calls are
//! synchronous; the hot envelope path never touches the store (routing works
//! off the in-memory active-session map), so only lifecycle operations and
//! REST handlers land here.

use std::path::Path;
use std::sync::Mutex;

use anyhow::Context;
use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;

/// Session kind. At most one active `default` session exists per agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionKind {
    Default,
    Background,
}

impl SessionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Default => "default",
            Self::Background => "background",
        }
    }

    fn parse(s: &str) -> Self {
        if s == "default" {
            Self::Default
        } else {
            Self::Background
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Active,
    Ended,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Ended => "ended",
        }
    }

    fn parse(s: &str) -> Self {
        if s == "active" {
            Self::Active
        } else {
            Self::Ended
        }
    }
}

/// One registered agent machine.
#[derive(Debug, Clone)]
pub struct AgentRow {
    pub id: i64,
    pub user_id: i64,
    pub machine_id: String,
    pub display_name: String,
    pub os: String,
    pub credential_fingerprint: String,
}

/// One terminal session. `archived_log` is loaded separately.
#[derive(Debug, Clone)]
pub struct SessionRow {
    pub id: i64,
    pub agent_id: i64,
    pub kind: SessionKind,
    pub working_dir: String,
    pub title: Option<String>,
    pub status: SessionStatus,
    pub started_at: i64,
    pub ended_at: Option<i64>,
}

pub struct Store {
    conn: Mutex<Connection>,
}

impl Store {
    /// Open (or create) the database and ensure all tables exist.
    pub fn open(path: &Path) -> anyhow::Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("open database at {}", path.display()))?;
        Self::init(conn)
    }

    /// In-memory store for tests.
    pub fn open_in_memory() -> anyhow::Result<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> anyhow::Result<Self> {
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS agents (
                id                      INTEGER PRIMARY KEY,
                user_id                 INTEGER NOT NULL,
                machine_id              TEXT NOT NULL,
                display_name            TEXT NOT NULL DEFAULT '',
                os                      TEXT NOT NULL DEFAULT '',
                credential_fingerprint  TEXT NOT NULL DEFAULT '',
                UNIQUE (user_id, machine_id)
            );

            CREATE TABLE IF NOT EXISTS sessions (
                id           INTEGER PRIMARY KEY AUTOINCREMENT,
                agent_id     INTEGER NOT NULL REFERENCES agents(id) ON DELETE CASCADE,
                kind         TEXT NOT NULL,
                working_dir  TEXT NOT NULL DEFAULT '',
                title        TEXT,
                status       TEXT NOT NULL DEFAULT 'active',
                started_at   INTEGER NOT NULL,
                ended_at     INTEGER,
                archived_log BLOB
            );

            CREATE INDEX IF NOT EXISTS idx_sessions_agent ON sessions(agent_id);
            ",
        )?;
        Ok(Self { conn: Mutex::new(conn) })
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    // -- Agents ---------------------------------------------------------------

    /// Insert or refresh an agent record.
    ///
    /// The id is assigned by the account system and carried in the agent's
    /// token; a reconnect from a renamed host updates the existing row in
    /// place. `UNIQUE (user_id, machine_id)` keeps one record per machine.
    pub fn upsert_agent(&self, agent: &AgentRow) -> anyhow::Result<()> {
        let conn = self.lock();
        conn.execute(
            "INSERT INTO agents (id, user_id, machine_id, display_name, os, credential_fingerprint)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(id) DO UPDATE SET
                 machine_id = excluded.machine_id,
                 display_name = excluded.display_name,
                 os = excluded.os,
                 credential_fingerprint = excluded.credential_fingerprint",
            params![
                agent.id,
                agent.user_id,
                agent.machine_id,
                agent.display_name,
                agent.os,
                agent.credential_fingerprint,
            ],
        )?;
        Ok(())
    }

    pub fn get_agent(&self, id: i64) -> anyhow::Result<Option<AgentRow>> {
        let conn = self.lock();
        let row = conn
            .query_row(
                "SELECT id, user_id, machine_id, display_name, os, credential_fingerprint
                 FROM agents WHERE id = ?1",
                params![id],
                |row| {
                    Ok(AgentRow {
                        id: row.get(0)?,
                        user_id: row.get(1)?,
                        machine_id: row.get(2)?,
                        display_name: row.get(3)?,
                        os: row.get(4)?,
                        credential_fingerprint: row.get(5)?,
                    })
                },
            )
            .optional()?;
        Ok(row)
    }

    /// Delete an agent; its sessions (and their archives) cascade.
    pub fn delete_agent(&self, id: i64) -> anyhow::Result<bool> {
        let conn = self.lock();
        Ok(conn.execute("DELETE FROM agents WHERE id = ?1", params![id])? > 0)
    }

    // -- Sessions -------------------------------------------------------------

    pub fn create_session(
        &self,
        agent_id: i64,
        kind: SessionKind,
        working_dir: &str,
        started_at: i64,
    ) -> anyhow::Result<SessionRow> {
        let conn = self.lock();
        conn.execute(
            "INSERT INTO sessions (agent_id, kind, working_dir, status, started_at)
             VALUES (?1, ?2, ?3, 'active', ?4)",
            params![agent_id, kind.as_str(), working_dir, started_at],
        )?;
        let id = conn.last_insert_rowid();
        Ok(SessionRow {
            id,
            agent_id,
            kind,
            working_dir: working_dir.to_owned(),
            title: None,
            status: SessionStatus::Active,
            started_at,
            ended_at: None,
        })
    }

    pub fn get_session(&self, id: i64) -> anyhow::Result<Option<SessionRow>> {
        let conn = self.lock();
        let row = conn
            .query_row(
                "SELECT id, agent_id, kind, working_dir, title, status, started_at, ended_at
                 FROM sessions WHERE id = ?1",
                params![id],
                session_from_row,
            )
            .optional()?;
        Ok(row)
    }

    /// The active default session for an agent, if any.
    pub fn find_active_default(&self, agent_id: i64) -> anyhow::Result<Option<SessionRow>> {
        let conn = self.lock();
        let row = conn
            .query_row(
                "SELECT id, agent_id, kind, working_dir, title, status, started_at, ended_at
                 FROM sessions
                 WHERE agent_id = ?1 AND kind = 'default' AND status = 'active'",
                params![agent_id],
                session_from_row,
            )
            .optional()?;
        Ok(row)
    }

    pub fn list_sessions(
        &self,
        agent_id: i64,
        page: u32,
        page_size: u32,
    ) -> anyhow::Result<(Vec<SessionRow>, u32)> {
        let conn = self.lock();
        let total: u32 = conn.query_row(
            "SELECT COUNT(*) FROM sessions WHERE agent_id = ?1",
            params![agent_id],
            |row| row.get(0),
        )?;
        let offset = page.saturating_sub(1).saturating_mul(page_size);
        let mut stmt = conn.prepare(
            "SELECT id, agent_id, kind, working_dir, title, status, started_at, ended_at
             FROM sessions WHERE agent_id = ?1
             ORDER BY started_at DESC, id DESC
             LIMIT ?2 OFFSET ?3",
        )?;
        let rows = stmt
            .query_map(params![agent_id, page_size, offset], session_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok((rows, total))
    }

    /// Mark a session ended and attach its archived log.
    ///
    /// Returns false when the session was already ended (the transition is
    /// one-way) or does not exist.
    pub fn end_session(&self, id: i64, ended_at: i64, archived_log: &[u8]) -> anyhow::Result<bool> {
        let conn = self.lock();
        let changed = conn.execute(
            "UPDATE sessions
             SET status = 'ended', ended_at = ?2, archived_log = ?3
             WHERE id = ?1 AND status = 'active'",
            params![id, ended_at, archived_log],
        )?;
        Ok(changed > 0)
    }

    /// Active session ids for an agent.
    pub fn active_sessions(&self, agent_id: i64) -> anyhow::Result<Vec<SessionRow>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT id, agent_id, kind, working_dir, title, status, started_at, ended_at
             FROM sessions WHERE agent_id = ?1 AND status = 'active'",
        )?;
        let rows =
            stmt.query_map(params![agent_id], session_from_row)?.collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// End every session left active by a previous broker process.
    ///
    /// Their agent channels died with that process, so nothing will ever end
    /// them otherwise. Runs once at startup.
    pub fn end_all_active(&self, ended_at: i64) -> anyhow::Result<usize> {
        let conn = self.lock();
        let changed = conn.execute(
            "UPDATE sessions SET status = 'ended', ended_at = ?1 WHERE status = 'active'",
            params![ended_at],
        )?;
        Ok(changed)
    }

    pub fn archived_log(&self, id: i64) -> anyhow::Result<Option<Vec<u8>>> {
        let conn = self.lock();
        let blob: Option<Option<Vec<u8>>> = conn
            .query_row("SELECT archived_log FROM sessions WHERE id = ?1", params![id], |row| {
                row.get(0)
            })
            .optional()?;
        Ok(blob.flatten())
    }
}

fn session_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<SessionRow> {
    let kind: String = row.get(2)?;
    let status: String = row.get(5)?;
    Ok(SessionRow {
        id: row.get(0)?,
        agent_id: row.get(1)?,
        kind: SessionKind::parse(&kind),
        working_dir: row.get(3)?,
        title: row.get(4)?,
        status: SessionStatus::parse(&status),
        started_at: row.get(6)?,
        ended_at: row.get(7)?,
    })
}

#[cfg(test)]
#[path = "store_tests.rs"]
mod tests;
