// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Agent-side session multiplexer.
//!
//! One table maps session id -> PTY. The "main" session is the shell the
//! agent brought up at startup and mirrors to the local terminal; it is
//! adopted (never spawned) when the broker sends `session:create` with
//! `is_default=true`. Background sessions are headless login shells spawned
//! on demand. All envelopes toward the broker go through one bounded
//! outbound queue drained by the transport client.

use std::collections::HashMap;
use std::io::Write as _;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use base64::Engine;
use tokio::sync::{mpsc, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use tether_protocol::{Envelope, ErrorCode, Payload};

use crate::history::CaptureBuffer;
use crate::pty::Pty;

/// PTY read buffer size.
const READ_BUF: usize = 4096;

/// Local capture kept per session for `terminal:history` replies.
const CAPTURE_BYTES: usize = 256 * 1024;

/// Geometry for background shells until a viewer resizes them.
const DEFAULT_COLS: u16 = 80;
const DEFAULT_ROWS: u16 = 24;

/// Deadline for must-deliver envelopes when the transport is up.
const CRITICAL_SEND_DEADLINE: Duration = Duration::from_secs(10);

struct SessionEntry {
    pty: Arc<Pty>,
    history: Arc<StdMutex<CaptureBuffer>>,
    cancel: CancellationToken,
    is_main: bool,
}

/// The agent's PTY fan-out: session table, outbound queue, shutdown.
pub struct Multiplexer {
    sessions: RwLock<HashMap<i64, Arc<SessionEntry>>>,
    main_id: RwLock<Option<i64>>,
    main_pty: Arc<Pty>,
    main_history: Arc<StdMutex<CaptureBuffer>>,
    outbound: mpsc::Sender<Envelope>,
    shell: String,
    shutdown: CancellationToken,
    /// Whether the transport is currently connected; gates the blocking
    /// slow path for critical sends.
    connected: AtomicBool,
    exit_code: AtomicI32,
}

impl Multiplexer {
    pub fn new(
        main_pty: Arc<Pty>,
        shell: String,
        outbound: mpsc::Sender<Envelope>,
        shutdown: CancellationToken,
    ) -> Arc<Self> {
        Arc::new(Self {
            sessions: RwLock::new(HashMap::new()),
            main_id: RwLock::new(None),
            main_pty,
            main_history: Arc::new(StdMutex::new(CaptureBuffer::new(CAPTURE_BYTES))),
            outbound,
            shell,
            shutdown,
            connected: AtomicBool::new(false),
            exit_code: AtomicI32::new(0),
        })
    }

    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::Release);
    }

    pub fn exit_code(&self) -> i32 {
        self.exit_code.load(Ordering::Acquire)
    }

    /// Current geometry of every bound session, for replay after reconnect.
    pub async fn geometry(&self) -> Vec<(i64, u16, u16)> {
        let sessions = self.sessions.read().await;
        sessions
            .iter()
            .map(|(id, entry)| {
                let (cols, rows) = entry.pty.geometry();
                (*id, cols, rows)
            })
            .collect()
    }

    // -- Outbound helpers -----------------------------------------------------

    /// Ordinary envelope: drop under backpressure, noting the drop.
    fn send(&self, payload: Payload) {
        let envelope = Envelope::new(payload);
        if let Err(mpsc::error::TrySendError::Full(envelope)) = self.outbound.try_send(envelope) {
            debug!(kind = envelope.payload.kind(), "outbound queue full, dropping envelope");
        }
    }

    /// Must-deliver envelope (`terminal:exit`): waits for queue space while
    /// the transport is up, falls back to best-effort when it is not.
    async fn send_critical(&self, payload: Payload) {
        let envelope = Envelope::new(payload);
        if self.connected.load(Ordering::Acquire) {
            let send = self.outbound.send(envelope);
            if tokio::time::timeout(CRITICAL_SEND_DEADLINE, send).await.is_err() {
                warn!("critical envelope not delivered within deadline");
            }
        } else if self.outbound.try_send(envelope).is_err() {
            warn!("critical envelope dropped while disconnected");
        }
    }

    fn send_error(&self, code: ErrorCode, message: String) {
        self.send(code.to_payload(message));
    }

    // -- Envelope dispatch ----------------------------------------------------

    /// Handle one broker-originated envelope.
    pub async fn handle_envelope(self: &Arc<Self>, envelope: Envelope) {
        match envelope.payload {
            Payload::SessionCreate { session_id, working_dir, is_default } => {
                self.handle_create(session_id, working_dir, is_default).await;
            }
            Payload::SessionClose { session_id } => {
                self.handle_close(session_id).await;
            }
            Payload::TerminalInput { session_id, data } => {
                self.handle_input(session_id, &data).await;
            }
            Payload::TerminalResize { session_id, rows, cols } => {
                self.handle_resize(session_id, rows, cols).await;
            }
            Payload::TerminalHistory { session_id, data: None } => {
                self.handle_history(session_id).await;
            }
            Payload::Error { code, message } => {
                warn!(code, %message, "broker reported an error");
            }
            other => {
                debug!(kind = other.kind(), "ignoring unexpected envelope from broker");
            }
        }
    }

    /// `session:create`. Idempotent per session id: a duplicate never
    /// spawns a second PTY.
    async fn handle_create(self: &Arc<Self>, session_id: i64, working_dir: Option<String>, is_default: bool) {
        if self.sessions.read().await.contains_key(&session_id) {
            debug!(session_id, "session already bound, ignoring duplicate create");
            return;
        }

        if is_default {
            let mut main_id = self.main_id.write().await;
            match *main_id {
                // The agent process already holds the user's terminal; adopt
                // the id instead of spawning.
                None => {
                    *main_id = Some(session_id);
                    let entry = Arc::new(SessionEntry {
                        pty: Arc::clone(&self.main_pty),
                        history: Arc::clone(&self.main_history),
                        cancel: self.shutdown.child_token(),
                        is_main: true,
                    });
                    self.sessions.write().await.insert(session_id, entry);
                    info!(session_id, "adopted default session");
                }
                Some(existing) => {
                    warn!(session_id, existing, "ignoring second default session");
                }
            }
            return;
        }

        let working_dir = working_dir.filter(|d| !d.is_empty()).map(PathBuf::from);
        let pty = match Pty::spawn_shell(
            &self.shell,
            working_dir.as_deref(),
            DEFAULT_COLS,
            DEFAULT_ROWS,
        ) {
            Ok(pty) => Arc::new(pty),
            Err(e) => {
                warn!(session_id, err = %e, "PTY spawn failed");
                self.send_error(
                    ErrorCode::PtyFailure,
                    format!("session {session_id}: failed to spawn shell: {e}"),
                );
                // The broker marks the session ended off this exit.
                self.send_critical(Payload::TerminalExit { session_id, code: -1 }).await;
                return;
            }
        };

        let entry = Arc::new(SessionEntry {
            pty,
            history: Arc::new(StdMutex::new(CaptureBuffer::new(CAPTURE_BYTES))),
            cancel: self.shutdown.child_token(),
            is_main: false,
        });
        self.sessions.write().await.insert(session_id, Arc::clone(&entry));
        info!(session_id, pid = entry.pty.child_pid(), "background session spawned");
        self.spawn_background_pump(session_id, entry);
    }

    /// `session:close`: tear the PTY down without reporting back (the
    /// broker initiated this and already archived).
    async fn handle_close(&self, session_id: i64) {
        let removed = self.sessions.write().await.remove(&session_id);
        let Some(entry) = removed else {
            debug!(session_id, "close for unknown session");
            return;
        };
        entry.cancel.cancel();
        if entry.is_main {
            // Closing the default session ends the agent process.
            info!(session_id, "default session closed by broker, shutting down");
            self.shutdown.cancel();
        } else {
            entry.pty.shutdown();
            info!(session_id, "background session closed");
        }
    }

    /// `terminal:input`: demux to the owning PTY. Session id 0 routes to
    /// the main session when one is bound (legacy clients).
    async fn handle_input(&self, session_id: i64, data: &str) {
        let Some(entry) = self.resolve(session_id).await else {
            self.send_error(
                ErrorCode::SessionNotFound,
                format!("session {session_id}: no such pty"),
            );
            return;
        };
        // Payloads are base64; tolerate raw text from older clients.
        let bytes = match base64::engine::general_purpose::STANDARD.decode(data) {
            Ok(decoded) => decoded,
            Err(_) => data.as_bytes().to_vec(),
        };
        if let Err(e) = entry.pty.write(&bytes).await {
            self.send_error(
                ErrorCode::PtyFailure,
                format!("session {session_id}: write failed: {e}"),
            );
        }
    }

    /// `terminal:resize`. Zero dimensions are ignored; equal geometry is a
    /// no-op.
    async fn handle_resize(&self, session_id: i64, rows: u16, cols: u16) {
        let Some(entry) = self.resolve(session_id).await else {
            debug!(session_id, "resize for unknown session");
            return;
        };
        match entry.pty.resize(cols, rows) {
            Ok(true) => debug!(session_id, cols, rows, "resized"),
            Ok(false) => {}
            Err(e) => warn!(session_id, err = %e, "resize failed"),
        }
    }

    /// `terminal:history`: answer from the local capture ring.
    async fn handle_history(&self, session_id: i64) {
        let Some(entry) = self.resolve(session_id).await else {
            self.send_error(
                ErrorCode::SessionNotFound,
                format!("session {session_id}: no such pty"),
            );
            return;
        };
        let tail = {
            let history = entry.history.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            history.snapshot()
        };
        let encoded = base64::engine::general_purpose::STANDARD.encode(&tail);
        self.send(Payload::TerminalHistory { session_id, data: Some(encoded) });
    }

    /// Resolve a session id, honoring the id-0 alias for the main session.
    async fn resolve(&self, session_id: i64) -> Option<Arc<SessionEntry>> {
        let id = if session_id == 0 { (*self.main_id.read().await)? } else { session_id };
        self.sessions.read().await.get(&id).cloned()
    }

    // -- Local terminal path --------------------------------------------------

    /// Local keystrokes go straight to the main shell.
    pub async fn write_main(&self, bytes: &[u8]) {
        if let Err(e) = self.main_pty.write(bytes).await {
            warn!(err = %e, "local input write failed");
        }
    }

    /// The local terminal changed size (SIGWINCH); the main PTY follows and
    /// the broker is told so viewers can re-learn the geometry.
    pub async fn resize_main_from_local(&self, cols: u16, rows: u16) {
        match self.main_pty.resize(cols, rows) {
            Ok(true) => {
                if let Some(session_id) = *self.main_id.read().await {
                    self.send(Payload::TerminalResize { session_id, rows, cols });
                }
            }
            Ok(false) => {}
            Err(e) => warn!(err = %e, "local resize failed"),
        }
    }

    // -- Output pumps ---------------------------------------------------------

    /// Pump the main shell: mirror to the local terminal, capture history,
    /// and stream to the broker once a session id is bound. Runs from agent
    /// startup; its exit ends the process.
    pub fn spawn_main_pump(self: &Arc<Self>) {
        let mux = Arc::clone(self);
        tokio::spawn(async move {
            let mut buf = vec![0u8; READ_BUF];
            loop {
                let n = tokio::select! {
                    _ = mux.shutdown.cancelled() => break,
                    result = mux.main_pty.read_chunk(&mut buf) => match result {
                        Ok(0) => break,
                        Ok(n) => n,
                        Err(e) => {
                            warn!(err = %e, "main pty read failed");
                            break;
                        }
                    },
                };
                // The read buffer is reused; chunks leave it as fresh copies.
                let chunk = buf[..n].to_vec();
                {
                    let mut history =
                        mux.main_history.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
                    history.write(&chunk);
                }
                mirror_to_stdout(&chunk);
                if let Some(session_id) = *mux.main_id.read().await {
                    let data = base64::engine::general_purpose::STANDARD.encode(&chunk);
                    mux.send(Payload::TerminalOutput { session_id, data });
                }
            }

            let code = mux.main_pty.wait_exit().await.unwrap_or(0);
            mux.exit_code.store(code, Ordering::Release);
            let bound = *mux.main_id.read().await;
            if let Some(session_id) = bound {
                mux.sessions.write().await.remove(&session_id);
                mux.send_critical(Payload::TerminalExit { session_id, code }).await;
            }
            info!(code, "default session ended, shutting agent down");
            mux.shutdown.cancel();
        });
    }

    /// Pump a background shell: capture history and stream to the broker;
    /// no local mirroring. Reports `terminal:exit` when the shell dies.
    fn spawn_background_pump(self: &Arc<Self>, session_id: i64, entry: Arc<SessionEntry>) {
        let mux = Arc::clone(self);
        tokio::spawn(async move {
            let mut buf = vec![0u8; READ_BUF];
            let exited = loop {
                let n = tokio::select! {
                    _ = entry.cancel.cancelled() => break false,
                    result = entry.pty.read_chunk(&mut buf) => match result {
                        Ok(0) => break true,
                        Ok(n) => n,
                        Err(e) => {
                            warn!(session_id, err = %e, "pty read failed");
                            break true;
                        }
                    },
                };
                let chunk = buf[..n].to_vec();
                {
                    let mut history =
                        entry.history.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
                    history.write(&chunk);
                }
                let data = base64::engine::general_purpose::STANDARD.encode(&chunk);
                mux.send(Payload::TerminalOutput { session_id, data });
            };

            if !exited {
                // Cancelled via session:close; teardown already handled.
                return;
            }
            let code = entry.pty.wait_exit().await.unwrap_or(0);
            mux.sessions.write().await.remove(&session_id);
            info!(session_id, code, "background session exited");
            mux.send_critical(Payload::TerminalExit { session_id, code }).await;
        });
    }
}

/// Raw bytes straight to the local terminal.
fn mirror_to_stdout(chunk: &[u8]) {
    let mut stdout = std::io::stdout();
    let _ = stdout.write_all(chunk);
    let _ = stdout.flush();
}

#[cfg(test)]
#[path = "sessions_tests.rs"]
mod tests;
