// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Top-level agent runner: brings up the main shell, the local terminal
//! mirror, and the broker transport, then drives the local input loop.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::client::{self, ClientConfig};
use crate::config::AgentConfig;
use crate::local::{self, RawModeGuard, SHUTDOWN_KEY};
use crate::machine;
use crate::pty::Pty;
use crate::sessions::Multiplexer;

/// Outbound queue toward the broker, in envelopes.
const OUTBOUND_QUEUE: usize = 256;

/// Run the agent until its default session ends or the user detaches.
/// Returns the main shell's exit code.
pub async fn run(config: AgentConfig) -> anyhow::Result<i32> {
    config.validate()?;
    let token = config.resolve_token()?;

    let state_dir = machine::state_dir(config.state_dir.as_deref());
    let machine_id = machine::load_or_create(&state_dir)?;
    let instance_id = machine::new_instance_id();
    let host = std::env::var("HOSTNAME").unwrap_or_else(|_| "unknown-host".to_owned());
    let os = std::env::consts::OS;

    let shutdown = CancellationToken::new();

    // The agent owns the user's terminal: one shell under a PTY, mirrored
    // locally, adopted as the default session once the broker names it.
    let (cols, rows) = local::terminal_size().unwrap_or((80, 24));
    let shell = config.shell_command();
    let main_pty = Arc::new(Pty::spawn_shell(&shell, None, cols, rows)?);
    info!(machine_id = %machine_id, pid = main_pty.child_pid(), "main shell started");

    let (outbound_tx, outbound_rx) = mpsc::channel(OUTBOUND_QUEUE);
    let mux = Multiplexer::new(main_pty, shell, outbound_tx, shutdown.clone());
    mux.spawn_main_pump();

    // Raw mode fails when stdin is not a terminal; the agent then runs
    // headless and only serves viewers.
    let raw_guard = match RawModeGuard::enter() {
        Ok(guard) => {
            guard.install_panic_restore();
            Some(guard)
        }
        Err(e) => {
            warn!(err = %e, "stdin is not a terminal, running headless");
            None
        }
    };

    let client_config = ClientConfig {
        url: config.ws_url(&token, &machine_id, &instance_id, &host, os),
        reconnect_initial: config.reconnect_initial(),
        reconnect_max: config.reconnect_max(),
        heartbeat_interval: config.heartbeat_interval(),
    };
    tokio::spawn(client::run(Arc::clone(&mux), outbound_rx, client_config, shutdown.clone()));

    let mut stdin_rx = local::spawn_stdin_reader();
    let mut stdin_open = true;
    let mut sigwinch =
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::window_change()).ok();

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,

            data = stdin_rx.recv(), if stdin_open => {
                match data {
                    Some(bytes) => {
                        // Ctrl+\ detaches; bytes before it still reach the shell.
                        if let Some(pos) = bytes.iter().position(|&b| b == SHUTDOWN_KEY) {
                            if pos > 0 {
                                mux.write_main(&bytes[..pos]).await;
                            }
                            info!("shutdown key pressed");
                            shutdown.cancel();
                        } else {
                            mux.write_main(&bytes).await;
                        }
                    }
                    // Headless agent: stdin gone, keep serving viewers.
                    None => stdin_open = false,
                }
            }

            _ = async {
                match sigwinch.as_mut() {
                    Some(signal) => { signal.recv().await; }
                    None => std::future::pending::<()>().await,
                }
            } => {
                if let Some((cols, rows)) = local::terminal_size() {
                    mux.resize_main_from_local(cols, rows).await;
                }
            }
        }
    }

    // Give the transport a moment to flush its close frame.
    tokio::time::sleep(std::time::Duration::from_millis(100)).await;
    drop(raw_guard);
    eprintln!("\r\ntether agent stopped.");
    Ok(mux.exit_code())
}
