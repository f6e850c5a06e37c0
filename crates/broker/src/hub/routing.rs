// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Envelope routing: demultiplex by type, authorize the session -> agent ->
//! user chain, forward or reply.
//!
//! Errors always go back to the originator only; a bad envelope never tears
//! the channel down or leaks to peers.

use base64::Engine;
use tracing::{debug, warn};

use tether_protocol::{Envelope, ErrorCode, Payload};

use crate::hub::ChannelHandle;
use crate::state::BrokerState;

/// Upper bound on a `terminal:history` reply (raw bytes, pre-base64).
const HISTORY_REPLY_MAX: usize = 256 * 1024;

/// A viewer connection as seen by the router.
pub struct ViewerConn {
    pub user_id: i64,
    pub channel: ChannelHandle,
}

fn reply_error(channel: &ChannelHandle, code: ErrorCode, message: &str) {
    channel.enqueue(Envelope::new(code.to_payload(message)));
}

/// Handle one envelope read from a viewer channel.
pub async fn handle_viewer_envelope(state: &BrokerState, viewer: &ViewerConn, envelope: Envelope) {
    match &envelope.payload {
        Payload::TerminalInput { session_id, .. } | Payload::TerminalResize { session_id, .. } => {
            let session_id = *session_id;
            if session_id == 0 {
                // "main" aliasing is agent-local; the broker cannot resolve
                // an agent from it.
                reply_error(&viewer.channel, ErrorCode::BadRequest, "session id 0 is not routable");
                return;
            }
            match state.sessions.authorize(session_id, viewer.user_id).await {
                Ok(active) => {
                    // Forward verbatim; the broker never rewrites payloads.
                    if !state.hub.send_to_agent(active.agent_id, envelope).await {
                        reply_error(&viewer.channel, ErrorCode::AgentOffline, "agent is offline");
                    }
                }
                Err(code) => reply_error(&viewer.channel, code, code.as_str()),
            }
        }

        Payload::TerminalHistory { session_id, data: None } => {
            let session_id = *session_id;
            match state.sessions.authorize(session_id, viewer.user_id).await {
                Ok(_) => {
                    let tail = state.scrollback.read_tail(session_id, HISTORY_REPLY_MAX);
                    let encoded = base64::engine::general_purpose::STANDARD.encode(&tail);
                    viewer.channel.enqueue(Envelope::new(Payload::TerminalHistory {
                        session_id,
                        data: Some(encoded),
                    }));
                }
                Err(code) => reply_error(&viewer.channel, code, code.as_str()),
            }
        }

        // A history payload with data set is a reply, not a request.
        Payload::TerminalHistory { .. } => {
            reply_error(&viewer.channel, ErrorCode::BadRequest, "history request carries no data")
        }

        // Liveness is handled by the channel pump; never routed.
        Payload::Heartbeat {} | Payload::Pong {} => {}

        other => {
            debug!(kind = other.kind(), "dropping viewer envelope with unroutable type");
            reply_error(&viewer.channel, ErrorCode::BadRequest, "type not accepted from viewers");
        }
    }
}

/// Handle one envelope read from an agent channel.
pub async fn handle_agent_envelope(
    state: &BrokerState,
    agent_id: i64,
    user_id: i64,
    envelope: Envelope,
) {
    match &envelope.payload {
        Payload::TerminalOutput { session_id, data } => {
            let session_id = *session_id;
            let Some(active) = state.sessions.active(session_id).await else {
                // Ended or unknown: output for it never reaches viewers.
                debug!(session_id, agent_id, "dropping output for inactive session");
                return;
            };
            if active.agent_id != agent_id {
                warn!(session_id, agent_id, "dropping output from non-owning agent");
                return;
            }
            // Scrollback keeps raw bytes; the fan-out keeps the base64 form.
            match base64::engine::general_purpose::STANDARD.decode(data) {
                Ok(raw) => state.scrollback.append(session_id, &raw),
                Err(_) => state.scrollback.append(session_id, data.as_bytes()),
            }
            state.hub.fan_envelope_to_user(active.user_id, envelope).await;
        }

        Payload::TerminalExit { session_id, code } => {
            let session_id = *session_id;
            let Some(active) = state.sessions.active(session_id).await else {
                debug!(session_id, agent_id, "exit for inactive session");
                return;
            };
            if active.agent_id != agent_id {
                warn!(session_id, agent_id, "dropping exit from non-owning agent");
                return;
            }
            // The agent already knows; no session:close goes back.
            if let Err(e) = state.sessions.end_session(session_id, *code, false).await {
                debug!(session_id, code = %e, "exit raced with another teardown");
            }
        }

        // Geometry replay after an agent reconnect; viewers re-learn sizes.
        Payload::TerminalResize { session_id, .. } => {
            let session_id = *session_id;
            match state.sessions.active(session_id).await {
                Some(active) if active.agent_id == agent_id => {
                    state.hub.fan_envelope_to_user(active.user_id, envelope).await;
                }
                _ => debug!(session_id, agent_id, "dropping resize for inactive session"),
            }
        }

        // Agent-side faults surface to the owner's viewers.
        Payload::Error { .. } => {
            state.hub.fan_envelope_to_user(user_id, envelope).await;
        }

        Payload::Heartbeat {} | Payload::Pong {} => {}

        other => {
            debug!(kind = other.kind(), agent_id, "dropping agent envelope with unroutable type");
        }
    }
}

#[cfg(test)]
#[path = "routing_tests.rs"]
mod tests;
