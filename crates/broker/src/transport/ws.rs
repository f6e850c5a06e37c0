// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! WebSocket channel endpoints.
//!
//! Viewers attach at `/ws/mobile?token=...`, agents at
//! `/ws/desktop?token=...`. Authentication happens before the upgrade; a
//! rejected token gets a plain 401 and no socket. Each accepted connection
//! runs one pump that drains its bounded outbound queue, parses inbound
//! envelopes, and enforces the ping/idle discipline.

use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::extract::ws::{Message, WebSocket};
use axum::extract::{Query, State, WebSocketUpgrade};
use axum::response::IntoResponse;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use tether_protocol::{envelope::EnvelopeError, Envelope, ErrorCode, Payload};

use crate::hub::routing::{self, ViewerConn};
use crate::hub::ChannelHandle;
use crate::state::{new_instance_id, BrokerState};
use crate::store::AgentRow;

/// Per-frame write deadline.
const SEND_TIMEOUT: Duration = Duration::from_secs(10);

fn unauthorized() -> axum::response::Response {
    axum::http::Response::builder()
        .status(401)
        .body(axum::body::Body::from("unauthorized"))
        .unwrap_or_default()
        .into_response()
}

// -- Viewer endpoint ----------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct ViewerQuery {
    pub token: Option<String>,
}

/// `GET /ws/mobile` — WebSocket upgrade for a viewer.
pub async fn mobile_ws(
    State(state): State<Arc<BrokerState>>,
    Query(query): Query<ViewerQuery>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    let token = query.token.unwrap_or_default();
    let identity = match state.verifier.verify_viewer(&token).await {
        Ok(identity) => identity,
        Err(_) => return unauthorized(),
    };
    ws.on_upgrade(move |socket| run_viewer(state, socket, identity.user_id)).into_response()
}

async fn run_viewer(state: Arc<BrokerState>, socket: WebSocket, user_id: i64) {
    let (channel, rx) = ChannelHandle::new(state.config.outbound_queue_depth);
    state.hub.register_viewer(user_id, channel.clone()).await;

    let peer = Peer::Viewer(ViewerConn { user_id, channel: channel.clone() });
    pump(&state, socket, rx, &channel, peer).await;

    state.hub.unregister_viewer(user_id, channel.id()).await;
    channel.close();
    debug!(user_id, "viewer channel closed");
}

// -- Agent endpoint -----------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct AgentQuery {
    pub token: Option<String>,
    /// Stable machine identifier, persisted by the agent across runs.
    pub machine_id: Option<String>,
    pub host: Option<String>,
    pub os: Option<String>,
    /// Process-instance id, random per agent process start.
    pub instance: Option<String>,
}

/// `GET /ws/desktop` — WebSocket upgrade for an agent.
pub async fn desktop_ws(
    State(state): State<Arc<BrokerState>>,
    Query(query): Query<AgentQuery>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    let token = query.token.clone().unwrap_or_default();
    let identity = match state.verifier.verify_agent(&token).await {
        Ok(identity) => identity,
        Err(_) => return unauthorized(),
    };
    if state.blacklist.contains(&identity.credential_fingerprint) {
        info!(desktop_id = identity.desktop_id, "rejecting blacklisted credential");
        return unauthorized();
    }

    // Keep the agent record current; a renamed host updates in place.
    let row = AgentRow {
        id: identity.desktop_id,
        user_id: identity.user_id,
        machine_id: query.machine_id.clone().unwrap_or_default(),
        display_name: query.host.clone().unwrap_or_default(),
        os: query.os.clone().unwrap_or_default(),
        credential_fingerprint: identity.credential_fingerprint.clone(),
    };
    if let Err(e) = state.store.upsert_agent(&row) {
        warn!(err = %e, desktop_id = identity.desktop_id, "agent upsert failed");
    }

    let instance_id = query.instance.clone().unwrap_or_else(new_instance_id);
    ws.on_upgrade(move |socket| run_agent(state, socket, identity.user_id, identity.desktop_id, instance_id))
        .into_response()
}

async fn run_agent(
    state: Arc<BrokerState>,
    socket: WebSocket,
    user_id: i64,
    agent_id: i64,
    instance_id: String,
) {
    let (channel, rx) = ChannelHandle::new(state.config.outbound_queue_depth);
    state.hub.register_agent(agent_id, user_id, instance_id, channel.clone()).await;

    // Registration path 1: the agent's default session, created broker-side.
    if let Err(e) = state.sessions.ensure_default(agent_id, user_id).await {
        warn!(agent_id, err = %e, "failed to ensure default session");
    }

    let peer = Peer::Agent { agent_id, user_id };
    pump(&state, socket, rx, &channel, peer).await;

    let was_current = state.hub.unregister_agent(agent_id, channel.id()).await;
    channel.close();
    if was_current {
        state.sessions.end_all_for_agent(agent_id).await;
    }
    debug!(agent_id, was_current, "agent channel closed");
}

// -- Shared pump --------------------------------------------------------------

enum Peer {
    Viewer(ViewerConn),
    Agent { agent_id: i64, user_id: i64 },
}

/// Per-connection event loop: drain the outbound queue, parse and route
/// inbound envelopes, ping on idle, close on a dead peer.
async fn pump(
    state: &Arc<BrokerState>,
    socket: WebSocket,
    mut rx: mpsc::Receiver<Envelope>,
    channel: &ChannelHandle,
    peer: Peer,
) {
    let (mut ws_tx, mut ws_rx) = socket.split();
    let cancel = channel.cancel_token();
    let idle_timeout = state.config.idle_timeout();
    let mut ping = tokio::time::interval(state.config.heartbeat_interval());
    ping.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    ping.tick().await; // Consume the immediate first tick.
    let mut last_seen = Instant::now();

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,

            outbound = rx.recv() => {
                let Some(envelope) = outbound else { break };
                let Ok(text) = envelope.to_json() else { continue };
                match tokio::time::timeout(SEND_TIMEOUT, ws_tx.send(Message::Text(text.into()))).await {
                    Ok(Ok(())) => {}
                    Ok(Err(_)) => break,
                    Err(_) => {
                        warn!(channel = channel.id(), "write deadline exceeded, closing channel");
                        break;
                    }
                }
            }

            incoming = ws_rx.next() => {
                let message = match incoming {
                    Some(Ok(m)) => m,
                    Some(Err(_)) | None => break,
                };
                match message {
                    Message::Text(text) => {
                        last_seen = Instant::now();
                        let envelope = match Envelope::from_json(&text) {
                            Ok(envelope) => envelope,
                            Err(EnvelopeError::Oversize(_)) => {
                                channel.enqueue(Envelope::new(
                                    ErrorCode::Oversize.to_payload("envelope too large"),
                                ));
                                continue;
                            }
                            Err(EnvelopeError::Malformed(e)) => {
                                debug!(channel = channel.id(), err = %e, "dropping malformed envelope");
                                channel.enqueue(Envelope::new(
                                    ErrorCode::BadRequest.to_payload("malformed envelope"),
                                ));
                                continue;
                            }
                        };
                        match &envelope.payload {
                            Payload::Heartbeat {} => {
                                channel.enqueue(Envelope::new(Payload::Pong {}));
                                if let Peer::Agent { agent_id, .. } = &peer {
                                    state.hub.presence().heartbeat(*agent_id);
                                }
                            }
                            Payload::Pong {} => {
                                if let Peer::Agent { agent_id, .. } = &peer {
                                    state.hub.presence().heartbeat(*agent_id);
                                }
                            }
                            _ => match &peer {
                                Peer::Viewer(conn) => {
                                    routing::handle_viewer_envelope(state, conn, envelope).await;
                                }
                                Peer::Agent { agent_id, user_id } => {
                                    routing::handle_agent_envelope(state, *agent_id, *user_id, envelope)
                                        .await;
                                }
                            },
                        }
                    }
                    Message::Ping(_) | Message::Pong(_) => {
                        last_seen = Instant::now();
                    }
                    Message::Binary(_) => {
                        channel.enqueue(Envelope::new(
                            ErrorCode::BadRequest.to_payload("binary frames not accepted"),
                        ));
                    }
                    Message::Close(_) => break,
                }
            }

            _ = ping.tick() => {
                if last_seen.elapsed() > idle_timeout {
                    info!(channel = channel.id(), "closing idle channel");
                    break;
                }
                channel.enqueue(Envelope::new(Payload::Heartbeat {}));
            }
        }
    }
}
