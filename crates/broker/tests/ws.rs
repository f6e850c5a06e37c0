// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! End-to-end WebSocket tests using real connections against an in-process
//! axum server: agent and viewer channels, routing, presence, history.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use base64::Engine;
use clap::Parser;
use futures_util::{SinkExt, StreamExt};
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_util::sync::CancellationToken;

use tether_broker::config::BrokerConfig;
use tether_broker::state::BrokerState;
use tether_broker::store::Store;
use tether_broker::transport::auth::{Blacklist, StaticVerifier, TokenVerifier};
use tether_broker::transport::build_router;
use tether_protocol::{Envelope, Payload};

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

type WsStream =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;
type WsTx = futures_util::stream::SplitSink<WsStream, WsMessage>;
type WsRx = futures_util::stream::SplitStream<WsStream>;

const RECV_TIMEOUT: Duration = Duration::from_secs(5);

fn b64(data: &[u8]) -> String {
    base64::engine::general_purpose::STANDARD.encode(data)
}

async fn spawn_broker() -> anyhow::Result<(SocketAddr, Arc<BrokerState>)> {
    let config = BrokerConfig::parse_from(["tetherd"]);
    let store = Arc::new(Store::open_in_memory()?);
    let verifier = TokenVerifier::Static(
        StaticVerifier::default()
            .with_viewer("v1", 1)
            .with_viewer("v2", 1)
            .with_viewer("intruder", 2)
            .with_agent("a1", 1, 7),
    );
    let state =
        BrokerState::new(config, store, verifier, Blacklist::new(), CancellationToken::new());

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    let router = build_router(Arc::clone(&state));
    tokio::spawn(async move {
        let _ = axum::serve(listener, router).await;
    });
    Ok((addr, state))
}

async fn ws_connect(addr: &SocketAddr, path_and_query: &str) -> anyhow::Result<(WsTx, WsRx)> {
    let url = format!("ws://{addr}{path_and_query}");
    let (stream, _) = tokio_tungstenite::connect_async(&url)
        .await
        .map_err(|e| anyhow::anyhow!("ws connect: {e}"))?;
    Ok(stream.split())
}

async fn send_envelope(tx: &mut WsTx, payload: Payload) -> anyhow::Result<()> {
    let text = Envelope::new(payload).to_json()?;
    tx.send(WsMessage::Text(text.into())).await.map_err(|e| anyhow::anyhow!("ws send: {e}"))?;
    Ok(())
}

/// Receive envelopes until one matches the predicate, skipping liveness
/// traffic, with an overall timeout.
async fn recv_until(
    rx: &mut WsRx,
    mut matches: impl FnMut(&Payload) -> bool,
) -> anyhow::Result<Envelope> {
    let deadline = tokio::time::Instant::now() + RECV_TIMEOUT;
    loop {
        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        let msg = tokio::time::timeout(remaining, rx.next())
            .await
            .map_err(|_| anyhow::anyhow!("ws recv timeout"))?
            .ok_or_else(|| anyhow::anyhow!("ws stream closed"))?
            .map_err(|e| anyhow::anyhow!("ws recv: {e}"))?;
        if let WsMessage::Text(text) = msg {
            let envelope = Envelope::from_json(&text)?;
            if matches(&envelope.payload) {
                return Ok(envelope);
            }
        }
    }
}

/// Give the server-side upgrade callback a moment to finish registration.
async fn settle() {
    tokio::time::sleep(Duration::from_millis(200)).await;
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[tokio::test]
async fn rejected_tokens_do_not_upgrade() -> anyhow::Result<()> {
    let (addr, _state) = spawn_broker().await?;

    let result = tokio_tungstenite::connect_async(format!("ws://{addr}/ws/mobile?token=bad")).await;
    match result {
        Err(tokio_tungstenite::tungstenite::Error::Http(response)) => {
            assert_eq!(response.status(), 401);
        }
        other => anyhow::bail!("expected HTTP 401 rejection, got {other:?}"),
    }

    let result = tokio_tungstenite::connect_async(format!("ws://{addr}/ws/desktop")).await;
    assert!(result.is_err());
    Ok(())
}

#[tokio::test]
async fn default_session_bring_up_and_presence() -> anyhow::Result<()> {
    let (addr, _state) = spawn_broker().await?;

    let (_viewer_tx, mut viewer_rx) = ws_connect(&addr, "/ws/mobile?token=v1").await?;
    settle().await;

    let (_agent_tx, mut agent_rx) =
        ws_connect(&addr, "/ws/desktop?token=a1&machine_id=m-7&host=box&os=linux&instance=i-1")
            .await?;

    // The agent is told to bind its default session.
    let create = recv_until(&mut agent_rx, |p| matches!(p, Payload::SessionCreate { .. })).await?;
    let Payload::SessionCreate { is_default, .. } = create.payload else { unreachable!() };
    assert!(is_default);

    // Every viewer of the owning user sees the presence change.
    let online =
        recv_until(&mut viewer_rx, |p| matches!(p, Payload::DesktopOnline { .. })).await?;
    assert_eq!(online.payload, Payload::DesktopOnline { desktop_id: 7 });
    Ok(())
}

#[tokio::test]
async fn keystrokes_propagate_and_output_fans_out_with_scrollback() -> anyhow::Result<()> {
    let (addr, state) = spawn_broker().await?;

    let (mut agent_tx, mut agent_rx) =
        ws_connect(&addr, "/ws/desktop?token=a1&machine_id=m-7&instance=i-1").await?;
    let create = recv_until(&mut agent_rx, |p| matches!(p, Payload::SessionCreate { .. })).await?;
    let Payload::SessionCreate { session_id, .. } = create.payload else { unreachable!() };

    let (mut v1_tx, mut v1_rx) = ws_connect(&addr, "/ws/mobile?token=v1").await?;
    let (_v2_tx, mut v2_rx) = ws_connect(&addr, "/ws/mobile?token=v2").await?;
    settle().await;

    // Viewer keystroke reaches the agent verbatim.
    send_envelope(&mut v1_tx, Payload::TerminalInput { session_id, data: b64(b"ls\n") }).await?;
    let input = recv_until(&mut agent_rx, |p| matches!(p, Payload::TerminalInput { .. })).await?;
    assert_eq!(input.payload, Payload::TerminalInput { session_id, data: b64(b"ls\n") });

    // Agent output fans to every viewer of the user and lands in scrollback.
    send_envelope(&mut agent_tx, Payload::TerminalOutput { session_id, data: b64(b"file-a\r\n") })
        .await?;
    for rx in [&mut v1_rx, &mut v2_rx] {
        let output = recv_until(rx, |p| matches!(p, Payload::TerminalOutput { .. })).await?;
        assert_eq!(
            output.payload,
            Payload::TerminalOutput { session_id, data: b64(b"file-a\r\n") }
        );
    }
    assert_eq!(state.scrollback.read_all(session_id), b"file-a\r\n");
    Ok(())
}

#[tokio::test]
async fn late_viewer_reads_history() -> anyhow::Result<()> {
    let (addr, _state) = spawn_broker().await?;

    let (mut agent_tx, mut agent_rx) =
        ws_connect(&addr, "/ws/desktop?token=a1&machine_id=m-7&instance=i-1").await?;
    let create = recv_until(&mut agent_rx, |p| matches!(p, Payload::SessionCreate { .. })).await?;
    let Payload::SessionCreate { session_id, .. } = create.payload else { unreachable!() };

    send_envelope(&mut agent_tx, Payload::TerminalOutput { session_id, data: b64(b"earlier output") })
        .await?;
    settle().await;

    // A viewer that joins late asks for scrollback and gets it, alone.
    let (mut late_tx, mut late_rx) = ws_connect(&addr, "/ws/mobile?token=v2").await?;
    settle().await;
    send_envelope(&mut late_tx, Payload::TerminalHistory { session_id, data: None }).await?;

    let reply =
        recv_until(&mut late_rx, |p| matches!(p, Payload::TerminalHistory { .. })).await?;
    let Payload::TerminalHistory { data: Some(data), .. } = reply.payload else {
        anyhow::bail!("history reply carried no data");
    };
    let decoded = base64::engine::general_purpose::STANDARD.decode(&data)?;
    assert_eq!(decoded, b"earlier output");
    Ok(())
}

#[tokio::test]
async fn unauthorized_viewer_input_is_rejected_with_1003() -> anyhow::Result<()> {
    let (addr, _state) = spawn_broker().await?;

    let (_agent_tx, mut agent_rx) =
        ws_connect(&addr, "/ws/desktop?token=a1&machine_id=m-7&instance=i-1").await?;
    let create = recv_until(&mut agent_rx, |p| matches!(p, Payload::SessionCreate { .. })).await?;
    let Payload::SessionCreate { session_id, .. } = create.payload else { unreachable!() };

    let (mut intruder_tx, mut intruder_rx) =
        ws_connect(&addr, "/ws/mobile?token=intruder").await?;
    settle().await;
    send_envelope(&mut intruder_tx, Payload::TerminalInput { session_id, data: b64(b"whoami\n") })
        .await?;

    let reply = recv_until(&mut intruder_rx, |p| matches!(p, Payload::Error { .. })).await?;
    let Payload::Error { code, .. } = reply.payload else { unreachable!() };
    assert_eq!(code, 1003);

    // The agent hears nothing but its own liveness traffic.
    let heard_input = tokio::time::timeout(Duration::from_millis(300), async {
        recv_until(&mut agent_rx, |p| matches!(p, Payload::TerminalInput { .. })).await
    })
    .await;
    assert!(heard_input.is_err());
    Ok(())
}

#[tokio::test]
async fn agent_drop_ends_sessions_and_goes_offline() -> anyhow::Result<()> {
    let (addr, state) = spawn_broker().await?;

    let (agent_tx, mut agent_rx) =
        ws_connect(&addr, "/ws/desktop?token=a1&machine_id=m-7&instance=i-1").await?;
    let create = recv_until(&mut agent_rx, |p| matches!(p, Payload::SessionCreate { .. })).await?;
    let Payload::SessionCreate { session_id, .. } = create.payload else { unreachable!() };

    let (_viewer_tx, mut viewer_rx) = ws_connect(&addr, "/ws/mobile?token=v1").await?;
    settle().await;

    // Kill the agent transport; its sessions end and presence flips.
    drop(agent_tx);
    drop(agent_rx);

    let offline =
        recv_until(&mut viewer_rx, |p| matches!(p, Payload::DesktopOffline { .. })).await?;
    assert_eq!(offline.payload, Payload::DesktopOffline { desktop_id: 7 });
    let exit = recv_until(&mut viewer_rx, |p| matches!(p, Payload::TerminalExit { .. })).await?;
    let Payload::TerminalExit { session_id: ended, .. } = exit.payload else { unreachable!() };
    assert_eq!(ended, session_id);

    settle().await;
    assert!(!state.hub.presence().is_online(7));
    use tether_broker::store::SessionStatus;
    let row = state.store.get_session(session_id).unwrap().unwrap();
    assert_eq!(row.status, SessionStatus::Ended);

    // A reconnect registers a fresh default session; the old one stays ended.
    let (_agent_tx2, mut agent_rx2) =
        ws_connect(&addr, "/ws/desktop?token=a1&machine_id=m-7&instance=i-2").await?;
    let create2 =
        recv_until(&mut agent_rx2, |p| matches!(p, Payload::SessionCreate { .. })).await?;
    let Payload::SessionCreate { session_id: new_id, is_default, .. } = create2.payload else {
        unreachable!()
    };
    assert!(is_default);
    assert_ne!(new_id, session_id);
    Ok(())
}

#[tokio::test]
async fn heartbeat_is_answered_with_pong() -> anyhow::Result<()> {
    let (addr, _state) = spawn_broker().await?;
    let (mut viewer_tx, mut viewer_rx) = ws_connect(&addr, "/ws/mobile?token=v1").await?;

    send_envelope(&mut viewer_tx, Payload::Heartbeat {}).await?;
    recv_until(&mut viewer_rx, |p| matches!(p, Payload::Pong {})).await?;
    Ok(())
}
