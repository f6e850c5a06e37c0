// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Broker transport: one WebSocket, reconnected forever.
//!
//! PTYs live in the multiplexer and survive transport drops; this loop
//! reopens the channel on a jittered exponential backoff, re-sends current
//! geometry after every reopen so viewers re-learn sizes, and bridges the
//! outbound queue onto the socket.

use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use tether_protocol::{Envelope, Payload};

use crate::sessions::Multiplexer;

pub struct ClientConfig {
    /// Full agent channel URL including token and identity query params.
    pub url: String,
    pub reconnect_initial: Duration,
    pub reconnect_max: Duration,
    pub heartbeat_interval: Duration,
}

/// Run the transport until shutdown. Never returns early on transport
/// faults; those only cost a backoff.
pub async fn run(
    mux: Arc<Multiplexer>,
    mut outbound_rx: mpsc::Receiver<Envelope>,
    config: ClientConfig,
    shutdown: CancellationToken,
) {
    let mut attempt: u32 = 0;
    loop {
        if shutdown.is_cancelled() {
            return;
        }

        match tokio_tungstenite::connect_async(&config.url).await {
            Ok((stream, _response)) => {
                attempt = 0;
                mux.set_connected(true);
                info!("connected to broker");
                bridge(&mux, &mut outbound_rx, stream, &config, &shutdown).await;
                mux.set_connected(false);
                if shutdown.is_cancelled() {
                    return;
                }
                warn!("broker transport lost, reconnecting");
            }
            Err(e) => {
                debug!(err = %e, attempt, "broker connect failed");
            }
        }

        let delay = backoff_delay(attempt, config.reconnect_initial, config.reconnect_max);
        attempt = attempt.saturating_add(1);
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = shutdown.cancelled() => return,
        }
    }
}

/// Bridge one live connection until it drops or shutdown.
async fn bridge(
    mux: &Arc<Multiplexer>,
    outbound_rx: &mut mpsc::Receiver<Envelope>,
    stream: tokio_tungstenite::WebSocketStream<
        tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
    >,
    config: &ClientConfig,
    shutdown: &CancellationToken,
) {
    let (mut ws_tx, mut ws_rx) = stream.split();

    // Geometry replay: the broker re-instructs viewers from these.
    for (session_id, cols, rows) in mux.geometry().await {
        let envelope = Envelope::new(Payload::TerminalResize { session_id, rows, cols });
        if send_envelope(&mut ws_tx, &envelope).await.is_err() {
            return;
        }
    }

    let mut heartbeat = tokio::time::interval(config.heartbeat_interval);
    heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    heartbeat.tick().await; // Consume the immediate first tick.

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                let _ = ws_tx.send(WsMessage::Close(None)).await;
                return;
            }

            outbound = outbound_rx.recv() => {
                let Some(envelope) = outbound else { return };
                if send_envelope(&mut ws_tx, &envelope).await.is_err() {
                    return;
                }
            }

            incoming = ws_rx.next() => {
                let message = match incoming {
                    Some(Ok(m)) => m,
                    Some(Err(e)) => {
                        debug!(err = %e, "broker read failed");
                        return;
                    }
                    None => return,
                };
                match message {
                    WsMessage::Text(text) => {
                        let envelope = match Envelope::from_json(&text) {
                            Ok(envelope) => envelope,
                            Err(e) => {
                                debug!(err = %e, "dropping malformed broker envelope");
                                continue;
                            }
                        };
                        match &envelope.payload {
                            Payload::Heartbeat {} => {
                                let pong = Envelope::new(Payload::Pong {});
                                if send_envelope(&mut ws_tx, &pong).await.is_err() {
                                    return;
                                }
                            }
                            Payload::Pong {} => {}
                            _ => mux.handle_envelope(envelope).await,
                        }
                    }
                    WsMessage::Close(_) => return,
                    _ => {}
                }
            }

            _ = heartbeat.tick() => {
                let ping = Envelope::new(Payload::Heartbeat {});
                if send_envelope(&mut ws_tx, &ping).await.is_err() {
                    return;
                }
            }
        }
    }
}

async fn send_envelope<S>(tx: &mut S, envelope: &Envelope) -> Result<(), ()>
where
    S: SinkExt<WsMessage> + Unpin,
{
    let text = match envelope.to_json() {
        Ok(text) => text,
        Err(_) => return Ok(()),
    };
    tx.send(WsMessage::Text(text.into())).await.map_err(|_| ())
}

/// Deterministic backoff schedule: initial, doubled per failure, capped.
fn backoff_base(attempt: u32, initial: Duration, max: Duration) -> Duration {
    let factor = 2u32.saturating_pow(attempt.min(16));
    initial.saturating_mul(factor).min(max)
}

/// The schedule above with ±50% uniform jitter.
fn backoff_delay(attempt: u32, initial: Duration, max: Duration) -> Duration {
    use rand::Rng;
    let base = backoff_base(attempt, initial, max);
    let jitter: f64 = rand::rng().random_range(0.5..1.5);
    base.mul_f64(jitter)
}

#[cfg(test)]
#[path = "client_tests.rs"]
mod tests;
