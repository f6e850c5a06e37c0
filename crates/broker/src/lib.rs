// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Tether broker: routes PTY byte streams between agents and viewers,
//! keeps presence and scrollback, persists session bookkeeping.

pub mod config;
pub mod hub;
pub mod scrollback;
pub mod session;
pub mod state;
pub mod store;
pub mod transport;

use std::sync::Arc;

use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::info;

use tether_protocol::epoch_ms;

use crate::config::BrokerConfig;
use crate::state::BrokerState;
use crate::store::Store;
use crate::transport::auth::{Blacklist, RemoteVerifier, StaticVerifier, TokenVerifier};
use crate::transport::build_router;

/// Run the broker until shutdown.
pub async fn run(config: BrokerConfig) -> anyhow::Result<()> {
    config.validate()?;
    let shutdown = CancellationToken::new();

    let verifier = match (&config.auth_url, &config.auth_tokens_path) {
        (Some(url), _) => TokenVerifier::Remote(RemoteVerifier::new(url)),
        (None, Some(path)) => TokenVerifier::Static(StaticVerifier::from_file(path)?),
        (None, None) => anyhow::bail!("no token verifier configured"),
    };
    let blacklist = match &config.blacklist_path {
        Some(path) => Blacklist::load(path)?,
        None => Blacklist::new(),
    };

    let store = Arc::new(Store::open(&config.db_path)?);
    // Sessions left active by a previous process have no live PTY behind
    // them anymore.
    let swept = store.end_all_active(epoch_ms())?;
    if swept > 0 {
        info!(count = swept, "ended stale active sessions from previous run");
    }

    let state = BrokerState::new(config.clone(), store, verifier, blacklist, shutdown.clone());

    if let Some(ref nats_url) = config.nats_url {
        let pubsub = hub::pubsub::PubSub::connect(
            nats_url,
            config.nats_token.as_deref(),
            &config.nats_prefix,
            &state.instance_id,
        )
        .await?;
        state.hub.set_pubsub(Arc::clone(&pubsub));
        hub::pubsub::spawn_subscriber(Arc::clone(&state.hub), pubsub, shutdown.clone());
    }

    tokio::spawn(scrollback::run_sweeper(Arc::clone(&state.scrollback), shutdown.clone()));

    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            let _ = tokio::signal::ctrl_c().await;
            shutdown.cancel();
        });
    }

    let addr = format!("{}:{}", config.host, config.port);
    let listener = TcpListener::bind(&addr).await?;
    info!(instance = %state.instance_id, "tetherd listening on {addr}");
    let router = build_router(state);
    axum::serve(listener, router).with_graceful_shutdown(shutdown.cancelled_owned()).await?;

    Ok(())
}
