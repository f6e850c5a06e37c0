// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::config::BrokerConfig;
use crate::hub::Hub;
use crate::scrollback::ScrollbackCache;
use crate::session::SessionManager;
use crate::store::Store;
use crate::transport::auth::{Blacklist, TokenVerifier};

/// Shared broker state. Components receive handles by construction; nothing
/// reaches for globals.
pub struct BrokerState {
    pub config: BrokerConfig,
    pub hub: Arc<Hub>,
    pub store: Arc<Store>,
    pub scrollback: Arc<ScrollbackCache>,
    pub sessions: Arc<SessionManager>,
    pub verifier: TokenVerifier,
    pub blacklist: Blacklist,
    pub shutdown: CancellationToken,
    /// This broker process's identity on the pub/sub plane.
    pub instance_id: String,
}

impl BrokerState {
    pub fn new(
        config: BrokerConfig,
        store: Arc<Store>,
        verifier: TokenVerifier,
        blacklist: Blacklist,
        shutdown: CancellationToken,
    ) -> Arc<Self> {
        let hub = Hub::new(shutdown.clone());
        let scrollback = Arc::new(ScrollbackCache::new(
            config.scrollback_ttl(),
            config.scrollback_cap_bytes,
        ));
        let sessions =
            SessionManager::new(Arc::clone(&store), Arc::clone(&scrollback), Arc::clone(&hub));
        Arc::new(Self {
            config,
            hub,
            store,
            scrollback,
            sessions,
            verifier,
            blacklist,
            shutdown,
            instance_id: new_instance_id(),
        })
    }
}

/// Sixteen random bytes, hex-encoded.
pub fn new_instance_id() -> String {
    let bytes: [u8; 16] = rand::random();
    let mut out = String::with_capacity(32);
    for byte in bytes {
        out.push_str(&format!("{byte:02x}"));
    }
    out
}
