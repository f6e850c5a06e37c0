// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! HTTP + WebSocket transport for the broker.

pub mod auth;
pub mod http;
pub mod ws;

use std::sync::Arc;

use axum::routing::get;
use axum::Router;
use tower_http::cors::CorsLayer;

use crate::state::BrokerState;

/// Build the axum `Router` with all broker routes.
pub fn build_router(state: Arc<BrokerState>) -> Router {
    Router::new()
        // Health (no auth)
        .route("/healthz", get(http::health))
        // Session management
        .route("/sessions", axum::routing::post(http::create_session).get(http::list_sessions))
        .route("/sessions/{id}", get(http::get_session).delete(http::delete_session))
        // Channels
        .route("/ws/mobile", get(ws::mobile_ws))
        .route("/ws/desktop", get(ws::desktop_ws))
        .layer(CorsLayer::permissive())
        .with_state(state)
}
