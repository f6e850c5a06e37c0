// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use std::sync::Arc;

use clap::Parser;
use tokio_util::sync::CancellationToken;

use tether_protocol::{Envelope, ErrorCode, Payload};

use super::*;
use crate::config::BrokerConfig;
use crate::hub::ChannelHandle;
use crate::state::BrokerState;
use crate::store::AgentRow;
use crate::transport::auth::{Blacklist, StaticVerifier, TokenVerifier};

fn test_state() -> Arc<BrokerState> {
    let config = BrokerConfig::parse_from(["tetherd"]);
    let store = Arc::new(Store::open_in_memory().unwrap());
    BrokerState::new(
        config,
        store,
        TokenVerifier::Static(StaticVerifier::default()),
        Blacklist::new(),
        CancellationToken::new(),
    )
}

fn seed_agent(state: &BrokerState, agent_id: i64, user_id: i64) {
    state
        .store
        .upsert_agent(&AgentRow {
            id: agent_id,
            user_id,
            machine_id: format!("m-{agent_id}"),
            display_name: String::new(),
            os: String::new(),
            credential_fingerprint: String::new(),
        })
        .unwrap();
}

async fn connect_agent(
    state: &BrokerState,
    agent_id: i64,
    user_id: i64,
) -> (ChannelHandle, tokio::sync::mpsc::Receiver<Envelope>) {
    let (channel, rx) = ChannelHandle::new(16);
    state.hub.register_agent(agent_id, user_id, "inst".to_owned(), channel.clone()).await;
    (channel, rx)
}

#[tokio::test]
async fn ensure_default_is_idempotent_per_agent() {
    let state = test_state();
    seed_agent(&state, 7, 1);
    let (_agent, mut agent_rx) = connect_agent(&state, 7, 1).await;

    let first = state.sessions.ensure_default(7, 1).await.unwrap();
    let second = state.sessions.ensure_default(7, 1).await.unwrap();
    assert_eq!(first.id, second.id);
    assert_eq!(first.kind, SessionKind::Default);

    // The agent is told about the session; the instruction is idempotent on
    // its side, so the re-send for the second call is fine.
    let instruction = agent_rx.recv().await.unwrap();
    let Payload::SessionCreate { session_id, is_default, .. } = instruction.payload else {
        panic!("expected session:create");
    };
    assert_eq!(session_id, first.id);
    assert!(is_default);

    // Only one active default row exists.
    assert_eq!(state.store.find_active_default(7).unwrap().unwrap().id, first.id);
}

#[tokio::test]
async fn background_creation_requires_an_online_agent() {
    let state = test_state();
    seed_agent(&state, 7, 1);

    let err = state.sessions.create_background(1, 7, None).await.unwrap_err();
    assert_eq!(err, ErrorCode::AgentOffline);

    let (_agent, mut agent_rx) = connect_agent(&state, 7, 1).await;
    let row = state
        .sessions
        .create_background(1, 7, Some("/srv/project".to_owned()))
        .await
        .unwrap();
    assert_eq!(row.kind, SessionKind::Background);
    assert_eq!(row.working_dir, "/srv/project");

    let instruction = agent_rx.recv().await.unwrap();
    let Payload::SessionCreate { session_id, working_dir, is_default } = instruction.payload else {
        panic!("expected session:create");
    };
    assert_eq!(session_id, row.id);
    assert_eq!(working_dir.as_deref(), Some("/srv/project"));
    assert!(!is_default);
}

#[tokio::test]
async fn background_creation_enforces_ownership() {
    let state = test_state();
    seed_agent(&state, 7, 1);
    let (_agent, _rx) = connect_agent(&state, 7, 1).await;

    let err = state.sessions.create_background(2, 7, None).await.unwrap_err();
    assert_eq!(err, ErrorCode::PermissionDenied);

    let err = state.sessions.create_background(1, 99, None).await.unwrap_err();
    assert_eq!(err, ErrorCode::BadRequest);
}

#[tokio::test]
async fn end_session_archives_scrollback_and_tells_the_agent() {
    let state = test_state();
    seed_agent(&state, 7, 1);
    let (_agent, mut agent_rx) = connect_agent(&state, 7, 1).await;
    let row = state.sessions.create_background(1, 7, None).await.unwrap();
    let _ = agent_rx.recv().await; // session:create

    state.scrollback.append(row.id, b"shell transcript");
    state.sessions.end_session(row.id, 0, true).await.unwrap();

    let stored = state.store.get_session(row.id).unwrap().unwrap();
    assert_eq!(stored.status, SessionStatus::Ended);
    assert!(stored.ended_at.is_some());
    assert_eq!(state.store.archived_log(row.id).unwrap().unwrap(), b"shell transcript");
    assert!(state.scrollback.read_all(row.id).is_empty());

    let close = agent_rx.recv().await.unwrap();
    assert_eq!(close.payload, Payload::SessionClose { session_id: row.id });

    // Ended is terminal.
    let err = state.sessions.end_session(row.id, 0, true).await.unwrap_err();
    assert_eq!(err, ErrorCode::SessionEnded);
}

#[tokio::test]
async fn agent_disconnect_ends_every_active_session() {
    let state = test_state();
    seed_agent(&state, 7, 1);
    let (_agent, _agent_rx) = connect_agent(&state, 7, 1).await;

    let default = state.sessions.ensure_default(7, 1).await.unwrap();
    let background = state.sessions.create_background(1, 7, None).await.unwrap();
    state.scrollback.append(default.id, b"d");
    state.scrollback.append(background.id, b"b");

    state.sessions.end_all_for_agent(7).await;

    for id in [default.id, background.id] {
        let row = state.store.get_session(id).unwrap().unwrap();
        assert_eq!(row.status, SessionStatus::Ended);
    }
    assert!(state.scrollback.is_empty());
    assert!(state.sessions.active(default.id).await.is_none());
}

#[tokio::test]
async fn authorize_distinguishes_permission_from_state() {
    let state = test_state();
    seed_agent(&state, 7, 1);
    let (_agent, _rx) = connect_agent(&state, 7, 1).await;
    let row = state.sessions.create_background(1, 7, None).await.unwrap();

    assert!(state.sessions.authorize(row.id, 1).await.is_ok());
    assert_eq!(
        state.sessions.authorize(row.id, 2).await.unwrap_err(),
        ErrorCode::PermissionDenied
    );
    assert_eq!(state.sessions.authorize(404, 1).await.unwrap_err(), ErrorCode::SessionNotFound);

    state.sessions.end_session(row.id, 0, false).await.unwrap();
    assert_eq!(state.sessions.authorize(row.id, 1).await.unwrap_err(), ErrorCode::SessionEnded);
    // Ownership still wins over state for foreign callers.
    assert_eq!(
        state.sessions.authorize(row.id, 2).await.unwrap_err(),
        ErrorCode::PermissionDenied
    );
}
