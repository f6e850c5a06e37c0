// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! REST surface: session management for viewers.
//!
//! Every handler authenticates the bearer token, enforces ownership, and
//! maps failures to HTTP status + `{code, message}` with the same numeric
//! codes used on the wire.

use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use base64::Engine;
use serde::{Deserialize, Serialize};

use tether_protocol::ErrorCode;

use crate::state::BrokerState;
use crate::store::{SessionKind, SessionRow, SessionStatus};
use crate::transport::auth::bearer_token;

// -- Request/Response types ---------------------------------------------------

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
}

#[derive(Debug, Deserialize)]
pub struct CreateSessionRequest {
    pub desktop_id: i64,
    #[serde(default)]
    pub working_dir: Option<String>,
    // `is_default` is deliberately absent: the broker alone decides it.
}

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    pub desktop_id: i64,
    #[serde(default)]
    pub page: Option<u32>,
    #[serde(default)]
    pub page_size: Option<u32>,
}

#[derive(Debug, Serialize)]
pub struct SessionInfo {
    pub id: i64,
    pub desktop_id: i64,
    pub kind: SessionKind,
    pub is_default: bool,
    pub working_dir: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    pub status: SessionStatus,
    pub started_at: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<i64>,
    /// Last kilobyte of live scrollback, base64. Computed per request.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub preview: Option<String>,
}

impl SessionInfo {
    fn from_row(row: SessionRow, preview: Option<String>) -> Self {
        Self {
            id: row.id,
            desktop_id: row.agent_id,
            kind: row.kind,
            is_default: row.kind == SessionKind::Default,
            working_dir: row.working_dir,
            title: row.title,
            status: row.status,
            started_at: row.started_at,
            ended_at: row.ended_at,
            preview,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct SessionListResponse {
    pub sessions: Vec<SessionInfo>,
    pub total: u32,
}

// -- Helpers ------------------------------------------------------------------

fn error_response(code: ErrorCode, message: &str) -> Response {
    let status =
        StatusCode::from_u16(code.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    (status, Json(code.to_body(message))).into_response()
}

/// Resolve the caller's user id from the Authorization header.
async fn authenticate(state: &BrokerState, headers: &HeaderMap) -> Result<i64, Response> {
    let token = bearer_token(headers)
        .ok_or_else(|| error_response(ErrorCode::Unauthorized, "missing bearer token"))?;
    match state.verifier.verify_viewer(token).await {
        Ok(identity) => Ok(identity.user_id),
        Err(code) => Err(error_response(code, "authentication failed")),
    }
}

// -- Handlers -----------------------------------------------------------------

/// `GET /healthz`
pub async fn health() -> impl IntoResponse {
    Json(HealthResponse { status: "running".to_owned() })
}

/// `POST /sessions` — create a background session on an owned agent.
pub async fn create_session(
    State(state): State<Arc<BrokerState>>,
    headers: HeaderMap,
    Json(request): Json<CreateSessionRequest>,
) -> Response {
    let user_id = match authenticate(&state, &headers).await {
        Ok(id) => id,
        Err(response) => return response,
    };
    match state
        .sessions
        .create_background(user_id, request.desktop_id, request.working_dir)
        .await
    {
        Ok(row) => {
            let info = SessionInfo::from_row(row, None);
            (StatusCode::CREATED, Json(info)).into_response()
        }
        Err(code) => error_response(code, code.as_str()),
    }
}

/// `GET /sessions?desktop_id=&page=&page_size=`
pub async fn list_sessions(
    State(state): State<Arc<BrokerState>>,
    headers: HeaderMap,
    Query(query): Query<ListQuery>,
) -> Response {
    let user_id = match authenticate(&state, &headers).await {
        Ok(id) => id,
        Err(response) => return response,
    };
    let page = query.page.unwrap_or(1).max(1);
    let page_size = query.page_size.unwrap_or(20).clamp(1, 100);

    match state.sessions.list_with_preview(user_id, query.desktop_id, page, page_size).await {
        Ok((rows, total)) => {
            let sessions = rows
                .into_iter()
                .map(|(row, preview)| {
                    let encoded = if preview.is_empty() {
                        None
                    } else {
                        Some(base64::engine::general_purpose::STANDARD.encode(&preview))
                    };
                    SessionInfo::from_row(row, encoded)
                })
                .collect();
            Json(SessionListResponse { sessions, total }).into_response()
        }
        Err(code) => error_response(code, code.as_str()),
    }
}

/// `GET /sessions/{id}`
pub async fn get_session(
    State(state): State<Arc<BrokerState>>,
    headers: HeaderMap,
    Path(id): Path<i64>,
) -> Response {
    let user_id = match authenticate(&state, &headers).await {
        Ok(id) => id,
        Err(response) => return response,
    };
    match state.sessions.get_owned(id, user_id).await {
        Ok(row) => {
            let info = SessionInfo::from_row(row, None);
            Json(serde_json::json!({ "session": info })).into_response()
        }
        Err(code) => error_response(code, code.as_str()),
    }
}

/// `DELETE /sessions/{id}` — end a session: archive scrollback and tell the
/// agent to tear its PTY down.
pub async fn delete_session(
    State(state): State<Arc<BrokerState>>,
    headers: HeaderMap,
    Path(id): Path<i64>,
) -> Response {
    let user_id = match authenticate(&state, &headers).await {
        Ok(id) => id,
        Err(response) => return response,
    };
    if let Err(code) = state.sessions.get_owned(id, user_id).await {
        return error_response(code, code.as_str());
    }
    match state.sessions.end_session(id, 0, true).await {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(code) => error_response(code, code.as_str()),
    }
}
